//! Descriptor of the host API surface the generated program calls into.

use crate::points::{is_array_type, ANY, ARRAY, VOID};
use indexmap::IndexMap;
use std::collections::{HashMap, VecDeque};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterDesc {
    pub name: String,
    pub type_name: String,
    pub optional: bool,
    /// The `this` argument of a method or extension method.
    pub is_receiver: bool,
    /// Acceptable shapes in preference order. Empty means `[type_name]`.
    pub check: Vec<String>,
}

impl ParameterDesc {
    pub fn new(name: &str, type_name: &str) -> Self {
        Self {
            name: name.to_string(),
            type_name: type_name.to_string(),
            optional: false,
            is_receiver: false,
            check: Vec::new(),
        }
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn receiver(mut self) -> Self {
        self.is_receiver = true;
        self
    }

    pub fn with_check(mut self, check: &[&str]) -> Self {
        self.check = check.iter().map(ToString::to_string).collect();
        self
    }

    pub fn checks(&self) -> Vec<String> {
        if self.check.is_empty() {
            vec![self.type_name.clone()]
        } else {
            self.check.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerParam {
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SymbolAttributes {
    pub block_id: Option<String>,
    pub is_extension_method: bool,
    pub image_literal: bool,
    pub alias_for: Option<String>,
    pub default_instance: Option<String>,
    pub after_on_start: bool,
    pub allow_multiple: bool,
    /// Handler block used as a statement rather than an event registration.
    pub handler_statement: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymbolInfo {
    pub namespace: String,
    pub name: String,
    pub parameters: Vec<ParameterDesc>,
    pub ret_type: String,
    /// Present when the last argument is a callback handler.
    pub handler: Option<Vec<HandlerParam>>,
    pub attributes: SymbolAttributes,
}

impl SymbolInfo {
    pub fn new(namespace: &str, name: &str, ret_type: &str) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            parameters: Vec::new(),
            ret_type: ret_type.to_string(),
            handler: None,
            attributes: SymbolAttributes::default(),
        }
    }

    pub fn qualified_name(&self) -> String {
        if self.namespace.is_empty() {
            self.name.clone()
        } else {
            format!("{}.{}", self.namespace, self.name)
        }
    }

    pub fn block(mut self, block_id: &str) -> Self {
        self.attributes.block_id = Some(block_id.to_string());
        self
    }

    pub fn param(mut self, param: ParameterDesc) -> Self {
        self.parameters.push(param);
        self
    }

    pub fn handler(mut self, params: &[(&str, &str)]) -> Self {
        self.handler = Some(
            params
                .iter()
                .map(|(name, type_name)| HandlerParam {
                    name: name.to_string(),
                    type_name: type_name.to_string(),
                })
                .collect(),
        );
        self
    }

    pub fn receiver(&self) -> Option<&ParameterDesc> {
        self.parameters.iter().find(|p| p.is_receiver)
    }

    pub fn has_handler(&self) -> bool {
        self.handler.is_some()
    }

    /// Event registrations are top-level handler blocks.
    pub fn is_event(&self) -> bool {
        self.has_handler() && !self.attributes.handler_statement
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnumInfo {
    pub name: String,
    pub is_bitmask: bool,
    pub is_hash: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KindInfo {
    pub name: String,
    pub create_function_name: String,
    pub initial_members: Vec<String>,
}

/// Symbols keyed by qualified name, plus the block-type index built once per
/// surface.
#[derive(Debug, Clone, Default)]
pub struct ApiInfo {
    symbols: IndexMap<String, SymbolInfo>,
    by_block: HashMap<String, String>,
    supertypes: HashMap<String, Vec<String>>,
    pub enums: Vec<EnumInfo>,
    pub kinds: Vec<KindInfo>,
}

impl ApiInfo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a symbol. An extension method is called on its first
    /// parameter unless another parameter is marked as the receiver.
    pub fn add_symbol(&mut self, mut symbol: SymbolInfo) {
        if symbol.attributes.is_extension_method && symbol.receiver().is_none() {
            if let Some(first) = symbol.parameters.first_mut() {
                first.is_receiver = true;
            }
        }
        let qname = symbol.qualified_name();
        if let Some(block_id) = &symbol.attributes.block_id {
            self.by_block.insert(block_id.clone(), qname.clone());
        }
        self.symbols.insert(qname, symbol);
    }

    pub fn with_symbol(mut self, symbol: SymbolInfo) -> Self {
        self.add_symbol(symbol);
        self
    }

    pub fn add_supertypes(&mut self, type_name: &str, supertypes: &[&str]) {
        self.supertypes.insert(
            type_name.to_string(),
            supertypes.iter().map(ToString::to_string).collect(),
        );
    }

    pub fn symbol(&self, qualified_name: &str) -> Option<&SymbolInfo> {
        self.symbols.get(qualified_name)
    }

    pub fn symbol_for_block(&self, block_type: &str) -> Option<&SymbolInfo> {
        self.by_block
            .get(block_type)
            .and_then(|qname| self.symbols.get(qname))
    }

    pub fn namespaces(&self) -> Vec<String> {
        let mut out = self
            .symbols
            .values()
            .filter(|s| !s.namespace.is_empty())
            .map(|s| s.namespace.clone())
            .collect::<Vec<_>>();
        out.sort();
        out.dedup();
        out
    }

    pub fn enum_info(&self, name: &str) -> Option<&EnumInfo> {
        self.enums.iter().find(|e| e.name == name)
    }

    /// Inheritance chain of `type_name`, narrowest first, the type itself
    /// excluded. Cycles in the declared table are cut.
    pub fn supertypes_of(&self, type_name: &str) -> Vec<String> {
        let mut out: Vec<String> = Vec::new();
        let mut queue = VecDeque::from([type_name.to_string()]);
        while let Some(current) = queue.pop_front() {
            let Some(parents) = self.supertypes.get(&current) else {
                continue;
            };
            for parent in parents {
                if parent != type_name && !out.contains(parent) {
                    out.push(parent.clone());
                    queue.push_back(parent.clone());
                }
            }
        }
        out
    }

    /// Output check list of a host call block; `None` for statements.
    pub fn output_shape(&self, symbol: &SymbolInfo) -> Option<Vec<String>> {
        let ret = symbol.ret_type.as_str();
        if ret == VOID {
            return None;
        }
        if ret == "T" || ret == ANY {
            return Some(vec!["T".to_string()]);
        }
        if is_array_type(ret) {
            if ret == ARRAY || ret == "any[]" || ret == "T[]" {
                return Some(vec![ARRAY.to_string()]);
            }
            return Some(vec![ARRAY.to_string(), ret.to_string()]);
        }
        let mut shape = vec![ret.to_string()];
        shape.extend(self.supertypes_of(ret));
        Some(shape)
    }
}
