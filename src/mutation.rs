//! Block mutation strategies.
//!
//! A mutation changes the shape of a host call block after construction:
//! extra rest-parameter inputs, a destructured callback parameter, or an
//! optional receiver input that falls back to a default instance. The
//! inference pass and the compiler only see the `MutationStrategy` trait.

use crate::blocks::BlockRef;
use crate::diagnostics::PipelineError;
use crate::output::OutputNode;
use anyhow::{anyhow, bail, Result};
use indexmap::IndexMap;
use serde_json::{json, Value};

pub const REST_INPUT_PREFIX: &str = "REST";
pub const INSTANCE_INPUT: &str = "__instance__";

/// What a strategy may ask of the compiler.
pub trait MutationContext {
    /// Compiles the value input `input` of `block`, or `None` when the block
    /// has no such input slot.
    fn compile_input(
        &mut self,
        block: BlockRef,
        input: &str,
    ) -> Result<Option<OutputNode>, PipelineError>;

    /// Output identifier of the variable `name` as seen from `block`.
    fn variable_name(&mut self, block: BlockRef, name: &str) -> Result<String, PipelineError>;
}

pub trait MutationStrategy {
    fn compile_mutation(
        &self,
        cx: &mut dyn MutationContext,
        block: BlockRef,
    ) -> Result<Option<OutputNode>, PipelineError>;

    /// Variables the mutation declares in the block's own scope, name to type.
    fn declared_variables(&self) -> Option<IndexMap<String, String>>;

    fn serialize(&self) -> Value;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestParameterMutator {
    pub count: usize,
}

impl RestParameterMutator {
    pub fn input_name(index: usize) -> String {
        format!("{}{}", REST_INPUT_PREFIX, index)
    }
}

impl MutationStrategy for RestParameterMutator {
    fn compile_mutation(
        &self,
        cx: &mut dyn MutationContext,
        block: BlockRef,
    ) -> Result<Option<OutputNode>, PipelineError> {
        let mut args = Vec::new();
        for index in 0..self.count {
            if let Some(arg) = cx.compile_input(block, &Self::input_name(index))? {
                args.push(arg);
            }
        }
        if args.is_empty() {
            return Ok(None);
        }
        Ok(Some(OutputNode::comma_separated(args)))
    }

    fn declared_variables(&self) -> Option<IndexMap<String, String>> {
        None
    }

    fn serialize(&self) -> Value {
        json!({ "kind": "rest", "count": self.count })
    }
}

/// Callback parameter written as an object pattern, `{ x, y }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DestructuringMutator {
    pub properties: Vec<(String, String)>,
}

impl MutationStrategy for DestructuringMutator {
    fn compile_mutation(
        &self,
        cx: &mut dyn MutationContext,
        block: BlockRef,
    ) -> Result<Option<OutputNode>, PipelineError> {
        if self.properties.is_empty() {
            return Ok(None);
        }
        let mut parts = Vec::new();
        for (property, _) in &self.properties {
            let local = cx.variable_name(block, property)?;
            if &local == property {
                parts.push(local);
            } else {
                parts.push(format!("{}: {}", property, local));
            }
        }
        Ok(Some(OutputNode::text(format!("{{ {} }}", parts.join(", ")))))
    }

    fn declared_variables(&self) -> Option<IndexMap<String, String>> {
        Some(self.properties.iter().cloned().collect())
    }

    fn serialize(&self) -> Value {
        let properties = self
            .properties
            .iter()
            .map(|(name, type_name)| json!({ "name": name, "type": type_name }))
            .collect::<Vec<_>>();
        json!({ "kind": "destructuring", "properties": properties })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultInstanceMutator {
    pub show_instance: bool,
}

impl MutationStrategy for DefaultInstanceMutator {
    fn compile_mutation(
        &self,
        cx: &mut dyn MutationContext,
        block: BlockRef,
    ) -> Result<Option<OutputNode>, PipelineError> {
        if !self.show_instance {
            return Ok(None);
        }
        cx.compile_input(block, INSTANCE_INPUT)
    }

    fn declared_variables(&self) -> Option<IndexMap<String, String>> {
        None
    }

    fn serialize(&self) -> Value {
        json!({ "kind": "defaultInstance", "showInstance": self.show_instance })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutator {
    Rest(RestParameterMutator),
    Destructuring(DestructuringMutator),
    DefaultInstance(DefaultInstanceMutator),
}

impl Mutator {
    pub fn strategy(&self) -> &dyn MutationStrategy {
        match self {
            Mutator::Rest(m) => m,
            Mutator::Destructuring(m) => m,
            Mutator::DefaultInstance(m) => m,
        }
    }

    pub fn deserialize(value: &Value) -> Result<Self> {
        let kind = value
            .get("kind")
            .and_then(Value::as_str)
            .ok_or_else(|| anyhow!("Mutation is missing 'kind'."))?;
        match kind {
            "rest" => {
                let count = value.get("count").and_then(Value::as_u64).unwrap_or(0);
                Ok(Mutator::Rest(RestParameterMutator {
                    count: count as usize,
                }))
            }
            "destructuring" => {
                let mut properties = Vec::new();
                if let Some(items) = value.get("properties").and_then(Value::as_array) {
                    for item in items {
                        let name = item
                            .get("name")
                            .and_then(Value::as_str)
                            .ok_or_else(|| anyhow!("Destructured property is missing 'name'."))?;
                        let type_name = item.get("type").and_then(Value::as_str).unwrap_or("any");
                        properties.push((name.to_string(), type_name.to_string()));
                    }
                }
                Ok(Mutator::Destructuring(DestructuringMutator { properties }))
            }
            "defaultInstance" => {
                let show_instance = value
                    .get("showInstance")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                Ok(Mutator::DefaultInstance(DefaultInstanceMutator { show_instance }))
            }
            other => bail!("Unknown mutation kind '{}'.", other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serialized_mutations_read_back() {
        let mutators = [
            Mutator::Rest(RestParameterMutator { count: 3 }),
            Mutator::Destructuring(DestructuringMutator {
                properties: vec![("x".to_string(), "number".to_string())],
            }),
            Mutator::DefaultInstance(DefaultInstanceMutator { show_instance: true }),
        ];
        for mutator in mutators {
            let value = mutator.strategy().serialize();
            assert_eq!(Mutator::deserialize(&value).unwrap(), mutator);
        }
    }

    #[test]
    fn unknown_kind_is_rejected() {
        let err = Mutator::deserialize(&json!({ "kind": "wat" })).unwrap_err();
        assert!(err.to_string().contains("wat"));
    }

    #[test]
    fn destructuring_declares_its_properties() {
        let m = DestructuringMutator {
            properties: vec![
                ("x".to_string(), "number".to_string()),
                ("name".to_string(), "string".to_string()),
            ],
        };
        let vars = m.declared_variables().unwrap();
        assert_eq!(vars.get("name").map(String::as_str), Some("string"));
        assert_eq!(vars.len(), 2);
    }
}
