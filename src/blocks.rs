//! Block graph handed over by the editor, stored as an arena.

use crate::api::ApiInfo;
use crate::mutation::Mutator;
use crate::points::{ARRAY, BOOLEAN, NUMBER, STRING};
use anyhow::{anyhow, bail, Result};
use std::collections::HashMap;

pub type BlockRef = usize;

pub const ON_START: &str = "pxt-on-start";
pub const FUNCTION_DEFINITION: &str = "function_definition";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArithmeticOp {
    Add,
    Minus,
    Multiply,
    Divide,
    Power,
}

impl ArithmeticOp {
    fn from_field(value: &str) -> Option<Self> {
        match value {
            "ADD" => Some(Self::Add),
            "MINUS" => Some(Self::Minus),
            "MULTIPLY" => Some(Self::Multiply),
            "DIVIDE" => Some(Self::Divide),
            "POWER" => Some(Self::Power),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Minus => "-",
            Self::Multiply => "*",
            Self::Divide => "/",
            Self::Power => "**",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Eq,
    Neq,
    Lt,
    Lte,
    Gt,
    Gte,
}

impl CompareOp {
    fn from_field(value: &str) -> Option<Self> {
        match value {
            "EQ" => Some(Self::Eq),
            "NEQ" => Some(Self::Neq),
            "LT" => Some(Self::Lt),
            "LTE" => Some(Self::Lte),
            "GT" => Some(Self::Gt),
            "GTE" => Some(Self::Gte),
            _ => None,
        }
    }

    pub fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::Neq => "!=",
            Self::Lt => "<",
            Self::Lte => "<=",
            Self::Gt => ">",
            Self::Gte => ">=",
        }
    }

    pub fn is_equality(self) -> bool {
        matches!(self, Self::Eq | Self::Neq)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BoolOp {
    And,
    Or,
}

impl BoolOp {
    pub fn symbol(self) -> &'static str {
        match self {
            Self::And => "&&",
            Self::Or => "||",
        }
    }
}

/// Closed set of block kinds the passes dispatch on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockKind {
    OnStart,
    VariableGet,
    VariableSet,
    VariableChange,
    NumberLiteral,
    TextLiteral,
    BooleanLiteral,
    Arithmetic(ArithmeticOp),
    Compare(CompareOp),
    BoolOperation(BoolOp),
    Negate,
    Modulo,
    /// `Math.<name>(x, y)`
    MathBinary(String),
    /// `Math.<name>(x)`
    MathUnary(String),
    TextJoin,
    TextLength,
    If,
    Repeat,
    While,
    ForRange,
    ForOf,
    Break,
    Continue,
    ListCreate,
    ListIndexGet,
    ListIndexSet,
    ListLength,
    FunctionDefinition,
    FunctionCall,
    FunctionCallOutput,
    FunctionReturn,
    ArgumentReporter,
    TypeScriptStatement,
    TypeScriptExpression,
    /// Shadow block whose single field is spliced into the output verbatim.
    FieldLiteral,
    /// Call into the host API, by qualified symbol name.
    HostCall(String),
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputKind {
    Value,
    Statement,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Input {
    pub name: String,
    pub kind: InputKind,
    pub target: Option<BlockRef>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionArg {
    pub id: String,
    pub name: String,
    pub type_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSignature {
    pub name: String,
    pub args: Vec<FunctionArg>,
}

#[derive(Debug, Clone)]
pub struct Block {
    pub id: String,
    pub tag: String,
    pub kind: BlockKind,
    pub enabled: bool,
    pub shadow: bool,
    pub inputs: Vec<Input>,
    pub fields: Vec<Field>,
    pub next: Option<BlockRef>,
    pub mutation: Option<Mutator>,
    /// Static output shape; `None` for statement blocks.
    pub output_check: Option<Vec<String>>,
    pub signature: Option<FunctionSignature>,
}

impl Block {
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.value.as_str())
    }

    pub fn input(&self, name: &str) -> Option<&Input> {
        self.inputs.iter().find(|i| i.name == name)
    }

    pub fn input_target(&self, name: &str) -> Option<BlockRef> {
        self.input(name).and_then(|i| i.target)
    }

    pub fn value_inputs(&self) -> impl Iterator<Item = &Input> {
        self.inputs.iter().filter(|i| i.kind == InputKind::Value)
    }

    pub fn statement_inputs(&self) -> impl Iterator<Item = &Input> {
        self.inputs.iter().filter(|i| i.kind == InputKind::Statement)
    }

    pub fn has_statement_inputs(&self) -> bool {
        self.statement_inputs().next().is_some()
    }

    pub fn has_output(&self) -> bool {
        self.output_check.is_some()
    }

    /// Variable named by the `VAR` field of variable and loop blocks.
    pub fn variable_field(&self) -> Option<&str> {
        self.field("VAR")
    }

    pub fn function_name(&self) -> Option<&str> {
        self.signature
            .as_ref()
            .map(|s| s.name.as_str())
            .or_else(|| self.field("function_name"))
    }

    pub fn is_literal(&self) -> bool {
        matches!(
            self.kind,
            BlockKind::NumberLiteral
                | BlockKind::TextLiteral
                | BlockKind::BooleanLiteral
                | BlockKind::FieldLiteral
        )
    }

    /// Numbered inputs `<prefix>0`, `<prefix>1`, ... in order.
    pub fn numbered_inputs<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a Input> {
        self.inputs.iter().filter(move |i| {
            i.name
                .strip_prefix(prefix)
                .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VariableModel {
    pub name: String,
    pub var_type: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Workspace {
    blocks: Vec<Block>,
    parents: Vec<Option<BlockRef>>,
    pub variables: Vec<VariableModel>,
}

impl Workspace {
    pub fn block(&self, block: BlockRef) -> &Block {
        &self.blocks[block]
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn refs(&self) -> impl Iterator<Item = BlockRef> {
        0..self.blocks.len()
    }

    pub fn parent(&self, block: BlockRef) -> Option<BlockRef> {
        self.parents[block]
    }

    /// Blocks without a parent connection, in document order.
    pub fn top_blocks(&self) -> Vec<BlockRef> {
        self.refs().filter(|b| self.parents[*b].is_none()).collect()
    }

    /// A block is enabled when it and every block surrounding it are. The
    /// statement before a block in a chain does not count as surrounding it.
    pub fn is_enabled(&self, block: BlockRef) -> bool {
        if !self.blocks[block].enabled {
            return false;
        }
        let mut child = block;
        while let Some(parent) = self.parents[child] {
            let surrounds = self.blocks[parent].next != Some(child);
            if surrounds && !self.blocks[parent].enabled {
                return false;
            }
            child = parent;
        }
        true
    }

    /// Statement chain starting at `first`, following `next` links.
    pub fn chain(&self, first: Option<BlockRef>) -> Vec<BlockRef> {
        let mut out = Vec::new();
        let mut current = first;
        while let Some(b) = current {
            out.push(b);
            current = self.blocks[b].next;
        }
        out
    }

    /// `block` and everything reachable below it, depth first.
    pub fn descendants(&self, block: BlockRef) -> Vec<BlockRef> {
        let mut out = Vec::new();
        let mut stack = vec![block];
        while let Some(b) = stack.pop() {
            out.push(b);
            let current = &self.blocks[b];
            if let Some(next) = current.next {
                stack.push(next);
            }
            for input in current.inputs.iter().rev() {
                if let Some(target) = input.target {
                    stack.push(target);
                }
            }
        }
        out
    }

    /// `block` and its inputs, without the statements chained after it.
    pub fn subtree(&self, block: BlockRef) -> Vec<BlockRef> {
        let mut out = vec![block];
        for target in self.blocks[block].inputs.iter().filter_map(|i| i.target) {
            out.extend(self.descendants(target));
        }
        out
    }

    /// Function definition block for `name`, first in document order.
    pub fn function_definition(&self, name: &str) -> Option<BlockRef> {
        self.refs().find(|b| {
            let block = &self.blocks[*b];
            block.kind == BlockKind::FunctionDefinition && block.function_name() == Some(name)
        })
    }
}

#[derive(Debug, Clone)]
pub struct BlockSpec {
    id: String,
    tag: String,
    enabled: bool,
    shadow: bool,
    fields: Vec<Field>,
    inputs: Vec<(String, InputKind, Option<String>)>,
    next: Option<String>,
    mutation: Option<Mutator>,
    output: Option<Vec<String>>,
    arguments: Vec<FunctionArg>,
}

impl BlockSpec {
    pub fn new(id: &str, tag: &str) -> Self {
        Self {
            id: id.to_string(),
            tag: tag.to_string(),
            enabled: true,
            shadow: false,
            fields: Vec::new(),
            inputs: Vec::new(),
            next: None,
            mutation: None,
            output: None,
            arguments: Vec::new(),
        }
    }

    pub fn field(mut self, name: &str, value: &str) -> Self {
        self.fields.push(Field {
            name: name.to_string(),
            value: value.to_string(),
        });
        self
    }

    pub fn value(mut self, name: &str, child: &str) -> Self {
        self.inputs
            .push((name.to_string(), InputKind::Value, Some(child.to_string())));
        self
    }

    /// Declares a value input with nothing connected.
    pub fn empty_value(mut self, name: &str) -> Self {
        self.inputs.push((name.to_string(), InputKind::Value, None));
        self
    }

    pub fn statements(mut self, name: &str, first: Option<&str>) -> Self {
        self.inputs.push((
            name.to_string(),
            InputKind::Statement,
            first.map(ToString::to_string),
        ));
        self
    }

    pub fn input(mut self, name: &str, kind: InputKind, child: Option<&str>) -> Self {
        self.inputs
            .push((name.to_string(), kind, child.map(ToString::to_string)));
        self
    }

    pub fn next(mut self, id: &str) -> Self {
        self.next = Some(id.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn shadow(mut self) -> Self {
        self.shadow = true;
        self
    }

    pub fn mutation(mut self, mutation: Mutator) -> Self {
        self.mutation = Some(mutation);
        self
    }

    pub fn output(mut self, check: &[&str]) -> Self {
        self.output = Some(check.iter().map(ToString::to_string).collect());
        self
    }

    pub fn argument(mut self, id: &str, name: &str, type_name: &str) -> Self {
        self.arguments.push(FunctionArg {
            id: id.to_string(),
            name: name.to_string(),
            type_name: type_name.to_string(),
        });
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceBuilder {
    specs: Vec<BlockSpec>,
    variables: Vec<VariableModel>,
}

impl WorkspaceBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn block(mut self, spec: BlockSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn add(&mut self, spec: BlockSpec) {
        self.specs.push(spec);
    }

    pub fn variable(mut self, name: &str, var_type: Option<&str>) -> Self {
        self.add_variable(name, var_type);
        self
    }

    pub fn add_variable(&mut self, name: &str, var_type: Option<&str>) {
        self.variables.push(VariableModel {
            name: name.to_string(),
            var_type: var_type.map(ToString::to_string),
        });
    }

    /// Resolves ids and block kinds. Fails on dangling references, blocks
    /// with two parents and parent cycles.
    pub fn build(self, api: &ApiInfo) -> Result<Workspace> {
        let mut index: HashMap<String, BlockRef> = HashMap::new();
        for (position, spec) in self.specs.iter().enumerate() {
            if index.insert(spec.id.clone(), position).is_some() {
                bail!("Duplicate block id '{}'.", spec.id);
            }
        }
        let resolve = |owner: &str, id: &str| -> Result<BlockRef> {
            index
                .get(id)
                .copied()
                .ok_or_else(|| anyhow!("Block '{}' references unknown block '{}'.", owner, id))
        };

        let mut parents: Vec<Option<BlockRef>> = vec![None; self.specs.len()];
        let mut blocks = Vec::with_capacity(self.specs.len());
        for (position, spec) in self.specs.into_iter().enumerate() {
            let mut inputs = Vec::with_capacity(spec.inputs.len());
            for (name, kind, child) in spec.inputs {
                let target = match child {
                    Some(id) => Some(resolve(&spec.id, &id)?),
                    None => None,
                };
                inputs.push(Input { name, kind, target });
            }
            let next = match &spec.next {
                Some(id) => Some(resolve(&spec.id, id)?),
                None => None,
            };
            for child in inputs.iter().filter_map(|i| i.target).chain(next) {
                if child == position {
                    bail!("Block '{}' is connected to itself.", spec.id);
                }
                if parents[child].replace(position).is_some() {
                    bail!(
                        "Block '{}' connects a block that already has a parent.",
                        spec.id
                    );
                }
            }

            let (kind, default_output) = resolve_kind(&spec.tag, &spec.fields, &inputs, spec.shadow, api);
            let signature = match kind {
                BlockKind::FunctionDefinition | BlockKind::FunctionCall | BlockKind::FunctionCallOutput => {
                    spec.fields
                        .iter()
                        .find(|f| f.name == "function_name")
                        .map(|f| FunctionSignature {
                            name: f.value.clone(),
                            args: spec.arguments.clone(),
                        })
                }
                _ => None,
            };
            blocks.push(Block {
                id: spec.id,
                tag: spec.tag,
                kind,
                enabled: spec.enabled,
                shadow: spec.shadow,
                inputs,
                fields: spec.fields,
                next,
                mutation: spec.mutation,
                output_check: spec.output.or(default_output),
                signature,
            });
        }

        for start in 0..blocks.len() {
            let mut current = parents[start];
            let mut steps = 0;
            while let Some(parent) = current {
                steps += 1;
                if parent == start || steps > blocks.len() {
                    bail!("Block '{}' is part of a connection cycle.", blocks[start].id);
                }
                current = parents[parent];
            }
        }

        Ok(Workspace {
            blocks,
            parents,
            variables: self.variables,
        })
    }
}

fn shape(types: &[&str]) -> Option<Vec<String>> {
    Some(types.iter().map(ToString::to_string).collect())
}

fn field_of<'a>(fields: &'a [Field], name: &str) -> Option<&'a str> {
    fields.iter().find(|f| f.name == name).map(|f| f.value.as_str())
}

/// Maps a tag string to its kind and default output shape.
fn resolve_kind(
    tag: &str,
    fields: &[Field],
    inputs: &[Input],
    shadow: bool,
    api: &ApiInfo,
) -> (BlockKind, Option<Vec<String>>) {
    let op = field_of(fields, "OP").unwrap_or_default();
    match tag {
        ON_START => (BlockKind::OnStart, None),
        "variables_get" => (BlockKind::VariableGet, shape(&["T"])),
        "variables_set" => (BlockKind::VariableSet, None),
        "variables_change" => (BlockKind::VariableChange, None),
        "math_number" | "math_integer" | "math_whole_number" | "math_number_minmax" => {
            (BlockKind::NumberLiteral, shape(&[NUMBER]))
        }
        "text" => (BlockKind::TextLiteral, shape(&[STRING])),
        "logic_boolean" => (BlockKind::BooleanLiteral, shape(&[BOOLEAN])),
        "math_arithmetic" => match ArithmeticOp::from_field(op) {
            Some(op) => (BlockKind::Arithmetic(op), shape(&[NUMBER])),
            None => (BlockKind::Unknown, shape(&[NUMBER])),
        },
        "logic_compare" => match CompareOp::from_field(op) {
            Some(op) => (BlockKind::Compare(op), shape(&[BOOLEAN])),
            None => (BlockKind::Unknown, shape(&[BOOLEAN])),
        },
        "logic_operation" => match op {
            "AND" => (BlockKind::BoolOperation(BoolOp::And), shape(&[BOOLEAN])),
            "OR" => (BlockKind::BoolOperation(BoolOp::Or), shape(&[BOOLEAN])),
            _ => (BlockKind::Unknown, shape(&[BOOLEAN])),
        },
        "logic_negate" => (BlockKind::Negate, shape(&[BOOLEAN])),
        "math_modulo" => (BlockKind::Modulo, shape(&[NUMBER])),
        "math_op2" => {
            let name = if op.is_empty() { "min" } else { op };
            (BlockKind::MathBinary(name.to_string()), shape(&[NUMBER]))
        }
        "math_op3" => (BlockKind::MathUnary("abs".to_string()), shape(&[NUMBER])),
        "math_js_op" => {
            let name = if op.is_empty() { "abs" } else { op };
            (BlockKind::MathUnary(name.to_string()), shape(&[NUMBER]))
        }
        "text_join" => (BlockKind::TextJoin, shape(&[STRING])),
        "text_length" => (BlockKind::TextLength, shape(&[NUMBER])),
        "controls_if" => (BlockKind::If, None),
        "controls_repeat_ext" => (BlockKind::Repeat, None),
        "device_while" | "controls_whileUntil" => (BlockKind::While, None),
        "pxt_controls_for" | "controls_simple_for" => (BlockKind::ForRange, None),
        "pxt_controls_for_of" | "controls_for_of" => (BlockKind::ForOf, None),
        "break_keyword" => (BlockKind::Break, None),
        "continue_keyword" => (BlockKind::Continue, None),
        "lists_create_with" => (BlockKind::ListCreate, shape(&[ARRAY])),
        "lists_index_get" => (BlockKind::ListIndexGet, shape(&["T"])),
        "lists_index_set" => (BlockKind::ListIndexSet, None),
        "lists_length" => (BlockKind::ListLength, shape(&[NUMBER])),
        FUNCTION_DEFINITION => (BlockKind::FunctionDefinition, None),
        "function_call" => (BlockKind::FunctionCall, None),
        "function_call_output" => (BlockKind::FunctionCallOutput, shape(&["T"])),
        "function_return" => (BlockKind::FunctionReturn, None),
        "typescript_statement" => (BlockKind::TypeScriptStatement, None),
        "typescript_expression" => (BlockKind::TypeScriptExpression, shape(&["T"])),
        _ if tag.starts_with("argument_reporter") => (BlockKind::ArgumentReporter, shape(&["T"])),
        _ => {
            if let Some(symbol) = api.symbol_for_block(tag) {
                return (
                    BlockKind::HostCall(symbol.qualified_name()),
                    api.output_shape(symbol),
                );
            }
            if shadow && fields.len() == 1 && inputs.is_empty() {
                return (BlockKind::FieldLiteral, shape(&["T"]));
            }
            (BlockKind::Unknown, None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::SymbolInfo;

    #[test]
    fn kinds_are_resolved_from_tags() {
        let api = ApiInfo::new()
            .with_symbol(SymbolInfo::new("sprites", "create", "Sprite").block("sprites_create"));
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("a", "math_arithmetic").field("OP", "POWER"))
            .block(BlockSpec::new("b", "sprites_create"))
            .block(BlockSpec::new("c", "colorNumberPicker").shadow().field("value", "0xff0000"))
            .block(BlockSpec::new("d", "mystery_block"))
            .build(&api)
            .unwrap();
        assert_eq!(ws.block(0).kind, BlockKind::Arithmetic(ArithmeticOp::Power));
        assert_eq!(ws.block(1).kind, BlockKind::HostCall("sprites.create".to_string()));
        assert_eq!(ws.block(1).output_check, Some(vec!["Sprite".to_string()]));
        assert_eq!(ws.block(2).kind, BlockKind::FieldLiteral);
        assert_eq!(ws.block(3).kind, BlockKind::Unknown);
        assert!(!ws.block(3).has_output());
    }

    #[test]
    fn parents_and_top_blocks() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("set")))
            .block(
                BlockSpec::new("set", "variables_set")
                    .field("VAR", "x")
                    .value("VALUE", "num")
                    .next("set2"),
            )
            .block(BlockSpec::new("num", "math_number").field("NUM", "1"))
            .block(BlockSpec::new("set2", "variables_set").field("VAR", "y").disabled())
            .block(BlockSpec::new("loose", "math_number").field("NUM", "2"))
            .build(&ApiInfo::new())
            .unwrap();
        assert_eq!(ws.top_blocks(), vec![0, 4]);
        assert_eq!(ws.parent(2), Some(1));
        assert_eq!(ws.chain(Some(1)), vec![1, 3]);
        assert!(!ws.is_enabled(3));
        assert!(ws.is_enabled(2));
        assert_eq!(ws.descendants(0), vec![0, 1, 2, 3]);
        assert_eq!(ws.subtree(1), vec![1, 2]);
    }

    #[test]
    fn disabling_a_statement_leaves_its_successor_enabled() {
        let ws = WorkspaceBuilder::new()
            .block(
                BlockSpec::new("loop", "device_while")
                    .statements("DO", Some("a"))
                    .disabled(),
            )
            .block(BlockSpec::new("a", "break_keyword").disabled().next("b"))
            .block(BlockSpec::new("b", "continue_keyword"))
            .block(BlockSpec::new("c", "break_keyword").disabled().next("d"))
            .block(BlockSpec::new("d", "continue_keyword"))
            .build(&ApiInfo::new())
            .unwrap();
        assert!(!ws.is_enabled(2), "surrounding loop is disabled");
        assert!(ws.is_enabled(4));
    }

    #[test]
    fn malformed_graphs_are_rejected() {
        let api = ApiInfo::new();
        let dangling = WorkspaceBuilder::new()
            .block(BlockSpec::new("a", "variables_set").value("VALUE", "nope"))
            .build(&api);
        assert!(dangling.unwrap_err().to_string().contains("nope"));

        let shared = WorkspaceBuilder::new()
            .block(BlockSpec::new("a", "logic_negate").value("BOOL", "c"))
            .block(BlockSpec::new("b", "logic_negate").value("BOOL", "c"))
            .block(BlockSpec::new("c", "logic_boolean").field("BOOL", "TRUE"))
            .build(&api);
        assert!(shared.is_err());

        let cycle = WorkspaceBuilder::new()
            .block(BlockSpec::new("a", "variables_set").next("b"))
            .block(BlockSpec::new("b", "variables_set").next("a"))
            .build(&api);
        assert!(cycle.unwrap_err().to_string().contains("cycle"));
    }

    #[test]
    fn numbered_inputs_skip_other_names() {
        let ws = WorkspaceBuilder::new()
            .block(
                BlockSpec::new("if", "controls_if")
                    .empty_value("IF0")
                    .statements("DO0", None)
                    .empty_value("IF1")
                    .statements("ELSE", None),
            )
            .build(&ApiInfo::new())
            .unwrap();
        let names = ws
            .block(0)
            .numbered_inputs("IF")
            .map(|i| i.name.as_str())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["IF0", "IF1"]);
    }
}
