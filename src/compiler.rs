//! Statement/Expression Compiler.
//!
//! Runs after inference has settled and turns blocks into `OutputNode`
//! trees. Holes (missing, disabled or placeholder inputs) become default
//! literals of their inferred type.

use crate::api::SymbolInfo;
use crate::blocks::{BlockKind, BlockRef};
use crate::diagnostics::PipelineError;
use crate::env::{BindingId, DeclarationKind, Environment, Target};
use crate::infer::parameter_input;
use crate::mutation::{MutationContext, Mutator};
use crate::output::{flatten_expression, NodeKind, OutputNode};
use crate::points::{is_array_type, ANY, ARRAY, BOOLEAN, NUMBER, STRING};
use crate::resolver::{concrete_type_name, function_return_type, RETURN_VALUE_INPUT};
use crate::scope::{identifier_pattern, sanitize_identifier, HANDLER_FIELD_PREFIX, REPEAT_INDEX};
use regex::Regex;

type CompileResult<T> = Result<T, PipelineError>;

/// Default literal for a hole of the given type.
pub fn default_literal(type_name: Option<&str>) -> &'static str {
    match type_name {
        Some(NUMBER) => "0",
        Some(BOOLEAN) => "false",
        Some(STRING) => "\"\"",
        Some(ARRAY) => "[0]",
        Some(t) if is_array_type(t) => "[]",
        _ => "null",
    }
}

pub fn format_num(v: f64) -> String {
    if (v - v.round()).abs() < 1e-9 {
        format!("{}", v.round() as i64)
    } else {
        let s = format!("{:.6}", v);
        s.trim_end_matches('0').trim_end_matches('.').to_string()
    }
}

fn quote(text: &str) -> String {
    serde_json::to_string(text).unwrap_or_else(|_| "\"\"".to_string())
}

/// Wraps operators so a member access binds to the whole operand.
fn member(target: OutputNode, suffix: &str) -> OutputNode {
    let target = match target.kind {
        NodeKind::Infix { .. } | NodeKind::Prefix { .. } => OutputNode::parenthesized(target),
        _ => target,
    };
    OutputNode::group(vec![target, OutputNode::text(suffix)])
}

pub struct BlockCompiler<'e, 'a> {
    env: &'e mut Environment<'a>,
    identifier: Regex,
}

impl<'e, 'a> BlockCompiler<'e, 'a> {
    pub fn new(env: &'e mut Environment<'a>) -> CompileResult<Self> {
        Ok(Self {
            env,
            identifier: identifier_pattern()?,
        })
    }

    pub fn function_identifier(&self, name: &str) -> String {
        sanitize_identifier(&self.identifier, name)
    }

    fn block_id(&self, block: BlockRef) -> &str {
        &self.env.workspace.block(block).id
    }

    fn type_of_target(&mut self, target: Target) -> CompileResult<Option<String>> {
        concrete_type_name(self.env, target)
    }

    fn binding_type(&mut self, binding: BindingId) -> Option<String> {
        let point = self.env.binding(binding).type_point;
        self.env.points.concrete_type_name(point)
    }

    fn variable(&mut self, block: BlockRef, name: &str) -> CompileResult<BindingId> {
        self.env.lookup(block, name)
    }

    /// Compiles a statement chain into a brace block.
    pub fn emit_block(&mut self, first: Option<BlockRef>) -> CompileResult<OutputNode> {
        Ok(OutputNode::block(self.emit_statement_chain(first)?))
    }

    /// Compiles a statement chain, skipping dead blocks and prepending the
    /// declarations the scope tracker attached to each statement.
    pub fn emit_statement_chain(&mut self, first: Option<BlockRef>) -> CompileResult<Vec<OutputNode>> {
        let mut out = Vec::new();
        for block in self.env.workspace.chain(first) {
            if !self.env.is_live(block) {
                continue;
            }
            out.extend(self.emit_declarations_for(block)?);
            out.extend(self.emit_statement(block)?);
        }
        Ok(out)
    }

    pub fn emit_declarations_for(&mut self, block: BlockRef) -> CompileResult<Vec<OutputNode>> {
        let ids = self.env.block_declarations.get(&block).cloned().unwrap_or_default();
        Ok(ids.into_iter().map(|id| self.emit_declaration(id)).collect())
    }

    /// `let x = 0;` with the initializer chosen from the settled type.
    pub fn emit_declaration(&mut self, binding: BindingId) -> OutputNode {
        let name = self.env.escaped_name(binding).to_string();
        let text = match self.binding_type(binding).as_deref() {
            Some(NUMBER) | None => format!("let {} = 0", name),
            Some(BOOLEAN) => format!("let {} = false", name),
            Some(STRING) => format!("let {} = \"\"", name),
            Some(ARRAY) => format!("let {}: any[] = []", name),
            Some(ANY) => format!("let {}: any = null", name),
            Some(t) if is_array_type(t) => format!("let {}: {} = []", name, t),
            Some(t) => format!("let {}: {} = null", name, t),
        };
        OutputNode::stmt(vec![OutputNode::text(text)])
    }

    /// Compiles one statement block. The last node carries the block id.
    pub fn emit_statement(&mut self, block: BlockRef) -> CompileResult<Vec<OutputNode>> {
        let ws = self.env.workspace;
        let b = ws.block(block);
        let mut nodes = match &b.kind {
            BlockKind::OnStart => {
                let first = b.statement_inputs().find_map(|i| i.target);
                self.emit_statement_chain(first)?
            }
            BlockKind::VariableSet => vec![self.emit_set_stmt(block)?],
            BlockKind::VariableChange => vec![self.emit_change_stmt(block)?],
            BlockKind::If => vec![self.emit_if_stmt(block)?],
            BlockKind::Repeat => vec![self.emit_repeat_stmt(block)?],
            BlockKind::While => vec![self.emit_while_stmt(block)?],
            BlockKind::ForRange => vec![self.emit_for_stmt(block)?],
            BlockKind::ForOf => vec![self.emit_for_each_stmt(block)?],
            BlockKind::Break => vec![OutputNode::stmt(vec![OutputNode::text("break")])],
            BlockKind::Continue => vec![OutputNode::stmt(vec![OutputNode::text("continue")])],
            BlockKind::ListIndexSet => vec![self.emit_index_set_stmt(block)?],
            BlockKind::FunctionDefinition => vec![self.emit_function_definition(block)?],
            BlockKind::FunctionCall => {
                vec![OutputNode::stmt(vec![self.emit_function_call(block)?])]
            }
            BlockKind::FunctionReturn => vec![self.emit_return_stmt(block)?],
            BlockKind::TypeScriptStatement => b
                .field("CODE")
                .unwrap_or_default()
                .lines()
                .filter(|line| !line.trim().is_empty())
                .map(|line| OutputNode::text(line.trim_end()))
                .collect(),
            BlockKind::HostCall(qname) => {
                let call = self.emit_host_call(block, qname)?;
                let has_handler = self.env.api.symbol(qname).is_some_and(SymbolInfo::has_handler);
                if has_handler {
                    vec![call]
                } else {
                    vec![OutputNode::stmt(vec![call])]
                }
            }
            BlockKind::Unknown if !b.has_output() => {
                self.env.report(block, format!("Unsupported block '{}'.", b.tag));
                Vec::new()
            }
            _ => {
                // An array literal at statement start would index the previous line.
                let expr = self.emit_expr_reporter(block)?;
                if flatten_expression(&expr).starts_with('[') {
                    vec![OutputNode::stmt(vec![OutputNode::text(";"), expr])]
                } else {
                    vec![OutputNode::stmt(vec![expr])]
                }
            }
        };
        if let Some(last) = nodes.last_mut() {
            last.tag(&b.id);
        }
        Ok(nodes)
    }

    fn emit_set_stmt(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let binding = self.variable(block, b.variable_field().unwrap_or_default())?;
        let target = self.env.attach_placeholder_if(block, "VALUE", None);
        let value = self.expr_target(target)?;
        let name = self.env.escaped_name(binding).to_string();

        let declares_here = {
            let info = self.env.binding(binding);
            info.already_declared == Some(DeclarationKind::Assigned) && info.first_reference == Some(block)
        };
        if !declares_here {
            return Ok(OutputNode::stmt(vec![OutputNode::text(format!("{} = ", name)), value]));
        }

        let declared = self.binding_type(binding);
        let assigned = self.type_of_target(target)?;
        let untyped_literal = matches!(value.as_text(), Some("null") | Some("[]"));
        let head = match declared {
            Some(t) if untyped_literal || Some(&t) != assigned.as_ref() => format!("let {}: {} = ", name, t),
            _ => format!("let {} = ", name),
        };
        Ok(OutputNode::stmt(vec![OutputNode::text(head), value]))
    }

    fn emit_change_stmt(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let binding = self.variable(block, b.variable_field().unwrap_or_default())?;
        let value = self.expr_input(block, "VALUE")?;
        let name = self.env.escaped_name(binding).to_string();
        Ok(OutputNode::stmt(vec![OutputNode::text(format!("{} += ", name)), value]))
    }

    fn emit_if_stmt(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let mut parts = Vec::new();
        let branches = b
            .numbered_inputs("IF")
            .map(|i| i.name.clone())
            .collect::<Vec<_>>();
        for (index, condition) in branches.iter().enumerate() {
            let body = format!("DO{}", &condition[2..]);
            let keyword = if index == 0 { "if (" } else { " else if (" };
            parts.push(OutputNode::text(keyword));
            parts.push(self.expr_input(block, condition)?);
            parts.push(OutputNode::text(") "));
            parts.push(self.emit_block(b.input_target(&body))?);
        }
        if let Some(otherwise) = b.input("ELSE") {
            let body = self.emit_block(otherwise.target)?;
            if parts.is_empty() {
                return Ok(OutputNode::group(vec![OutputNode::text("if (true) "), body]));
            }
            parts.push(OutputNode::text(" else "));
            parts.push(body);
        }
        if parts.is_empty() {
            parts.push(OutputNode::text("if (false) "));
            parts.push(OutputNode::block(Vec::new()));
        }
        Ok(OutputNode::group(parts))
    }

    fn emit_repeat_stmt(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let index = self.variable(block, REPEAT_INDEX)?;
        let index = self.env.escaped_name(index).to_string();
        let times = self.expr_input(block, "TIMES")?;
        let body = self.emit_block(b.input_target("DO"))?;
        Ok(OutputNode::group(vec![
            OutputNode::text(format!("for (let {} = 0; {} < ", index, index)),
            times,
            OutputNode::text(format!("; {}++) ", index)),
            body,
        ]))
    }

    fn emit_while_stmt(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let condition = self.expr_input(block, "COND")?;
        let condition = if b.field("MODE") == Some("UNTIL") {
            OutputNode::prefix("!", condition)
        } else {
            condition
        };
        let body = self.emit_block(b.input_target("DO"))?;
        Ok(OutputNode::group(vec![
            OutputNode::text("while ("),
            condition,
            OutputNode::text(") "),
            body,
        ]))
    }

    fn emit_for_stmt(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let var = self.variable(block, b.variable_field().unwrap_or_default())?;
        let var = self.env.escaped_name(var).to_string();
        let from = match b.input("FROM") {
            Some(_) => self.expr_input(block, "FROM")?,
            None => OutputNode::text("0"),
        };
        let to = self.expr_input(block, "TO")?;
        let body = self.emit_block(b.input_target("DO"))?;
        Ok(OutputNode::group(vec![
            OutputNode::text(format!("for (let {} = ", var)),
            from,
            OutputNode::text(format!("; {} <= ", var)),
            to,
            OutputNode::text(format!("; {}++) ", var)),
            body,
        ]))
    }

    fn emit_for_each_stmt(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let var = self.variable(block, b.variable_field().unwrap_or_default())?;
        let var = self.env.escaped_name(var).to_string();
        let list = self.expr_input(block, "LIST")?;
        let body = self.emit_block(b.input_target("DO"))?;
        Ok(OutputNode::group(vec![
            OutputNode::text(format!("for (let {} of ", var)),
            list,
            OutputNode::text(") "),
            body,
        ]))
    }

    fn emit_index_set_stmt(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let list = self.expr_input(block, "LIST")?;
        let index = self.expr_input(block, "INDEX")?;
        let value = self.expr_input(block, "VALUE")?;
        Ok(OutputNode::stmt(vec![
            member(list, "["),
            index,
            OutputNode::text("] = "),
            value,
        ]))
    }

    fn emit_return_stmt(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        if self.env.workspace.block(block).input(RETURN_VALUE_INPUT).is_none() {
            return Ok(OutputNode::stmt(vec![OutputNode::text("return")]));
        }
        let value = self.expr_input(block, RETURN_VALUE_INPUT)?;
        Ok(OutputNode::stmt(vec![OutputNode::text("return "), value]))
    }

    fn emit_function_definition(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let name = b
            .function_name()
            .ok_or_else(|| PipelineError::at(&b.id, "Function definition without a name."))?;
        let mut params = Vec::new();
        for arg in b.signature.iter().flat_map(|s| s.args.iter()) {
            let binding = self.variable(block, &arg.name)?;
            let param_type = self.binding_type(binding).unwrap_or_else(|| ANY.to_string());
            params.push(format!("{}: {}", self.env.escaped_name(binding), param_type));
        }
        let returns = match function_return_type(self.env, name) {
            Ok(point) => self.env.points.concrete_type_name(point),
            Err(_) => None,
        };
        let annotation = if returns.as_deref() == Some(ANY) { ": any" } else { "" };
        let body_input = b.statement_inputs().next().and_then(|i| i.target);
        let body = self.emit_block(body_input)?;
        Ok(OutputNode::group(vec![
            OutputNode::text(format!(
                "function {}({}){} ",
                self.function_identifier(name),
                params.join(", "),
                annotation
            )),
            body,
        ]))
    }

    /// `name(args)` for calls to user functions.
    fn emit_function_call(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let name = b.function_name().unwrap_or_default();
        let mut args = Vec::new();
        for arg in b.signature.iter().flat_map(|s| s.args.iter()) {
            args.push(self.expr_input(block, &arg.id)?);
        }
        Ok(OutputNode::call(&self.function_identifier(name), args))
    }

    /// Compiles a value input, substituting a default literal for holes.
    pub fn expr_input(&mut self, block: BlockRef, input: &str) -> CompileResult<OutputNode> {
        let target = self.env.attach_placeholder_if(block, input, None);
        self.expr_target(target)
    }

    fn expr_target(&mut self, target: Target) -> CompileResult<OutputNode> {
        match target {
            Target::Block(child) => {
                let node = self.emit_expr_reporter(child)?;
                Ok(node.with_id(self.block_id(child)))
            }
            Target::Placeholder(_) => {
                let type_name = self.type_of_target(target)?;
                Ok(OutputNode::text(default_literal(type_name.as_deref())))
            }
        }
    }

    /// Compiles one expression block.
    pub fn emit_expr_reporter(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let ws = self.env.workspace;
        let b = ws.block(block);
        let node = match &b.kind {
            BlockKind::NumberLiteral => {
                let raw = b.field("NUM").unwrap_or("0");
                let text = raw.trim().parse::<f64>().map(format_num).unwrap_or_else(|_| "0".to_string());
                OutputNode::text(text)
            }
            BlockKind::TextLiteral => OutputNode::text(quote(b.field("TEXT").unwrap_or_default())),
            BlockKind::BooleanLiteral => {
                let value = b.field("BOOL").is_some_and(|v| v.eq_ignore_ascii_case("TRUE"));
                OutputNode::text(if value { "true" } else { "false" })
            }
            BlockKind::FieldLiteral => {
                OutputNode::text(b.fields.first().map(|f| f.value.clone()).unwrap_or_default())
            }
            BlockKind::VariableGet => {
                let binding = self.variable(block, b.variable_field().unwrap_or_default())?;
                OutputNode::text(self.env.escaped_name(binding))
            }
            BlockKind::ArgumentReporter => {
                let binding = self.variable(block, b.field("VALUE").unwrap_or_default())?;
                OutputNode::text(self.env.escaped_name(binding))
            }
            BlockKind::Arithmetic(op) => self.emit_binary_expr(block, "A", op.symbol(), "B")?,
            BlockKind::Modulo => self.emit_binary_expr(block, "DIVIDEND", "%", "DIVISOR")?,
            BlockKind::BoolOperation(op) => self.emit_binary_expr(block, "A", op.symbol(), "B")?,
            BlockKind::Compare(op) => {
                let left = self.expr_input(block, "A")?;
                let right = self.expr_input(block, "B")?;
                let mixed_literals = op.is_equality()
                    && left.is_literal()
                    && right.is_literal()
                    && flatten_expression(&left) != flatten_expression(&right);
                if mixed_literals {
                    let cast = |node: OutputNode| {
                        OutputNode::group(vec![OutputNode::text("("), node, OutputNode::text(" as any)")])
                    };
                    OutputNode::infix(cast(left), op.symbol(), cast(right))
                } else {
                    OutputNode::infix(left, op.symbol(), right)
                }
            }
            BlockKind::Negate => OutputNode::prefix("!", self.expr_input(block, "BOOL")?),
            BlockKind::MathBinary(name) | BlockKind::MathUnary(name) => {
                let inputs = b.value_inputs().map(|i| i.name.clone()).collect::<Vec<_>>();
                let mut args = Vec::new();
                for input in inputs {
                    args.push(self.expr_input(block, &input)?);
                }
                OutputNode::call(&format!("Math.{}", name), args)
            }
            BlockKind::TextJoin => self.emit_text_join(block)?,
            BlockKind::TextLength => member(self.expr_input(block, "VALUE")?, ".length"),
            BlockKind::ListCreate => {
                let inputs = b
                    .numbered_inputs("ADD")
                    .map(|i| i.name.clone())
                    .collect::<Vec<_>>();
                let mut items = Vec::new();
                for input in inputs {
                    items.push(self.expr_input(block, &input)?);
                }
                OutputNode::group(vec![
                    OutputNode::text("["),
                    OutputNode::comma_separated(items),
                    OutputNode::text("]"),
                ])
            }
            BlockKind::ListIndexGet => {
                let list = self.expr_input(block, "LIST")?;
                let index = self.expr_input(block, "INDEX")?;
                OutputNode::group(vec![member(list, "["), index, OutputNode::text("]")])
            }
            BlockKind::ListLength => {
                let input = if b.input("LIST").is_some() { "LIST" } else { "VALUE" };
                member(self.expr_input(block, input)?, ".length")
            }
            BlockKind::FunctionCallOutput => self.emit_function_call(block)?,
            BlockKind::TypeScriptExpression => {
                OutputNode::text(b.field("EXPRESSION").unwrap_or_default().trim())
            }
            BlockKind::HostCall(qname) => self.emit_host_call(block, qname)?,
            _ => {
                let type_name = self.type_of_target(Target::Block(block))?;
                OutputNode::text(default_literal(type_name.as_deref()))
            }
        };
        Ok(node)
    }

    fn emit_binary_expr(&mut self, block: BlockRef, left: &str, op: &str, right: &str) -> CompileResult<OutputNode> {
        let left = self.expr_input(block, left)?;
        let right = self.expr_input(block, right)?;
        Ok(OutputNode::infix(left, op, right))
    }

    /// String concatenation; a non-string first operand is prefixed with
    /// `""` so the whole chain stays a string.
    fn emit_text_join(&mut self, block: BlockRef) -> CompileResult<OutputNode> {
        let inputs = self
            .env
            .workspace
            .block(block)
            .numbered_inputs("ADD")
            .map(|i| i.name.clone())
            .collect::<Vec<_>>();
        let mut parts = Vec::new();
        let mut first_is_string = false;
        for (index, input) in inputs.iter().enumerate() {
            let target = self.env.attach_placeholder_if(block, input, None);
            if index == 0 {
                first_is_string = self.type_of_target(target)?.as_deref() == Some(STRING);
            }
            parts.push(self.expr_target(target)?);
        }
        let mut parts = parts.into_iter();
        let Some(first) = parts.next() else {
            return Ok(OutputNode::text("\"\""));
        };
        let mut joined = if first_is_string {
            first
        } else {
            OutputNode::infix(OutputNode::text("\"\""), "+", first)
        };
        for part in parts {
            joined = OutputNode::infix(joined, "+", part);
        }
        Ok(joined)
    }

    /// Calls into the host API: namespace functions, receiver methods,
    /// property accessors, image literals and callback registrations.
    fn emit_host_call(&mut self, block: BlockRef, qname: &str) -> CompileResult<OutputNode> {
        let api = self.env.api;
        let b = self.env.workspace.block(block);
        let symbol = api
            .symbol(qname)
            .ok_or_else(|| PipelineError::at(&b.id, format!("Unknown API symbol '{}'.", qname)))?;
        let callee = symbol
            .attributes
            .alias_for
            .as_deref()
            .and_then(|alias| api.symbol(alias))
            .unwrap_or(symbol);

        if symbol.attributes.image_literal {
            let text = b.fields.first().map(|f| f.value.as_str()).unwrap_or_default();
            return Ok(OutputNode::text(format!("{}`{}`", callee.qualified_name(), text)));
        }

        let mut receiver = None;
        let mut args = Vec::new();
        for param in &symbol.parameters {
            let input = parameter_input(b.mutation.as_ref(), param);
            if param.is_receiver {
                receiver = Some(self.emit_receiver(block, symbol, &input)?);
                continue;
            }
            if b.input(&input).is_none() {
                if param.optional {
                    break;
                }
                let type_name = param.checks().into_iter().next();
                args.push(OutputNode::text(default_literal(type_name.as_deref())));
                continue;
            }
            args.push(self.expr_input(block, &input)?);
        }

        if let Some(mutation @ Mutator::Rest(_)) = b.mutation.as_ref() {
            if let Some(rest) = mutation.strategy().compile_mutation(self, block)? {
                args.push(rest);
            }
        }
        if symbol.has_handler() {
            args.push(self.emit_handler(block, symbol)?);
        }

        let (name, accessor) = match callee.name.split_once('@') {
            Some((prop, kind)) => (prop.to_string(), Some(kind.to_string())),
            None => (callee.name.clone(), None),
        };
        let target = match receiver {
            Some(receiver) => member(receiver, &format!(".{}", name)),
            None if callee.namespace.is_empty() => OutputNode::text(name),
            None => OutputNode::text(format!("{}.{}", callee.namespace, name)),
        };

        let mut args = args.into_iter();
        let node = match accessor.as_deref() {
            Some("get") => target,
            Some("set") => OutputNode::infix(
                target,
                "=",
                args.next().unwrap_or_else(|| OutputNode::text("null")),
            ),
            Some("change") => OutputNode::infix(
                target,
                "+=",
                args.next().unwrap_or_else(|| OutputNode::text("0")),
            ),
            _ => OutputNode::group(vec![
                target,
                OutputNode::text("("),
                OutputNode::comma_separated(args.collect()),
                OutputNode::text(")"),
            ]),
        };
        Ok(node)
    }

    fn emit_receiver(&mut self, block: BlockRef, symbol: &SymbolInfo, input: &str) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        if let Some(mutation @ Mutator::DefaultInstance(_)) = b.mutation.as_ref() {
            if let Some(node) = mutation.strategy().compile_mutation(self, block)? {
                return Ok(node);
            }
            if let Some(instance) = symbol.attributes.default_instance.as_deref() {
                return Ok(OutputNode::text(instance));
            }
        }
        self.expr_input(block, input)
    }

    /// `function (a, b) { ... }` for the trailing callback of a handler call.
    fn emit_handler(&mut self, block: BlockRef, symbol: &SymbolInfo) -> CompileResult<OutputNode> {
        let b = self.env.workspace.block(block);
        let mut params = Vec::new();
        for param in symbol.handler.iter().flatten() {
            let field = format!("{}{}", HANDLER_FIELD_PREFIX, param.name);
            let name = b.field(&field).unwrap_or(&param.name);
            let binding = self.variable(block, name)?;
            params.push(self.env.escaped_name(binding).to_string());
        }
        if let Some(mutation @ Mutator::Destructuring(_)) = b.mutation.as_ref() {
            if let Some(pattern) = mutation.strategy().compile_mutation(self, block)? {
                params = vec![flatten_expression(&pattern)];
            }
        }
        let body = self.emit_block(b.statement_inputs().next().and_then(|i| i.target))?;
        Ok(OutputNode::group(vec![
            OutputNode::text(format!("function ({}) ", params.join(", "))),
            body,
        ]))
    }
}

impl MutationContext for BlockCompiler<'_, '_> {
    fn compile_input(&mut self, block: BlockRef, input: &str) -> Result<Option<OutputNode>, PipelineError> {
        if self.env.workspace.block(block).input(input).is_none() {
            return Ok(None);
        }
        self.expr_input(block, input).map(Some)
    }

    fn variable_name(&mut self, block: BlockRef, name: &str) -> Result<String, PipelineError> {
        let binding = self.variable(block, name)?;
        Ok(self.env.escaped_name(binding).to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiInfo, ParameterDesc, SymbolInfo};
    use crate::blocks::{BlockSpec, Workspace, WorkspaceBuilder, ON_START};
    use crate::infer::infer_types;
    use crate::mutation::{DestructuringMutator, RestParameterMutator};
    use crate::output::flatten;
    use crate::scope::track_all_variables;

    fn compile(ws: &Workspace, api: &ApiInfo, top: BlockRef) -> String {
        let mut env = Environment::new(ws, api);
        track_all_variables(&mut env).unwrap();
        infer_types(&mut env).unwrap();
        let mut compiler = BlockCompiler::new(&mut env).unwrap();
        let nodes = compiler.emit_statement(top).unwrap();
        flatten(&nodes).source
    }

    #[test]
    fn default_literals_follow_types() {
        assert_eq!(default_literal(Some(NUMBER)), "0");
        assert_eq!(default_literal(Some(STRING)), "\"\"");
        assert_eq!(default_literal(Some(BOOLEAN)), "false");
        assert_eq!(default_literal(Some("number[]")), "[]");
        assert_eq!(default_literal(None), "null");
        assert_eq!(default_literal(Some("Sprite")), "null");
        assert_eq!(default_literal(Some(ARRAY)), "[0]");
    }

    #[test]
    fn array_expression_statement_is_isolated() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("list")))
            .block(BlockSpec::new("list", "lists_create_with").value("ADD0", "one"))
            .block(BlockSpec::new("one", "math_number").field("NUM", "1"))
            .build(&ApiInfo::new())
            .unwrap();
        assert_eq!(compile(&ws, &ApiInfo::new(), 0), ";[1];\n");
    }

    #[test]
    fn numbers_print_compactly() {
        assert_eq!(format_num(4.0), "4");
        assert_eq!(format_num(-0.5), "-0.5");
        assert_eq!(format_num(1.0 / 3.0), "0.333333");
    }

    #[test]
    fn different_literals_are_cast_before_comparing() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("set")))
            .block(BlockSpec::new("set", "variables_set").field("VAR", "same").value("VALUE", "cmp"))
            .block(BlockSpec::new("cmp", "logic_compare").field("OP", "EQ").value("A", "s").value("B", "n"))
            .block(BlockSpec::new("s", "text").field("TEXT", "5"))
            .block(BlockSpec::new("n", "math_number").field("NUM", "5"))
            .build(&ApiInfo::new())
            .unwrap();
        let out = compile(&ws, &ApiInfo::new(), 0);
        assert_eq!(out, "let same = (\"5\" as any) == (5 as any);\n");
    }

    #[test]
    fn for_loop_bounds_are_inclusive() {
        let ws = WorkspaceBuilder::new()
            .block(
                BlockSpec::new("loop", "pxt_controls_for")
                    .field("VAR", "i")
                    .value("TO", "four")
                    .statements("DO", None),
            )
            .block(BlockSpec::new("four", "math_number").field("NUM", "4"))
            .build(&ApiInfo::new())
            .unwrap();
        let out = compile(&ws, &ApiInfo::new(), 0);
        assert_eq!(out, "for (let i = 0; i <= 4; i++) {\n}\n");
    }

    #[test]
    fn missing_inputs_compile_to_typed_defaults() {
        let ws = WorkspaceBuilder::new()
            .block(
                BlockSpec::new("if", "controls_if")
                    .empty_value("IF0")
                    .statements("DO0", Some("rep")),
            )
            .block(BlockSpec::new("rep", "controls_repeat_ext").empty_value("TIMES").statements("DO", None))
            .build(&ApiInfo::new())
            .unwrap();
        let out = compile(&ws, &ApiInfo::new(), 0);
        assert_eq!(
            out,
            "if (false) {\n    for (let index = 0; index < 0; index++) {\n    }\n}\n"
        );
    }

    #[test]
    fn host_calls_cover_accessors_and_handlers() {
        let api = ApiInfo::new()
            .with_symbol(
                SymbolInfo::new("sprites", "onOverlap", "void")
                    .block("sprites_on_overlap")
                    .handler(&[("sprite", "Sprite"), ("otherSprite", "Sprite")]),
            )
            .with_symbol(
                SymbolInfo::new("Sprite", "x@set", "void")
                    .block("sprite_set_x")
                    .param(ParameterDesc::new("sprite", "Sprite").receiver())
                    .param(ParameterDesc::new("value", "number")),
            );
        let ws = WorkspaceBuilder::new()
            .block(
                BlockSpec::new("ev", "sprites_on_overlap")
                    .field("HANDLER_otherSprite", "other")
                    .statements("HANDLER", Some("setx")),
            )
            .block(
                BlockSpec::new("setx", "sprite_set_x")
                    .value("sprite", "get")
                    .value("value", "ten"),
            )
            .block(BlockSpec::new("get", "variables_get").field("VAR", "other"))
            .block(BlockSpec::new("ten", "math_number").field("NUM", "10"))
            .build(&api)
            .unwrap();
        let out = compile(&ws, &api, 0);
        assert_eq!(
            out,
            "sprites.onOverlap(function (sprite, other) {\n    other.x = 10;\n})\n"
        );
    }

    #[test]
    fn mutations_extend_calls() {
        let api = ApiInfo::new()
            .with_symbol(
                SymbolInfo::new("console", "log", "void")
                    .block("console_log")
                    .param(ParameterDesc::new("first", "number")),
            )
            .with_symbol(
                SymbolInfo::new("game", "onTap", "void")
                    .block("game_on_tap")
                    .handler(&[("event", "TapEvent")]),
            );
        let ws = WorkspaceBuilder::new()
            .block(
                BlockSpec::new("log", "console_log")
                    .value("first", "one")
                    .value("REST0", "two")
                    .mutation(Mutator::Rest(RestParameterMutator { count: 2 })),
            )
            .block(BlockSpec::new("one", "math_number").field("NUM", "1"))
            .block(BlockSpec::new("two", "math_number").field("NUM", "2"))
            .block(
                BlockSpec::new("tap", "game_on_tap")
                    .statements("HANDLER", None)
                    .mutation(Mutator::Destructuring(DestructuringMutator {
                        properties: vec![("x".to_string(), "number".to_string())],
                    })),
            )
            .build(&api)
            .unwrap();
        assert_eq!(compile(&ws, &api, 0), "console.log(1, 2);\n");
        assert_eq!(compile(&ws, &api, 3), "game.onTap(function ({ x }) {\n})\n");
    }
}
