//! Inference Pass: one walk over every live block applying its typing rule.

use crate::api::ParameterDesc;
use crate::blocks::{BlockKind, BlockRef};
use crate::diagnostics::{InferError, PipelineError};
use crate::env::{Environment, Target};
use crate::mutation::{Mutator, INSTANCE_INPUT};
use crate::points::{is_array_type, PointId, ANY, ARRAY, BOOLEAN, NUMBER, STRING};
use crate::resolver::{block_return_type, function_return_type, return_type, return_type_with_inheritance};
use tracing::{debug, trace};

pub fn infer_types(env: &mut Environment) -> Result<(), PipelineError> {
    let ws = env.workspace;
    let mut failures = 0;
    for block in ws.refs() {
        if !env.is_live(block) || !env.block_scope.contains_key(&block) {
            continue;
        }
        match infer_block(env, block) {
            Ok(()) => {}
            Err(InferError::Unify(err)) => {
                failures += 1;
                env.report(block, err.to_string());
            }
            Err(InferError::Fatal(err)) => return Err(err),
        }
    }
    default_unresolved(env);
    debug!(failures, "inference done");
    Ok(())
}

/// Unifies two points unless either side is already dynamically typed.
fn union_points(env: &mut Environment, a: PointId, b: PointId) -> Result<(), InferError> {
    let dynamic = |env: &mut Environment, p: PointId| env.points.type_of(p).as_deref() == Some(ANY);
    if dynamic(env, a) || dynamic(env, b) {
        return Ok(());
    }
    env.points.union(a, b)?;
    Ok(())
}

/// Point standing for a declared parameter or check type. Generic and
/// dynamic shapes give `None`.
fn shape_point(env: &mut Environment, type_name: &str) -> Option<PointId> {
    match type_name {
        "T" | ANY => None,
        ARRAY | "T[]" | "any[]" => Some(env.points.mk_point(Some(ARRAY), true)),
        other => Some(env.points.ground(other)),
    }
}

fn union_input(env: &mut Environment, block: BlockRef, input: &str, type_name: &str) -> Result<PointId, InferError> {
    let target = env.attach_placeholder_if(block, input, Some(type_name));
    let point = return_type(env, target)?;
    if let Some(expected) = shape_point(env, type_name) {
        union_points(env, point, expected)?;
    }
    Ok(point)
}

fn input_point(env: &mut Environment, block: BlockRef, input: &str) -> Result<PointId, InferError> {
    let target = env.attach_placeholder_if(block, input, None);
    return_type(env, target)
}

fn infer_block(env: &mut Environment, block: BlockRef) -> Result<(), InferError> {
    let ws = env.workspace;
    let b = ws.block(block);
    trace!(block = %b.id, tag = %b.tag, "infer");
    match &b.kind {
        BlockKind::Arithmetic(_) | BlockKind::Modulo | BlockKind::MathBinary(_) | BlockKind::MathUnary(_) => {
            for input in b.value_inputs() {
                union_input(env, block, &input.name, NUMBER)?;
            }
        }
        BlockKind::Compare(op) if op.is_equality() => {
            let left = input_point(env, block, "A")?;
            let right = input_point(env, block, "B")?;
            union_points(env, left, right)?;
        }
        BlockKind::Compare(_) => {
            union_input(env, block, "A", NUMBER)?;
            union_input(env, block, "B", NUMBER)?;
        }
        BlockKind::BoolOperation(_) => {
            union_input(env, block, "A", BOOLEAN)?;
            union_input(env, block, "B", BOOLEAN)?;
        }
        BlockKind::Negate => {
            union_input(env, block, "BOOL", BOOLEAN)?;
        }
        BlockKind::TextLength => {
            union_input(env, block, "VALUE", STRING)?;
        }
        BlockKind::If => {
            let conditions = b.numbered_inputs("IF").map(|i| i.name.clone()).collect::<Vec<_>>();
            for input in conditions {
                union_input(env, block, &input, BOOLEAN)?;
            }
        }
        BlockKind::Repeat => {
            union_input(env, block, "TIMES", NUMBER)?;
        }
        BlockKind::While => {
            union_input(env, block, "COND", BOOLEAN)?;
        }
        BlockKind::ForRange => {
            if b.input("FROM").is_some() {
                union_input(env, block, "FROM", NUMBER)?;
            }
            union_input(env, block, "TO", NUMBER)?;
        }
        BlockKind::ForOf => {
            let list = union_input(env, block, "LIST", ARRAY)?;
            let var = env.lookup(block, b.variable_field().unwrap_or_default())?;
            let element = env.binding(var).type_point;
            env.points.generic_link(list, element)?;
        }
        BlockKind::VariableSet => {
            let var = env.lookup(block, b.variable_field().unwrap_or_default())?;
            let point = env.binding(var).type_point;
            let value = env.attach_placeholder_if(block, "VALUE", None);
            narrow_assignment(env, point, value)?;
        }
        BlockKind::VariableChange => {
            let var = env.lookup(block, b.variable_field().unwrap_or_default())?;
            let point = env.binding(var).type_point;
            let number = env.points.ground(NUMBER);
            union_points(env, point, number)?;
            union_input(env, block, "VALUE", NUMBER)?;
        }
        BlockKind::ListIndexGet => {
            union_input(env, block, "LIST", ARRAY)?;
            union_input(env, block, "INDEX", NUMBER)?;
            block_return_type(env, block)?;
        }
        BlockKind::ListIndexSet => {
            let list = union_input(env, block, "LIST", ARRAY)?;
            union_input(env, block, "INDEX", NUMBER)?;
            let value = input_point(env, block, "VALUE")?;
            env.points.generic_link(list, value)?;
        }
        BlockKind::ListLength => {
            let input = if b.input("LIST").is_some() { "LIST" } else { "VALUE" };
            union_input(env, block, input, ARRAY)?;
        }
        BlockKind::ListCreate => {
            let list = block_return_type(env, block)?;
            let rep = env.points.find(list);
            if let Some(element) = env.points.get(rep).child_type {
                let items = b
                    .numbered_inputs("ADD")
                    .filter_map(|i| i.target)
                    .filter(|i| env.is_live(*i))
                    .collect::<Vec<_>>();
                for item in items {
                    let point = block_return_type(env, item)?;
                    union_points(env, element, point)?;
                }
            }
        }
        BlockKind::FunctionDefinition => {
            if let Some(name) = b.function_name() {
                function_return_type(env, name)?;
            }
        }
        BlockKind::FunctionCall | BlockKind::FunctionCallOutput => infer_function_call(env, block)?,
        BlockKind::HostCall(qname) => infer_host_call(env, block, qname)?,
        _ => {}
    }
    Ok(())
}

/// Assignment policy: a value whose type is a known supertype of the
/// variable's current type leaves the narrower type in place, and a value
/// whose type is a subtype is accepted as is. Everything else unifies.
pub fn narrow_assignment(env: &mut Environment, variable: PointId, value: Target) -> Result<(), InferError> {
    let candidates = return_type_with_inheritance(env, value)?;
    let Some(narrowest) = candidates.first().copied() else {
        return Ok(());
    };
    let current = env.points.concrete_type_name(variable);
    let assigned = env.points.concrete_type_name(narrowest);
    if let (Some(current), Some(assigned)) = (current.as_deref(), assigned.as_deref()) {
        if current != assigned {
            let wider = env.api.supertypes_of(current).iter().any(|t| t == assigned);
            let narrower = env.api.supertypes_of(assigned).iter().any(|t| t == current);
            if wider || narrower {
                trace!(current, assigned, "assignment keeps the variable type");
                return Ok(());
            }
        }
    }
    union_points(env, variable, narrowest)
}

fn infer_function_call(env: &mut Environment, block: BlockRef) -> Result<(), InferError> {
    let ws = env.workspace;
    let b = ws.block(block);
    let Some(signature) = b.signature.as_ref() else {
        return Ok(());
    };
    let definition = ws.function_definition(&signature.name).and_then(|def| {
        env.block_scope
            .get(&def)
            .copied()
            .filter(|scope| env.scopes[*scope].first_statement == Some(def))
    });
    for arg in &signature.args {
        let target = env.attach_placeholder_if(block, &arg.id, None);
        let point = return_type(env, target)?;
        let parameter = definition.and_then(|scope| env.scopes[scope].declared_vars.get(&arg.name).copied());
        match parameter {
            Some(binding) => {
                let expected = env.binding(binding).type_point;
                union_points(env, point, expected)?;
            }
            None => {
                if let Some(expected) = shape_point(env, &arg.type_name) {
                    union_points(env, point, expected)?;
                }
            }
        }
    }
    Ok(())
}

/// Input a host call parameter is connected through.
pub fn parameter_input(block_mutation: Option<&Mutator>, param: &ParameterDesc) -> String {
    match block_mutation {
        Some(Mutator::DefaultInstance(_)) if param.is_receiver => INSTANCE_INPUT.to_string(),
        _ => param.name.clone(),
    }
}

fn infer_host_call(env: &mut Environment, block: BlockRef, qname: &str) -> Result<(), InferError> {
    let ws = env.workspace;
    let b = ws.block(block);
    let Some(symbol) = env.api.symbol(qname) else {
        return Err(PipelineError::at(&b.id, format!("Unknown API symbol '{}'.", qname)).into());
    };

    let mut receiver_point = None;
    for param in &symbol.parameters {
        let input = parameter_input(b.mutation.as_ref(), param);
        if b.input(&input).is_none() {
            continue;
        }
        if b.input_target(&input).is_some_and(|child| ws.block(child).kind == BlockKind::FieldLiteral) {
            continue;
        }
        let checks = param.checks();
        let placeholder_type = checks.first().filter(|t| shape_point_is_ground(t)).map(String::as_str);
        let target = env.attach_placeholder_if(block, &input, placeholder_type);
        let point = return_type(env, target)?;
        if param.is_receiver {
            receiver_point = Some(point);
        }
        if param.type_name == "T" {
            if let Some(receiver) = receiver_point.filter(|_| !param.is_receiver) {
                if env.points.is_array_point(receiver) {
                    env.points.generic_link(receiver, point)?;
                }
            }
        }
        for check in &checks {
            let Some(expected) = shape_point(env, check) else {
                break;
            };
            if union_points(env, point, expected).is_ok() {
                break;
            }
        }
    }
    Ok(())
}

fn shape_point_is_ground(type_name: &str) -> bool {
    !matches!(type_name, "T" | ANY) && !is_array_type(type_name)
}

/// Unresolved variables become `number` (or `number[]`); unresolved array
/// function parameters become `any[]`.
fn default_unresolved(env: &mut Environment) {
    for id in 0..env.bindings.len() {
        let binding = &env.bindings[id];
        let (point, is_parameter) = (binding.type_point, binding.is_function_parameter);
        let resolved = env.points.concrete_type_name(point);
        if resolved.as_deref().is_some_and(|t| t != ARRAY) {
            continue;
        }
        let is_array = env.points.is_array_point(point);
        match (is_parameter, is_array) {
            (true, true) => env.points.set_type(point, "any[]"),
            (true, false) => {}
            (false, true) => env.points.set_type(point, "number[]"),
            (false, false) => env.points.set_type(point, NUMBER),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiInfo, SymbolInfo};
    use crate::blocks::{BlockSpec, Workspace, WorkspaceBuilder, ON_START};
    use crate::scope::track_all_variables;

    fn run(ws: &Workspace, api: &ApiInfo, check: impl FnOnce(&mut Environment)) {
        let mut env = Environment::new(ws, api);
        track_all_variables(&mut env).unwrap();
        infer_types(&mut env).unwrap();
        check(&mut env);
    }

    fn variable_type(env: &mut Environment, name: &str) -> Option<String> {
        let id = env.bindings.iter().position(|b| b.name == name).unwrap();
        let point = env.bindings[id].type_point;
        env.points.concrete_type_name(point)
    }

    #[test]
    fn assignment_types_the_variable() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("set")))
            .block(BlockSpec::new("set", "variables_set").field("VAR", "name").value("VALUE", "t"))
            .block(BlockSpec::new("t", "text").field("TEXT", "bob"))
            .build(&ApiInfo::new())
            .unwrap();
        run(&ws, &ApiInfo::new(), |env| {
            assert_eq!(variable_type(env, "name").as_deref(), Some(STRING));
            assert!(env.diagnostics.is_empty());
        });
    }

    #[test]
    fn mixed_equality_is_reported_and_pass_continues() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("if")))
            .block(
                BlockSpec::new("if", "controls_if")
                    .value("IF0", "cmp")
                    .statements("DO0", Some("set")),
            )
            .block(BlockSpec::new("cmp", "logic_compare").field("OP", "EQ").value("A", "s").value("B", "n"))
            .block(BlockSpec::new("s", "text").field("TEXT", "5"))
            .block(BlockSpec::new("n", "math_number").field("NUM", "5"))
            .block(BlockSpec::new("set", "variables_set").field("VAR", "flag").value("VALUE", "b"))
            .block(BlockSpec::new("b", "logic_boolean").field("BOOL", "TRUE"))
            .build(&ApiInfo::new())
            .unwrap();
        run(&ws, &ApiInfo::new(), |env| {
            assert_eq!(env.diagnostics.len(), 1);
            assert_eq!(env.diagnostics[0].block_id, "cmp");
            assert_eq!(variable_type(env, "flag").as_deref(), Some(BOOLEAN));
        });
    }

    #[test]
    fn for_of_links_loop_variable_to_list() {
        let api = ApiInfo::new();
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("set")))
            .block(
                BlockSpec::new("set", "variables_set")
                    .field("VAR", "list")
                    .value("VALUE", "create")
                    .next("loop"),
            )
            .block(BlockSpec::new("create", "lists_create_with").value("ADD0", "one"))
            .block(BlockSpec::new("one", "math_number").field("NUM", "1"))
            .block(
                BlockSpec::new("loop", "pxt_controls_for_of")
                    .field("VAR", "value")
                    .value("LIST", "get")
                    .statements("DO", None),
            )
            .block(BlockSpec::new("get", "variables_get").field("VAR", "list"))
            .build(&api)
            .unwrap();
        run(&ws, &api, |env| {
            assert_eq!(variable_type(env, "list").as_deref(), Some("number[]"));
            assert_eq!(variable_type(env, "value").as_deref(), Some(NUMBER));
        });
    }

    #[test]
    fn unresolved_variables_default_to_number() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("set")))
            .block(BlockSpec::new("set", "variables_set").field("VAR", "x"))
            .build(&ApiInfo::new())
            .unwrap();
        run(&ws, &ApiInfo::new(), |env| {
            assert_eq!(variable_type(env, "x").as_deref(), Some(NUMBER));
        });
    }

    #[test]
    fn host_call_tries_later_checks() {
        let api = ApiInfo::new().with_symbol(
            SymbolInfo::new("game", "splash", "void")
                .block("game_splash")
                .param(ParameterDesc::new("text", "string").with_check(&["number", "string"])),
        );
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("init")))
            .block(
                BlockSpec::new("init", "variables_set")
                    .field("VAR", "label")
                    .value("VALUE", "t")
                    .next("call"),
            )
            .block(BlockSpec::new("t", "text").field("TEXT", "hi"))
            .block(BlockSpec::new("call", "game_splash").value("text", "get"))
            .block(BlockSpec::new("get", "variables_get").field("VAR", "label"))
            .build(&api)
            .unwrap();
        run(&ws, &api, |env| {
            assert!(env.diagnostics.is_empty());
            assert_eq!(variable_type(env, "label").as_deref(), Some(STRING));
        });
    }

    #[test]
    fn narrower_type_survives_reassignment() {
        let mut api = ApiInfo::new()
            .with_symbol(SymbolInfo::new("sprites", "create", "Sprite").block("sprites_create"))
            .with_symbol(SymbolInfo::new("sprites", "base", "Entity").block("sprites_base"));
        api.add_supertypes("Sprite", &["Entity"]);
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("a")))
            .block(BlockSpec::new("a", "variables_set").field("VAR", "s").value("VALUE", "mk").next("b"))
            .block(BlockSpec::new("mk", "sprites_create"))
            .block(BlockSpec::new("b", "variables_set").field("VAR", "s").value("VALUE", "base"))
            .block(BlockSpec::new("base", "sprites_base"))
            .build(&api)
            .unwrap();
        run(&ws, &api, |env| {
            assert!(env.diagnostics.is_empty());
            assert_eq!(variable_type(env, "s").as_deref(), Some("Sprite"));
        });
    }
}
