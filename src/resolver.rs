//! Type Resolver: the type a block produces when evaluated.

use crate::blocks::{BlockKind, BlockRef};
use crate::diagnostics::{InferError, PipelineError};
use crate::env::{Environment, Target};
use crate::points::{is_array_type, PointId, ANY, ARRAY, VOID};
use tracing::trace;

pub const RETURN_VALUE_INPUT: &str = "RETURN_VALUE";
pub const MIXED_RETURNS: &str = "All function return values must be of the same type";

pub fn return_type(env: &mut Environment, target: Target) -> Result<PointId, InferError> {
    match target {
        Target::Placeholder(index) => Ok(env.placeholder(index).point),
        Target::Block(block) => block_return_type(env, block),
    }
}

pub fn block_return_type(env: &mut Environment, block: BlockRef) -> Result<PointId, InferError> {
    if let Some(point) = env.expression_points.get(&block) {
        return Ok(*point);
    }
    let ws = env.workspace;
    let b = ws.block(block);
    match &b.kind {
        BlockKind::VariableGet => {
            let name = b.variable_field().unwrap_or_default();
            let binding = env.lookup(block, name)?;
            return Ok(env.binding(binding).type_point);
        }
        BlockKind::ArgumentReporter => {
            let name = b.field("VALUE").unwrap_or_default();
            let binding = env.lookup(block, name)?;
            return Ok(env.binding(binding).type_point);
        }
        BlockKind::FunctionCallOutput => {
            let name = b.function_name().unwrap_or_default().to_string();
            return function_return_type(env, &name);
        }
        _ => {}
    }

    let Some(check) = b.output_check.as_ref() else {
        return Ok(env.points.ground(VOID));
    };
    let Some(first) = check.first() else {
        return Ok(memoized(env, block, None, false));
    };

    if first == ARRAY {
        if let Some(element) = check.get(1) {
            return Ok(env.points.ground(element));
        }
        if b.kind == BlockKind::ListCreate {
            return list_literal_type(env, block);
        }
        return Ok(memoized(env, block, None, true));
    }

    if first == "T" {
        let receiver = match &b.kind {
            BlockKind::ListIndexGet => env.input_target(block, "LIST"),
            BlockKind::HostCall(qname) => generic_receiver_input(env, block, qname),
            _ => None,
        };
        if let Some(receiver) = receiver {
            let container = return_type(env, receiver)?;
            return element_of(env, block, container);
        }
        return Ok(memoized(env, block, None, false));
    }

    Ok(env.points.ground(first))
}

/// All declared output types of a block, narrowest first. Only host call
/// shapes list more than one.
pub fn return_type_with_inheritance(env: &mut Environment, target: Target) -> Result<Vec<PointId>, InferError> {
    if let Target::Block(block) = target {
        let check = env.workspace.block(block).output_check.clone();
        if let Some(check) = check {
            let nominal = check.len() > 1
                && check.iter().all(|t| t != ARRAY && t != "T" && !is_array_type(t));
            if nominal {
                return Ok(check.iter().map(|t| env.points.ground(t)).collect());
            }
        }
    }
    Ok(vec![return_type(env, target)?])
}

fn memoized(env: &mut Environment, block: BlockRef, type_name: Option<&str>, is_array: bool) -> PointId {
    if let Some(point) = env.expression_points.get(&block) {
        return *point;
    }
    let point = env.points.mk_point(type_name, is_array);
    env.expression_points.insert(block, point);
    point
}

/// The input carrying the generic of a receiver method, when the receiver's
/// declared type mentions one.
fn generic_receiver_input(env: &Environment, block: BlockRef, qname: &str) -> Option<Target> {
    let symbol = env.api.symbol(qname)?;
    let receiver = symbol.receiver()?;
    if receiver.type_name != "T" && !is_array_type(&receiver.type_name) {
        return None;
    }
    env.input_target(block, &receiver.name)
}

/// Element point of the array produced by `container`, linked generically
/// and remembered as the type of `block`.
fn element_of(env: &mut Environment, block: BlockRef, container: PointId) -> Result<PointId, InferError> {
    if let Some(point) = env.expression_points.get(&block) {
        return Ok(*point);
    }
    let rep = env.points.find(container);
    let element = match env.points.get(rep).child_type {
        Some(child) => child,
        None => {
            let element = env.points.mk_point(None, false);
            env.points.generic_link(container, element)?;
            element
        }
    };
    env.expression_points.insert(block, element);
    Ok(element)
}

fn list_literal_type(env: &mut Environment, block: BlockRef) -> Result<PointId, InferError> {
    let array = memoized(env, block, None, true);
    let items = env
        .workspace
        .block(block)
        .numbered_inputs("ADD")
        .filter_map(|i| i.target)
        .collect::<Vec<_>>();
    for item in items {
        if !env.is_live(item) {
            continue;
        }
        let item_type = block_return_type(env, item)?;
        let known = env.points.concrete_type_name(item_type).is_some();
        if known {
            env.points.generic_link(array, item_type)?;
            break;
        }
    }
    Ok(array)
}

/// Memoized return type of a user function. Self-recursive returns make the
/// result `any`; conflicting returns are reported against the definition.
pub fn function_return_type(env: &mut Environment, name: &str) -> Result<PointId, InferError> {
    if let Some(point) = env.function_returns.get(name) {
        return Ok(*point);
    }
    let ws = env.workspace;
    let Some(definition) = ws.function_definition(name) else {
        return Ok(env.points.ground(ANY));
    };
    if env.functions_in_progress.contains(name) {
        return Ok(env.points.mk_point(None, false));
    }

    let returns = ws
        .descendants(definition)
        .into_iter()
        .filter(|b| ws.block(*b).kind == BlockKind::FunctionReturn && env.is_live(*b))
        .collect::<Vec<_>>();

    let recursive = returns.iter().any(|r| {
        ws.block(*r)
            .input_target(RETURN_VALUE_INPUT)
            .map(|value| {
                ws.descendants(value).into_iter().any(|b| {
                    let block = ws.block(b);
                    block.kind == BlockKind::FunctionCallOutput && block.function_name() == Some(name)
                })
            })
            .unwrap_or(false)
    });
    if recursive {
        trace!(function = name, "recursive return, typed as any");
        let any = env.points.ground(ANY);
        env.function_returns.insert(name.to_string(), any);
        return Ok(any);
    }

    env.functions_in_progress.insert(name.to_string());
    let result = collect_return_types(env, definition, &returns);
    env.functions_in_progress.remove(name);
    let point = result?;
    env.function_returns.insert(name.to_string(), point);
    Ok(point)
}

fn collect_return_types(
    env: &mut Environment,
    definition: BlockRef,
    returns: &[BlockRef],
) -> Result<PointId, InferError> {
    let mut points = Vec::new();
    for ret in returns {
        if env.workspace.block(*ret).input(RETURN_VALUE_INPUT).is_none() {
            continue;
        }
        let target = env.attach_placeholder_if(*ret, RETURN_VALUE_INPUT, None);
        points.push(return_type(env, target)?);
    }
    let Some((first, rest)) = points.split_first() else {
        return Ok(env.points.ground(VOID));
    };
    for point in rest {
        if env.points.union(*first, *point).is_err() {
            env.report(definition, MIXED_RETURNS);
            return Ok(env.points.ground(ANY));
        }
    }
    Ok(*first)
}

/// Settled concrete type of a target, for passes that run after inference.
pub fn concrete_type_name(env: &mut Environment, target: Target) -> Result<Option<String>, PipelineError> {
    match return_type(env, target) {
        Ok(point) => Ok(env.points.concrete_type_name(point)),
        Err(InferError::Unify(_)) => Ok(None),
        Err(InferError::Fatal(err)) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{ApiInfo, ParameterDesc, SymbolInfo};
    use crate::blocks::{BlockSpec, WorkspaceBuilder};
    use crate::points::{NUMBER, STRING};

    #[test]
    fn list_literal_takes_first_known_item() {
        let ws = WorkspaceBuilder::new()
            .block(
                BlockSpec::new("list", "lists_create_with")
                    .empty_value("ADD0")
                    .value("ADD1", "s"),
            )
            .block(BlockSpec::new("s", "text").field("TEXT", "hi"))
            .build(&ApiInfo::new())
            .unwrap();
        let api = ApiInfo::new();
        let mut env = Environment::new(&ws, &api);
        let list = block_return_type(&mut env, 0).unwrap();
        assert_eq!(env.points.concrete_type_name(list).as_deref(), Some("string[]"));
        assert_eq!(block_return_type(&mut env, 0).unwrap(), list);
    }

    #[test]
    fn index_get_yields_element_type() {
        let api = ApiInfo::new().with_symbol(
            SymbolInfo::new("lists", "numbers", "number[]").block("lists_numbers"),
        );
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("get", "lists_index_get").value("LIST", "nums").empty_value("INDEX"))
            .block(BlockSpec::new("nums", "lists_numbers"))
            .build(&api)
            .unwrap();
        let mut env = Environment::new(&ws, &api);
        let element = block_return_type(&mut env, 0).unwrap();
        assert_eq!(env.points.concrete_type_name(element).as_deref(), Some(NUMBER));
    }

    #[test]
    fn receiver_generic_reads_element() {
        let api = ApiInfo::new()
            .with_symbol(
                SymbolInfo::new("Array", "pop", "T")
                    .block("array_pop")
                    .param(ParameterDesc::new("list", "T[]").receiver()),
            )
            .with_symbol(SymbolInfo::new("names", "all", "string[]").block("names_all"));
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("pop", "array_pop").value("list", "all"))
            .block(BlockSpec::new("all", "names_all"))
            .build(&api)
            .unwrap();
        let mut env = Environment::new(&ws, &api);
        let point = block_return_type(&mut env, 0).unwrap();
        assert_eq!(env.points.concrete_type_name(point).as_deref(), Some(STRING));
    }

    #[test]
    fn statements_return_void() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("brk", "break_keyword"))
            .build(&ApiInfo::new())
            .unwrap();
        let api = ApiInfo::new();
        let mut env = Environment::new(&ws, &api);
        let point = block_return_type(&mut env, 0).unwrap();
        assert_eq!(env.points.type_of(point).as_deref(), Some(VOID));
    }

    #[test]
    fn supertypes_come_back_as_separate_points() {
        let mut api = ApiInfo::new()
            .with_symbol(SymbolInfo::new("sprites", "create", "Sprite").block("sprites_create"));
        api.add_supertypes("Sprite", &["Entity"]);
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("c", "sprites_create"))
            .build(&api)
            .unwrap();
        let mut env = Environment::new(&ws, &api);
        let points = return_type_with_inheritance(&mut env, Target::Block(0)).unwrap();
        let names = points
            .into_iter()
            .map(|p| env.points.type_of(p).unwrap_or_default())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["Sprite".to_string(), "Entity".to_string()]);
    }
}
