//! Scope Tracker.
//!
//! One walk over the live blocks builds the scope tree and a binding for
//! every variable. Post-passes then move each binding to the scope that owns
//! it, decide where its declaration goes and give it a unique output name.

use crate::blocks::{Block, BlockKind, BlockRef, InputKind};
use crate::diagnostics::PipelineError;
use crate::env::{BindingId, DeclarationKind, Environment, ScopeId};
use crate::points::{PointId, ANY, ARRAY, NUMBER};
use regex::Regex;
use std::collections::HashSet;
use tracing::debug;

pub const REPEAT_INDEX: &str = "index";
pub const HANDLER_FIELD_PREFIX: &str = "HANDLER_";

pub const RESERVED_WORDS: &[&str] = &[
    "abstract", "any", "as", "async", "await", "boolean", "break", "case", "catch", "class",
    "const", "constructor", "continue", "debugger", "declare", "default", "delete", "do", "else",
    "enum", "export", "extends", "false", "finally", "for", "from", "function", "get", "if",
    "implements", "import", "in", "instanceof", "interface", "let", "module", "namespace", "new",
    "null", "number", "of", "package", "private", "protected", "public", "require", "return",
    "set", "static", "string", "super", "switch", "symbol", "this", "throw", "true", "try",
    "type", "typeof", "undefined", "var", "void", "while", "with", "yield", "Math", "Array",
];

struct OwnDeclaration {
    name: String,
    point: PointId,
    kind: DeclarationKind,
    hidden: bool,
    is_function_parameter: bool,
}

pub fn identifier_pattern() -> Result<Regex, PipelineError> {
    Regex::new(r"[^A-Za-z0-9_$]+").map_err(|err| PipelineError::new(err.to_string()))
}

/// Turns a display name into a valid identifier.
pub fn sanitize_identifier(pattern: &Regex, name: &str) -> String {
    let mut out = pattern.replace_all(name.trim(), "_").into_owned();
    if out.is_empty() {
        out.push('_');
    }
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

pub fn track_all_variables(env: &mut Environment) -> Result<(), PipelineError> {
    declare_workspace_variables(env);
    let ws = env.workspace;
    let root = env.root_scope;

    let mut tops = ws
        .top_blocks()
        .into_iter()
        .filter(|b| env.is_live(*b))
        .collect::<Vec<_>>();
    tops.sort_by_key(|b| match &ws.block(*b).kind {
        BlockKind::OnStart => 0,
        _ if is_container(env, *b) => 1,
        _ => 2,
    });

    for top in tops {
        let block = ws.block(top);
        if block.kind == BlockKind::OnStart {
            env.block_scope.insert(top, root);
            for first in block.statement_inputs().filter_map(|i| i.target) {
                visit_chain(env, first, root);
            }
        } else if is_container(env, top) {
            visit(env, top, root);
        } else {
            visit_chain(env, top, root);
        }
    }

    narrow_ownership(env);
    mark_declaration_sites(env);
    escape_names(env)?;
    debug!(
        scopes = env.scopes.len(),
        bindings = env.bindings.len(),
        "scope tracking done"
    );
    Ok(())
}

/// Function definitions and event registrations own their bodies.
fn is_container(env: &Environment, block: BlockRef) -> bool {
    match &env.workspace.block(block).kind {
        BlockKind::FunctionDefinition => true,
        BlockKind::HostCall(qname) => env.api.symbol(qname).is_some_and(|s| s.is_event()),
        _ => false,
    }
}

fn declare_workspace_variables(env: &mut Environment) {
    let root = env.root_scope;
    let ws = env.workspace;
    for variable in &ws.variables {
        let enum_typed = variable
            .var_type
            .as_deref()
            .is_some_and(|t| env.api.enum_info(t).is_some());
        if enum_typed || env.scopes[root].declared_vars.contains_key(&variable.name) {
            continue;
        }
        let point = match variable.var_type.as_deref() {
            Some(t) if !t.is_empty() => env.points.ground(t),
            _ => env.points.mk_point(None, false),
        };
        env.declare(root, &variable.name, point);
    }
}

fn visit_chain(env: &mut Environment, first: BlockRef, scope: ScopeId) {
    for block in env.workspace.chain(Some(first)) {
        if !env.is_live(block) {
            continue;
        }
        env.scopes[scope].statements.push(block);
        visit(env, block, scope);
    }
}

fn visit(env: &mut Environment, block: BlockRef, scope: ScopeId) {
    if !env.is_live(block) {
        return;
    }
    let ws = env.workspace;
    let b = ws.block(block);
    env.block_scope.insert(block, scope);
    match &b.kind {
        BlockKind::VariableGet => reference(env, scope, b.variable_field(), block, false),
        BlockKind::ArgumentReporter => reference(env, scope, b.field("VALUE"), block, false),
        BlockKind::VariableSet | BlockKind::VariableChange => {
            reference(env, scope, b.variable_field(), block, true)
        }
        BlockKind::TypeScriptStatement => declare_raw_variables(env, scope, b),
        _ => {}
    }

    let declared = own_declarations(env, block);
    if !b.has_statement_inputs() && declared.is_empty() {
        for target in b.value_inputs().filter_map(|i| i.target) {
            visit(env, target, scope);
        }
        return;
    }

    let input_scope = if declared.is_empty() {
        scope
    } else {
        let own = env.new_scope(Some(scope), Some(block));
        for decl in declared {
            let id = env.declare(own, &decl.name, decl.point);
            let binding = env.binding_mut(id);
            binding.already_declared = Some(decl.kind);
            binding.hidden = decl.hidden;
            binding.is_function_parameter = decl.is_function_parameter;
            binding.first_reference = Some(block);
        }
        env.block_scope.insert(block, own);
        own
    };

    for input in &b.inputs {
        let Some(target) = input.target else {
            continue;
        };
        match input.kind {
            InputKind::Statement => {
                let child = env.new_scope(Some(input_scope), Some(target));
                visit_chain(env, target, child);
            }
            InputKind::Value => visit(env, target, input_scope),
        }
    }
}

/// Finds the binding visible from `scope` or provisionally declares one at
/// the root, then records the use.
fn reference(env: &mut Environment, scope: ScopeId, name: Option<&str>, block: BlockRef, assign: bool) {
    let Some(name) = name else {
        return;
    };
    let id = match env.find_in_chain(scope, name) {
        Some(id) => id,
        None => {
            let point = env.points.mk_point(None, false);
            let root = env.root_scope;
            env.declare(root, name, point)
        }
    };
    let binding = env.binding_mut(id);
    binding.references.push(block);
    binding.first_reference.get_or_insert(block);
    binding.is_assigned |= assign;

    let s = &mut env.scopes[scope];
    if !s.referenced_vars.contains(&id) {
        s.referenced_vars.push(id);
    }
    if assign && !s.assigned_vars.contains(&id) {
        s.assigned_vars.push(id);
    }
}

/// Variables written by raw code are declared by that code.
fn declare_raw_variables(env: &mut Environment, scope: ScopeId, block: &Block) {
    let Some(names) = block.field("DECLARED_VARIABLES") else {
        return;
    };
    for name in names.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        if env.scopes[scope].declared_vars.contains_key(name) {
            continue;
        }
        let point = env.points.mk_point(None, false);
        let id = env.declare(scope, name, point);
        env.binding_mut(id).already_declared = Some(DeclarationKind::Argument);
    }
}

/// Variables a block declares for its own inputs.
fn own_declarations(env: &mut Environment, block: BlockRef) -> Vec<OwnDeclaration> {
    let ws = env.workspace;
    let b = ws.block(block);
    let argument = |name: &str, point: PointId| OwnDeclaration {
        name: name.to_string(),
        point,
        kind: DeclarationKind::Argument,
        hidden: false,
        is_function_parameter: false,
    };
    let mut out = Vec::new();
    match &b.kind {
        BlockKind::ForRange => {
            if let Some(var) = b.variable_field() {
                out.push(argument(var, env.points.ground(NUMBER)));
            }
        }
        BlockKind::ForOf => {
            if let Some(var) = b.variable_field() {
                out.push(argument(var, env.points.mk_point(None, false)));
            }
        }
        BlockKind::Repeat => out.push(OwnDeclaration {
            name: REPEAT_INDEX.to_string(),
            point: env.points.ground(NUMBER),
            kind: DeclarationKind::Implicit,
            hidden: true,
            is_function_parameter: false,
        }),
        BlockKind::FunctionDefinition => {
            for arg in b.signature.iter().flat_map(|s| s.args.iter()) {
                let point = match arg.type_name.as_str() {
                    ARRAY => env.points.mk_point(None, true),
                    "" => env.points.ground(ANY),
                    other => env.points.ground(other),
                };
                let mut decl = argument(&arg.name, point);
                decl.is_function_parameter = true;
                out.push(decl);
            }
        }
        BlockKind::HostCall(qname) => {
            if let Some(params) = env.api.symbol(qname).and_then(|s| s.handler.as_ref()) {
                for param in params {
                    let field = format!("{}{}", HANDLER_FIELD_PREFIX, param.name);
                    let name = b.field(&field).unwrap_or(&param.name);
                    out.push(argument(name, env.points.ground(&param.type_name)));
                }
            }
        }
        _ => {}
    }
    if let Some(vars) = b.mutation.as_ref().and_then(|m| m.strategy().declared_variables()) {
        for (name, type_name) in vars {
            let point = if type_name == ANY {
                env.points.mk_point(None, false)
            } else {
                env.points.ground(&type_name)
            };
            out.push(argument(&name, point));
        }
    }
    out
}

fn subtree_has(env: &Environment, scope: ScopeId, id: BindingId, assigned: bool) -> bool {
    let s = &env.scopes[scope];
    let list = if assigned { &s.assigned_vars } else { &s.referenced_vars };
    list.contains(&id) || s.children.iter().any(|c| subtree_has(env, *c, id, assigned))
}

/// Scope that should declare a root binding: the first scope, walking down
/// from the root, that references it directly or has no single child subtree
/// that both references and assigns it.
pub fn owning_scope(env: &Environment, id: BindingId) -> ScopeId {
    let mut current = env.root_scope;
    loop {
        let scope = &env.scopes[current];
        if scope.referenced_vars.contains(&id) {
            return current;
        }
        let referencing = scope
            .children
            .iter()
            .copied()
            .filter(|c| subtree_has(env, *c, id, false))
            .collect::<Vec<_>>();
        match referencing.as_slice() {
            [only] if subtree_has(env, *only, id, true) => current = *only,
            _ => return current,
        }
    }
}

fn narrow_ownership(env: &mut Environment) {
    let root = env.root_scope;
    let candidates = env.scopes[root]
        .declared_vars
        .iter()
        .map(|(name, id)| (name.clone(), *id))
        .collect::<Vec<_>>();
    for (name, id) in candidates {
        if env.binding(id).already_declared.is_some() {
            continue;
        }
        let owner = owning_scope(env, id);
        if owner == root || env.scopes[owner].declared_vars.contains_key(&name) {
            continue;
        }
        env.scopes[root].declared_vars.shift_remove(&name);
        env.scopes[owner].declared_vars.insert(name, id);
    }
}

/// First statement of `scope` touching the binding, when that statement is
/// an assignment that can double as the declaration.
fn inline_declaration_site(env: &Environment, scope: ScopeId, id: BindingId) -> Option<BlockRef> {
    let ws = env.workspace;
    let refs = env.binding(id).references.iter().copied().collect::<HashSet<_>>();
    for stmt in &env.scopes[scope].statements {
        if !ws.subtree(*stmt).iter().any(|b| refs.contains(b)) {
            continue;
        }
        let block = ws.block(*stmt);
        if block.kind != BlockKind::VariableSet || !refs.contains(stmt) {
            return None;
        }
        let reads_itself = block
            .input_target("VALUE")
            .is_some_and(|value| ws.descendants(value).iter().any(|b| refs.contains(b)));
        return (!reads_itself).then_some(*stmt);
    }
    None
}

fn mark_declaration_sites(env: &mut Environment) {
    let root = env.root_scope;
    for scope in 0..env.scopes.len() {
        let ids = env.scopes[scope].declared_vars.values().copied().collect::<Vec<_>>();
        for id in ids {
            if env.binding(id).already_declared.is_some() {
                continue;
            }
            if let Some(stmt) = inline_declaration_site(env, scope, id) {
                let binding = env.binding_mut(id);
                binding.already_declared = Some(DeclarationKind::Assigned);
                binding.first_reference = Some(stmt);
                continue;
            }
            let site = env.scopes[scope]
                .statements
                .first()
                .copied()
                .or(env.scopes[scope].first_statement);
            match site {
                Some(first) if scope != root => {
                    env.block_declarations.entry(first).or_default().push(id)
                }
                _ => env.root_declarations.push(id),
            }
        }
    }
}

fn escape_names(env: &mut Environment) -> Result<(), PipelineError> {
    let pattern = identifier_pattern()?;
    let mut taken = RESERVED_WORDS
        .iter()
        .map(ToString::to_string)
        .collect::<HashSet<_>>();
    taken.extend(env.taken_names.iter().cloned());
    let root = env.root_scope;
    escape_scope(env, root, &pattern, &taken);
    Ok(())
}

fn escape_scope(env: &mut Environment, scope: ScopeId, pattern: &Regex, taken: &HashSet<String>) {
    let mut local = taken.clone();
    let ids = env.scopes[scope].declared_vars.values().copied().collect::<Vec<_>>();
    for id in ids {
        let base = sanitize_identifier(pattern, &env.binding(id).name);
        let mut candidate = base.clone();
        let mut suffix = 2;
        while local.contains(&candidate) {
            candidate = format!("{}{}", base, suffix);
            suffix += 1;
        }
        local.insert(candidate.clone());
        env.binding_mut(id).escaped_name = Some(candidate);
    }
    for child in env.scopes[scope].children.clone() {
        escape_scope(env, child, pattern, &local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ApiInfo;
    use crate::blocks::{BlockSpec, Workspace, WorkspaceBuilder, ON_START};

    fn tracked(ws: &Workspace, api: &ApiInfo, check: impl FnOnce(&mut Environment)) {
        let mut env = Environment::new(ws, api);
        track_all_variables(&mut env).unwrap();
        check(&mut env);
    }

    fn binding_named(env: &Environment, name: &str) -> BindingId {
        env.bindings
            .iter()
            .position(|b| b.name == name)
            .unwrap_or_else(|| panic!("no binding '{}'", name))
    }

    fn declaring_scope(env: &Environment, id: BindingId) -> ScopeId {
        (0..env.scopes.len())
            .find(|s| env.scopes[*s].declared_vars.values().any(|b| *b == id))
            .unwrap()
    }

    #[test]
    fn sanitizes_display_names() {
        let pattern = identifier_pattern().unwrap();
        assert_eq!(sanitize_identifier(&pattern, "my var"), "my_var");
        assert_eq!(sanitize_identifier(&pattern, "2nd"), "_2nd");
        assert_eq!(sanitize_identifier(&pattern, "   "), "_");
    }

    #[test]
    fn variable_used_only_in_loop_body_is_declared_there() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("loop")))
            .block(
                BlockSpec::new("loop", "pxt_controls_for")
                    .field("VAR", "i")
                    .value("TO", "four")
                    .statements("DO", Some("body")),
            )
            .block(BlockSpec::new("four", "math_number").field("NUM", "4"))
            .block(
                BlockSpec::new("body", "variables_change")
                    .field("VAR", "total")
                    .value("VALUE", "get_i"),
            )
            .block(BlockSpec::new("get_i", "variables_get").field("VAR", "i"))
            .build(&ApiInfo::new())
            .unwrap();
        tracked(&ws, &ApiInfo::new(), |env| {
            let total = binding_named(env, "total");
            let owner = declaring_scope(env, total);
            assert_eq!(env.scopes[owner].first_statement, Some(3));
            assert_eq!(env.block_declarations.get(&3), Some(&vec![total]));
            assert!(env.root_declarations.is_empty());

            let i = binding_named(env, "i");
            assert_eq!(env.binding(i).already_declared, Some(DeclarationKind::Argument));
            assert_eq!(env.lookup(4, "i").unwrap(), i);
        });
    }

    #[test]
    fn hoisted_declarations_skip_disabled_head() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("rep", "controls_repeat_ext").statements("DO", Some("off")))
            .block(BlockSpec::new("off", "break_keyword").enabled(false).next("body"))
            .block(BlockSpec::new("body", "variables_change").field("VAR", "total"))
            .build(&ApiInfo::new())
            .unwrap();
        tracked(&ws, &ApiInfo::new(), |env| {
            let total = binding_named(env, "total");
            assert_eq!(env.block_declarations.get(&2), Some(&vec![total]));
            assert!(env.block_declarations.get(&1).is_none());
        });
    }

    #[test]
    fn sibling_references_keep_parent_ownership() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("set")))
            .block(BlockSpec::new("set", "variables_set").field("VAR", "x").next("if"))
            .block(
                BlockSpec::new("if", "controls_if")
                    .statements("DO0", Some("a"))
                    .statements("ELSE", Some("b")),
            )
            .block(BlockSpec::new("a", "variables_change").field("VAR", "x"))
            .block(BlockSpec::new("b", "variables_change").field("VAR", "x"))
            .build(&ApiInfo::new())
            .unwrap();
        tracked(&ws, &ApiInfo::new(), |env| {
            let x = binding_named(env, "x");
            assert_eq!(declaring_scope(env, x), env.root_scope);
            assert_eq!(env.binding(x).already_declared, Some(DeclarationKind::Assigned));
            assert_eq!(env.binding(x).first_reference, Some(1));
        });
    }

    #[test]
    fn shadowing_names_get_suffixes() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("start", ON_START).statements("HANDLER", Some("set")))
            .block(BlockSpec::new("set", "variables_set").field("VAR", "i").next("loop"))
            .block(
                BlockSpec::new("loop", "pxt_controls_for")
                    .field("VAR", "i")
                    .statements("DO", Some("inner")),
            )
            .block(BlockSpec::new("inner", "variables_set").field("VAR", "let"))
            .build(&ApiInfo::new())
            .unwrap();
        tracked(&ws, &ApiInfo::new(), |env| {
            let mut names = env
                .bindings
                .iter()
                .map(|b| (b.name.clone(), b.escaped_name.clone().unwrap_or_default()))
                .collect::<Vec<_>>();
            names.sort();
            assert_eq!(
                names,
                vec![
                    ("i".to_string(), "i".to_string()),
                    ("i".to_string(), "i2".to_string()),
                    ("let".to_string(), "let2".to_string()),
                ]
            );
        });
    }

    #[test]
    fn repeat_declares_hidden_index() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("rep", "controls_repeat_ext").statements("DO", None))
            .build(&ApiInfo::new())
            .unwrap();
        tracked(&ws, &ApiInfo::new(), |env| {
            let index = binding_named(env, REPEAT_INDEX);
            assert!(env.binding(index).hidden);
            assert_eq!(env.binding(index).already_declared, Some(DeclarationKind::Implicit));
            assert_eq!(env.lookup(0, REPEAT_INDEX).unwrap(), index);
        });
    }
}
