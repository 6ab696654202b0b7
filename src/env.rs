//! Per-compilation state shared by every pass.
//!
//! One `Environment` is created for each call to the orchestrator and dropped
//! at its end, so placeholders and memoized points never leak between runs.

use crate::api::ApiInfo;
use crate::blocks::{BlockRef, Workspace};
use crate::diagnostics::{Diagnostic, PipelineError};
use crate::points::{PointId, Points};
use indexmap::IndexMap;
use std::collections::{HashMap, HashSet};
use tracing::debug;

pub type ScopeId = usize;
pub type BindingId = usize;

/// How a binding came to exist without a `let` emitted for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationKind {
    /// Function, handler or loop parameter.
    Argument,
    /// Declared inline by its first assignment.
    Assigned,
    /// Compiler-generated induction variable.
    Implicit,
}

#[derive(Debug, Clone)]
pub struct Binding {
    pub name: String,
    pub type_point: PointId,
    pub id: BindingId,
    pub escaped_name: Option<String>,
    pub already_declared: Option<DeclarationKind>,
    pub is_assigned: bool,
    pub is_function_parameter: bool,
    pub first_reference: Option<BlockRef>,
    pub hidden: bool,
    /// Blocks that read or write this binding.
    pub references: Vec<BlockRef>,
}

#[derive(Debug, Clone, Default)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub first_statement: Option<BlockRef>,
    pub declared_vars: IndexMap<String, BindingId>,
    pub referenced_vars: Vec<BindingId>,
    pub assigned_vars: Vec<BindingId>,
    pub children: Vec<ScopeId>,
    /// Statements visited directly in this scope, in output order.
    pub statements: Vec<BlockRef>,
}

/// Where an input's value comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Target {
    Block(BlockRef),
    Placeholder(usize),
}

#[derive(Debug, Clone)]
pub struct Placeholder {
    pub owner: BlockRef,
    pub input: String,
    pub point: PointId,
}

pub struct Environment<'a> {
    pub workspace: &'a Workspace,
    pub api: &'a ApiInfo,
    pub points: Points,
    pub scopes: Vec<Scope>,
    pub bindings: Vec<Binding>,
    pub root_scope: ScopeId,
    pub block_scope: HashMap<BlockRef, ScopeId>,
    /// Declarations to emit right before a statement.
    pub block_declarations: HashMap<BlockRef, Vec<BindingId>>,
    /// Declarations emitted at the top of the program.
    pub root_declarations: Vec<BindingId>,
    placeholders: Vec<Placeholder>,
    placeholder_index: HashMap<(BlockRef, String), usize>,
    /// Synthetic points memoized per block so every pass sees the same one.
    pub expression_points: HashMap<BlockRef, PointId>,
    pub function_returns: HashMap<String, PointId>,
    pub functions_in_progress: HashSet<String>,
    pub diagnostics: Vec<Diagnostic>,
    /// Blocks switched off by the orchestrator for this run only.
    pub disabled: HashSet<BlockRef>,
    /// Identifiers no variable may be renamed to.
    pub taken_names: HashSet<String>,
}

impl<'a> Environment<'a> {
    pub fn new(workspace: &'a Workspace, api: &'a ApiInfo) -> Self {
        let mut env = Self {
            workspace,
            api,
            points: Points::new(),
            scopes: Vec::new(),
            bindings: Vec::new(),
            root_scope: 0,
            block_scope: HashMap::new(),
            block_declarations: HashMap::new(),
            root_declarations: Vec::new(),
            placeholders: Vec::new(),
            placeholder_index: HashMap::new(),
            expression_points: HashMap::new(),
            function_returns: HashMap::new(),
            functions_in_progress: HashSet::new(),
            diagnostics: Vec::new(),
            disabled: HashSet::new(),
            taken_names: HashSet::new(),
        };
        env.root_scope = env.new_scope(None, None);
        env
    }

    /// Enabled in the editor and not switched off for this run.
    pub fn is_live(&self, block: BlockRef) -> bool {
        if !self.workspace.is_enabled(block) {
            return false;
        }
        let mut current = Some(block);
        while let Some(b) = current {
            if self.disabled.contains(&b) {
                return false;
            }
            current = self.workspace.parent(b);
        }
        true
    }

    pub fn new_scope(&mut self, parent: Option<ScopeId>, first_statement: Option<BlockRef>) -> ScopeId {
        let id = self.scopes.len();
        self.scopes.push(Scope {
            parent,
            first_statement,
            ..Scope::default()
        });
        if let Some(parent) = parent {
            self.scopes[parent].children.push(id);
        }
        id
    }

    /// Creates a binding declared in `scope`.
    pub fn declare(&mut self, scope: ScopeId, name: &str, type_point: PointId) -> BindingId {
        let id = self.bindings.len();
        self.bindings.push(Binding {
            name: name.to_string(),
            type_point,
            id,
            escaped_name: None,
            already_declared: None,
            is_assigned: false,
            is_function_parameter: false,
            first_reference: None,
            hidden: false,
            references: Vec::new(),
        });
        self.scopes[scope].declared_vars.insert(name.to_string(), id);
        id
    }

    /// Nearest binding named `name` visible from `scope`.
    pub fn find_in_chain(&self, scope: ScopeId, name: &str) -> Option<BindingId> {
        let mut current = Some(scope);
        while let Some(s) = current {
            if let Some(id) = self.scopes[s].declared_vars.get(name) {
                return Some(*id);
            }
            current = self.scopes[s].parent;
        }
        None
    }

    pub fn lookup(&self, block: BlockRef, name: &str) -> Result<BindingId, PipelineError> {
        let id = &self.workspace.block(block).id;
        let scope = self
            .block_scope
            .get(&block)
            .copied()
            .ok_or_else(|| PipelineError::at(id, "Block was never visited by the scope tracker."))?;
        self.find_in_chain(scope, name)
            .ok_or_else(|| PipelineError::at(id, format!("Unknown variable '{}'.", name)))
    }

    pub fn binding(&self, id: BindingId) -> &Binding {
        &self.bindings[id]
    }

    pub fn binding_mut(&mut self, id: BindingId) -> &mut Binding {
        &mut self.bindings[id]
    }

    /// Output identifier of a binding.
    pub fn escaped_name(&self, id: BindingId) -> &str {
        let binding = &self.bindings[id];
        binding.escaped_name.as_deref().unwrap_or(&binding.name)
    }

    pub fn input_target(&self, block: BlockRef, input: &str) -> Option<Target> {
        self.workspace
            .block(block)
            .input_target(input)
            .map(Target::Block)
    }

    /// The connected child of `input`, or a placeholder standing in for it.
    /// The placeholder's point starts at `type_name` and is reused on every
    /// later request for the same slot.
    pub fn attach_placeholder_if(&mut self, block: BlockRef, input: &str, type_name: Option<&str>) -> Target {
        if let Some(target) = self.input_target(block, input) {
            if self.is_live_target(target) {
                return target;
            }
        }
        let key = (block, input.to_string());
        if let Some(index) = self.placeholder_index.get(&key) {
            return Target::Placeholder(*index);
        }
        let point = match type_name {
            Some(t) => self.points.ground(t),
            None => self.points.mk_point(None, false),
        };
        let index = self.placeholders.len();
        self.placeholders.push(Placeholder {
            owner: block,
            input: input.to_string(),
            point,
        });
        self.placeholder_index.insert(key, index);
        Target::Placeholder(index)
    }

    fn is_live_target(&self, target: Target) -> bool {
        match target {
            Target::Block(b) => self.is_live(b),
            Target::Placeholder(_) => true,
        }
    }

    pub fn placeholder(&self, index: usize) -> &Placeholder {
        &self.placeholders[index]
    }

    pub fn placeholder_count(&self) -> usize {
        self.placeholders.len()
    }

    /// Block a target belongs to, for diagnostics and source mapping.
    pub fn target_owner(&self, target: Target) -> BlockRef {
        match target {
            Target::Block(b) => b,
            Target::Placeholder(index) => self.placeholders[index].owner,
        }
    }

    pub fn report(&mut self, block: BlockRef, message: impl Into<String>) {
        let diagnostic = Diagnostic {
            block_id: self.workspace.block(block).id.clone(),
            message: message.into(),
        };
        debug!(block = %diagnostic.block_id, "{}", diagnostic.message);
        if !self.diagnostics.contains(&diagnostic) {
            self.diagnostics.push(diagnostic);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockSpec, WorkspaceBuilder};

    fn workspace() -> Workspace {
        WorkspaceBuilder::new()
            .block(BlockSpec::new("set", "variables_set").field("VAR", "x").empty_value("VALUE"))
            .block(BlockSpec::new("num", "math_number").field("NUM", "3").disabled())
            .block(BlockSpec::new("neg", "logic_negate").value("BOOL", "num"))
            .build(&ApiInfo::new())
            .unwrap()
    }

    #[test]
    fn placeholders_are_reused_per_slot() {
        let ws = workspace();
        let api = ApiInfo::new();
        let mut env = Environment::new(&ws, &api);
        let first = env.attach_placeholder_if(0, "VALUE", Some("number"));
        let again = env.attach_placeholder_if(0, "VALUE", None);
        assert_eq!(first, again);
        assert_eq!(env.placeholder_count(), 1);
        assert_eq!(env.target_owner(first), 0);
    }

    #[test]
    fn disabled_children_are_replaced_by_placeholders() {
        let ws = workspace();
        let api = ApiInfo::new();
        let mut env = Environment::new(&ws, &api);
        assert!(matches!(
            env.attach_placeholder_if(2, "BOOL", None),
            Target::Placeholder(_)
        ));
        env.disabled.insert(2);
        assert!(!env.is_live(2));
    }

    #[test]
    fn lookup_walks_the_scope_chain() {
        let ws = workspace();
        let api = ApiInfo::new();
        let mut env = Environment::new(&ws, &api);
        let root = env.root_scope;
        let child = env.new_scope(Some(root), Some(0));
        let point = env.points.mk_point(None, false);
        let x = env.declare(root, "x", point);
        env.block_scope.insert(0, child);
        assert_eq!(env.lookup(0, "x").unwrap(), x);
        assert!(env.lookup(0, "y").is_err());
        assert!(env.lookup(2, "x").is_err());
    }
}
