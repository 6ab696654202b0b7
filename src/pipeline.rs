//! Workspace Orchestrator.
//!
//! Chooses which top blocks survive, runs scope tracking, inference and
//! compilation over one shared `Environment`, then assembles the program
//! text, the source maps and the diagnostics.

use crate::api::{ApiInfo, EnumInfo, KindInfo};
use crate::blocks::{BlockKind, BlockRef, Workspace, ON_START};
use crate::compiler::BlockCompiler;
use crate::diagnostics::{Diagnostic, PipelineError};
use crate::env::Environment;
use crate::format::SourceFormatter;
use crate::infer::infer_types;
use crate::output::{flatten, line_map, LineMapEntry, OutputNode, SourceMapEntry};
use crate::scope::{identifier_pattern, sanitize_identifier, track_all_variables};
use anyhow::{anyhow, Result};
use indexmap::IndexSet;
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

#[derive(Default)]
pub struct CompileOptions {
    pub formatter: Option<Box<dyn SourceFormatter>>,
    /// Run the formatter and keep its output next to the raw source.
    pub emit_formatted: bool,
}

#[derive(Debug, Clone, Default)]
pub struct CompileOutput {
    pub source: String,
    pub source_map: Vec<SourceMapEntry>,
    pub line_map: Vec<LineMapEntry>,
    pub diagnostics: Vec<Diagnostic>,
    /// Top blocks switched off by the orchestrator, by id.
    pub disabled_blocks: Vec<String>,
    pub block_stats: BTreeMap<String, usize>,
    pub formatted: Option<String>,
    /// Set when a fatal error aborted compilation at a known block.
    pub failure: Option<PipelineError>,
}

impl CompileOutput {
    fn failed(error: PipelineError) -> Self {
        Self {
            failure: Some(error),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.failure.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TopRole {
    OnStart,
    FreeChain,
    Container,
}

type ProgressCallback<'a> = dyn FnMut(usize, usize, &str) + 'a;

pub const STAGES: usize = 4;

pub fn compile_workspace(workspace: &Workspace, api: &ApiInfo, options: &CompileOptions) -> Result<CompileOutput> {
    compile_workspace_with_progress(
        workspace,
        api,
        options,
        Option::<&mut fn(usize, usize, &str)>::None,
    )
}

pub fn compile_workspace_with_progress<F>(
    workspace: &Workspace,
    api: &ApiInfo,
    options: &CompileOptions,
    progress: Option<&mut F>,
) -> Result<CompileOutput>
where
    F: FnMut(usize, usize, &str),
{
    let mut progress = progress.map(|cb| cb as &mut ProgressCallback<'_>);
    let mut env = Environment::new(workspace, api);
    match run_stages(&mut env, options, &mut progress) {
        Ok(output) => Ok(output),
        Err(err) if err.block_id.is_some() => {
            warn!(error = %err, "compilation aborted");
            Ok(CompileOutput::failed(err))
        }
        Err(err) => Err(anyhow!(err)),
    }
}

fn report_progress(progress: &mut Option<&mut ProgressCallback<'_>>, step: usize, label: &str) {
    if let Some(cb) = progress.as_deref_mut() {
        cb(step, STAGES, label);
    }
}

fn run_stages(
    env: &mut Environment,
    options: &CompileOptions,
    progress: &mut Option<&mut ProgressCallback<'_>>,
) -> Result<CompileOutput, PipelineError> {
    report_progress(progress, 1, "Selecting top blocks");
    reserve_names(env)?;
    let tops = select_top_blocks(env);
    let disabled_blocks = {
        let ws = env.workspace;
        let mut ids = env.disabled.iter().map(|b| ws.block(*b).id.clone()).collect::<Vec<_>>();
        ids.sort();
        ids
    };
    debug!(tops = tops.len(), disabled = disabled_blocks.len(), "top blocks selected");

    report_progress(progress, 2, "Tracking scopes");
    track_all_variables(env)?;

    report_progress(progress, 3, "Inferring types");
    infer_types(env)?;

    report_progress(progress, 4, "Compiling blocks");
    let mut program = declarations_prelude(env)?;
    let mut compiler = BlockCompiler::new(env)?;
    for (top, role) in &tops {
        let mut nodes = match role {
            TopRole::FreeChain => compiler.emit_statement_chain(Some(*top))?,
            TopRole::OnStart | TopRole::Container => {
                let mut nodes = compiler.emit_declarations_for(*top)?;
                nodes.extend(compiler.emit_statement(*top)?);
                nodes
            }
        };
        if let Some(first) = nodes.first_mut() {
            first.blank_line_before = true;
        }
        program.append(&mut nodes);
    }

    let flat = flatten(&program);
    let lines = line_map(&flat.source, &flat.source_map);
    let formatted = match options.formatter.as_ref().filter(|_| options.emit_formatted) {
        Some(formatter) => match formatter.format(&flat.source) {
            Ok(text) => Some(text),
            Err(err) => {
                warn!(error = %err, "formatter failed, keeping raw output");
                None
            }
        },
        None => None,
    };

    Ok(CompileOutput {
        source: flat.source,
        source_map: flat.source_map,
        line_map: lines,
        diagnostics: env.diagnostics.clone(),
        disabled_blocks,
        block_stats: block_stats(env),
        formatted,
        failure: None,
    })
}

/// Identifiers variables may not take: user functions, API namespaces and
/// synthesized enums.
fn reserve_names(env: &mut Environment) -> Result<(), PipelineError> {
    let pattern = identifier_pattern()?;
    let ws = env.workspace;
    for block in ws.refs() {
        let b = ws.block(block);
        if b.kind == BlockKind::FunctionDefinition {
            if let Some(name) = b.function_name() {
                env.taken_names.insert(sanitize_identifier(&pattern, name));
            }
        }
    }
    env.taken_names.extend(env.api.namespaces());
    env.taken_names.extend(env.api.enums.iter().map(|e| e.name.clone()));
    env.taken_names.extend(env.api.kinds.iter().map(|k| k.name.clone()));
    Ok(())
}

fn role_of(env: &Environment, block: BlockRef) -> Option<TopRole> {
    let b = env.workspace.block(block);
    match &b.kind {
        BlockKind::OnStart => Some(TopRole::OnStart),
        BlockKind::FunctionDefinition => Some(TopRole::Container),
        BlockKind::HostCall(qname) if env.api.symbol(qname).is_some_and(|s| s.is_event()) => {
            Some(TopRole::Container)
        }
        _ if b.has_output() => None,
        _ => Some(TopRole::FreeChain),
    }
}

/// Disables surplus top blocks and orders the survivors: program start
/// first, then the free chain, then events and functions by structural
/// hash.
fn select_top_blocks(env: &mut Environment) -> Vec<(BlockRef, TopRole)> {
    let ws = env.workspace;
    let mut seen_keys = HashSet::new();
    let mut on_start = None;
    let mut free_chain = None;
    let mut containers = Vec::new();

    for (position, top) in ws.top_blocks().into_iter().enumerate() {
        if !ws.is_enabled(top) {
            continue;
        }
        let Some(role) = role_of(env, top) else {
            debug!(block = %ws.block(top).id, "free-floating reporter disabled");
            env.disabled.insert(top);
            continue;
        };
        let survives = match role {
            TopRole::FreeChain => free_chain.is_none(),
            _ => {
                let key = structural_key(env, top);
                allows_multiple(env, top) || seen_keys.insert(key)
            }
        };
        if !survives {
            debug!(block = %ws.block(top).id, "duplicate top block disabled");
            env.disabled.insert(top);
            continue;
        }
        match role {
            TopRole::OnStart => on_start = Some(top),
            TopRole::FreeChain => free_chain = Some(top),
            TopRole::Container => {
                let after_on_start = event_after_on_start(env, top);
                containers.push((hash16(&structural_key(env, top)), after_on_start, position, top));
            }
        }
    }
    containers.sort();

    on_start
        .map(|b| (b, TopRole::OnStart))
        .into_iter()
        .chain(free_chain.map(|b| (b, TopRole::FreeChain)))
        .chain(containers.into_iter().map(|(_, _, _, b)| (b, TopRole::Container)))
        .collect()
}

fn allows_multiple(env: &Environment, block: BlockRef) -> bool {
    match &env.workspace.block(block).kind {
        BlockKind::HostCall(qname) => env
            .api
            .symbol(qname)
            .is_some_and(|s| s.attributes.allow_multiple),
        _ => false,
    }
}

fn event_after_on_start(env: &Environment, block: BlockRef) -> bool {
    match &env.workspace.block(block).kind {
        BlockKind::HostCall(qname) => env
            .api
            .symbol(qname)
            .is_some_and(|s| s.attributes.after_on_start),
        _ => false,
    }
}

/// Identity of a top block for duplicate detection: its kind, fields and
/// the shape of its value inputs. Handler bodies do not count.
fn structural_key(env: &Environment, block: BlockRef) -> String {
    let b = env.workspace.block(block);
    if b.kind == BlockKind::FunctionDefinition {
        return format!("function {}", b.function_name().unwrap_or_default());
    }
    if b.kind == BlockKind::OnStart {
        return ON_START.to_string();
    }
    let mut key = b.tag.clone();
    for field in &b.fields {
        key.push_str(&format!(" {}={}", field.name, field.value));
    }
    for input in b.value_inputs() {
        key.push_str(&format!(" {}:(", input.name));
        if let Some(child) = input.target.filter(|c| env.is_live(*c)) {
            key.push_str(&structural_key(env, child));
        }
        key.push(')');
    }
    key
}

/// First 16 bits of the MD5 digest of `text`.
pub fn hash16(text: &str) -> u16 {
    let digest = md5::compute(text.as_bytes());
    u16::from_be_bytes([digest.0[0], digest.0[1]])
}

fn block_stats(env: &Environment) -> BTreeMap<String, usize> {
    let ws = env.workspace;
    let mut stats = BTreeMap::new();
    for block in ws.refs() {
        let b = ws.block(block);
        if b.shadow || !env.is_live(block) {
            continue;
        }
        *stats.entry(b.tag.clone()).or_insert(0) += 1;
    }
    stats
}

/// Enums, kind namespaces and the declarations no statement claimed.
fn declarations_prelude(env: &mut Environment) -> Result<Vec<OutputNode>, PipelineError> {
    let ws = env.workspace;
    let api = env.api;
    let mut out = Vec::new();

    for info in &api.enums {
        let members = ws
            .variables
            .iter()
            .filter(|v| v.var_type.as_deref() == Some(info.name.as_str()))
            .filter_map(|v| match decode_enum_member(&v.name) {
                Some(member) => Some(member),
                None => {
                    warn!(variable = %v.name, "enum member without an encoded value");
                    None
                }
            })
            .collect::<Vec<_>>();
        if !members.is_empty() {
            out.push(enum_declaration(info, members));
        }
    }

    for kind in &api.kinds {
        let members = kind_members(ws, kind);
        if !members.is_empty() {
            out.push(kind_namespace(kind, &members));
        }
    }

    let root_declarations = env
        .root_declarations
        .iter()
        .copied()
        .filter(|id| !env.binding(*id).hidden)
        .collect::<Vec<_>>();
    let mut compiler = BlockCompiler::new(env)?;
    for (index, id) in root_declarations.into_iter().enumerate() {
        let mut node = compiler.emit_declaration(id);
        node.blank_line_before = index == 0;
        out.push(node);
    }
    Ok(out)
}

/// Splits `<value><Member>` into its parts.
fn decode_enum_member(encoded: &str) -> Option<(i64, String)> {
    let digits = encoded
        .char_indices()
        .take_while(|(i, c)| c.is_ascii_digit() || (*i == 0 && *c == '-'))
        .count();
    let value = encoded[..digits].parse::<i64>().ok()?;
    let member = &encoded[digits..];
    if member.is_empty() {
        return None;
    }
    Some((value, member.to_string()))
}

fn enum_declaration(info: &EnumInfo, mut members: Vec<(i64, String)>) -> OutputNode {
    members.sort();
    let mut lines = Vec::new();
    let mut previous: Option<i64> = None;
    for (value, member) in members {
        let line = if info.is_hash {
            format!("{} = {},", member, hash16(&member))
        } else if info.is_bitmask && value > 0 && (value & (value - 1)) == 0 {
            format!("{} = 1 << {},", member, value.trailing_zeros())
        } else if previous.is_some_and(|p| p + 1 == value) && !info.is_bitmask {
            format!("{},", member)
        } else {
            format!("{} = {},", member, value)
        };
        previous = Some(value);
        lines.push(OutputNode::text(line));
    }
    OutputNode::group(vec![
        OutputNode::text(format!("enum {} ", info.name)),
        OutputNode::block(lines),
    ])
}

/// Workspace variables typed as `kind`, minus its built-in members, each once.
fn kind_members(ws: &Workspace, kind: &KindInfo) -> IndexSet<String> {
    ws.variables
        .iter()
        .filter(|v| v.var_type.as_deref() == Some(kind.name.as_str()))
        .filter(|v| !kind.initial_members.contains(&v.name))
        .map(|v| v.name.clone())
        .collect()
}

fn kind_namespace(kind: &KindInfo, members: &IndexSet<String>) -> OutputNode {
    let lines = members
        .iter()
        .map(|m| {
            OutputNode::stmt(vec![OutputNode::text(format!(
                "export const {} = {}()",
                m, kind.create_function_name
            ))])
        })
        .collect();
    OutputNode::group(vec![
        OutputNode::text(format!("namespace {} ", kind.name)),
        OutputNode::block(lines),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blocks::{BlockSpec, WorkspaceBuilder};

    #[test]
    fn enum_members_decode_value_and_name() {
        assert_eq!(decode_enum_member("3Left"), Some((3, "Left".to_string())));
        assert_eq!(decode_enum_member("-1Off"), Some((-1, "Off".to_string())));
        assert_eq!(decode_enum_member("Left"), None);
        assert_eq!(decode_enum_member("12"), None);
    }

    #[test]
    fn consecutive_enum_values_omit_initializers() {
        let info = EnumInfo {
            name: "Direction".to_string(),
            ..EnumInfo::default()
        };
        let node = enum_declaration(
            &info,
            vec![(2, "Down".to_string()), (1, "Up".to_string()), (5, "Left".to_string())],
        );
        assert_eq!(
            flatten(&[node]).source,
            "enum Direction {\n    Up = 1,\n    Down,\n    Left = 5,\n}\n"
        );
    }

    #[test]
    fn kind_members_are_listed_once() {
        let ws = WorkspaceBuilder::new()
            .variable("Player", Some("SpriteKind"))
            .variable("Enemy", Some("SpriteKind"))
            .variable("Food", Some("SpriteKind"))
            .variable("Enemy", Some("SpriteKind"))
            .build(&ApiInfo::new())
            .unwrap();
        let kind = KindInfo {
            name: "SpriteKind".to_string(),
            create_function_name: "SpriteKind.create".to_string(),
            initial_members: vec!["Player".to_string()],
        };
        let members = kind_members(&ws, &kind);
        assert_eq!(members.iter().collect::<Vec<_>>(), vec!["Enemy", "Food"]);
        assert_eq!(
            flatten(&[kind_namespace(&kind, &members)]).source,
            "namespace SpriteKind {\n    export const Enemy = SpriteKind.create();\n    export const Food = SpriteKind.create();\n}\n"
        );
    }

    #[test]
    fn bitmask_enums_use_shifts() {
        let info = EnumInfo {
            name: "Flags".to_string(),
            is_bitmask: true,
            is_hash: false,
        };
        let node = enum_declaration(&info, vec![(1, "A".to_string()), (4, "C".to_string())]);
        assert_eq!(
            flatten(&[node]).source,
            "enum Flags {\n    A = 1 << 0,\n    C = 1 << 2,\n}\n"
        );
    }

    #[test]
    fn duplicate_free_chains_and_reporters_are_disabled() {
        let ws = WorkspaceBuilder::new()
            .block(BlockSpec::new("a", "variables_set").field("VAR", "x").empty_value("VALUE"))
            .block(BlockSpec::new("b", "variables_set").field("VAR", "y").empty_value("VALUE"))
            .block(BlockSpec::new("r", "math_number").field("NUM", "1"))
            .build(&ApiInfo::new())
            .unwrap();
        let out = compile_workspace(&ws, &ApiInfo::new(), &CompileOptions::default()).unwrap();
        assert_eq!(out.disabled_blocks, vec!["b".to_string(), "r".to_string()]);
        assert_eq!(out.source, "let x = 0;\n");
        assert_eq!(out.block_stats.get("variables_set"), Some(&1));
    }
}
