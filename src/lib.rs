pub mod api;
pub mod blocks;
pub mod compiler;
pub mod diagnostics;
pub mod env;
pub mod format;
pub mod infer;
pub mod loader;
pub mod mutation;
pub mod output;
pub mod pipeline;
pub mod points;
pub mod resolver;
pub mod scope;

#[cfg(not(target_arch = "wasm32"))]
pub mod cli;

#[cfg(all(target_arch = "wasm32", feature = "wasm-bindings"))]
pub mod wasm;

use anyhow::Result;
use api::ApiInfo;
use format::{SourceFormatter, TrimFormatter};
use pipeline::{compile_workspace, compile_workspace_with_progress, CompileOptions, CompileOutput};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[cfg(not(target_arch = "wasm32"))]
pub fn run_cli(args: &cli::Args) -> Result<()> {
    let total_stages = 2
        + pipeline::STAGES
        + usize::from(args.output.is_some())
        + usize::from(args.source_map.is_some());
    let progress = CliProgress::new("Compile", total_stages);
    let mut stage = 0usize;

    stage += 1;
    progress.emit(stage, "Loading API surface");
    let api = match &args.api {
        Some(path) => loader::load_api_file(&canonicalize_file(path)?)?,
        None => ApiInfo::new(),
    };

    stage += 1;
    progress.emit(stage, "Loading workspace");
    let input = canonicalize_file(&args.input)?;
    let workspace = loader::load_workspace_file(&input, &api)?;

    let options = CompileOptions {
        formatter: args
            .trim_formatter
            .then(|| Box::new(TrimFormatter) as Box<dyn SourceFormatter>),
        emit_formatted: args.trim_formatter,
    };
    let loaded = stage;
    let mut compile_stage_cb = |step: usize, _total: usize, label: &str| {
        progress.emit(loaded + step, label);
    };
    let output = compile_workspace_with_progress(&workspace, &api, &options, Some(&mut compile_stage_cb))?;
    stage += pipeline::STAGES;

    if let Some(failure) = &output.failure {
        anyhow::bail!("Compilation failed: {}", failure);
    }
    if args.diagnostics {
        for diagnostic in &output.diagnostics {
            eprintln!("warning: {}", diagnostic);
        }
    }
    if args.stats {
        for (tag, count) in &output.block_stats {
            eprintln!("{:>6}  {}", count, tag);
        }
    }

    let source = output.formatted.as_deref().unwrap_or(&output.source);
    match &args.output {
        Some(path) => {
            stage += 1;
            progress.emit(stage, "Writing TypeScript");
            std::fs::write(path, source.as_bytes())?;
        }
        None => print!("{}", source),
    }

    if let Some(path) = &args.source_map {
        stage += 1;
        progress.emit(stage, "Writing source map");
        let text = serde_json::to_string_pretty(&source_map_json(&output))?;
        std::fs::write(path, text.as_bytes())?;
    }

    Ok(())
}

/// Compiles a workspace document against an API document, both JSON text.
pub fn compile_json_sources(workspace: &str, api: &str) -> Result<CompileOutput> {
    let api = if api.trim().is_empty() {
        ApiInfo::new()
    } else {
        loader::parse_api(&serde_json::from_str(api)?)?
    };
    let workspace = loader::parse_workspace(&serde_json::from_str(workspace)?, &api)?;
    compile_workspace(&workspace, &api, &CompileOptions::default())
}

/// JSON form of both source maps and the diagnostics.
pub fn source_map_json(output: &CompileOutput) -> Value {
    let entries = output
        .source_map
        .iter()
        .map(|e| json!({ "startOffset": e.start, "length": e.length, "blockId": e.block_id }))
        .collect::<Vec<_>>();
    let lines = output
        .line_map
        .iter()
        .map(|e| json!({ "startLine": e.start_line, "endLine": e.end_line, "blockId": e.block_id }))
        .collect::<Vec<_>>();
    let diagnostics = output
        .diagnostics
        .iter()
        .map(|d| json!({ "blockId": d.block_id, "message": d.message }))
        .collect::<Vec<_>>();
    json!({ "sourceMap": entries, "lineMap": lines, "diagnostics": diagnostics })
}

pub fn canonicalize_file(path: &Path) -> Result<PathBuf> {
    if !path.exists() || !path.is_file() {
        return Err(anyhow::anyhow!("Input file not found: '{}'.", path.display()));
    }
    Ok(path.canonicalize()?)
}

#[cfg(not(target_arch = "wasm32"))]
struct CliProgress {
    prefix: &'static str,
    total: usize,
}

#[cfg(not(target_arch = "wasm32"))]
impl CliProgress {
    fn new(prefix: &'static str, total: usize) -> Self {
        Self {
            prefix,
            total: total.max(1),
        }
    }

    fn emit(&self, step: usize, label: &str) {
        self.emit_with_total(step, self.total, label);
    }

    fn emit_with_total(&self, step: usize, total: usize, label: &str) {
        let total = total.max(1);
        let step = step.clamp(1, total);
        let bar = render_progress_bar(step, total, 14);
        eprintln!("[{}] {}... ({}/{}) {}", self.prefix, label, step, total, bar);
    }
}

#[cfg(not(target_arch = "wasm32"))]
fn render_progress_bar(step: usize, total: usize, width: usize) -> String {
    let width = width.max(1);
    let filled = ((step * width) + (total / 2)) / total;
    let mut s = String::with_capacity(width + 2);
    s.push('[');
    for i in 0..width {
        s.push(if i < filled { '=' } else { '-' });
    }
    s.push(']');
    s
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;

    #[test]
    fn progress_bar_rounds_to_width() {
        assert_eq!(render_progress_bar(1, 4, 8), "[==------]");
        assert_eq!(render_progress_bar(4, 4, 8), "[========]");
    }
}
