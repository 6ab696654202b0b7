//! Formatter seam. The orchestrator hands the flattened program to a
//! formatter last; callers that only need the source map may ignore it.

use anyhow::Result;

pub trait SourceFormatter {
    fn format(&self, source: &str) -> Result<String>;
}

/// Strips trailing whitespace and collapses runs of blank lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TrimFormatter;

impl SourceFormatter for TrimFormatter {
    fn format(&self, source: &str) -> Result<String> {
        let mut out = String::with_capacity(source.len());
        let mut blank_run = 0usize;
        for line in source.lines() {
            let line = line.trim_end();
            if line.is_empty() {
                blank_run += 1;
                if blank_run > 1 || out.is_empty() {
                    continue;
                }
            } else {
                blank_run = 0;
            }
            out.push_str(line);
            out.push('\n');
        }
        while out.ends_with("\n\n") {
            out.pop();
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trims_and_collapses_blank_lines() {
        let formatted = TrimFormatter.format("\nlet x = 0;   \n\n\n\nx = 1;\n\n").unwrap();
        assert_eq!(formatted, "let x = 0;\n\nx = 1;\n");
    }
}
