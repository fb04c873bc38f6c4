//! Sub-document dependency extraction.
//!
//! Targets can depend on literate reports via `subdoc_in("report.md")`; the
//! identifiers referenced from the report's code blocks become target loads
//! of the depending command.  The extractor is pluggable so callers can
//! swap in a parser for their own document format.

use crate::analyze;
use crate::parse::parse_expr_text;

pub trait SubdocExtractor {
    /// Return the identifiers referenced by the document at `path`.
    /// Errors are parse errors and abort plan loading.
    fn extract(&self, path: &str) -> Result<Vec<String>, String>;
}

/// Default extractor: scans a markdown-style document for fenced code
/// blocks and analyzes each line inside them as a command expression.
#[derive(Default)]
pub struct FencedCodeExtractor;

impl SubdocExtractor for FencedCodeExtractor {
    fn extract(&self, path: &str) -> Result<Vec<String>, String> {
        let text = std::fs::read_to_string(path)
            .map_err(|err| format!("read subdoc {}: {}", path, err))?;
        let mut names = Vec::new();
        let mut in_fence = false;
        for line in text.lines() {
            if line.trim_start().starts_with("```") {
                in_fence = !in_fence;
                continue;
            }
            if !in_fence {
                continue;
            }
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let expr = parse_expr_text(line)
                .map_err(|err| format!("subdoc {}: {}", path, err))?;
            let deps = analyze::analyze(&expr);
            names.extend(deps.loads.into_iter());
            names.extend(deps.globals.into_iter());
        }
        names.sort();
        names.dedup();
        Ok(names)
    }
}

/// Extractor that never finds anything; used when sub-document tracking is
/// not wanted.
pub struct NullExtractor;

impl SubdocExtractor for NullExtractor {
    fn extract(&self, _path: &str) -> Result<Vec<String>, String> {
        Ok(Vec::new())
    }
}
