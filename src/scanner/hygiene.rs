//! Workspace hygiene sweep.
//!
//! A cheap, self-contained check that walks the workspace looking for
//! mechanical defects no linter owns: leftover merge-conflict markers and
//! UTF-8 byte-order marks in source files. Findings carry a canonical
//! signature (path plus issue kind) so the same defect keeps the same task
//! id across cycles.

use globset::{Glob, GlobSet, GlobSetBuilder};
use serde::{Deserialize, Serialize};
use std::path::Path;
use walkdir::WalkDir;

/// Upper bound on findings reported per sweep.
const MAX_FINDINGS: usize = 20;

/// Files larger than this are skipped.
const MAX_FILE_BYTES: u64 = 1_048_576;

/// Directory names never descended into.
const EXCLUDED_DIRS: &[&str] = &[
    ".git",
    "_outputs",
    "_logs",
    "__pycache__",
    "node_modules",
    ".venv",
    "venv",
    "target",
    "dist",
];

/// One hygiene defect.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HygieneFinding {
    pub path: String,
    pub line: u32,
    pub issue: String,
    /// Canonical signature for stable task ids: `<path>#<kind>`.
    pub signature: String,
}

/// Parsed result of one hygiene sweep.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HygieneScan {
    pub findings: Vec<HygieneFinding>,
}

impl HygieneScan {
    #[must_use]
    pub fn finding_count(&self) -> usize {
        self.findings.len()
    }
}

fn source_globs() -> GlobSet {
    let mut builder = GlobSetBuilder::new();
    for pattern in [
        "*.py", "*.rs", "*.ts", "*.tsx", "*.js", "*.jsx", "*.md", "*.toml", "*.yml", "*.yaml",
        "*.json",
    ] {
        if let Ok(glob) = Glob::new(pattern) {
            builder.add(glob);
        }
    }
    builder.build().unwrap_or_else(|_| GlobSet::empty())
}

/// Check one file's content for hygiene defects.
#[must_use]
pub fn check_content(rel_path: &str, content: &str) -> Vec<HygieneFinding> {
    let mut findings = Vec::new();

    if content.starts_with('\u{feff}') {
        findings.push(HygieneFinding {
            path: rel_path.to_string(),
            line: 1,
            issue: "file starts with a UTF-8 byte-order mark".to_string(),
            signature: format!("{rel_path}#utf8_bom"),
        });
    }

    for (idx, line) in content.lines().enumerate() {
        if line.starts_with("<<<<<<< ") || line.starts_with(">>>>>>> ") {
            findings.push(HygieneFinding {
                path: rel_path.to_string(),
                line: (idx + 1) as u32,
                issue: format!("merge conflict marker: {}", line.trim()),
                signature: format!("{rel_path}#merge_conflict_marker"),
            });
            // One marker finding per file is enough to drive a fix.
            break;
        }
    }

    findings
}

/// Walk the workspace and collect hygiene findings, capped.
#[must_use]
pub fn scan_workspace(workspace: &Path) -> HygieneScan {
    let globs = source_globs();
    let mut findings = Vec::new();

    let walker = WalkDir::new(workspace)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !(e.file_type().is_dir() && EXCLUDED_DIRS.contains(&name.as_ref()))
        });

    for entry in walker.flatten() {
        if findings.len() >= MAX_FINDINGS {
            break;
        }
        if !entry.file_type().is_file() {
            continue;
        }
        if !globs.is_match(entry.file_name()) {
            continue;
        }
        if entry.metadata().map(|m| m.len() > MAX_FILE_BYTES).unwrap_or(true) {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(workspace)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        findings.extend(check_content(&rel, &content));
    }

    findings.truncate(MAX_FINDINGS);
    HygieneScan { findings }
}
