//! Patch model: parsing, validation, and the deterministic line diff.
//!
//! The model provider returns a JSON object of file actions. Nothing in it
//! is trusted: paths must stay inside the workspace under path-component
//! containment, the action set is closed, and the change size is bounded
//! before anything touches disk.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path};

/// Maximum files one patch may change.
pub const MAX_PATCH_FILES: usize = 5;

/// Maximum changed lines one patch may produce.
pub const MAX_DIFF_LINES: usize = 200;

/// Attempts against the default model before escalating.
pub const MAX_LLM_RETRIES: u32 = 3;

// =============================================================================
// Patch model
// =============================================================================

/// One file action. The set is closed: anything else fails validation at
/// the serde layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PatchAction {
    /// Create a file (must not already exist under the target anchor).
    WriteFile { path: String, content: String },
    /// Replace a file's full content.
    ModifyFile { path: String, content: String },
    /// Remove a file.
    DeleteFile { path: String },
}

impl PatchAction {
    #[must_use]
    pub fn path(&self) -> &str {
        match self {
            PatchAction::WriteFile { path, .. }
            | PatchAction::ModifyFile { path, .. }
            | PatchAction::DeleteFile { path } => path,
        }
    }

    #[must_use]
    pub fn content(&self) -> Option<&str> {
        match self {
            PatchAction::WriteFile { content, .. } | PatchAction::ModifyFile { content, .. } => {
                Some(content)
            }
            PatchAction::DeleteFile { .. } => None,
        }
    }

    #[must_use]
    pub fn kind_name(&self) -> &'static str {
        match self {
            PatchAction::WriteFile { .. } => "write_file",
            PatchAction::ModifyFile { .. } => "modify_file",
            PatchAction::DeleteFile { .. } => "delete_file",
        }
    }
}

/// A validated, bounded set of file actions plus a human summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchResult {
    pub actions: Vec<PatchAction>,
    #[serde(default)]
    pub summary: String,
}

// =============================================================================
// Parsing
// =============================================================================

/// Collect JSON candidate substrings from raw model output, in preference
/// order: fenced code blocks, the whole text, then balanced-brace spans.
fn collect_json_candidates(raw: &str) -> Vec<String> {
    let text = raw.trim();
    if text.is_empty() {
        return Vec::new();
    }

    let mut candidates: Vec<String> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();
    let mut push = |candidate: &str| {
        let normalized = candidate.trim().to_string();
        if !normalized.is_empty() && seen.insert(normalized.clone()) {
            candidates.push(normalized);
        }
    };

    let fence_re = Regex::new(r"(?s)```(?:json)?\s*\n(.*?)\n```").expect("static regex");
    for caps in fence_re.captures_iter(text) {
        push(&caps[1]);
    }

    push(text);

    // Balanced-brace scan, string-aware.
    let mut depth = 0usize;
    let mut start: Option<usize> = None;
    let mut in_string = false;
    let mut escaped = false;
    for (idx, ch) in text.char_indices() {
        if in_string {
            if escaped {
                escaped = false;
            } else if ch == '\\' {
                escaped = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => {
                if depth == 0 {
                    start = Some(idx);
                }
                depth += 1;
            }
            '}' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start.take() {
                        push(&text[s..=idx]);
                    }
                }
            }
            _ => {}
        }
    }

    candidates
}

/// Extract and parse a [`PatchResult`] from raw model output.
pub fn parse_patch_json(raw: &str) -> Result<PatchResult, String> {
    let mut last_error = None;
    for candidate in collect_json_candidates(raw) {
        match serde_json::from_str::<PatchResult>(&candidate) {
            Ok(patch) => return Ok(patch),
            Err(e) => last_error = Some(e.to_string()),
        }
    }
    Err(match last_error {
        Some(e) => format!("no valid patch object in model output: {e}"),
        None => "no JSON found in model output".to_string(),
    })
}

// =============================================================================
// Path containment
// =============================================================================

/// Whether `rel` resolves inside `workspace` under path-component
/// containment.
///
/// Rejects absolute paths and any parent-directory component outright,
/// then resolves the deepest existing ancestor of the joined path so a
/// symlink inside the workspace cannot smuggle a write outside it. The
/// final check is `Path::starts_with`, which compares whole components:
/// `/a/repo-evil` does not start with `/a/repo`.
#[must_use]
pub fn path_within_workspace(workspace: &Path, rel: &str) -> bool {
    if rel.is_empty() {
        return false;
    }
    let rel_path = Path::new(rel);
    if !rel_path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return false;
    }

    let Ok(ws) = workspace.canonicalize() else {
        return false;
    };
    let joined = ws.join(rel_path);
    let mut probe = joined;
    loop {
        if probe.exists() {
            break;
        }
        match probe.parent() {
            Some(parent) => probe = parent.to_path_buf(),
            None => return false,
        }
    }
    match probe.canonicalize() {
        Ok(resolved) => resolved.starts_with(&ws),
        Err(_) => false,
    }
}

fn same_anchor(path: &str, target: &str) -> bool {
    if path == target {
        return true;
    }
    Path::new(path).parent() == Path::new(target).parent()
}

// =============================================================================
// Validation
// =============================================================================

/// Validate a patch against the workspace and the candidate's target.
///
/// Checks, in order: the action list is non-empty and within the file
/// budget, every path stays inside the workspace, every path is anchored
/// at the target file (same file or a sibling), deletes reference existing
/// files, and the deterministic line diff stays within budget.
pub fn validate_patch(
    patch: &PatchResult,
    workspace: &Path,
    target_path: Option<&str>,
) -> Result<(), String> {
    if patch.actions.is_empty() {
        return Err("patch contains no actions".to_string());
    }

    let distinct: HashSet<&str> = patch.actions.iter().map(PatchAction::path).collect();
    if distinct.len() > MAX_PATCH_FILES {
        return Err(format!(
            "patch changes {} files, limit is {MAX_PATCH_FILES}",
            distinct.len()
        ));
    }

    for action in &patch.actions {
        let path = action.path();
        if !path_within_workspace(workspace, path) {
            return Err(format!("path escapes the workspace: {path}"));
        }
        if let Some(target) = target_path {
            if !same_anchor(path, target) {
                return Err(format!(
                    "path is not anchored at the target file: {path} (target: {target})"
                ));
            }
        }
        if matches!(action, PatchAction::DeleteFile { .. })
            && !workspace.join(path).is_file()
        {
            return Err(format!("delete target does not exist: {path}"));
        }
    }

    let diff_lines = compute_diff_lines(patch, workspace);
    if diff_lines > MAX_DIFF_LINES {
        return Err(format!(
            "patch changes {diff_lines} lines, limit is {MAX_DIFF_LINES}"
        ));
    }

    Ok(())
}

// =============================================================================
// Deterministic line diff
// =============================================================================

/// Count changed lines between two contents.
///
/// Trims the common line prefix and suffix and counts everything left on
/// both sides. Deterministic, no VCS involved; may over-count relative to
/// a minimal diff but never under-counts.
#[must_use]
pub fn line_diff_count(old: &str, new: &str) -> usize {
    let old_lines: Vec<&str> = old.lines().collect();
    let new_lines: Vec<&str> = new.lines().collect();
    let min_len = old_lines.len().min(new_lines.len());

    let mut prefix = 0;
    while prefix < min_len && old_lines[prefix] == new_lines[prefix] {
        prefix += 1;
    }

    let mut suffix = 0;
    while suffix < min_len - prefix
        && old_lines[old_lines.len() - 1 - suffix] == new_lines[new_lines.len() - 1 - suffix]
    {
        suffix += 1;
    }

    (old_lines.len() - prefix - suffix) + (new_lines.len() - prefix - suffix)
}

/// Total changed lines a patch would produce against current file contents.
///
/// Must be computed before apply, while the old contents still exist.
#[must_use]
pub fn compute_diff_lines(patch: &PatchResult, workspace: &Path) -> usize {
    let mut total = 0;
    for action in &patch.actions {
        let old = std::fs::read_to_string(workspace.join(action.path())).unwrap_or_default();
        match action.content() {
            Some(new) => total += line_diff_count(&old, new),
            None => total += old.lines().count(),
        }
    }
    total
}
