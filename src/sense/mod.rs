//! Candidate generation and selection.
//!
//! Turns scanner findings into stable-id, priority-ranked remediation
//! candidates, and picks at most one per cycle.
//!
//! # Stable task ids
//!
//! A task id is a source prefix plus the first 10 hex characters of a
//! SHA-256 over the finding's key attributes. The same underlying issue
//! yields the same id across cycles, which is what lets the failure log
//! and the paused set survive restarts.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

use crate::scanner::ScanResults;

/// Hex characters of the digest kept in a task id.
const TASK_ID_HEX_LEN: usize = 10;

/// Lint findings matching these signatures cannot be fixed by patching a
/// single file and are blocked rather than attempted.
const UNFIXABLE_LINT_PATTERNS: &[&str] = &[
    "missing skill.md",
    "missing workflow.md",
    "utf-8",
    "decode",
    "__pycache__",
];

// =============================================================================
// Candidate
// =============================================================================

/// Where a candidate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CandidateSource {
    WorkflowLint,
    Pytest,
    Hygiene,
}

impl std::fmt::Display for CandidateSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            CandidateSource::WorkflowLint => "workflow_lint",
            CandidateSource::Pytest => "pytest",
            CandidateSource::Hygiene => "hygiene",
        };
        write!(f, "{name}")
    }
}

/// A concrete remediation task derived from a single finding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub task_id: String,
    pub source: CandidateSource,
    /// Smaller is more urgent.
    pub priority: u8,
    pub title: String,
    pub description: String,
    /// Narrowest file implicated; bounds EXECUTE and VERIFY.
    pub target_path: Option<String>,
    /// Single failing test identifier, when the runner provided one.
    pub target_nodeid: Option<String>,
    pub auto_fixable: bool,
    pub blocked_reason: Option<String>,
}

impl Candidate {
    fn new(
        task_id: String,
        source: CandidateSource,
        priority: u8,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            task_id,
            source,
            priority,
            title: title.into(),
            description: description.into(),
            target_path: None,
            target_nodeid: None,
            auto_fixable: true,
            blocked_reason: None,
        }
    }
}

/// Derive a stable task id from a source prefix and key attributes.
#[must_use]
pub fn stable_task_id(prefix: &str, parts: &[&str]) -> String {
    let key = parts.join(":");
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<String>()
        .chars()
        .take(TASK_ID_HEX_LEN)
        .collect();
    format!("{prefix}_{hex}")
}

// =============================================================================
// Generation
// =============================================================================

fn truncated(text: &str, max: usize) -> String {
    text.chars().take(max).collect()
}

/// Convert scan findings into candidates.
///
/// One candidate per lint finding, per failing test node, per
/// collection-error file, and per hygiene defect. A test file failing N
/// tests yields N candidates sharing a target file but with distinct
/// task ids and distinct verification targets.
#[must_use]
pub fn generate_candidates(scan: &ScanResults) -> Vec<Candidate> {
    let mut candidates = Vec::new();

    for finding in &scan.lint.findings {
        let key_rule = finding.rule_id.as_deref().unwrap_or(&finding.raw);
        let key_path = finding.path.as_deref().unwrap_or("");
        let mut candidate = Candidate::new(
            stable_task_id("lint", &[key_rule, key_path]),
            CandidateSource::WorkflowLint,
            finding.severity.priority(),
            format!("Fix lint finding: {}", truncated(&finding.raw, 80)),
            finding.raw.clone(),
        );
        candidate.target_path = finding.path.clone();
        candidates.push(candidate);
    }

    let pytest = &scan.pytest;
    if pytest.errors_count > 0 && !pytest.error_blocks.is_empty() {
        for block in &pytest.error_blocks {
            let mut candidate = Candidate::new(
                stable_task_id("pytest_ce", &[&block.path, &block.exception_line]),
                CandidateSource::Pytest,
                2,
                format!("Fix collection error: {}", truncated(&block.path, 80)),
                truncated(&block.snippet.join("\n"), 800),
            );
            candidate.target_path = Some(block.path.clone());
            candidates.push(candidate);
        }
    } else if pytest.errors_count > 0 {
        candidates.push(Candidate::new(
            stable_task_id("pytest_ce", &[&pytest.errors_count.to_string()]),
            CandidateSource::Pytest,
            2,
            format!("Fix {} collection error(s)", pytest.errors_count),
            build_pytest_description(pytest),
        ));
    }

    if pytest.failures > 0 && !pytest.failure_nodes.is_empty() {
        for node in &pytest.failure_nodes {
            let mut candidate = Candidate::new(
                stable_task_id("pytest_tf", &[&node.nodeid]),
                CandidateSource::Pytest,
                2,
                format!("Fix failing test: {}", truncated(&node.nodeid, 80)),
                format!("FAILED {}", node.nodeid),
            );
            candidate.target_path = Some(node.path.clone());
            candidate.target_nodeid = Some(node.nodeid.clone());
            candidates.push(candidate);
        }
    } else if pytest.failures > 0 {
        candidates.push(Candidate::new(
            stable_task_id("pytest_tf", &[&pytest.failures.to_string()]),
            CandidateSource::Pytest,
            2,
            format!("Fix {} failing test(s)", pytest.failures),
            build_pytest_description(pytest),
        ));
    }

    for finding in &scan.hygiene.findings {
        let mut candidate = Candidate::new(
            stable_task_id("hygiene", &[&finding.signature]),
            CandidateSource::Hygiene,
            3,
            format!("Fix hygiene issue: {}", truncated(&finding.signature, 80)),
            format!("{}:{}: {}", finding.path, finding.line, finding.issue),
        );
        candidate.target_path = Some(finding.path.clone());
        candidates.push(candidate);
    }

    candidates
}

fn build_pytest_description(pytest: &crate::scanner::PytestScan) -> String {
    let mut parts = Vec::new();
    let headline = if pytest.headline.is_empty() {
        &pytest.summary
    } else {
        &pytest.headline
    };
    parts.push(headline.clone());
    if !pytest.error_lines.is_empty() {
        parts.push(String::new());
        parts.extend(pytest.error_lines.iter().take(5).cloned());
    }
    truncated(&parts.join("\n"), 800)
}

/// Annotate candidates with `auto_fixable` / `blocked_reason`.
///
/// A candidate is auto-fixable iff it names a target path that resolves to
/// a writable file inside the workspace and does not match a known
/// unfixable pattern.
pub fn annotate_candidates(candidates: &mut [Candidate], workspace: &Path) {
    for candidate in candidates.iter_mut() {
        let mut fixable = true;
        let mut reason = None;

        match &candidate.target_path {
            None => {
                fixable = false;
                reason = Some("no_target_path".to_string());
            }
            Some(rel) => {
                let path = workspace.join(rel);
                if !path.is_file() {
                    fixable = false;
                    reason = Some("target_path_missing".to_string());
                } else if path
                    .metadata()
                    .map(|m| m.permissions().readonly())
                    .unwrap_or(true)
                {
                    fixable = false;
                    reason = Some("target_path_readonly".to_string());
                }
            }
        }

        if fixable && candidate.source == CandidateSource::WorkflowLint {
            let desc = candidate.description.to_lowercase();
            if let Some(pattern) = UNFIXABLE_LINT_PATTERNS.iter().find(|p| desc.contains(*p)) {
                fixable = false;
                reason = Some(format!("unfixable_lint:{pattern}"));
            }
        }

        candidate.auto_fixable = fixable;
        candidate.blocked_reason = reason;
    }
}

// =============================================================================
// Selection
// =============================================================================

/// Why SELECT produced no task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionSkipReason {
    /// Scanner produced no candidates at all.
    EmptyScan,
    /// Candidates exist but none are auto-fixable.
    NoFixableCandidates,
    /// Fixable candidates exist but every one is paused.
    AllPaused,
}

impl std::fmt::Display for SelectionSkipReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SelectionSkipReason::EmptyScan => "empty_scan",
            SelectionSkipReason::NoFixableCandidates => "no_fixable_candidates",
            SelectionSkipReason::AllPaused => "all_paused",
        };
        write!(f, "{name}")
    }
}

/// Result of the SELECT phase.
#[derive(Debug, Clone, PartialEq)]
pub enum SelectionOutcome {
    Selected(Candidate),
    Skipped(SelectionSkipReason),
}

/// Choose at most one candidate, honoring the paused set.
///
/// Paused and non-fixable candidates are filtered out; the remainder is
/// sorted by `(priority, task_id)` so ties break deterministically.
#[must_use]
pub fn select_task(candidates: &[Candidate], paused_tasks: &[String]) -> SelectionOutcome {
    if candidates.is_empty() {
        return SelectionOutcome::Skipped(SelectionSkipReason::EmptyScan);
    }

    let fixable: Vec<&Candidate> = candidates.iter().filter(|c| c.auto_fixable).collect();
    if fixable.is_empty() {
        return SelectionOutcome::Skipped(SelectionSkipReason::NoFixableCandidates);
    }

    let mut active: Vec<&Candidate> = fixable
        .iter()
        .copied()
        .filter(|c| !paused_tasks.iter().any(|t| *t == c.task_id))
        .collect();
    if active.is_empty() {
        return SelectionOutcome::Skipped(SelectionSkipReason::AllPaused);
    }

    active.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.task_id.cmp(&b.task_id))
    });
    SelectionOutcome::Selected(active[0].clone())
}

/// Count candidates blocked from auto-fixing.
#[must_use]
pub fn blocked_candidates(candidates: &[Candidate]) -> Vec<&Candidate> {
    candidates.iter().filter(|c| !c.auto_fixable).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{
        parse_lint_output, parse_pytest_output, HygieneScan, LintScan, LintSeverity,
    };
    use tempfile::TempDir;

    fn scan_with_lint(lines: &str) -> ScanResults {
        ScanResults {
            lint: LintScan {
                available: true,
                exit_code: Some(1),
                findings: parse_lint_output(lines, &[LintSeverity::Error, LintSeverity::Caution]),
                error: None,
            },
            ..ScanResults::default()
        }
    }

    fn fixable(task_id: &str, priority: u8) -> Candidate {
        Candidate {
            task_id: task_id.to_string(),
            source: CandidateSource::Pytest,
            priority,
            title: task_id.to_string(),
            description: String::new(),
            target_path: Some("tests/test_a.py".to_string()),
            target_nodeid: None,
            auto_fixable: true,
            blocked_reason: None,
        }
    }

    #[test]
    fn test_stable_task_id_is_deterministic() {
        let a = stable_task_id("pytest_tf", &["tests/test_a.py::test_x"]);
        let b = stable_task_id("pytest_tf", &["tests/test_a.py::test_x"]);
        assert_eq!(a, b);
        assert!(a.starts_with("pytest_tf_"));
        assert_eq!(a.len(), "pytest_tf_".len() + TASK_ID_HEX_LEN);
    }

    #[test]
    fn test_stable_task_id_differs_by_key() {
        let a = stable_task_id("lint", &["WL-1", "a.py"]);
        let b = stable_task_id("lint", &["WL-1", "b.py"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_generator_equal_findings_equal_ids() {
        let scan = scan_with_lint("[ERROR] a.py:1: broken (WL-1)");
        let first = generate_candidates(&scan);
        let second = generate_candidates(&scan);
        assert_eq!(first[0].task_id, second[0].task_id);
    }

    #[test]
    fn test_nodeid_splitting_one_candidate_per_node() {
        let output = "\
FAILED tests/test_a.py::test_x - assert 1 == 2
FAILED tests/test_a.py::test_y - assert 3 == 4
2 failed in 0.1s";
        let scan = ScanResults {
            pytest: parse_pytest_output(output, 1),
            ..ScanResults::default()
        };
        let candidates = generate_candidates(&scan);
        assert_eq!(candidates.len(), 2);
        assert_ne!(candidates[0].task_id, candidates[1].task_id);
        assert_eq!(candidates[0].target_path, candidates[1].target_path);
        assert_ne!(candidates[0].target_nodeid, candidates[1].target_nodeid);
    }

    #[test]
    fn test_priorities_by_source() {
        let output = "FAILED tests/test_a.py::test_x - boom\n1 failed in 0.1s";
        let scan = ScanResults {
            lint: scan_with_lint("[ERROR] a.py:1: broken (WL-1)\n[CAUTION] b.py:2: iffy (WL-2)")
                .lint,
            pytest: parse_pytest_output(output, 1),
            hygiene: HygieneScan {
                findings: crate::scanner::hygiene::check_content("c.py", "<<<<<<< HEAD\n"),
            },
        };
        let candidates = generate_candidates(&scan);
        let by_source: Vec<(u8, CandidateSource)> =
            candidates.iter().map(|c| (c.priority, c.source)).collect();
        assert!(by_source.contains(&(1, CandidateSource::WorkflowLint)));
        assert!(by_source.contains(&(4, CandidateSource::WorkflowLint)));
        assert!(by_source.contains(&(2, CandidateSource::Pytest)));
        assert!(by_source.contains(&(3, CandidateSource::Hygiene)));
    }

    #[test]
    fn test_annotate_blocks_missing_target() {
        let temp = TempDir::new().unwrap();
        let mut candidates = vec![fixable("a", 2)];
        candidates[0].target_path = None;
        annotate_candidates(&mut candidates, temp.path());
        assert!(!candidates[0].auto_fixable);
        assert_eq!(candidates[0].blocked_reason.as_deref(), Some("no_target_path"));
    }

    #[test]
    fn test_annotate_accepts_writable_target() {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("tests")).unwrap();
        std::fs::write(temp.path().join("tests/test_a.py"), "x = 1\n").unwrap();
        let mut candidates = vec![fixable("a", 2)];
        annotate_candidates(&mut candidates, temp.path());
        assert!(candidates[0].auto_fixable);
        assert!(candidates[0].blocked_reason.is_none());
    }

    #[test]
    fn test_annotate_blocks_unfixable_lint_pattern() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join("skill.py"), "x\n").unwrap();
        let mut candidates = vec![Candidate {
            task_id: "lint_x".to_string(),
            source: CandidateSource::WorkflowLint,
            priority: 1,
            title: "t".to_string(),
            description: "[ERROR] skill.py: missing SKILL.md for agent".to_string(),
            target_path: Some("skill.py".to_string()),
            target_nodeid: None,
            auto_fixable: true,
            blocked_reason: None,
        }];
        annotate_candidates(&mut candidates, temp.path());
        assert!(!candidates[0].auto_fixable);
        assert!(candidates[0]
            .blocked_reason
            .as_deref()
            .unwrap()
            .starts_with("unfixable_lint:"));
    }

    #[test]
    fn test_select_empty_scan() {
        assert_eq!(
            select_task(&[], &[]),
            SelectionOutcome::Skipped(SelectionSkipReason::EmptyScan)
        );
    }

    #[test]
    fn test_select_no_fixable() {
        let mut candidate = fixable("a", 2);
        candidate.auto_fixable = false;
        assert_eq!(
            select_task(&[candidate], &[]),
            SelectionOutcome::Skipped(SelectionSkipReason::NoFixableCandidates)
        );
    }

    #[test]
    fn test_select_all_paused() {
        let candidate = fixable("a", 2);
        assert_eq!(
            select_task(&[candidate], &["a".to_string()]),
            SelectionOutcome::Skipped(SelectionSkipReason::AllPaused)
        );
    }

    #[test]
    fn test_select_respects_pause_and_picks_next_best() {
        // The paused task is the sole highest-priority candidate; the
        // selector must emit the next best, not the paused one.
        let high = fixable("high_priority", 1);
        let low = fixable("low_priority", 2);
        let outcome = select_task(&[high, low], &["high_priority".to_string()]);
        match outcome {
            SelectionOutcome::Selected(c) => assert_eq!(c.task_id, "low_priority"),
            other => panic!("expected selection, got {other:?}"),
        }
    }

    #[test]
    fn test_select_deterministic_tie_break() {
        let b = fixable("bbb", 2);
        let a = fixable("aaa", 2);
        let outcome = select_task(&[b, a], &[]);
        match outcome {
            SelectionOutcome::Selected(c) => assert_eq!(c.task_id, "aaa"),
            other => panic!("expected selection, got {other:?}"),
        }
    }
}
