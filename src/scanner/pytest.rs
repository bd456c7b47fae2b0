//! Test-runner output parsing.
//!
//! Pure functions over captured runner output so every edge case is unit
//! testable without spawning a subprocess. The runner contract is the
//! pytest short-traceback format: per-test node ids
//! (`file::Class::test`), `FAILED`/`ERROR` result lines, and
//! `ERROR collecting <file>` blocks for import-time failures.

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Upper bound on failure nodes extracted from one run.
const MAX_FAILURE_NODES: usize = 30;

/// Upper bound on collection-error blocks extracted from one run.
const MAX_ERROR_BLOCKS: usize = 20;

/// Upper bound on raw error lines kept for context.
const MAX_ERROR_LINES: usize = 10;

/// Exception names that identify the cause line of a traceback.
const EXCEPTION_NAMES: &[&str] = &[
    "ModuleNotFoundError",
    "ImportError",
    "ConnectionRefusedError",
    "FileNotFoundError",
    "SyntaxError",
    "AttributeError",
    "TypeError",
    "NameError",
    "OSError",
    "PermissionError",
];

/// Output signatures meaning the runner itself is broken, not the tests.
const ENV_BLOCKER_SIGNATURES: &[&str] = &[
    "no module named pytest",
    "no module named 'pytest'",
    "error while loading conftest",
];

/// A single failing test, addressable by its node id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureNode {
    /// Narrowest test identifier the runner can re-run (`file::Class::test`).
    pub nodeid: String,
    /// File containing the failing node.
    pub path: String,
}

/// A per-file collection error (the file failed to import).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBlock {
    pub path: String,
    pub exception_line: String,
    pub snippet: Vec<String>,
}

/// Parsed result of one test-runner invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PytestScan {
    /// Whether the runner could be invoked at all.
    pub available: bool,
    pub exit_code: Option<i32>,
    /// Count of failing tests.
    pub failures: usize,
    /// Count of collection errors.
    pub errors_count: usize,
    /// The runner's result line (`3 failed, 10 passed in 1.2s`).
    pub summary: String,
    /// Best single line explaining the failure cause.
    pub headline: String,
    /// Last 20 output lines, for prompt context.
    pub tail: Vec<String>,
    /// Raw `ERROR`/`E   ` lines, capped.
    pub error_lines: Vec<String>,
    pub error_blocks: Vec<ErrorBlock>,
    pub failure_nodes: Vec<FailureNode>,
    /// Invocation-level error (timeout, spawn failure).
    pub error: Option<String>,
    /// Set when the runner itself is broken (environmental blocker).
    pub env_blocker: Option<String>,
}

impl PytestScan {
    /// A scan result for a runner that could not be spawned.
    #[must_use]
    pub fn unavailable(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self {
            available: false,
            error: Some(detail.clone()),
            env_blocker: Some(detail),
            ..Self::default()
        }
    }
}

/// Remove ANSI color escape sequences (belt and braces over `--color=no`).
#[must_use]
pub fn strip_ansi(text: &str) -> String {
    let re = Regex::new(r"\x1b\[[0-9;]*m").expect("static regex");
    re.replace_all(text, "").into_owned()
}

/// Find the runner's result line by scanning from the end, skipping
/// warnings noise.
fn find_summary_line(lines: &[&str]) -> String {
    const SUMMARY_KEYWORDS: &[&str] = &["passed", "failed", "error", "no tests ran"];
    for line in lines.iter().rev() {
        let stripped = line.trim();
        if stripped.is_empty() {
            continue;
        }
        if stripped.to_lowercase().contains("warnings summary") || stripped.contains("Warning:") {
            continue;
        }
        let lower = stripped.to_lowercase();
        if SUMMARY_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
            return stripped.to_string();
        }
    }
    lines.last().map(|l| l.trim().to_string()).unwrap_or_default()
}

/// Pick the single line most likely to explain the failure.
fn extract_headline(lines: &[&str]) -> String {
    for line in lines {
        if line.contains("ERROR collecting") {
            return line.trim().to_string();
        }
    }
    for line in lines {
        let stripped = line.trim_end();
        if stripped.trim_start().starts_with("E   ") || stripped.starts_with("E   ") {
            return stripped.trim().to_string();
        }
    }
    for line in lines {
        if EXCEPTION_NAMES.iter().any(|exc| line.contains(exc)) {
            return line.trim().to_string();
        }
    }
    for line in lines {
        if line.contains("Interrupted:") && line.contains("errors") {
            return line.trim().to_string();
        }
    }
    lines.last().map(|l| l.trim().to_string()).unwrap_or_default()
}

fn extract_error_lines(lines: &[&str]) -> Vec<String> {
    let mut result = Vec::new();
    for line in lines {
        let stripped = line.trim();
        if stripped.starts_with("ERROR") || stripped.starts_with("E   ") {
            result.push(stripped.to_string());
            if result.len() >= MAX_ERROR_LINES {
                break;
            }
        }
    }
    result
}

/// Extract node ids from `FAILED`/`ERROR` result lines, deduplicated.
fn extract_failure_nodes(lines: &[&str]) -> Vec<FailureNode> {
    let re = Regex::new(r"^(?:FAILED|ERROR)\s+(\S+)").expect("static regex");
    let mut nodes = Vec::new();
    let mut seen = std::collections::HashSet::new();
    for line in lines {
        let stripped = line.trim();
        if let Some(caps) = re.captures(stripped) {
            let nodeid = caps[1].to_string();
            // Result lines reference node ids; bare words ("ERROR collecting")
            // are handled by the block extractor.
            if !nodeid.contains("::") && !nodeid.contains('.') {
                continue;
            }
            if !seen.insert(nodeid.clone()) {
                continue;
            }
            let path = nodeid.split("::").next().unwrap_or(&nodeid).to_string();
            nodes.push(FailureNode { nodeid, path });
            if nodes.len() >= MAX_FAILURE_NODES {
                break;
            }
        }
    }
    nodes
}

/// Group `ERROR collecting <file>` output into per-file blocks.
fn extract_error_blocks(lines: &[&str]) -> Vec<ErrorBlock> {
    let re = Regex::new(r"ERROR\s+collecting\s+(\S+)").expect("static regex");
    let mut blocks = Vec::new();
    let mut i = 0;
    while i < lines.len() && blocks.len() < MAX_ERROR_BLOCKS {
        let stripped = lines[i].trim();
        if let Some(caps) = re.captures(stripped) {
            let path = caps[1].trim_matches('_').trim().to_string();
            let mut exception_line = String::new();
            let mut snippet = vec![stripped.to_string()];
            let mut j = i + 1;
            while j < lines.len() {
                let next = lines[j].trim();
                if next.starts_with("E   ") {
                    snippet.push(next.to_string());
                    if exception_line.is_empty() {
                        exception_line = next.to_string();
                    }
                    j += 1;
                } else if next.starts_with("ERROR") || next.is_empty() {
                    break;
                } else {
                    snippet.push(next.to_string());
                    j += 1;
                }
            }
            snippet.truncate(8);
            blocks.push(ErrorBlock {
                path,
                exception_line,
                snippet,
            });
            i = j;
        } else {
            i += 1;
        }
    }
    blocks
}

fn count_collection_errors(output: &str) -> usize {
    let re_errors_in = Regex::new(r"(?m)(?:^|\s)(\d+)\s+errors?\s+in\s").expect("static regex");
    if let Some(caps) = re_errors_in.captures(output) {
        return caps[1].parse().unwrap_or(0);
    }
    let re_interrupted =
        Regex::new(r"Interrupted:\s+(\d+)\s+errors?\s+during\s+collection").expect("static regex");
    if let Some(caps) = re_interrupted.captures(output) {
        return caps[1].parse().unwrap_or(0);
    }
    0
}

fn count_failures(lines: &[&str]) -> usize {
    for line in lines {
        if line.contains("failed") {
            let parts: Vec<&str> = line.split_whitespace().collect();
            for (i, p) in parts.iter().enumerate() {
                if (*p == "failed" || *p == "failed,") && i > 0 {
                    if let Ok(n) = parts[i - 1].parse::<usize>() {
                        if n > 0 {
                            return n;
                        }
                    }
                }
            }
        }
    }
    0
}

fn detect_env_blocker(output: &str) -> Option<String> {
    let lower = output.to_lowercase();
    for sig in ENV_BLOCKER_SIGNATURES {
        if lower.contains(sig) {
            return Some(format!("test runner is broken: {sig}"));
        }
    }
    None
}

/// Parse captured runner output plus its exit code into a [`PytestScan`].
///
/// Exit-code floors: exit 1 implies at least one failure, exit 2 at least
/// one collection error, even when the counters could not be parsed.
#[must_use]
pub fn parse_pytest_output(output: &str, exit_code: i32) -> PytestScan {
    let clean = strip_ansi(output);
    let lines: Vec<&str> = clean.lines().collect();
    let tail: Vec<String> = lines
        .iter()
        .rev()
        .take(20)
        .rev()
        .map(|l| (*l).to_string())
        .collect();

    let summary = find_summary_line(&lines);
    let mut failures = count_failures(&lines);
    let mut errors_count = count_collection_errors(&clean);

    if exit_code == 1 && failures == 0 {
        failures = 1;
    }
    if exit_code == 2 && errors_count == 0 {
        errors_count = 1;
    }

    let headline = extract_headline(&lines);
    let error_lines = extract_error_lines(&lines);
    let error_blocks = if exit_code == 2 {
        extract_error_blocks(&lines)
    } else {
        Vec::new()
    };
    let failure_nodes = if exit_code == 1 {
        extract_failure_nodes(&lines)
    } else {
        Vec::new()
    };

    PytestScan {
        available: true,
        exit_code: Some(exit_code),
        failures,
        errors_count,
        summary,
        headline,
        tail,
        error_lines,
        error_blocks,
        failure_nodes,
        error: None,
        env_blocker: detect_env_blocker(&clean),
    }
}
