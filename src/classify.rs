//! Failure classification and pause accounting.
//!
//! Maps observed error text to a fixed taxonomy and maintains the per-task
//! failure log that feeds the pause threshold.
//!
//! # Taxonomy
//!
//! - `Transient`: network/timeout noise; retried next cycle, never counted.
//! - `Deterministic`: real task failures; counted toward the pause threshold.
//! - `Environment`: broken tooling; pauses the cycle without charging a task.
//! - `Flaky`: alternating outcomes on the same task id; task paused.
//! - `Policy`: destructive or escaping operations; immediate pause, no retry.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::state::{CycleState, FailureRecord};

/// Number of deterministic failures of one task before it is paused.
pub const PAUSE_THRESHOLD: u32 = 3;

/// Window of recent outcomes examined for flaky detection.
pub const FLAKY_WINDOW: usize = 5;

/// Alternation count within [`FLAKY_WINDOW`] that marks a task flaky.
pub const FLAKY_ALTERNATIONS: usize = 3;

/// Fixed failure taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureCategory {
    Transient,
    Deterministic,
    Environment,
    Flaky,
    Policy,
}

impl FailureCategory {
    /// Whether failures of this category count toward the pause threshold.
    #[must_use]
    pub fn counts_toward_pause(self) -> bool {
        matches!(self, FailureCategory::Deterministic)
    }

    /// Whether this category pauses the whole cycle immediately.
    #[must_use]
    pub fn pauses_immediately(self) -> bool {
        matches!(self, FailureCategory::Environment | FailureCategory::Policy)
    }
}

impl std::fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            FailureCategory::Transient => "TRANSIENT",
            FailureCategory::Deterministic => "DETERMINISTIC",
            FailureCategory::Environment => "ENVIRONMENT",
            FailureCategory::Flaky => "FLAKY",
            FailureCategory::Policy => "POLICY",
        };
        write!(f, "{name}")
    }
}

/// Signature tables, ordered from most to least specific.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "timeout",
    "timed out",
    "connection reset",
    "connection refused",
    "dns",
    "socket",
    "rate limit",
    "too many requests",
    "temporarily unavailable",
];

const ENVIRONMENT_SIGNATURES: &[&str] = &[
    "modulenotfounderror",
    "importerror",
    "no module named",
    "command not found",
    "not found in path",
    "no such file or directory",
];

const POLICY_SIGNATURES: &[&str] = &[
    "permission denied",
    "access denied",
    "operation not permitted",
    "outside the workspace",
];

const FLAKY_SIGNATURES: &[&str] = &["flaky", "intermittent"];

/// Classify an error message into the fixed taxonomy.
///
/// Unmatched messages default to `Deterministic`: an error we cannot
/// attribute to the environment is assumed to be a real task failure.
#[must_use]
pub fn classify_failure(error_msg: &str) -> FailureCategory {
    let msg = error_msg.to_lowercase();
    if TRANSIENT_SIGNATURES.iter().any(|s| msg.contains(s)) {
        return FailureCategory::Transient;
    }
    if ENVIRONMENT_SIGNATURES.iter().any(|s| msg.contains(s)) {
        return FailureCategory::Environment;
    }
    if POLICY_SIGNATURES.iter().any(|s| msg.contains(s)) {
        return FailureCategory::Policy;
    }
    if FLAKY_SIGNATURES.iter().any(|s| msg.contains(s)) {
        return FailureCategory::Flaky;
    }
    FailureCategory::Deterministic
}

/// Record a failure against a task id.
///
/// Only `Deterministic` failures increment the task's count. When the count
/// reaches [`PAUSE_THRESHOLD`], the task id is added to `paused_tasks`.
/// Adding the same task id twice is a no-op.
///
/// Returns `true` when this call pushed the task into the paused set (the
/// cycle should end PAUSED).
pub fn record_failure(
    state: &mut CycleState,
    task_id: &str,
    category: FailureCategory,
    error: &str,
) -> bool {
    if !category.counts_toward_pause() {
        return false;
    }

    let summary: String = error.chars().take(500).collect();
    let idx = match state.failure_log.iter().position(|r| r.task_id == task_id) {
        Some(idx) => idx,
        None => {
            state.failure_log.push(FailureRecord {
                task_id: task_id.to_string(),
                count: 0,
                last_category: category,
                last_error_summary: String::new(),
                last_seen_at: Utc::now(),
            });
            state.failure_log.len() - 1
        }
    };
    let entry = &mut state.failure_log[idx];

    entry.count += 1;
    entry.last_category = category;
    entry.last_error_summary = summary;
    entry.last_seen_at = Utc::now();

    if entry.count >= PAUSE_THRESHOLD && !state.paused_tasks.iter().any(|t| t == task_id) {
        state.paused_tasks.push(task_id.to_string());
        return true;
    }
    false
}

/// Append an outcome to a task's history and detect a flaky pattern.
///
/// A task is flaky when its recent outcomes (last [`FLAKY_WINDOW`]) contain
/// at least [`FLAKY_ALTERNATIONS`] success/failure flips. Flaky tasks are
/// paused with `FLAKY` recorded as their last category.
///
/// Returns `true` when this call paused the task.
pub fn record_outcome_and_detect_flaky(
    state: &mut CycleState,
    task_id: &str,
    success: bool,
) -> bool {
    let history = state
        .outcome_history
        .entry(task_id.to_string())
        .or_default();
    history.push(success);
    let start = history.len().saturating_sub(FLAKY_WINDOW);
    let window = &history[start..];

    let alternations = window.windows(2).filter(|w| w[0] != w[1]).count();
    if alternations < FLAKY_ALTERNATIONS {
        return false;
    }
    if state.paused_tasks.iter().any(|t| t == task_id) {
        return false;
    }

    state.paused_tasks.push(task_id.to_string());
    match state.failure_log.iter().position(|r| r.task_id == task_id) {
        Some(idx) => {
            let entry = &mut state.failure_log[idx];
            entry.last_category = FailureCategory::Flaky;
            entry.last_seen_at = Utc::now();
        }
        None => state.failure_log.push(FailureRecord {
            task_id: task_id.to_string(),
            count: 0,
            last_category: FailureCategory::Flaky,
            last_error_summary: "alternating outcomes".to_string(),
            last_seen_at: Utc::now(),
        }),
    }
    true
}
