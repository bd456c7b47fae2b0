//! Cycle state: the single record owned by the phase driver.
//!
//! `CycleState` is created at BOOT, mutated through the phases, and
//! finalized at CHECKPOINT. The driver is its only writer; everything a
//! crashed cycle needs to resume safely (including the rollback context
//! for a half-applied patch) lives here and is persisted atomically after
//! every completed phase.

pub mod lock;
pub mod persistence;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::classify::FailureCategory;
use crate::executor::ExecutionResult;
use crate::phase::{CycleStatus, Phase};
use crate::scanner::{ScanResults, ToolPaths};
use crate::sense::Candidate;
use crate::verifier::VerificationResult;

pub use lock::{WorkspaceLock, LOCK_TTL};
pub use persistence::StateStore;

/// Current schema version for persisted cycle state.
/// Increment on breaking changes to the serialization format.
pub const STATE_SCHEMA_VERSION: u32 = 1;

// =============================================================================
// Value records
// =============================================================================

/// Accumulated model token consumption for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u64,
    pub output: u64,
    pub total: u64,
    pub estimated_cost_usd: f64,
}

impl TokenUsage {
    /// Fold one model call into the running totals.
    pub fn accumulate(&mut self, prompt: u64, output: u64, cost_usd: f64) {
        self.prompt += prompt;
        self.output += output;
        self.total += prompt + output;
        self.estimated_cost_usd = round6(self.estimated_cost_usd + cost_usd);
    }

    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.total == 0
    }
}

fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Per-task failure accounting feeding the pause threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub task_id: String,
    pub count: u32,
    pub last_category: FailureCategory,
    pub last_error_summary: String,
    pub last_seen_at: DateTime<Utc>,
}

/// Everything needed to return the workspace to its pre-EXECUTE bytes.
///
/// Owned by the executor until VERIFY completes; cleared on success.
/// Required for resume after a crash mid-EXECUTE.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RollbackContext {
    /// Workspace-relative paths the patch touched.
    pub modified_files: Vec<String>,
    /// Backup directory, relative to the kernel output directory.
    pub backup_dir: String,
    /// Files the patch created (no backup exists; rollback deletes them).
    pub created_files: Vec<String>,
}

// =============================================================================
// CycleState
// =============================================================================

/// Singleton per-workspace record of one cycle, persisted after every
/// completed phase.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleState {
    pub schema_version: u32,
    /// Timestamp-derived cycle identifier.
    pub cycle_id: String,
    /// Artifact directory name (`YYYYMMDD`).
    pub date_str: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Phase currently in progress.
    pub phase: Phase,
    /// Last phase that fully succeeded; resume re-enters the one after it.
    pub last_completed_phase: Option<Phase>,
    pub status: CycleStatus,
    /// Checker commands resolved at BOOT.
    #[serde(default)]
    pub tool_paths: Option<ToolPaths>,
    #[serde(default)]
    pub scan_results: Option<ScanResults>,
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub selected_task: Option<Candidate>,
    #[serde(default)]
    pub execution_result: Option<ExecutionResult>,
    #[serde(default)]
    pub verification_result: Option<VerificationResult>,
    #[serde(default)]
    pub failure_log: Vec<FailureRecord>,
    /// Task ids excluded from selection.
    #[serde(default)]
    pub paused_tasks: Vec<String>,
    /// Recent per-task outcomes, for flaky detection.
    #[serde(default)]
    pub outcome_history: HashMap<String, Vec<bool>>,
    #[serde(default)]
    pub token_usage: TokenUsage,
    #[serde(default)]
    pub rollback_context: Option<RollbackContext>,
    /// Model calls made this cycle; visible so resume sees the counter.
    #[serde(default)]
    pub llm_attempts: u32,
}

impl CycleState {
    /// Fresh state for a brand-new cycle.
    #[must_use]
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            cycle_id: now.format("%H%M%S").to_string(),
            date_str: now.format("%Y%m%d").to_string(),
            started_at: now,
            completed_at: None,
            phase: Phase::Boot,
            last_completed_phase: None,
            status: CycleStatus::Running,
            tool_paths: None,
            scan_results: None,
            candidates: Vec::new(),
            selected_task: None,
            execution_result: None,
            verification_result: None,
            failure_log: Vec::new(),
            paused_tasks: Vec::new(),
            outcome_history: HashMap::new(),
            token_usage: TokenUsage::default(),
            rollback_context: None,
            llm_attempts: 0,
        }
    }

    /// Fresh cycle that carries forward the learning of a prior one.
    ///
    /// The failure log, paused set, and outcome history identify tasks by
    /// stable id, so they survive across cycles; everything else resets.
    #[must_use]
    pub fn new_from_prior(prior: &CycleState) -> Self {
        let mut state = Self::new();
        state.failure_log = prior.failure_log.clone();
        state.paused_tasks = prior.paused_tasks.clone();
        state.outcome_history = prior.outcome_history.clone();
        state
    }

    /// Invariant: the last completed phase never runs ahead of the phase
    /// in progress.
    #[must_use]
    pub fn phase_monotonic(&self) -> bool {
        match self.last_completed_phase {
            None => true,
            Some(done) => done.at_or_before(self.phase),
        }
    }

    /// Enter a phase.
    pub fn begin_phase(&mut self, phase: Phase) {
        self.phase = phase;
    }

    /// Mark a phase as fully completed.
    pub fn complete_phase(&mut self, phase: Phase) {
        self.last_completed_phase = Some(phase);
    }

    /// Finalize the cycle with a terminal status.
    pub fn finalize(&mut self, status: CycleStatus) {
        self.status = status;
        self.completed_at = Some(Utc::now());
    }

    /// Whether a task id is currently paused.
    #[must_use]
    pub fn is_paused(&self, task_id: &str) -> bool {
        self.paused_tasks.iter().any(|t| t == task_id)
    }

    /// Failure count recorded for a task id.
    #[must_use]
    pub fn failure_count(&self, task_id: &str) -> u32 {
        self.failure_log
            .iter()
            .find(|r| r.task_id == task_id)
            .map(|r| r.count)
            .unwrap_or(0)
    }
}

impl Default for CycleState {
    fn default() -> Self {
        Self::new()
    }
}
