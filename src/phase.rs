//! Phase machine definitions.
//!
//! One cycle visits eight phases in a fixed order:
//!
//! ```text
//! BOOT → SCAN → SENSE → SELECT → EXECUTE → VERIFY → LEARN → CHECKPOINT
//! ```
//!
//! The driver persists both the phase currently in progress and the last
//! phase that fully completed; the gap between the two is how a crashed
//! cycle is detected on resume.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The eight phases of one kernel cycle, in execution order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    #[default]
    Boot,
    Scan,
    Sense,
    Select,
    Execute,
    Verify,
    Learn,
    Checkpoint,
}

impl Phase {
    /// All phases in execution order.
    pub const ORDER: [Phase; 8] = [
        Phase::Boot,
        Phase::Scan,
        Phase::Sense,
        Phase::Select,
        Phase::Execute,
        Phase::Verify,
        Phase::Learn,
        Phase::Checkpoint,
    ];

    /// Position of this phase in the execution order.
    #[must_use]
    pub fn index(self) -> usize {
        Self::ORDER.iter().position(|p| *p == self).unwrap_or(0)
    }

    /// Phase name as persisted in state files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Phase::Boot => "BOOT",
            Phase::Scan => "SCAN",
            Phase::Sense => "SENSE",
            Phase::Select => "SELECT",
            Phase::Execute => "EXECUTE",
            Phase::Verify => "VERIFY",
            Phase::Learn => "LEARN",
            Phase::Checkpoint => "CHECKPOINT",
        }
    }

    /// Whether `self` is at or before `other` in the execution order.
    #[must_use]
    pub fn at_or_before(self, other: Phase) -> bool {
        self.index() <= other.index()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Check whether a phase was already completed by a prior run.
///
/// Used by `--resume`: phases at or before the last completed phase are
/// skipped; the phase after it is re-entered from scratch.
#[must_use]
pub fn phase_completed(last_completed: Option<Phase>, target: Phase) -> bool {
    match last_completed {
        Some(done) => target.index() <= done.index(),
        None => false,
    }
}

/// Terminal and in-flight status of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CycleStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Paused,
}

impl CycleStatus {
    /// Whether this status marks the end of a cycle.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, CycleStatus::Running)
    }

    /// Status name as persisted in state files.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            CycleStatus::Running => "RUNNING",
            CycleStatus::Completed => "COMPLETED",
            CycleStatus::Failed => "FAILED",
            CycleStatus::Paused => "PAUSED",
        }
    }
}

impl fmt::Display for CycleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
