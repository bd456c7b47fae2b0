//! Human-readable cycle report (`report.json`).
//!
//! Written at CHECKPOINT for every terminal state, success or not, next
//! to the cycle's other artifacts.

use serde::{Deserialize, Serialize};

use crate::phase::CycleStatus;
use crate::sense::blocked_candidates;
use crate::state::{CycleState, TokenUsage};
use crate::verifier::VerifyOutcome;

/// Scan counters summarized for the report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub lint_errors: usize,
    pub pytest_errors: usize,
    pub pytest_failures: usize,
    pub hygiene_findings: usize,
}

/// Candidate counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSummary {
    pub total: usize,
    pub blocked: usize,
    /// Task id of the selected candidate, if any.
    pub selected: Option<String>,
}

/// EXECUTE counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub attempted: bool,
    pub applied: bool,
    pub files_changed: usize,
}

/// VERIFY verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationSummary {
    pub outcome: String,
}

/// Pause details, present only when the cycle ended PAUSED on a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PauseSummary {
    pub task_id: Option<String>,
    pub count: Option<u32>,
}

/// The per-cycle report artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub cycle_id: String,
    pub status: CycleStatus,
    pub started_at: String,
    pub completed_at: Option<String>,
    pub workspace: String,
    pub scan_summary: ScanSummary,
    pub candidates: CandidateSummary,
    pub execution: ExecutionSummary,
    pub verification: VerificationSummary,
    pub token_usage: TokenUsage,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pause: Option<PauseSummary>,
    pub warnings: Vec<String>,
}

impl CycleReport {
    /// Build the report from finalized cycle state.
    #[must_use]
    pub fn from_state(state: &CycleState, workspace: &str, warnings: Vec<String>) -> Self {
        let scan_summary = match &state.scan_results {
            Some(scan) => ScanSummary {
                lint_errors: scan.lint_errors(),
                pytest_errors: scan.pytest_errors(),
                pytest_failures: scan.pytest_failures(),
                hygiene_findings: scan.hygiene_findings(),
            },
            None => ScanSummary::default(),
        };

        let candidates = CandidateSummary {
            total: state.candidates.len(),
            blocked: blocked_candidates(&state.candidates).len(),
            selected: state.selected_task.as_ref().map(|c| c.task_id.clone()),
        };

        let execution = match &state.execution_result {
            Some(exec) => ExecutionSummary {
                attempted: exec.attempted,
                applied: exec.success,
                files_changed: exec.files_modified,
            },
            None => ExecutionSummary::default(),
        };

        let verification = VerificationSummary {
            outcome: state
                .verification_result
                .as_ref()
                .map(|v| v.outcome.name().to_string())
                .unwrap_or_else(|| VerifyOutcome::Skipped.name().to_string()),
        };

        let pause = if state.status == CycleStatus::Paused {
            let task_id = state.selected_task.as_ref().map(|c| c.task_id.clone());
            let count = task_id.as_deref().map(|id| state.failure_count(id));
            Some(PauseSummary { task_id, count })
        } else {
            None
        };

        Self {
            cycle_id: state.cycle_id.clone(),
            status: state.status,
            started_at: state.started_at.to_rfc3339(),
            completed_at: state.completed_at.map(|t| t.to_rfc3339()),
            workspace: workspace.to_string(),
            scan_summary,
            candidates,
            execution,
            verification,
            token_usage: state.token_usage,
            pause,
            warnings,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ExecutionResult;
    use crate::phase::CycleStatus;
    use crate::scanner::{parse_pytest_output, ScanResults};
    use crate::sense::{Candidate, CandidateSource};

    fn candidate(task_id: &str, fixable: bool) -> Candidate {
        Candidate {
            task_id: task_id.to_string(),
            source: CandidateSource::Pytest,
            priority: 2,
            title: String::new(),
            description: String::new(),
            target_path: fixable.then(|| "tests/test_a.py".to_string()),
            target_nodeid: None,
            auto_fixable: fixable,
            blocked_reason: (!fixable).then(|| "no_target_path".to_string()),
        }
    }

    #[test]
    fn test_report_from_completed_state() {
        let mut state = CycleState::new();
        state.scan_results = Some(ScanResults {
            pytest: parse_pytest_output("1 failed in 0.1s\nFAILED t.py::test_a - x", 1),
            ..ScanResults::default()
        });
        state.candidates = vec![candidate("a", true), candidate("b", false)];
        state.selected_task = Some(candidate("a", true));
        state.execution_result = Some(ExecutionResult {
            attempted: true,
            success: true,
            files_modified: 1,
            ..ExecutionResult::default()
        });
        state.finalize(CycleStatus::Completed);

        let report = CycleReport::from_state(&state, "/ws", vec![]);
        assert_eq!(report.status, CycleStatus::Completed);
        assert_eq!(report.scan_summary.pytest_failures, 1);
        assert_eq!(report.candidates.total, 2);
        assert_eq!(report.candidates.blocked, 1);
        assert_eq!(report.candidates.selected.as_deref(), Some("a"));
        assert!(report.execution.attempted);
        assert_eq!(report.execution.files_changed, 1);
        assert!(report.pause.is_none());
        assert!(report.completed_at.is_some());
    }

    #[test]
    fn test_report_pause_section() {
        let mut state = CycleState::new();
        state.selected_task = Some(candidate("task_x", true));
        for _ in 0..3 {
            crate::classify::record_failure(
                &mut state,
                "task_x",
                crate::classify::FailureCategory::Deterministic,
                "boom",
            );
        }
        state.finalize(CycleStatus::Paused);

        let report = CycleReport::from_state(&state, "/ws", vec![]);
        let pause = report.pause.expect("pause section");
        assert_eq!(pause.task_id.as_deref(), Some("task_x"));
        assert_eq!(pause.count, Some(3));
    }

    #[test]
    fn test_report_serializes_to_json() {
        let mut state = CycleState::new();
        state.finalize(CycleStatus::Completed);
        let report = CycleReport::from_state(&state, "/ws", vec!["webhook delivery failed".into()]);
        let json = serde_json::to_string_pretty(&report).unwrap();
        assert!(json.contains("\"status\": \"COMPLETED\""));
        assert!(json.contains("webhook delivery failed"));
        assert!(!json.contains("\"pause\""));
    }
}
