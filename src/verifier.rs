//! VERIFY phase: the minimal reproducible check for one candidate.
//!
//! The verification command is scoped as narrowly as the candidate
//! allows: a single test node id when the runner provided one, the target
//! file otherwise, the lint command for lint candidates, and an in-process
//! recheck for hygiene candidates.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tracing::warn;

use crate::process::run_command;
use crate::scanner::{hygiene, ToolPaths};
use crate::sense::{Candidate, CandidateSource};

/// Verification command timeout.
const VERIFY_TIMEOUT: Duration = Duration::from_secs(120);

/// Output kept for the report and failure classification.
const OUTPUT_TAIL_CHARS: usize = 2000;

/// Verification verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifyOutcome {
    /// Exit 0 and no residual finding for the candidate.
    Success,
    /// Exit 0 but related warnings remain.
    Partial,
    /// Finding still present or non-zero exit.
    Failure,
    /// VERIFY did not run (dry-run, failed EXECUTE).
    Skipped,
}

impl VerifyOutcome {
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            VerifyOutcome::Success => "SUCCESS",
            VerifyOutcome::Partial => "PARTIAL",
            VerifyOutcome::Failure => "FAILURE",
            VerifyOutcome::Skipped => "SKIPPED",
        }
    }
}

impl std::fmt::Display for VerifyOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Outcome of the VERIFY phase, persisted in cycle state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationResult {
    pub outcome: VerifyOutcome,
    pub exit_code: Option<i32>,
    pub output: String,
    pub command: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub rolled_back: bool,
    #[serde(default)]
    pub auto_committed: bool,
}

impl VerificationResult {
    /// A VERIFY that did not run, with the reason why.
    #[must_use]
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            outcome: VerifyOutcome::Skipped,
            exit_code: None,
            output: String::new(),
            command: String::new(),
            reason: Some(reason.into()),
            rolled_back: false,
            auto_committed: false,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcome == VerifyOutcome::Success
    }
}

/// Runs the narrow verification check for a candidate.
#[async_trait]
pub trait TaskVerifier: Send + Sync {
    async fn verify(&self, task: &Candidate) -> VerificationResult;
}

/// Production verifier running the resolved checker subprocesses.
#[derive(Debug, Clone)]
pub struct CommandVerifier {
    workspace: PathBuf,
    tools: ToolPaths,
}

impl CommandVerifier {
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>, tools: ToolPaths) -> Self {
        Self {
            workspace: workspace.into(),
            tools,
        }
    }

    /// The narrowest command that reproduces the candidate's finding.
    #[must_use]
    pub fn command_for(&self, task: &Candidate) -> Option<Vec<String>> {
        match task.source {
            CandidateSource::Pytest => {
                let mut argv = self.tools.test_runner.clone();
                if let Some(nodeid) = &task.target_nodeid {
                    argv.push(nodeid.clone());
                } else if let Some(path) = &task.target_path {
                    argv.push(path.clone());
                }
                Some(argv)
            }
            CandidateSource::WorkflowLint => self
                .tools
                .lint_runner
                .clone()
                .or_else(|| Some(self.tools.test_runner.clone())),
            // Hygiene is rechecked in-process.
            CandidateSource::Hygiene => None,
        }
    }

    fn verify_hygiene(&self, task: &Candidate) -> VerificationResult {
        let Some(target) = &task.target_path else {
            return VerificationResult::skipped("hygiene candidate without target");
        };
        let content = std::fs::read_to_string(self.workspace.join(target)).unwrap_or_default();
        let findings = hygiene::check_content(target, &content);
        let outcome = if findings.is_empty() {
            VerifyOutcome::Success
        } else {
            VerifyOutcome::Failure
        };
        VerificationResult {
            outcome,
            exit_code: Some(i32::from(!findings.is_empty())),
            output: findings
                .iter()
                .map(|f| format!("{}:{}: {}", f.path, f.line, f.issue))
                .collect::<Vec<_>>()
                .join("\n"),
            command: format!("hygiene-check {target}"),
            reason: None,
            rolled_back: false,
            auto_committed: false,
        }
    }
}

fn tail(text: &str, cap: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let start = chars.len().saturating_sub(cap);
    chars[start..].iter().collect()
}

#[async_trait]
impl TaskVerifier for CommandVerifier {
    async fn verify(&self, task: &Candidate) -> VerificationResult {
        if task.source == CandidateSource::Hygiene {
            return self.verify_hygiene(task);
        }
        let Some(argv) = self.command_for(task) else {
            return VerificationResult::skipped("no verification command");
        };
        let command = argv.join(" ");

        match run_command(&argv, &self.workspace, VERIFY_TIMEOUT).await {
            Ok(out) => {
                let combined = tail(&out.combined(), OUTPUT_TAIL_CHARS);
                let outcome = if out.success() {
                    // Exit 0 with residual warnings about the target is a
                    // partial success: keep the change, do not commit it.
                    let residual = task
                        .target_path
                        .as_deref()
                        .map(|t| {
                            combined.to_lowercase().contains("warning") && combined.contains(t)
                        })
                        .unwrap_or(false);
                    if residual {
                        VerifyOutcome::Partial
                    } else {
                        VerifyOutcome::Success
                    }
                } else {
                    VerifyOutcome::Failure
                };
                VerificationResult {
                    outcome,
                    exit_code: Some(out.exit_code),
                    output: combined,
                    command,
                    reason: None,
                    rolled_back: false,
                    auto_committed: false,
                }
            }
            Err(e) => {
                warn!("verification command failed to run: {e}");
                VerificationResult {
                    outcome: VerifyOutcome::Failure,
                    exit_code: Some(-1),
                    output: e.to_string(),
                    command,
                    reason: None,
                    rolled_back: false,
                    auto_committed: false,
                }
            }
        }
    }
}
