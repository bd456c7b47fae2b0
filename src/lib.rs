//! mend - autonomous code repair loop
//!
//! A self-improvement control loop that repeatedly scans a source
//! repository for quality regressions (failing tests, lint violations),
//! generates candidate remediation tasks, drives a language-model-backed
//! patch executor to attempt a single repair per cycle, verifies the
//! result, and records outcomes for learning.
//!
//! # Architecture
//!
//! One cycle visits eight phases in order:
//!
//! ```text
//! BOOT → SCAN → SENSE → SELECT → EXECUTE → VERIFY → LEARN → CHECKPOINT
//! ```
//!
//! The crate is organized into:
//!
//! - [`kernel`] - Phase driver, run modes, cancellation
//! - [`state`] - Crash-safe cycle state, atomic persistence, workspace lock
//! - [`scanner`] - External checker invocation and output parsing
//! - [`sense`] - Candidate generation and selection
//! - [`executor`] - Patch generation, validation, backup, apply, rollback
//! - [`llm`] - Model provider seam
//! - [`verifier`] - Narrow per-candidate verification
//! - [`classify`] - Failure taxonomy and pause accounting
//! - [`webhook`] - Cycle-event delivery with bounded retry
//! - [`report`] - Per-cycle report artifact
//! - [`testing`] - Mocks for the external seams
//!
//! # Example
//!
//! ```rust,ignore
//! use mend::kernel::{Kernel, KernelConfig};
//!
//! let config = KernelConfig::new("/path/to/workspace");
//! let kernel = Kernel::new(config);
//! let exit_code = kernel.run_once().await;
//! ```

pub mod classify;
pub mod error;
pub mod executor;
pub mod kernel;
pub mod llm;
pub mod phase;
pub mod process;
pub mod report;
pub mod scanner;
pub mod sense;
pub mod state;
pub mod testing;
pub mod verifier;
pub mod webhook;

// Re-export commonly used types
pub use error::{KernelError, Result};

pub use phase::{phase_completed, CycleStatus, Phase};

pub use state::{
    CycleState, FailureRecord, RollbackContext, StateStore, TokenUsage, WorkspaceLock,
    STATE_SCHEMA_VERSION,
};

pub use classify::{
    classify_failure, record_failure, record_outcome_and_detect_flaky, FailureCategory,
    PAUSE_THRESHOLD,
};

pub use scanner::{
    parse_pytest_output, parse_severity_filter, resolve_tools, HygieneScan, LintFinding, LintScan,
    LintSeverity, PytestScan, RepoScanner, ScanResults, ToolPaths, WorkspaceScanner,
};

pub use sense::{
    generate_candidates, select_task, stable_task_id, Candidate, CandidateSource,
    SelectionOutcome, SelectionSkipReason,
};

pub use executor::{
    line_diff_count, parse_patch_json, path_within_workspace, validate_patch, BackupSet,
    ExecutionResult, PatchAction, PatchEngine, PatchResult, MAX_DIFF_LINES, MAX_LLM_RETRIES,
    MAX_PATCH_FILES,
};

pub use llm::{ClaudeCliClient, LlmClient, LlmResponse};

pub use verifier::{CommandVerifier, TaskVerifier, VerificationResult, VerifyOutcome};

pub use webhook::{idempotency_key, WebhookEvent, WebhookNotifier, WebhookTransport};

pub use report::CycleReport;

pub use kernel::{
    CancelToken, Kernel, KernelConfig, EXIT_LOCK_BUSY, EXIT_PAUSED, EXIT_SUCCESS,
};

pub use testing::{MockLlmClient, MockScanner, MockVerifier, MockWebhookTransport};
