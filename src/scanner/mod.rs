//! Repository scanning.
//!
//! Invokes a fixed, short list of external checkers (the workspace lint
//! script and the test runner) plus a built-in hygiene sweep, and returns
//! structured findings. Checker binaries are resolved once at BOOT and
//! cached in cycle state; a missing test runner is an environmental
//! blocker, not a task failure.

pub mod hygiene;
pub mod lint;
pub mod pytest;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{KernelError, Result};
use crate::process::run_command;

pub use hygiene::{HygieneFinding, HygieneScan};
pub use lint::{parse_lint_output, parse_severity_filter, LintFinding, LintScan, LintSeverity};
pub use pytest::{parse_pytest_output, strip_ansi, ErrorBlock, FailureNode, PytestScan};

/// Env var overriding the test-runner command line (whitespace separated).
pub const TEST_RUNNER_ENV: &str = "MEND_TEST_RUNNER";

/// Env var overriding the lint command line (whitespace separated).
pub const LINT_CMD_ENV: &str = "MEND_LINT_CMD";

/// Default test-runner invocation.
pub const DEFAULT_TEST_RUNNER: &[&str] =
    &["python3", "-m", "pytest", "-q", "--tb=short", "--color=no"];

/// Lint script location inside a workspace.
pub const LINT_SCRIPT_REL: &str = "tools/workflow_lint.py";

const LINT_TIMEOUT: Duration = Duration::from_secs(60);
const TEST_TIMEOUT: Duration = Duration::from_secs(120);

// =============================================================================
// Tool resolution
// =============================================================================

/// Checker command lines resolved at BOOT and cached in cycle state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolPaths {
    /// Test-runner argv; the program must exist at BOOT.
    pub test_runner: Vec<String>,
    /// Lint argv, or `None` when the workspace has no lint checker.
    pub lint_runner: Option<Vec<String>>,
}

fn argv_from_env(var: &str) -> Option<Vec<String>> {
    let raw = std::env::var(var).ok()?;
    let argv: Vec<String> = raw.split_whitespace().map(str::to_string).collect();
    if argv.is_empty() {
        None
    } else {
        Some(argv)
    }
}

fn program_exists(program: &str) -> bool {
    if program.contains('/') || program.contains('\\') {
        return Path::new(program).is_file();
    }
    let Some(paths) = std::env::var_os("PATH") else {
        return false;
    };
    std::env::split_paths(&paths).any(|dir| dir.join(program).is_file())
}

/// Resolve checker commands for a workspace.
///
/// Resolution happens once, at BOOT, so a broken environment surfaces
/// before any real work starts.
///
/// # Errors
///
/// Returns [`KernelError::MissingTool`] when a configured program cannot
/// be found.
pub fn resolve_tools(workspace: &Path) -> Result<ToolPaths> {
    let test_runner = argv_from_env(TEST_RUNNER_ENV)
        .unwrap_or_else(|| DEFAULT_TEST_RUNNER.iter().map(|s| (*s).to_string()).collect());
    if !program_exists(&test_runner[0]) {
        return Err(KernelError::MissingTool {
            tool: test_runner[0].clone(),
        });
    }

    let lint_runner = match argv_from_env(LINT_CMD_ENV) {
        Some(argv) => {
            if !program_exists(&argv[0]) {
                return Err(KernelError::MissingTool {
                    tool: argv[0].clone(),
                });
            }
            Some(argv)
        }
        None => {
            let script = workspace.join(LINT_SCRIPT_REL);
            script.is_file().then(|| {
                vec![
                    "python3".to_string(),
                    script.to_string_lossy().into_owned(),
                ]
            })
        }
    };

    debug!(?test_runner, ?lint_runner, "resolved checker tools");
    Ok(ToolPaths {
        test_runner,
        lint_runner,
    })
}

// =============================================================================
// Scan results
// =============================================================================

/// Structured findings from one SCAN phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanResults {
    pub lint: LintScan,
    pub pytest: PytestScan,
    pub hygiene: HygieneScan,
}

impl ScanResults {
    /// Environmental blocker, if any checker reported one.
    ///
    /// Blockers skip SENSE and pause the cycle without touching the
    /// failure log.
    #[must_use]
    pub fn environment_blocker(&self) -> Option<String> {
        self.pytest.env_blocker.clone()
    }

    #[must_use]
    pub fn lint_errors(&self) -> usize {
        self.lint.finding_count()
    }

    #[must_use]
    pub fn pytest_failures(&self) -> usize {
        self.pytest.failures
    }

    #[must_use]
    pub fn pytest_errors(&self) -> usize {
        self.pytest.errors_count
    }

    #[must_use]
    pub fn hygiene_findings(&self) -> usize {
        self.hygiene.finding_count()
    }

    #[must_use]
    pub fn total_issues(&self) -> usize {
        self.lint_errors() + self.pytest_failures() + self.pytest_errors() + self.hygiene_findings()
    }
}

// =============================================================================
// Scanner
// =============================================================================

/// Produces [`ScanResults`] for a workspace.
#[async_trait]
pub trait RepoScanner: Send + Sync {
    async fn scan(&self) -> Result<ScanResults>;
}

/// Production scanner running the resolved checker subprocesses.
#[derive(Debug, Clone)]
pub struct WorkspaceScanner {
    workspace: PathBuf,
    tools: ToolPaths,
    severity_filter: Vec<LintSeverity>,
}

impl WorkspaceScanner {
    #[must_use]
    pub fn new(
        workspace: impl Into<PathBuf>,
        tools: ToolPaths,
        severity_filter: Vec<LintSeverity>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            tools,
            severity_filter,
        }
    }

    async fn run_lint(&self) -> LintScan {
        let Some(argv) = &self.tools.lint_runner else {
            return LintScan::unavailable();
        };
        match run_command(argv, &self.workspace, LINT_TIMEOUT).await {
            Ok(out) => LintScan {
                available: true,
                exit_code: Some(out.exit_code),
                findings: lint::parse_lint_output(&out.stdout, &self.severity_filter),
                error: None,
            },
            Err(e) => {
                warn!("lint checker failed to run: {e}");
                LintScan {
                    available: true,
                    exit_code: None,
                    findings: Vec::new(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    async fn run_tests(&self) -> PytestScan {
        match run_command(&self.tools.test_runner, &self.workspace, TEST_TIMEOUT).await {
            Ok(out) => parse_pytest_output(&out.combined(), out.exit_code),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                PytestScan::unavailable(format!(
                    "test runner not found: {}",
                    self.tools.test_runner[0]
                ))
            }
            Err(e) => {
                warn!("test runner failed to run: {e}");
                PytestScan {
                    available: true,
                    error: Some(e.to_string()),
                    ..PytestScan::default()
                }
            }
        }
    }
}

#[async_trait]
impl RepoScanner for WorkspaceScanner {
    async fn scan(&self) -> Result<ScanResults> {
        let lint = self.run_lint().await;
        let pytest = self.run_tests().await;
        let hygiene = hygiene::scan_workspace(&self.workspace);
        Ok(ScanResults {
            lint,
            pytest,
            hygiene,
        })
    }
}
