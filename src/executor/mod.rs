//! EXECUTE phase machinery.
//!
//! Given one candidate, the engine drives the model provider to produce a
//! structured patch, validates it against hard bounds, and hands the
//! driver everything it needs to back up, apply, and roll back. The
//! engine itself never mutates workspace files; apply and rollback are
//! explicit steps owned by the phase driver so the rollback context can be
//! persisted before the first byte changes on disk.

pub mod backup;
pub mod patch;

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::llm::{estimate_cost_usd, LlmClient};
use crate::process::run_command;
use crate::scanner::ScanResults;
use crate::sense::{Candidate, CandidateSource};
use crate::state::CycleState;

pub use backup::{apply_patch, backup_targets, discard_backups, rollback, BackupSet};
pub use patch::{
    compute_diff_lines, line_diff_count, parse_patch_json, path_within_workspace, validate_patch,
    PatchAction, PatchResult, MAX_DIFF_LINES, MAX_LLM_RETRIES, MAX_PATCH_FILES,
};

/// Base delay between model retries.
const LLM_RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Cap on the model retry delay.
const LLM_RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Maximum random jitter added to each retry delay.
const LLM_RETRY_JITTER: Duration = Duration::from_secs(1);

/// Characters of target-file content included in the prompt.
const PROMPT_TARGET_CONTENT_CAP: usize = 4000;

/// Characters of manifest content included in the prompt.
const PROMPT_MANIFEST_CAP: usize = 2000;

/// Entries of directory listing included in the prompt.
const PROMPT_TREE_CAP: usize = 50;

// =============================================================================
// Results
// =============================================================================

/// Outcome of the EXECUTE phase, persisted in cycle state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether EXECUTE ran at all (false in dry-run).
    pub attempted: bool,
    pub success: bool,
    #[serde(default)]
    pub dry_run: bool,
    #[serde(default)]
    pub skipped: bool,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub files_modified: usize,
    #[serde(default)]
    pub diff_lines: usize,
    #[serde(default)]
    pub patch_summary: String,
    #[serde(default)]
    pub git_available: bool,
    /// Workspace-relative paths the applied patch touched.
    #[serde(default)]
    pub modified_files: Vec<String>,
}

impl ExecutionResult {
    /// Synthetic result for `--dry-run`.
    #[must_use]
    pub fn dry_run() -> Self {
        Self {
            dry_run: true,
            skipped: true,
            ..Self::default()
        }
    }

    /// Soft failure: the approver rejected the patch.
    #[must_use]
    pub fn rejected_by_approver() -> Self {
        Self {
            attempted: true,
            success: false,
            error: Some("user_rejected".to_string()),
            ..Self::default()
        }
    }

    /// Hard failure with an error message.
    #[must_use]
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            attempted: true,
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Result of the pre-EXECUTE safety check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreflightOutcome {
    pub ok: bool,
    pub reason: String,
    pub git_available: bool,
}

impl PreflightOutcome {
    fn blocked(reason: &str, git_available: bool) -> Self {
        Self {
            ok: false,
            reason: reason.to_string(),
            git_available,
        }
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Drives patch generation for one candidate.
pub struct PatchEngine {
    workspace: PathBuf,
    llm: Arc<dyn LlmClient>,
    model: String,
    strong_model: String,
    retry_base_delay: Duration,
}

impl PatchEngine {
    #[must_use]
    pub fn new(
        workspace: impl Into<PathBuf>,
        llm: Arc<dyn LlmClient>,
        model: impl Into<String>,
        strong_model: impl Into<String>,
    ) -> Self {
        Self {
            workspace: workspace.into(),
            llm,
            model: model.into(),
            strong_model: strong_model.into(),
            retry_base_delay: LLM_RETRY_BASE_DELAY,
        }
    }

    /// Override the retry pacing (tests use zero).
    #[must_use]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    /// Pre-EXECUTE safety check.
    ///
    /// Refuses when the target path escapes the workspace, when the
    /// workspace has no version-control snapshot to fall back to, or when
    /// the working tree is already dirty.
    pub async fn preflight(&self, target_path: Option<&str>) -> PreflightOutcome {
        if let Some(target) = target_path {
            if !path_within_workspace(&self.workspace, target) {
                return PreflightOutcome::blocked("target_outside_workspace", false);
            }
        }

        let git = |args: &[&str]| {
            let mut argv = vec!["git".to_string()];
            argv.extend(args.iter().map(|s| (*s).to_string()));
            argv
        };

        let version_ok = matches!(
            run_command(&git(&["--version"]), &self.workspace, Duration::from_secs(5)).await,
            Ok(out) if out.success()
        );
        if !version_ok {
            return PreflightOutcome::blocked("no_version_control", false);
        }

        let in_tree = matches!(
            run_command(
                &git(&["rev-parse", "--is-inside-work-tree"]),
                &self.workspace,
                Duration::from_secs(5),
            )
            .await,
            Ok(out) if out.success()
        );
        if !in_tree {
            return PreflightOutcome::blocked("no_version_control", false);
        }

        match run_command(
            &git(&["status", "--porcelain"]),
            &self.workspace,
            Duration::from_secs(10),
        )
        .await
        {
            Ok(out) if out.success() => {
                if out.stdout.trim().is_empty() {
                    PreflightOutcome {
                        ok: true,
                        reason: String::new(),
                        git_available: true,
                    }
                } else {
                    PreflightOutcome::blocked("dirty_worktree", true)
                }
            }
            _ => PreflightOutcome::blocked("git_status_failed", true),
        }
    }

    /// Generate a validated patch for the candidate.
    ///
    /// Tries the default model up to [`MAX_LLM_RETRIES`] times with
    /// exponential backoff, then re-prompts once with the strong model.
    /// Every attempt is visible in `state.llm_attempts`; token usage
    /// accumulates in `state.token_usage`.
    pub async fn generate_patch(
        &self,
        task: &Candidate,
        scan: &ScanResults,
        state: &mut CycleState,
    ) -> Result<PatchResult, String> {
        let prompt = build_prompt(task, scan, &self.workspace);
        let mut last_error = String::new();

        for attempt in 1..=MAX_LLM_RETRIES {
            match self.attempt(&self.model, &prompt, task, state).await {
                Ok(patch) => return Ok(patch),
                Err(e) => {
                    warn!(
                        "patch generation failed (attempt {attempt}/{MAX_LLM_RETRIES}, model {}): {e}",
                        self.model
                    );
                    last_error = e;
                }
            }
            if attempt < MAX_LLM_RETRIES {
                tokio::time::sleep(self.retry_delay(attempt)).await;
            }
        }

        if self.strong_model != self.model {
            info!("escalating to strong model {}", self.strong_model);
            match self.attempt(&self.strong_model, &prompt, task, state).await {
                Ok(patch) => return Ok(patch),
                Err(e) => {
                    warn!("strong model {} also failed: {e}", self.strong_model);
                    last_error = e;
                }
            }
        }

        Err(format!("patch generation exhausted all retries: {last_error}"))
    }

    async fn attempt(
        &self,
        model: &str,
        prompt: &str,
        task: &Candidate,
        state: &mut CycleState,
    ) -> Result<PatchResult, String> {
        state.llm_attempts += 1;
        let response = self
            .llm
            .complete(model, prompt)
            .await
            .map_err(|e| e.to_string())?;

        let cost = estimate_cost_usd(model, response.prompt_tokens, response.output_tokens);
        state
            .token_usage
            .accumulate(response.prompt_tokens, response.output_tokens, cost);

        let patch = parse_patch_json(&response.content)?;
        validate_patch(&patch, &self.workspace, task.target_path.as_deref())?;
        Ok(patch)
    }

    fn retry_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let base = self
            .retry_base_delay
            .saturating_mul(2u32.saturating_pow(exponent));
        let capped = base.min(LLM_RETRY_MAX_DELAY);
        if self.retry_base_delay.is_zero() {
            return capped;
        }
        let jitter = rand::thread_rng().gen_range(0..=LLM_RETRY_JITTER.as_millis() as u64);
        capped + Duration::from_millis(jitter)
    }
}

// =============================================================================
// Prompt assembly
// =============================================================================

/// Manifest files surfaced to the model, first match wins.
const MANIFEST_FILES: &[&str] = &["requirements.txt", "pyproject.toml", "Cargo.toml"];

/// Directory names excluded from the prompt's tree listing.
const TREE_EXCLUDES: &[&str] = &[
    "__pycache__",
    "node_modules",
    "_outputs",
    "_logs",
    ".venv",
    "venv",
    "target",
];

fn truncated(text: &str, cap: usize) -> String {
    if text.len() <= cap {
        return text.to_string();
    }
    let mut out: String = text.chars().take(cap).collect();
    out.push_str("\n... (truncated)");
    out
}

/// Assemble the patch-generation prompt for one candidate.
///
/// Contains the candidate, scan excerpts, the current target-file
/// content, the project manifest, a shallow directory listing, and a hard
/// instruction to reference only the target file.
#[must_use]
pub fn build_prompt(task: &Candidate, scan: &ScanResults, workspace: &Path) -> String {
    let mut sections: Vec<String> = Vec::new();

    sections.push(
        "You are an automated repair agent for this repository. Produce a patch \
         for the task below as a single JSON object."
            .to_string(),
    );

    sections.push(format!(
        "## Task\ntitle: {}\nsource: {}\ndescription: {}",
        task.title, task.source, task.description
    ));

    let mut context = Vec::new();
    match task.source {
        CandidateSource::Pytest => {
            let pytest = &scan.pytest;
            if let Some(code) = pytest.exit_code {
                context.push(format!("test runner exit code: {code}"));
            }
            if !pytest.summary.is_empty() {
                context.push(format!("summary: {}", pytest.summary));
            }
            if !pytest.headline.is_empty() {
                context.push(format!("headline: {}", pytest.headline));
            }
            if !pytest.error_lines.is_empty() {
                context.push("error lines:".to_string());
                context.extend(pytest.error_lines.iter().take(10).map(|l| format!("  {l}")));
            }
            if !pytest.tail.is_empty() {
                context.push("tail (last 20 lines):".to_string());
                context.extend(pytest.tail.iter().map(|l| format!("  {l}")));
            }
        }
        CandidateSource::WorkflowLint => {
            context.push("lint findings:".to_string());
            context.extend(scan.lint.findings.iter().map(|f| format!("  {}", f.raw)));
        }
        CandidateSource::Hygiene => {
            context.push("hygiene findings:".to_string());
            context.extend(
                scan.hygiene
                    .findings
                    .iter()
                    .map(|f| format!("  {}:{}: {}", f.path, f.line, f.issue)),
            );
        }
    }
    sections.push(format!("## Scan context\n{}", context.join("\n")));

    if let Some(target) = &task.target_path {
        let target_file = workspace.join(target);
        if target_file.is_file() {
            if let Ok(content) = std::fs::read_to_string(&target_file) {
                sections.push(format!(
                    "## Current content of {target}\n{}",
                    truncated(&content, PROMPT_TARGET_CONTENT_CAP)
                ));
            }
        }
    }

    for manifest in MANIFEST_FILES {
        let path = workspace.join(manifest);
        if path.is_file() {
            if let Ok(content) = std::fs::read_to_string(&path) {
                sections.push(format!(
                    "## {manifest}\n{}",
                    truncated(&content, PROMPT_MANIFEST_CAP)
                ));
            }
            break;
        }
    }

    let tree = directory_listing(workspace);
    if !tree.is_empty() {
        sections.push(format!(
            "## Directory structure (depth <= 3)\n{}",
            tree.join("\n")
        ));
    }

    let target_constraint = match &task.target_path {
        Some(target) => format!(
            "- Only {target} (or a file in its directory) may be changed; every \
             other path will be rejected."
        ),
        None => "- All paths must stay inside the repository root.".to_string(),
    };
    sections.push(format!(
        "## Output format (strict)\nRespond with exactly one JSON object, no prose:\n\
         ```json\n{{\n  \"actions\": [\n    {{\"kind\": \"modify_file\", \"path\": \
         \"relative/path\", \"content\": \"entire new file content\"}}\n  ],\n  \
         \"summary\": \"one-line description of the change\"\n}}\n```\n\
         Allowed kinds: write_file (new file), modify_file (full replacement), \
         delete_file (path only).\n## Constraints\n\
         - At most {MAX_PATCH_FILES} files and {MAX_DIFF_LINES} changed lines.\n\
         - No paths outside the repository; no parent-directory segments.\n\
         {target_constraint}\n\
         - Keep the existing code style; the verification command must pass."
    ));

    sections.join("\n\n")
}

fn directory_listing(workspace: &Path) -> Vec<String> {
    let mut entries = Vec::new();
    let walker = WalkDir::new(workspace)
        .min_depth(1)
        .max_depth(3)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| {
            let name = e.file_name().to_string_lossy();
            !name.starts_with('.') && !TREE_EXCLUDES.contains(&name.as_ref())
        });
    for entry in walker.flatten() {
        if let Ok(rel) = entry.path().strip_prefix(workspace) {
            entries.push(rel.to_string_lossy().replace('\\', "/"));
            if entries.len() >= PROMPT_TREE_CAP {
                break;
            }
        }
    }
    entries
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::parse_pytest_output;
    use crate::sense::{Candidate, CandidateSource};
    use crate::testing::MockLlmClient;
    use tempfile::TempDir;

    fn candidate(target: &str) -> Candidate {
        Candidate {
            task_id: "pytest_tf_0000000000".to_string(),
            source: CandidateSource::Pytest,
            priority: 2,
            title: "Fix failing test".to_string(),
            description: "FAILED tests/test_a.py::test_x".to_string(),
            target_path: Some(target.to_string()),
            target_nodeid: Some(format!("{target}::test_x")),
            auto_fixable: true,
            blocked_reason: None,
        }
    }

    fn workspace() -> TempDir {
        let temp = TempDir::new().unwrap();
        std::fs::create_dir_all(temp.path().join("tests")).unwrap();
        std::fs::write(
            temp.path().join("tests/test_a.py"),
            "def test_x():\n    assert 1 == 2\n",
        )
        .unwrap();
        temp
    }

    fn scan() -> ScanResults {
        ScanResults {
            pytest: parse_pytest_output(
                "FAILED tests/test_a.py::test_x - assert 1 == 2\n1 failed in 0.1s",
                1,
            ),
            ..ScanResults::default()
        }
    }

    fn valid_patch_json() -> String {
        serde_json::json!({
            "actions": [{
                "kind": "modify_file",
                "path": "tests/test_a.py",
                "content": "def test_x():\n    assert 1 == 1\n"
            }],
            "summary": "fix the assertion"
        })
        .to_string()
    }

    #[test]
    fn test_prompt_contains_task_and_target_content() {
        let temp = workspace();
        let prompt = build_prompt(&candidate("tests/test_a.py"), &scan(), temp.path());
        assert!(prompt.contains("Fix failing test"));
        assert!(prompt.contains("assert 1 == 2"));
        assert!(prompt.contains("tests/test_a.py"));
        assert!(prompt.contains("Only tests/test_a.py"));
        assert!(prompt.contains("modify_file"));
    }

    #[tokio::test]
    async fn test_generate_patch_first_try() {
        let temp = workspace();
        let llm = Arc::new(MockLlmClient::new().with_response(valid_patch_json()));
        let engine = PatchEngine::new(temp.path(), llm.clone(), "sonnet", "opus")
            .with_retry_base_delay(Duration::ZERO);

        let mut state = CycleState::new();
        let patch = engine
            .generate_patch(&candidate("tests/test_a.py"), &scan(), &mut state)
            .await
            .expect("patch should validate");

        assert_eq!(patch.actions.len(), 1);
        assert_eq!(state.llm_attempts, 1);
        assert!(!state.token_usage.is_zero());
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_generate_patch_retries_then_succeeds() {
        let temp = workspace();
        let llm = Arc::new(
            MockLlmClient::new()
                .with_response("not json")
                .with_response(valid_patch_json()),
        );
        let engine = PatchEngine::new(temp.path(), llm.clone(), "sonnet", "opus")
            .with_retry_base_delay(Duration::ZERO);

        let mut state = CycleState::new();
        engine
            .generate_patch(&candidate("tests/test_a.py"), &scan(), &mut state)
            .await
            .expect("second attempt should succeed");
        assert_eq!(state.llm_attempts, 2);
    }

    #[tokio::test]
    async fn test_generate_patch_escalates_to_strong_model() {
        let temp = workspace();
        // Three bad default-model answers, then a good strong-model one.
        let llm = Arc::new(
            MockLlmClient::new()
                .with_response("garbage 1")
                .with_response("garbage 2")
                .with_response("garbage 3")
                .with_response(valid_patch_json()),
        );
        let engine = PatchEngine::new(temp.path(), llm.clone(), "sonnet", "opus")
            .with_retry_base_delay(Duration::ZERO);

        let mut state = CycleState::new();
        engine
            .generate_patch(&candidate("tests/test_a.py"), &scan(), &mut state)
            .await
            .expect("strong model should rescue");
        assert_eq!(state.llm_attempts, (MAX_LLM_RETRIES + 1) as u32);
        assert_eq!(llm.models_called().last().map(String::as_str), Some("opus"));
    }

    #[tokio::test]
    async fn test_generate_patch_escape_fails_deterministically() {
        let temp = workspace();
        let escape = serde_json::json!({
            "actions": [{
                "kind": "write_file",
                "path": "../elsewhere/x.py",
                "content": "evil"
            }],
            "summary": "escape"
        })
        .to_string();
        // Default and strong model both propose the same escape.
        let llm = Arc::new(MockLlmClient::new().with_repeated_response(escape));
        let engine = PatchEngine::new(temp.path(), llm.clone(), "sonnet", "opus")
            .with_retry_base_delay(Duration::ZERO);

        let mut state = CycleState::new();
        let err = engine
            .generate_patch(&candidate("tests/test_a.py"), &scan(), &mut state)
            .await
            .expect_err("escape must never validate");
        assert!(err.contains("escapes"));
        assert_eq!(state.llm_attempts, (MAX_LLM_RETRIES + 1) as u32);
        // Workspace untouched: rollback is a no-op because nothing applied.
        assert_eq!(
            std::fs::read_to_string(temp.path().join("tests/test_a.py")).unwrap(),
            "def test_x():\n    assert 1 == 2\n"
        );
    }

    #[tokio::test]
    async fn test_preflight_rejects_target_outside_workspace() {
        let temp = workspace();
        let llm = Arc::new(MockLlmClient::new());
        let engine = PatchEngine::new(temp.path(), llm, "sonnet", "opus");
        let outcome = engine.preflight(Some("../outside.py")).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.reason, "target_outside_workspace");
    }

    #[tokio::test]
    async fn test_preflight_requires_version_control() {
        let temp = workspace();
        let llm = Arc::new(MockLlmClient::new());
        let engine = PatchEngine::new(temp.path(), llm, "sonnet", "opus");
        // Plain temp dir: git may exist but this is not a work tree.
        let outcome = engine.preflight(Some("tests/test_a.py")).await;
        assert!(!outcome.ok);
        assert_eq!(outcome.reason, "no_version_control");
    }
}
