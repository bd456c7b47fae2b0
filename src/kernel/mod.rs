//! Phase driver and top-level run modes.
//!
//! One cycle walks the eight phases in order, persisting state after
//! every completed phase. The driver owns the `CycleState` record and is
//! the only writer of the state file; workspace files are mutated only
//! inside EXECUTE, under the workspace lock.
//!
//! Exit codes are fixed: `0` success, `1` paused or failed, `2` lock
//! contention at BOOT.

use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::classify::{
    classify_failure, record_failure, record_outcome_and_detect_flaky, FailureCategory,
};
use crate::error::{KernelError, Result};
use crate::executor::{
    apply_patch, backup_targets, compute_diff_lines, discard_backups, rollback, BackupSet,
    ExecutionResult, PatchEngine, PatchResult,
};
use crate::llm::{ClaudeCliClient, LlmClient, DEFAULT_MODEL, DEFAULT_STRONG_MODEL};
use crate::phase::{phase_completed, CycleStatus, Phase};
use crate::report::CycleReport;
use crate::scanner::{
    resolve_tools, LintSeverity, RepoScanner, ScanResults, ToolPaths, WorkspaceScanner,
};
use crate::sense::{annotate_candidates, generate_candidates, select_task, SelectionOutcome};
use crate::state::{CycleState, StateStore, WorkspaceLock};
use crate::verifier::{CommandVerifier, TaskVerifier, VerificationResult, VerifyOutcome};
use crate::webhook::{WebhookEvent, WebhookNotifier, WebhookTransport};

/// Clean cycle completion.
pub const EXIT_SUCCESS: i32 = 0;

/// Cycle ended PAUSED or FAILED.
pub const EXIT_PAUSED: i32 = 1;

/// Another process holds the workspace lock.
pub const EXIT_LOCK_BUSY: i32 = 2;

/// Kernel output directory, relative to the workspace root.
pub const OUTPUT_DIR_REL: &str = "_outputs/agi_kernel";

// =============================================================================
// Configuration
// =============================================================================

/// Runtime configuration assembled from the CLI.
#[derive(Debug, Clone)]
pub struct KernelConfig {
    pub workspace: PathBuf,
    pub resume: bool,
    pub dry_run: bool,
    pub auto_commit: bool,
    pub approve: bool,
    pub llm_model: String,
    pub llm_strong_model: String,
    pub webhook_url: Option<String>,
    pub lint_severity: Vec<LintSeverity>,
    /// Sleep between cycles in loop mode.
    pub interval: Duration,
}

impl KernelConfig {
    #[must_use]
    pub fn new(workspace: impl Into<PathBuf>) -> Self {
        Self {
            workspace: workspace.into(),
            resume: false,
            dry_run: false,
            auto_commit: false,
            approve: false,
            llm_model: std::env::var("MEND_LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string()),
            llm_strong_model: std::env::var("MEND_LLM_STRONG_MODEL")
                .unwrap_or_else(|_| DEFAULT_STRONG_MODEL.to_string()),
            webhook_url: None,
            lint_severity: vec![LintSeverity::Error],
            interval: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// Cancellation
// =============================================================================

/// Interrupt counter shared with the signal handler.
///
/// Level 1 means "finish the current cycle" in loop mode (and abort the
/// in-flight cycle in one-shot mode); level 2 aborts the in-flight cycle
/// with rollback.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    level: Arc<AtomicU32>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one interrupt.
    pub fn trip(&self) {
        self.level.fetch_add(1, Ordering::SeqCst);
    }

    #[must_use]
    pub fn level(&self) -> u32 {
        self.level.load(Ordering::SeqCst)
    }

    /// Spawn a background task feeding Ctrl-C into this token.
    pub fn install_ctrl_c_handler(&self) {
        let token = self.clone();
        tokio::spawn(async move {
            loop {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("interrupt received");
                token.trip();
            }
        });
    }
}

/// Adapter so one shared transport can back many notifier instances.
struct SharedTransport(Arc<dyn WebhookTransport>);

#[async_trait]
impl WebhookTransport for SharedTransport {
    async fn post(
        &self,
        url: &str,
        body: &serde_json::Value,
        idempotency_key: &str,
    ) -> crate::webhook::PostOutcome {
        self.0.post(url, body, idempotency_key).await
    }
}

// =============================================================================
// Kernel
// =============================================================================

type Approver = dyn Fn(&PatchResult) -> bool + Send + Sync;

/// The cycle orchestrator.
pub struct Kernel {
    config: KernelConfig,
    llm: Arc<dyn LlmClient>,
    scanner_override: Option<Arc<dyn RepoScanner>>,
    verifier_override: Option<Arc<dyn TaskVerifier>>,
    webhook_transport: Option<Arc<dyn WebhookTransport>>,
    tools_override: Option<ToolPaths>,
    approver: Option<Box<Approver>>,
    cancel: CancelToken,
}

impl Kernel {
    #[must_use]
    pub fn new(config: KernelConfig) -> Self {
        let llm = Arc::new(ClaudeCliClient::new(&config.workspace));
        Self {
            config,
            llm,
            scanner_override: None,
            verifier_override: None,
            webhook_transport: None,
            tools_override: None,
            approver: None,
            cancel: CancelToken::new(),
        }
    }

    /// Swap the model provider.
    #[must_use]
    pub fn with_llm(mut self, llm: Arc<dyn LlmClient>) -> Self {
        self.llm = llm;
        self
    }

    /// Swap the scanner (tests).
    #[must_use]
    pub fn with_scanner(mut self, scanner: Arc<dyn RepoScanner>) -> Self {
        self.scanner_override = Some(scanner);
        self
    }

    /// Swap the verifier (tests).
    #[must_use]
    pub fn with_verifier(mut self, verifier: Arc<dyn TaskVerifier>) -> Self {
        self.verifier_override = Some(verifier);
        self
    }

    /// Swap the webhook transport (tests).
    #[must_use]
    pub fn with_webhook_transport(mut self, transport: Arc<dyn WebhookTransport>) -> Self {
        self.webhook_transport = Some(transport);
        self
    }

    /// Skip BOOT tool resolution with a fixed tool set (tests).
    #[must_use]
    pub fn with_tools(mut self, tools: ToolPaths) -> Self {
        self.tools_override = Some(tools);
        self
    }

    /// Replace the stdin approve gate.
    #[must_use]
    pub fn with_approver(mut self, approver: Box<Approver>) -> Self {
        self.approver = Some(approver);
        self
    }

    /// Share a cancellation token with the signal handler.
    #[must_use]
    pub fn with_cancel_token(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    #[must_use]
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    // =========================================================================
    // Run modes
    // =========================================================================

    /// One cycle on the configured workspace.
    pub async fn run_once(&self) -> i32 {
        let workspace = self.config.workspace.clone();
        self.run_cycle_entry(&workspace, 1).await
    }

    /// Sequential cycles over several workspaces; a failure in one does
    /// not abort the others. Returns the worst per-workspace exit code.
    pub async fn run_workspaces(&self, workspaces: &[PathBuf]) -> i32 {
        let mut worst = EXIT_SUCCESS;
        for (idx, workspace) in workspaces.iter().enumerate() {
            if workspaces.len() > 1 {
                info!(
                    "workspace [{}/{}]: {}",
                    idx + 1,
                    workspaces.len(),
                    workspace.display()
                );
            }
            let code = self.run_cycle_entry(workspace, 1).await;
            worst = worst.max(code);
        }
        worst
    }

    /// Continuous cycles until cancelled; never overlaps cycles.
    ///
    /// A first interrupt finishes the in-flight cycle and stops; a second
    /// aborts the in-flight cycle with rollback.
    pub async fn run_loop(&self, workspaces: &[PathBuf]) -> i32 {
        info!(
            "loop mode: interval={}s, workspaces={}",
            self.config.interval.as_secs(),
            workspaces.len()
        );
        let mut cycle_count: u64 = 0;
        loop {
            cycle_count += 1;
            for workspace in workspaces {
                if self.cancel.level() >= 1 {
                    break;
                }
                info!("=== cycle #{cycle_count}: {} ===", workspace.display());
                let code = self.run_cycle_entry(workspace, 2).await;
                if code != EXIT_SUCCESS {
                    warn!("cycle #{cycle_count} ended with exit code {code}");
                    if workspaces.len() == 1 && code == EXIT_LOCK_BUSY {
                        return code;
                    }
                }
            }
            if self.cancel.level() >= 1 {
                info!("interrupt received; stopping after {cycle_count} cycle(s)");
                return EXIT_SUCCESS;
            }
            info!(
                "all workspaces done; next cycle in {}s",
                self.config.interval.as_secs()
            );
            self.sleep_interruptible(self.config.interval).await;
            if self.cancel.level() >= 1 {
                return EXIT_SUCCESS;
            }
        }
    }

    async fn sleep_interruptible(&self, duration: Duration) {
        let deadline = tokio::time::Instant::now() + duration;
        while tokio::time::Instant::now() < deadline && self.cancel.level() == 0 {
            let remaining = deadline - tokio::time::Instant::now();
            tokio::time::sleep(remaining.min(Duration::from_millis(250))).await;
        }
    }

    async fn run_cycle_entry(&self, workspace: &Path, abort_level: u32) -> i32 {
        match self.run_cycle(workspace, abort_level).await {
            Ok(code) => code,
            Err(e) => {
                error!("cycle aborted: {e}");
                e.exit_code()
            }
        }
    }

    // =========================================================================
    // One cycle
    // =========================================================================

    /// Run one full cycle on a workspace.
    pub async fn run_cycle(&self, workspace: &Path, abort_level: u32) -> Result<i32> {
        let workspace = workspace
            .canonicalize()
            .unwrap_or_else(|_| workspace.to_path_buf());
        let output_dir = workspace.join(OUTPUT_DIR_REL);
        let store = StateStore::new(&output_dir);

        let mut lock = WorkspaceLock::new(output_dir.join("lock"));
        if !lock.acquire()? {
            warn!("another kernel process is running on this workspace");
            return Ok(EXIT_LOCK_BUSY);
        }
        let result = self.cycle_inner(&workspace, &store, abort_level).await;
        lock.release();
        result
    }

    #[allow(clippy::too_many_lines)]
    async fn cycle_inner(
        &self,
        workspace: &Path,
        store: &StateStore,
        abort_level: u32,
    ) -> Result<i32> {
        // ── BOOT ──
        let prior = store.load()?;
        let mut resume_phase: Option<Phase> = None;
        let mut state = if self.config.resume {
            match prior {
                None => {
                    info!("[BOOT] no prior state found; starting a fresh cycle");
                    CycleState::new()
                }
                Some(prev) if prev.status == CycleStatus::Paused => {
                    warn!("[BOOT] prior cycle is PAUSED; reset it manually before resuming");
                    return Ok(EXIT_PAUSED);
                }
                Some(prev) if prev.status.is_terminal() => {
                    info!("[BOOT] prior cycle finished; starting a fresh cycle");
                    CycleState::new_from_prior(&prev)
                }
                Some(mut prev) => {
                    info!(
                        "[BOOT] resuming cycle {} (last completed phase: {:?})",
                        prev.cycle_id, prev.last_completed_phase
                    );
                    resume_phase = prev.last_completed_phase;
                    // The previous attempt crashed mid-phase; roll back any
                    // half-applied patch before re-entering it.
                    if prev.last_completed_phase != Some(prev.phase) {
                        if let Some(context) = prev.rollback_context.take() {
                            let set = BackupSet::from_context(&context, store.dir());
                            rollback(&set, workspace)?;
                            info!(
                                "[BOOT] restored {} file(s) from backup before re-entering {}",
                                set.entries.len(),
                                prev.phase
                            );
                        }
                    }
                    prev
                }
            }
        } else {
            match prior {
                Some(prev) => CycleState::new_from_prior(&prev),
                None => CycleState::new(),
            }
        };

        state.begin_phase(Phase::Boot);
        state.status = CycleStatus::Running;
        state.completed_at = None;

        // Tool resolution happens once, here; a missing tool is an
        // ENVIRONMENT error before any real work starts.
        let tools = match (&self.tools_override, &state.tool_paths, resume_phase) {
            (Some(tools), _, _) => tools.clone(),
            (None, Some(tools), Some(_)) => tools.clone(),
            _ => match resolve_tools(workspace) {
                Ok(tools) => tools,
                Err(e) => {
                    error!("[BOOT] {e}");
                    return self
                        .pause_cycle(&mut state, store, workspace, &format!("{e}"))
                        .await;
                }
            },
        };
        state.tool_paths = Some(tools.clone());

        info!("[BOOT] cycle started: cycle_id={}", state.cycle_id);
        state.complete_phase(Phase::Boot);
        store.save(&state)?;

        // ── SCAN ──
        if !phase_completed(resume_phase, Phase::Scan) {
            if let Some(code) = self
                .abort_if_cancelled(&mut state, store, workspace, abort_level)
                .await?
            {
                return Ok(code);
            }
            state.begin_phase(Phase::Scan);
            info!("[SCAN] scanning repository...");
            let scanner: Arc<dyn RepoScanner> = match &self.scanner_override {
                Some(scanner) => scanner.clone(),
                None => Arc::new(WorkspaceScanner::new(
                    workspace,
                    tools.clone(),
                    self.config.lint_severity.clone(),
                )),
            };
            let results = match scanner.scan().await {
                Ok(results) => results,
                Err(e) => {
                    return self
                        .fail_cycle(&mut state, store, workspace, &format!("scan failed: {e}"))
                        .await;
                }
            };

            // Environmental blockers skip SENSE entirely and never touch
            // the failure log.
            if let Some(blocker) = results.environment_blocker() {
                error!("[SCAN] environment blocker: {blocker}");
                state.scan_results = Some(results);
                return self.pause_cycle(&mut state, store, workspace, &blocker).await;
            }

            info!(
                "[SCAN] lint_errors={}, pytest_errors={}, pytest_failures={}, hygiene={}",
                results.lint_errors(),
                results.pytest_errors(),
                results.pytest_failures(),
                results.hygiene_findings()
            );
            state.scan_results = Some(results);
            state.complete_phase(Phase::Scan);
            store.save(&state)?;
        } else {
            info!("[SCAN] resume: already completed");
        }
        let scan = state.scan_results.clone().unwrap_or_default();

        // ── SENSE ──
        if !phase_completed(resume_phase, Phase::Sense) {
            state.begin_phase(Phase::Sense);
            let mut candidates = generate_candidates(&scan);
            annotate_candidates(&mut candidates, workspace);
            let blocked = candidates.iter().filter(|c| !c.auto_fixable).count();
            info!(
                "[SENSE] {} candidate(s), {} blocked, {} fixable",
                candidates.len(),
                blocked,
                candidates.len() - blocked
            );
            state.candidates = candidates;
            store.save_candidates(&state.candidates, &state.date_str, &state.cycle_id)?;
            state.complete_phase(Phase::Sense);
            store.save(&state)?;
        } else {
            info!("[SENSE] resume: already completed");
        }

        // ── SELECT ──
        if !phase_completed(resume_phase, Phase::Select) {
            state.begin_phase(Phase::Select);
            match select_task(&state.candidates, &state.paused_tasks) {
                SelectionOutcome::Selected(task) => {
                    info!("[SELECT] task selected: {} ({})", task.task_id, task.title);
                    state.selected_task = Some(task);
                    state.complete_phase(Phase::Select);
                    store.save(&state)?;
                }
                SelectionOutcome::Skipped(reason) => {
                    info!("[SELECT] no actionable task ({reason}); cycle complete");
                    state.selected_task = None;
                    return self
                        .checkpoint(
                            &mut state,
                            store,
                            workspace,
                            CycleStatus::Completed,
                            Vec::new(),
                            None,
                        )
                        .await;
                }
            }
        } else {
            info!("[SELECT] resume: already completed");
        }
        let Some(task) = state.selected_task.clone() else {
            return self
                .checkpoint(
                    &mut state,
                    store,
                    workspace,
                    CycleStatus::Completed,
                    Vec::new(),
                    None,
                )
                .await;
        };

        // ── EXECUTE ──
        if !phase_completed(resume_phase, Phase::Execute) {
            if let Some(code) = self
                .abort_if_cancelled(&mut state, store, workspace, abort_level)
                .await?
            {
                return Ok(code);
            }
            state.begin_phase(Phase::Execute);
            if self.config.dry_run {
                info!("[EXECUTE] dry-run mode: skipped");
                state.execution_result = Some(ExecutionResult::dry_run());
            } else {
                match self
                    .execute_phase(workspace, store, &task, &scan, &mut state)
                    .await
                {
                    Ok(result) => state.execution_result = Some(result),
                    Err(e) if e.is_environment() || e.is_policy() => {
                        error!("[EXECUTE] blocked: {e}");
                        if e.is_policy() && !state.is_paused(&task.task_id) {
                            state.paused_tasks.push(task.task_id.clone());
                        }
                        return self
                            .pause_cycle(&mut state, store, workspace, &e.to_string())
                            .await;
                    }
                    Err(e) => {
                        return self
                            .fail_cycle(&mut state, store, workspace, &e.to_string())
                            .await;
                    }
                }
            }
            state.complete_phase(Phase::Execute);
            store.save(&state)?;
        } else {
            info!("[EXECUTE] resume: already completed");
        }

        // ── VERIFY ──
        let mut verified_backup: Option<BackupSet> = None;
        if !phase_completed(resume_phase, Phase::Verify) {
            state.begin_phase(Phase::Verify);
            let exec = state.execution_result.clone().unwrap_or_default();
            let result = if self.config.dry_run {
                info!("[VERIFY] dry-run mode: skipped");
                VerificationResult::skipped("dry_run")
            } else if !exec.success {
                info!("[VERIFY] skipped: EXECUTE did not apply a patch");
                VerificationResult::skipped("execute_failed")
            } else {
                info!("[VERIFY] running verification command...");
                let verifier: Arc<dyn TaskVerifier> = match &self.verifier_override {
                    Some(verifier) => verifier.clone(),
                    None => Arc::new(CommandVerifier::new(workspace, tools.clone())),
                };
                let mut result = verifier.verify(&task).await;
                match result.outcome {
                    VerifyOutcome::Success => {
                        info!("[VERIFY] success (exit_code={:?})", result.exit_code);
                        verified_backup = state
                            .rollback_context
                            .take()
                            .map(|ctx| BackupSet::from_context(&ctx, store.dir()));
                        if self.config.auto_commit && exec.git_available {
                            result.auto_committed = self.auto_commit(workspace, &task).await;
                        }
                    }
                    VerifyOutcome::Failure => {
                        warn!("[VERIFY] failure (exit_code={:?})", result.exit_code);
                        if let Some(context) = state.rollback_context.take() {
                            let set = BackupSet::from_context(&context, store.dir());
                            rollback(&set, workspace)?;
                            result.rolled_back = true;
                            info!("[VERIFY] changes rolled back");
                        }
                    }
                    VerifyOutcome::Partial => {
                        warn!("[VERIFY] partial: exit 0 with residual warnings");
                    }
                    VerifyOutcome::Skipped => {}
                }
                result
            };
            state.verification_result = Some(result);
            state.complete_phase(Phase::Verify);
            store.save(&state)?;
        } else {
            info!("[VERIFY] resume: already completed");
        }

        // ── LEARN ──
        let mut paused_now = false;
        if !phase_completed(resume_phase, Phase::Learn) {
            state.begin_phase(Phase::Learn);
            let exec = state.execution_result.clone().unwrap_or_default();
            let verify = state.verification_result.clone();
            let verify_success = verify.as_ref().map(|v| v.is_success()).unwrap_or(false);

            if self.config.dry_run {
                info!("[LEARN] outcome=PARTIAL (dry_run)");
            } else if verify_success {
                info!("[LEARN] outcome=SUCCESS (fix verified)");
                paused_now |= record_outcome_and_detect_flaky(&mut state, &task.task_id, true);
            } else {
                let error_msg = if exec.success {
                    verify
                        .as_ref()
                        .map(|v| v.output.clone())
                        .unwrap_or_else(|| "verification failed".to_string())
                } else {
                    exec.error.clone().unwrap_or_else(|| "execute failed".to_string())
                };
                if error_msg == "user_rejected" {
                    // Approver rejection is a soft failure: not retried
                    // this cycle, never charged against the task.
                    info!("[LEARN] outcome=SKIPPED (approver rejected the patch)");
                    state.complete_phase(Phase::Learn);
                    store.save(&state)?;
                    return self
                        .checkpoint(
                            &mut state,
                            store,
                            workspace,
                            CycleStatus::Completed,
                            Vec::new(),
                            None,
                        )
                        .await;
                }
                let category = classify_failure(&error_msg);
                info!("[LEARN] outcome=FAILURE category={category}");
                match category {
                    FailureCategory::Transient => {
                        // Not recorded; the next cycle retries.
                    }
                    FailureCategory::Deterministic => {
                        paused_now |=
                            record_failure(&mut state, &task.task_id, category, &error_msg);
                        paused_now |=
                            record_outcome_and_detect_flaky(&mut state, &task.task_id, false);
                    }
                    FailureCategory::Environment => {
                        state.complete_phase(Phase::Learn);
                        return self
                            .pause_cycle(&mut state, store, workspace, &error_msg)
                            .await;
                    }
                    FailureCategory::Policy => {
                        if !state.is_paused(&task.task_id) {
                            state.paused_tasks.push(task.task_id.clone());
                        }
                        state.complete_phase(Phase::Learn);
                        return self
                            .pause_cycle(&mut state, store, workspace, &error_msg)
                            .await;
                    }
                    FailureCategory::Flaky => {
                        if !state.is_paused(&task.task_id) {
                            state.paused_tasks.push(task.task_id.clone());
                        }
                        paused_now = true;
                    }
                }
            }
            state.complete_phase(Phase::Learn);
            store.save(&state)?;
        } else {
            info!("[LEARN] resume: already completed");
            paused_now = state.is_paused(&task.task_id);
        }

        // ── CHECKPOINT ──
        let status = if paused_now {
            warn!(
                "[CHECKPOINT] task {} reached the pause threshold; cycle PAUSED",
                task.task_id
            );
            CycleStatus::Paused
        } else {
            CycleStatus::Completed
        };
        self.checkpoint(&mut state, store, workspace, status, Vec::new(), verified_backup)
            .await
    }

    // =========================================================================
    // EXECUTE internals
    // =========================================================================

    async fn execute_phase(
        &self,
        workspace: &Path,
        store: &StateStore,
        task: &crate::sense::Candidate,
        scan: &ScanResults,
        state: &mut CycleState,
    ) -> Result<ExecutionResult> {
        let engine = PatchEngine::new(
            workspace,
            self.llm.clone(),
            &self.config.llm_model,
            &self.config.llm_strong_model,
        );

        let preflight = engine.preflight(task.target_path.as_deref()).await;
        if !preflight.ok {
            return Err(match preflight.reason.as_str() {
                "target_outside_workspace" => KernelError::Policy {
                    detail: format!(
                        "target path escapes the workspace: {:?}",
                        task.target_path
                    ),
                },
                reason => KernelError::environment(format!("preflight blocked: {reason}")),
            });
        }

        info!("[EXECUTE] generating patch via model provider...");
        let patch = match engine.generate_patch(task, scan, state).await {
            Ok(patch) => patch,
            Err(e) => {
                warn!("[EXECUTE] {e}");
                return Ok(ExecutionResult::failed(e));
            }
        };
        info!(
            "[EXECUTE] patch generated: {} action(s): {}",
            patch.actions.len(),
            patch.summary
        );

        if self.config.approve && !self.approve_patch(&patch) {
            info!("[EXECUTE] approver rejected the patch");
            return Ok(ExecutionResult::rejected_by_approver());
        }

        // The diff must be measured against pre-apply contents.
        let diff_lines = compute_diff_lines(&patch, workspace);

        let backup_dir = store
            .cycle_dir(&state.date_str, &state.cycle_id)
            .join("backup");
        let set = backup_targets(&patch, workspace, &backup_dir)?;
        info!("[EXECUTE] backed up {} file(s)", set.entries.len());

        // Persist the rollback context before the first byte changes so a
        // crash mid-apply can be rolled back on resume.
        state.rollback_context = Some(set.to_context(store.dir()));
        store.save(state)?;

        match apply_patch(&patch, workspace) {
            Ok(paths) => {
                info!("[EXECUTE] patch applied: {} file(s)", paths.len());
                Ok(ExecutionResult {
                    attempted: true,
                    success: true,
                    dry_run: false,
                    skipped: false,
                    error: None,
                    files_modified: paths.len(),
                    diff_lines,
                    patch_summary: patch.summary.clone(),
                    git_available: preflight.git_available,
                    modified_files: set.modified_files(),
                })
            }
            Err(e) => {
                warn!("[EXECUTE] apply failed mid-way; rolling back: {e}");
                rollback(&set, workspace)?;
                state.rollback_context = None;
                store.save(state)?;
                Ok(ExecutionResult::failed(format!("patch apply failed: {e}")))
            }
        }
    }

    fn approve_patch(&self, patch: &PatchResult) -> bool {
        if let Some(approver) = &self.approver {
            return approver(patch);
        }
        eprintln!("{}", "=".repeat(60));
        eprintln!("[APPROVE] proposed patch:");
        for action in &patch.actions {
            eprintln!("  {}: {}", action.kind_name(), action.path());
        }
        eprintln!("  summary: {}", patch.summary);
        eprintln!("{}", "=".repeat(60));
        eprint!("[APPROVE] apply this patch? (y/n): ");
        let _ = std::io::stderr().flush();
        let mut answer = String::new();
        if std::io::stdin().read_line(&mut answer).is_err() {
            return false;
        }
        answer.trim().eq_ignore_ascii_case("y")
    }

    async fn auto_commit(&self, workspace: &Path, task: &crate::sense::Candidate) -> bool {
        let run = |args: Vec<String>| async move {
            crate::process::run_command(&args, workspace, Duration::from_secs(10)).await
        };
        let add = run(vec!["git".into(), "add".into(), "-A".into()]).await;
        if !matches!(add, Ok(ref out) if out.success()) {
            warn!("[VERIFY] auto-commit failed at git add");
            return false;
        }
        let commit = run(vec![
            "git".into(),
            "commit".into(),
            "-m".into(),
            format!("mend auto-fix: {}", task.task_id),
        ])
        .await;
        match commit {
            Ok(out) if out.success() => {
                info!("[VERIFY] auto-commit done");
                true
            }
            _ => {
                warn!("[VERIFY] auto-commit failed at git commit");
                false
            }
        }
    }

    // =========================================================================
    // Terminal transitions
    // =========================================================================

    async fn abort_if_cancelled(
        &self,
        state: &mut CycleState,
        store: &StateStore,
        workspace: &Path,
        abort_level: u32,
    ) -> Result<Option<i32>> {
        if self.cancel.level() < abort_level {
            return Ok(None);
        }
        warn!("cancellation requested; saving state for --resume");
        if let Some(context) = state.rollback_context.take() {
            let set = BackupSet::from_context(&context, store.dir());
            rollback(&set, workspace)?;
        }
        // Status stays RUNNING; last_completed_phase marks the true
        // boundary for the next --resume.
        store.save(state)?;
        Ok(Some(EXIT_PAUSED))
    }

    /// End the cycle PAUSED (environment blocker, policy violation, or
    /// pause threshold). Never touches the failure log.
    async fn pause_cycle(
        &self,
        state: &mut CycleState,
        store: &StateStore,
        workspace: &Path,
        reason: &str,
    ) -> Result<i32> {
        self.checkpoint(
            state,
            store,
            workspace,
            CycleStatus::Paused,
            vec![reason.to_string()],
            None,
        )
        .await
    }

    /// End the cycle FAILED. `last_completed_phase` is left at the
    /// boundary of the last phase that actually finished.
    async fn fail_cycle(
        &self,
        state: &mut CycleState,
        store: &StateStore,
        workspace: &Path,
        reason: &str,
    ) -> Result<i32> {
        error!("cycle failed: {reason}");
        state.begin_phase(Phase::Checkpoint);
        state.finalize(CycleStatus::Failed);
        store.save(state)?;
        let report = CycleReport::from_state(
            state,
            &workspace.display().to_string(),
            vec![reason.to_string()],
        );
        store.save_report(&report, &state.date_str, &state.cycle_id)?;
        self.send_webhook(state, workspace).await;
        Ok(EXIT_PAUSED)
    }

    async fn checkpoint(
        &self,
        state: &mut CycleState,
        store: &StateStore,
        workspace: &Path,
        status: CycleStatus,
        warnings: Vec<String>,
        verified_backup: Option<BackupSet>,
    ) -> Result<i32> {
        state.begin_phase(Phase::Checkpoint);
        state.complete_phase(Phase::Checkpoint);
        state.finalize(status);
        store.save(state)?;

        let report = CycleReport::from_state(state, &workspace.display().to_string(), warnings);
        store.save_report(&report, &state.date_str, &state.cycle_id)?;
        info!("[CHECKPOINT] state saved: {}", store.state_path().display());

        // The backup directory outlives VERIFY only until the success is
        // checkpointed.
        if let Some(set) = verified_backup {
            discard_backups(&set);
        }

        self.send_webhook(state, workspace).await;

        Ok(match status {
            CycleStatus::Paused | CycleStatus::Failed => EXIT_PAUSED,
            _ => EXIT_SUCCESS,
        })
    }

    async fn send_webhook(&self, state: &CycleState, workspace: &Path) {
        let Some(url) = &self.config.webhook_url else {
            return;
        };
        let event_name = match state.status {
            CycleStatus::Paused => "cycle_paused",
            CycleStatus::Failed => "cycle_failed",
            _ => "cycle_completed",
        };
        let summary = format!(
            "mend cycle {}: status={} tokens={}",
            state.cycle_id,
            state.status,
            state.token_usage.total
        );
        let event = WebhookEvent::new(
            &state.cycle_id,
            event_name,
            state.status.name(),
            &workspace.display().to_string(),
            summary,
        );
        let mut notifier = WebhookNotifier::new(url.clone());
        if let Some(transport) = &self.webhook_transport {
            notifier = notifier.with_transport(Box::new(SharedTransport(transport.clone())));
        }
        let delivery = notifier.notify(&event).await;
        if !delivery.delivered {
            // Delivery failures never affect cycle status.
            warn!(
                "webhook delivery failed after {} attempt(s)",
                delivery.attempts
            );
        }
    }
}
