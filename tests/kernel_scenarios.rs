//! End-to-end cycle scenarios over mocked external seams.
//!
//! These tests drive the real phase machine, state store, candidate
//! generator, selector, executor, and rollback paths; only the model
//! provider, checkers, and webhook transport are scripted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::TempDir;

use mend::executor::backup::{backup_targets, BackupSet};
use mend::executor::{apply_patch, PatchAction, PatchResult};
use mend::kernel::{Kernel, KernelConfig, OUTPUT_DIR_REL, EXIT_PAUSED, EXIT_SUCCESS};
use mend::scanner::{parse_pytest_output, ScanResults, ToolPaths};
use mend::state::{CycleState, StateStore};
use mend::testing::{MockLlmClient, MockScanner, MockVerifier, MockWebhookTransport};
use mend::{CycleStatus, Phase, VerifyOutcome};

const FAILING_TEST_CONTENT: &str = "def test_subtract():\n    assert 2 == 1\n";
const FIXED_TEST_CONTENT: &str = "def test_subtract():\n    assert 1 == 1\n";

fn tools() -> ToolPaths {
    ToolPaths {
        test_runner: vec!["true".to_string()],
        lint_runner: None,
    }
}

fn failing_scan() -> ScanResults {
    ScanResults {
        pytest: parse_pytest_output(
            "FAILED tests/test_math.py::test_subtract - assert 2 == 1\n1 failed in 0.04s",
            1,
        ),
        ..ScanResults::default()
    }
}

fn fix_patch_json() -> String {
    serde_json::json!({
        "actions": [{
            "kind": "modify_file",
            "path": "tests/test_math.py",
            "content": FIXED_TEST_CONTENT
        }],
        "summary": "correct the inverted assertion"
    })
    .to_string()
}

fn workspace_with_failing_test() -> TempDir {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("tests")).unwrap();
    std::fs::write(temp.path().join("tests/test_math.py"), FAILING_TEST_CONTENT).unwrap();
    std::fs::write(temp.path().join(".gitignore"), "_outputs/\n").unwrap();
    temp
}

fn git(dir: &Path, args: &[&str]) -> bool {
    std::process::Command::new("git")
        .args(args)
        .current_dir(dir)
        .env("GIT_AUTHOR_NAME", "mend-test")
        .env("GIT_AUTHOR_EMAIL", "mend@test.invalid")
        .env("GIT_COMMITTER_NAME", "mend-test")
        .env("GIT_COMMITTER_EMAIL", "mend@test.invalid")
        .output()
        .map(|out| out.status.success())
        .unwrap_or(false)
}

/// Initialize a committed git repo; false when git is unavailable.
fn try_git_init(dir: &Path) -> bool {
    if !git(dir, &["--version"]) {
        return false;
    }
    git(dir, &["init", "-q"])
        && git(dir, &["config", "user.email", "mend@test.invalid"])
        && git(dir, &["config", "user.name", "mend-test"])
        && git(dir, &["add", "-A"])
        && git(dir, &["commit", "-q", "-m", "init"])
}

fn load_state(workspace: &Path) -> CycleState {
    StateStore::new(workspace.join(OUTPUT_DIR_REL))
        .load()
        .expect("state loads")
        .expect("state exists")
}

// =============================================================================
// Scenario 1: fresh cycle, clean repo
// =============================================================================

#[tokio::test]
async fn scenario_clean_repo_completes_with_no_candidates() {
    let temp = TempDir::new().unwrap();
    let kernel = Kernel::new(KernelConfig::new(temp.path()))
        .with_tools(tools())
        .with_scanner(Arc::new(MockScanner::new()));

    let code = kernel.run_cycle(temp.path(), 1).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);

    let state = load_state(temp.path());
    assert_eq!(state.status, CycleStatus::Completed);
    assert!(state.candidates.is_empty());
    assert!(state.selected_task.is_none());
    assert_eq!(state.last_completed_phase, Some(Phase::Checkpoint));
    assert!(state.completed_at.is_some());
}

// =============================================================================
// Scenario 2: one failing test, fix succeeds
// =============================================================================

#[tokio::test]
async fn scenario_failing_test_fix_succeeds() {
    let temp = workspace_with_failing_test();
    if !try_git_init(temp.path()) {
        eprintln!("git unavailable; skipping");
        return;
    }

    let transport = Arc::new(MockWebhookTransport::new().with_status(200));
    let recorder = transport.recorder();
    let mut config = KernelConfig::new(temp.path());
    config.webhook_url = Some("http://example.invalid/hook".to_string());

    let kernel = Kernel::new(config)
        .with_tools(tools())
        .with_scanner(Arc::new(MockScanner::new().with_results(failing_scan())))
        .with_llm(Arc::new(MockLlmClient::new().with_response(fix_patch_json())))
        .with_verifier(Arc::new(MockVerifier::succeeding()))
        .with_webhook_transport(transport);

    let code = kernel.run_cycle(temp.path(), 1).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);

    let state = load_state(temp.path());
    assert_eq!(state.status, CycleStatus::Completed);
    assert!(!state.token_usage.is_zero(), "token usage must be recorded");
    assert!(state.rollback_context.is_none(), "cleared on verified success");

    let exec = state.execution_result.expect("execution result");
    assert!(exec.success);
    assert_eq!(exec.files_modified, 1);

    let verify = state.verification_result.expect("verification result");
    assert_eq!(verify.outcome, VerifyOutcome::Success);

    // The fix landed on disk.
    let content = std::fs::read_to_string(temp.path().join("tests/test_math.py")).unwrap();
    assert_eq!(content, FIXED_TEST_CONTENT);

    // Backup directory removed after the verified-success checkpoint.
    let backup_dir = temp
        .path()
        .join(OUTPUT_DIR_REL)
        .join(&state.date_str)
        .join(&state.cycle_id)
        .join("backup");
    assert!(!backup_dir.exists());

    // One webhook event delivered for the cycle end.
    assert_eq!(recorder.attempt_count(), 1);
}

// =============================================================================
// Scenario 3: one failing test, fix regresses
// =============================================================================

#[tokio::test]
async fn scenario_fix_regresses_and_rolls_back() {
    let temp = workspace_with_failing_test();
    if !try_git_init(temp.path()) {
        eprintln!("git unavailable; skipping");
        return;
    }

    let kernel = Kernel::new(KernelConfig::new(temp.path()))
        .with_tools(tools())
        .with_scanner(Arc::new(MockScanner::new().with_results(failing_scan())))
        .with_llm(Arc::new(MockLlmClient::new().with_response(fix_patch_json())))
        .with_verifier(Arc::new(MockVerifier::failing("assert 2 == 1")));

    let code = kernel.run_cycle(temp.path(), 1).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS, "one failure is below the pause threshold");

    let state = load_state(temp.path());
    assert_eq!(state.status, CycleStatus::Completed);

    // Original bytes restored.
    let content = std::fs::read_to_string(temp.path().join("tests/test_math.py")).unwrap();
    assert_eq!(content, FAILING_TEST_CONTENT);

    let verify = state.verification_result.as_ref().expect("verification");
    assert_eq!(verify.outcome, VerifyOutcome::Failure);
    assert!(verify.rolled_back);

    assert_eq!(state.failure_log.len(), 1);
    assert_eq!(state.failure_log[0].count, 1);
    assert!(state.paused_tasks.is_empty());
}

// =============================================================================
// Scenario 4: same failing test three cycles in a row
// =============================================================================

#[tokio::test]
async fn scenario_three_failures_pause_the_task() {
    let temp = workspace_with_failing_test();
    if !try_git_init(temp.path()) {
        eprintln!("git unavailable; skipping");
        return;
    }

    let kernel = Kernel::new(KernelConfig::new(temp.path()))
        .with_tools(tools())
        .with_scanner(Arc::new(MockScanner::new().with_results(failing_scan())))
        .with_llm(Arc::new(
            MockLlmClient::new().with_repeated_response(fix_patch_json()),
        ))
        .with_verifier(Arc::new(MockVerifier::failing("assert 2 == 1")));

    // Cycles 1 and 2: recorded failures, still COMPLETED.
    for cycle in 1u32..=2 {
        let code = kernel.run_cycle(temp.path(), 1).await.unwrap();
        assert_eq!(code, EXIT_SUCCESS, "cycle {cycle} must not pause yet");
        let state = load_state(temp.path());
        assert_eq!(state.status, CycleStatus::Completed);
        assert!(state.paused_tasks.is_empty());
        assert_eq!(state.failure_log[0].count, cycle);
    }

    // Cycle 3: threshold reached, task paused, exit 1.
    let code = kernel.run_cycle(temp.path(), 1).await.unwrap();
    assert_eq!(code, EXIT_PAUSED);
    let state = load_state(temp.path());
    assert_eq!(state.status, CycleStatus::Paused);
    assert_eq!(state.paused_tasks.len(), 1);
    assert_eq!(state.failure_log[0].count, 3);
    let paused_id = state.paused_tasks[0].clone();

    // Cycle 4 (fresh, carrying the paused set): the only candidate is
    // paused, so the cycle completes without selecting it.
    let code = kernel.run_cycle(temp.path(), 1).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);
    let state = load_state(temp.path());
    assert_eq!(state.status, CycleStatus::Completed);
    assert!(state.selected_task.is_none());
    assert!(state.paused_tasks.contains(&paused_id));
}

// =============================================================================
// Scenario 5: model proposes writing outside the workspace
// =============================================================================

#[tokio::test]
async fn scenario_escape_patch_fails_deterministically() {
    let temp = workspace_with_failing_test();
    if !try_git_init(temp.path()) {
        eprintln!("git unavailable; skipping");
        return;
    }

    let escape = serde_json::json!({
        "actions": [{
            "kind": "write_file",
            "path": "../elsewhere/x.py",
            "content": "evil"
        }],
        "summary": "escape attempt"
    })
    .to_string();

    let llm = Arc::new(MockLlmClient::new().with_repeated_response(escape));
    let kernel = Kernel::new(KernelConfig::new(temp.path()))
        .with_tools(tools())
        .with_scanner(Arc::new(MockScanner::new().with_results(failing_scan())))
        .with_llm(llm.clone())
        .with_verifier(Arc::new(MockVerifier::succeeding()));

    let code = kernel.run_cycle(temp.path(), 1).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);

    let state = load_state(temp.path());
    // Default model retries plus one strong-model escalation, all rejected.
    assert_eq!(state.llm_attempts, 4);
    let exec = state.execution_result.expect("execution result");
    assert!(!exec.success);
    assert!(exec.error.unwrap().contains("escapes"));

    // Verification skipped; failure recorded as deterministic.
    let verify = state.verification_result.expect("verification");
    assert_eq!(verify.outcome, VerifyOutcome::Skipped);
    assert_eq!(state.failure_log.len(), 1);

    // Nothing was applied, so the workspace is untouched.
    let content = std::fs::read_to_string(temp.path().join("tests/test_math.py")).unwrap();
    assert_eq!(content, FAILING_TEST_CONTENT);
    assert!(!temp.path().parent().unwrap().join("elsewhere").exists());
}

// =============================================================================
// Scenario 6: crash mid-EXECUTE, resume restores from backup
// =============================================================================

#[tokio::test]
async fn scenario_resume_after_crash_mid_execute() {
    let temp = workspace_with_failing_test();
    let workspace: PathBuf = temp.path().canonicalize().unwrap();
    let store = StateStore::new(workspace.join(OUTPUT_DIR_REL));

    // Build the pre-crash world: a patch was backed up and applied, the
    // rollback context was persisted, but VERIFY never ran.
    let patch = PatchResult {
        actions: vec![PatchAction::ModifyFile {
            path: "tests/test_math.py".to_string(),
            content: FIXED_TEST_CONTENT.to_string(),
        }],
        summary: "half-applied".to_string(),
    };

    let mut state = CycleState::new();
    let backup_dir = store
        .cycle_dir(&state.date_str, &state.cycle_id)
        .join("backup");
    let set = backup_targets(&patch, &workspace, &backup_dir).unwrap();
    apply_patch(&patch, &workspace).unwrap();

    let scan = failing_scan();
    let candidates = mend::generate_candidates(&scan);
    state.scan_results = Some(scan);
    state.selected_task = candidates.first().cloned();
    state.candidates = candidates;
    state.rollback_context = Some(set.to_context(store.dir()));
    state.begin_phase(Phase::Execute);
    state.complete_phase(Phase::Select);
    store.save(&state).unwrap();

    // Sanity: the crash left the patched content on disk.
    assert_eq!(
        std::fs::read_to_string(workspace.join("tests/test_math.py")).unwrap(),
        FIXED_TEST_CONTENT
    );

    // Resume in dry-run: BOOT must roll the workspace back to its
    // pre-cycle bytes before re-entering EXECUTE.
    let mut config = KernelConfig::new(&workspace);
    config.resume = true;
    config.dry_run = true;
    let kernel = Kernel::new(config)
        .with_tools(tools())
        .with_scanner(Arc::new(MockScanner::new().with_results(failing_scan())));

    let code = kernel.run_cycle(&workspace, 1).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);

    assert_eq!(
        std::fs::read_to_string(workspace.join("tests/test_math.py")).unwrap(),
        FAILING_TEST_CONTENT,
        "no file divergence from the pre-cycle state"
    );
    let state = load_state(&workspace);
    assert!(state.rollback_context.is_none());
    assert_eq!(state.status, CycleStatus::Completed);
}

// =============================================================================
// Environment blocker
// =============================================================================

#[tokio::test]
async fn scenario_environment_blocker_pauses_without_failure_log() {
    let temp = TempDir::new().unwrap();
    let scan = ScanResults {
        pytest: mend::PytestScan::unavailable("test runner not found: python3"),
        ..ScanResults::default()
    };

    let kernel = Kernel::new(KernelConfig::new(temp.path()))
        .with_tools(tools())
        .with_scanner(Arc::new(MockScanner::new().with_results(scan)));

    let code = kernel.run_cycle(temp.path(), 1).await.unwrap();
    assert_eq!(code, EXIT_PAUSED);

    let state = load_state(temp.path());
    assert_eq!(state.status, CycleStatus::Paused);
    assert!(
        state.failure_log.is_empty(),
        "environment blockers never charge a task"
    );
    assert!(state.paused_tasks.is_empty());
}

// =============================================================================
// Approve gate
// =============================================================================

#[tokio::test]
async fn scenario_approver_rejection_is_soft_failure() {
    let temp = workspace_with_failing_test();
    if !try_git_init(temp.path()) {
        eprintln!("git unavailable; skipping");
        return;
    }

    let mut config = KernelConfig::new(temp.path());
    config.approve = true;
    let kernel = Kernel::new(config)
        .with_tools(tools())
        .with_scanner(Arc::new(MockScanner::new().with_results(failing_scan())))
        .with_llm(Arc::new(MockLlmClient::new().with_response(fix_patch_json())))
        .with_verifier(Arc::new(MockVerifier::succeeding()))
        .with_approver(Box::new(|_patch| false));

    let code = kernel.run_cycle(temp.path(), 1).await.unwrap();
    assert_eq!(code, EXIT_SUCCESS);

    let state = load_state(temp.path());
    let exec = state.execution_result.clone().expect("execution result");
    assert!(!exec.success);
    assert_eq!(exec.error.as_deref(), Some("user_rejected"));

    // A soft failure is never charged against the task.
    assert!(state.failure_log.is_empty());

    // Nothing applied, nothing to verify, file untouched.
    let content = std::fs::read_to_string(temp.path().join("tests/test_math.py")).unwrap();
    assert_eq!(content, FAILING_TEST_CONTENT);
}

// =============================================================================
// BackupSet persistence sanity used by the crash scenario
// =============================================================================

#[tokio::test]
async fn backup_set_roundtrips_through_persisted_state() {
    let temp = workspace_with_failing_test();
    let workspace = temp.path().canonicalize().unwrap();
    let store = StateStore::new(workspace.join(OUTPUT_DIR_REL));

    let patch = PatchResult {
        actions: vec![PatchAction::ModifyFile {
            path: "tests/test_math.py".to_string(),
            content: FIXED_TEST_CONTENT.to_string(),
        }],
        summary: String::new(),
    };
    let state = CycleState::new();
    let backup_dir = store
        .cycle_dir(&state.date_str, &state.cycle_id)
        .join("backup");
    let set = backup_targets(&patch, &workspace, &backup_dir).unwrap();

    let context = set.to_context(store.dir());
    let rebuilt = BackupSet::from_context(&context, store.dir());
    assert_eq!(rebuilt, set);
}
