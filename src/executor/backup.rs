//! Copy-on-write backup, patch application, and rollback.
//!
//! Before EXECUTE mutates anything, every file the patch will overwrite or
//! delete is copied into the cycle's backup directory. The resulting
//! [`BackupSet`] round-trips through [`RollbackContext`] in persisted
//! state, so a crash between backup and apply can still be rolled back on
//! resume.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use super::patch::{PatchAction, PatchResult};
use crate::state::RollbackContext;

/// One patch's backup inventory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupSet {
    /// Absolute backup directory for this cycle.
    pub backup_dir: PathBuf,
    /// Workspace-relative path → backup copy. `None` means the patch
    /// created the file; rollback deletes it.
    pub entries: Vec<(String, Option<PathBuf>)>,
}

impl BackupSet {
    /// All workspace-relative paths the patch touches.
    #[must_use]
    pub fn modified_files(&self) -> Vec<String> {
        self.entries.iter().map(|(rel, _)| rel.clone()).collect()
    }

    /// Paths the patch created (no pre-existing content).
    #[must_use]
    pub fn created_files(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, bak)| bak.is_none())
            .map(|(rel, _)| rel.clone())
            .collect()
    }

    /// Serialize for persisted state. The backup directory is stored
    /// relative to the kernel output directory.
    #[must_use]
    pub fn to_context(&self, output_dir: &Path) -> RollbackContext {
        let backup_dir = self
            .backup_dir
            .strip_prefix(output_dir)
            .unwrap_or(&self.backup_dir)
            .to_string_lossy()
            .replace('\\', "/");
        RollbackContext {
            modified_files: self.modified_files(),
            backup_dir,
            created_files: self.created_files(),
        }
    }

    /// Rebuild from persisted state after a crash or resume.
    #[must_use]
    pub fn from_context(context: &RollbackContext, output_dir: &Path) -> Self {
        let backup_dir = output_dir.join(&context.backup_dir);
        let entries = context
            .modified_files
            .iter()
            .map(|rel| {
                if context.created_files.iter().any(|c| c == rel) {
                    (rel.clone(), None)
                } else {
                    let bak = backup_dir.join(rel);
                    (rel.clone(), bak.exists().then_some(bak))
                }
            })
            .collect();
        Self {
            backup_dir,
            entries,
        }
    }
}

/// Copy every file the patch will overwrite or delete into `backup_dir`.
pub fn backup_targets(
    patch: &PatchResult,
    workspace: &Path,
    backup_dir: &Path,
) -> std::io::Result<BackupSet> {
    fs::create_dir_all(backup_dir)?;
    let mut entries = Vec::new();
    let mut seen = std::collections::HashSet::new();

    for action in &patch.actions {
        let rel = action.path().to_string();
        if !seen.insert(rel.clone()) {
            continue;
        }
        let original = workspace.join(&rel);
        if original.is_file() {
            let bak = backup_dir.join(&rel);
            if let Some(parent) = bak.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(&original, &bak)?;
            entries.push((rel, Some(bak)));
        } else {
            entries.push((rel, None));
        }
    }

    Ok(BackupSet {
        backup_dir: backup_dir.to_path_buf(),
        entries,
    })
}

/// Apply the patch actions to the workspace.
///
/// Returns the absolute paths touched. Fails on the first action that
/// cannot be applied; the caller rolls back immediately.
pub fn apply_patch(patch: &PatchResult, workspace: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut touched = Vec::new();
    for action in &patch.actions {
        let target = workspace.join(action.path());
        match action {
            PatchAction::WriteFile { content, .. } | PatchAction::ModifyFile { content, .. } => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, content)?;
            }
            PatchAction::DeleteFile { .. } => {
                fs::remove_file(&target)?;
            }
        }
        touched.push(target);
    }
    Ok(touched)
}

/// Restore pre-EXECUTE bytes from a backup set.
///
/// Backed-up files are copied back; files the patch created are removed.
pub fn rollback(set: &BackupSet, workspace: &Path) -> std::io::Result<()> {
    for (rel, backup) in &set.entries {
        let target = workspace.join(rel);
        match backup {
            Some(bak) => {
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::copy(bak, &target)?;
            }
            None => {
                if target.exists() {
                    fs::remove_file(&target)?;
                }
            }
        }
    }
    info!("rolled back {} file(s)", set.entries.len());
    Ok(())
}

/// Remove a cycle's backup directory after a verified success.
pub fn discard_backups(set: &BackupSet) {
    if set.backup_dir.exists() {
        if let Err(e) = fs::remove_dir_all(&set.backup_dir) {
            warn!("could not remove backup directory: {e}");
        }
    }
}
