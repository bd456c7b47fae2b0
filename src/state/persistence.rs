//! Atomic persistence for cycle state and per-cycle artifacts.
//!
//! `save` never leaves a torn `state.json`: the new state is written to a
//! temporary sibling, flushed and fsynced, the previous state is copied to
//! `state.json.bak`, and the temporary is renamed over the target. `load`
//! prefers the target and falls back to the `.bak` when the target is
//! corrupt or missing.

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::{CycleState, STATE_SCHEMA_VERSION};
use crate::error::{KernelError, Result};
use crate::report::CycleReport;
use crate::sense::Candidate;

/// State file name inside the kernel output directory.
const STATE_FILE: &str = "state.json";

/// Backup of the previous state.
const BAK_SUFFIX: &str = ".bak";

/// Temporary sibling used for atomic writes.
const TMP_SUFFIX: &str = ".tmp";

/// Persistence manager for one workspace's kernel output directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The kernel output directory this store writes into.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.dir.join(STATE_FILE)
    }

    #[must_use]
    pub fn bak_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{BAK_SUFFIX}"))
    }

    #[must_use]
    pub fn tmp_path(&self) -> PathBuf {
        self.dir.join(format!("{STATE_FILE}{TMP_SUFFIX}"))
    }

    /// Persist state atomically.
    ///
    /// Write order: temp file (+fsync), old target copied to `.bak`,
    /// rename over target. A crash between the temp write and the rename
    /// leaves the previous `state.json` untouched.
    pub fn save(&self, state: &CycleState) -> Result<()> {
        fs::create_dir_all(&self.dir)?;

        let json = serde_json::to_string_pretty(state)?;
        let tmp = self.tmp_path();
        let mut file = File::create(&tmp)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        drop(file);

        let target = self.state_path();
        if target.exists() {
            if let Err(e) = fs::copy(&target, self.bak_path()) {
                warn!("could not refresh state backup: {e}");
            }
        }

        fs::rename(&tmp, &target)?;
        Ok(())
    }

    /// Load the latest usable state.
    ///
    /// Returns `Ok(None)` when neither the target nor the backup is
    /// readable (treated as a fresh cycle).
    ///
    /// # Errors
    ///
    /// Returns [`KernelError::UnsupportedSchema`] when the persisted
    /// schema version is newer than this binary understands.
    pub fn load(&self) -> Result<Option<CycleState>> {
        if let Some(state) = self.try_load(&self.state_path())? {
            return Ok(Some(state));
        }
        if let Some(state) = self.try_load(&self.bak_path())? {
            warn!("state.json unreadable, recovered from .bak");
            return Ok(Some(state));
        }
        Ok(None)
    }

    fn try_load(&self, path: &Path) -> Result<Option<CycleState>> {
        if !path.exists() {
            return Ok(None);
        }
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                warn!("could not read {}: {e}", path.display());
                return Ok(None);
            }
        };
        let value: serde_json::Value = match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(e) => {
                warn!("corrupt state file {}: {e}", path.display());
                return Ok(None);
            }
        };

        let version = value
            .get("schema_version")
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0) as u32;
        if version > STATE_SCHEMA_VERSION {
            return Err(KernelError::UnsupportedSchema {
                found: version,
                supported: STATE_SCHEMA_VERSION,
            });
        }

        match serde_json::from_value::<CycleState>(value) {
            Ok(mut state) => {
                // Older schemas deserialize through serde defaults; stamp
                // the current version after the forward migration.
                state.schema_version = STATE_SCHEMA_VERSION;
                Ok(Some(state))
            }
            Err(e) => {
                warn!("state file {} does not match schema: {e}", path.display());
                Ok(None)
            }
        }
    }

    /// Directory for one cycle's artifacts: `<dir>/<date>/<cycle_id>/`.
    #[must_use]
    pub fn cycle_dir(&self, date_str: &str, cycle_id: &str) -> PathBuf {
        self.dir.join(date_str).join(cycle_id)
    }

    /// Persist `candidates.json` for a cycle, refreshing the day's
    /// `latest_candidates.json` copy.
    pub fn save_candidates(
        &self,
        candidates: &[Candidate],
        date_str: &str,
        cycle_id: &str,
    ) -> Result<PathBuf> {
        self.save_artifact(
            &serde_json::to_string_pretty(candidates)?,
            "candidates.json",
            "latest_candidates.json",
            date_str,
            cycle_id,
        )
    }

    /// Persist `report.json` for a cycle, refreshing the day's
    /// `latest_report.json` copy.
    pub fn save_report(
        &self,
        report: &CycleReport,
        date_str: &str,
        cycle_id: &str,
    ) -> Result<PathBuf> {
        self.save_artifact(
            &serde_json::to_string_pretty(report)?,
            "report.json",
            "latest_report.json",
            date_str,
            cycle_id,
        )
    }

    fn save_artifact(
        &self,
        json: &str,
        name: &str,
        latest_name: &str,
        date_str: &str,
        cycle_id: &str,
    ) -> Result<PathBuf> {
        let cycle_dir = self.cycle_dir(date_str, cycle_id);
        fs::create_dir_all(&cycle_dir)?;
        let dest = cycle_dir.join(name);
        fs::write(&dest, json)?;

        let latest = self.dir.join(date_str).join(latest_name);
        if let Err(e) = fs::copy(&dest, &latest) {
            warn!("could not refresh {latest_name}: {e}");
        }
        Ok(dest)
    }
}
