//! Single-writer guarantee per workspace via a TTL-based lockfile.
//!
//! The lockfile is created with an exclusive create so two processes can
//! never both own it. Its body records `{pid, acquired_at}`; a lock older
//! than the TTL is considered left behind by a crashed process and is
//! reclaimed once.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

/// Stale-lock TTL: locks older than this are reclaimed.
pub const LOCK_TTL: Duration = Duration::from_secs(600);

/// Lockfile body.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    /// Unix seconds at acquisition.
    acquired_at: i64,
}

/// File-based workspace lock with stale-lock reclamation.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
    ttl: Duration,
    acquired: bool,
}

impl WorkspaceLock {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            ttl: LOCK_TTL,
            acquired: false,
        }
    }

    /// Override the stale TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn is_acquired(&self) -> bool {
        self.acquired
    }

    /// Try to acquire the lock.
    ///
    /// Returns `Ok(false)` when another live process holds it. A stale or
    /// corrupt lockfile is removed and acquisition retried once.
    pub fn acquire(&mut self) -> Result<bool> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }

        if self.path.exists() {
            match fs::read_to_string(&self.path)
                .ok()
                .and_then(|text| serde_json::from_str::<LockInfo>(&text).ok())
            {
                Some(info) => {
                    let age = Utc::now().timestamp() - info.acquired_at;
                    if age > self.ttl.as_secs() as i64 {
                        warn!(
                            "reclaiming stale lock (pid={}, age={}s)",
                            info.pid, age
                        );
                        let _ = fs::remove_file(&self.path);
                    } else {
                        return Ok(false);
                    }
                }
                None => {
                    warn!("removing corrupt lockfile at {}", self.path.display());
                    let _ = fs::remove_file(&self.path);
                }
            }
        }

        match OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
        {
            Ok(mut file) => {
                let info = LockInfo {
                    pid: std::process::id(),
                    acquired_at: Utc::now().timestamp(),
                };
                file.write_all(serde_json::to_string(&info)?.as_bytes())?;
                self.acquired = true;
                debug!("acquired workspace lock at {}", self.path.display());
                Ok(true)
            }
            // Another process created it between our check and our create.
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Release the lock if held.
    pub fn release(&mut self) {
        if self.acquired {
            if let Err(e) = fs::remove_file(&self.path) {
                warn!("could not remove lockfile: {e}");
            }
            self.acquired = false;
        }
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn lock_path(temp: &TempDir) -> PathBuf {
        temp.path().join("_outputs").join("agi_kernel").join("lock")
    }

    #[test]
    fn test_acquire_fresh() {
        let temp = TempDir::new().unwrap();
        let mut lock = WorkspaceLock::new(lock_path(&temp));
        assert!(lock.acquire().unwrap());
        assert!(lock.is_acquired());
        assert!(lock.path().exists());
    }

    #[test]
    fn test_contention_fails() {
        let temp = TempDir::new().unwrap();
        let mut first = WorkspaceLock::new(lock_path(&temp));
        assert!(first.acquire().unwrap());

        let mut second = WorkspaceLock::new(lock_path(&temp));
        assert!(!second.acquire().unwrap());
        assert!(!second.is_acquired());
    }

    #[test]
    fn test_release_allows_reacquire() {
        let temp = TempDir::new().unwrap();
        let mut first = WorkspaceLock::new(lock_path(&temp));
        assert!(first.acquire().unwrap());
        first.release();

        let mut second = WorkspaceLock::new(lock_path(&temp));
        assert!(second.acquire().unwrap());
    }

    #[test]
    fn test_drop_releases() {
        let temp = TempDir::new().unwrap();
        {
            let mut lock = WorkspaceLock::new(lock_path(&temp));
            assert!(lock.acquire().unwrap());
        }
        let mut second = WorkspaceLock::new(lock_path(&temp));
        assert!(second.acquire().unwrap());
    }

    #[test]
    fn test_stale_lock_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let stale = LockInfo {
            pid: 99999,
            acquired_at: Utc::now().timestamp() - 3600,
        };
        fs::write(&path, serde_json::to_string(&stale).unwrap()).unwrap();

        let mut lock = WorkspaceLock::new(&path);
        assert!(lock.acquire().unwrap());
    }

    #[test]
    fn test_live_lock_not_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        let live = LockInfo {
            pid: 99999,
            acquired_at: Utc::now().timestamp(),
        };
        fs::write(&path, serde_json::to_string(&live).unwrap()).unwrap();

        let mut lock = WorkspaceLock::new(&path);
        assert!(!lock.acquire().unwrap());
    }

    #[test]
    fn test_corrupt_lockfile_reclaimed() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, "not json at all").unwrap();

        let mut lock = WorkspaceLock::new(&path);
        assert!(lock.acquire().unwrap());
    }

    #[test]
    fn test_release_of_unacquired_lock_keeps_foreign_file() {
        let temp = TempDir::new().unwrap();
        let path = lock_path(&temp);
        let mut owner = WorkspaceLock::new(&path);
        assert!(owner.acquire().unwrap());

        let mut other = WorkspaceLock::new(&path);
        assert!(!other.acquire().unwrap());
        other.release();
        assert!(path.exists(), "non-owner release must not delete the lock");
    }
}
