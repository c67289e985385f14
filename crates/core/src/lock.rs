//! Workspace locking
//!
//! A file lock keyed by workspace id serializes concurrent mutating runs
//! (`up`, `stop`, `delete`). Readers such as `status` never take the lock.
//! The lock file records the holder's pid; a lock whose holder is no longer
//! alive is treated as stale and reclaimed.
//!
//! The lock is dropped as soon as the run controller has a confirmed running
//! container, before setup, so other clients can attach while setup runs.

use crate::errors::{LockError, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

/// An acquired workspace lock; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    path: PathBuf,
    workspace_id: String,
}

impl WorkspaceLock {
    /// Try to acquire the lock once.
    ///
    /// Creation is atomic (`create_new`); on contention the holder pid is
    /// read back and returned in [`LockError::AlreadyLocked`]. A stale lock
    /// (holder no longer running) is removed and acquisition retried once.
    #[instrument(skip_all, fields(workspace_id = workspace_id))]
    pub fn try_acquire(path: PathBuf, workspace_id: &str) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(LockError::from)?;
        }

        match Self::create_lock_file(&path) {
            Ok(()) => {
                debug!("workspace lock acquired");
                return Ok(Self {
                    path,
                    workspace_id: workspace_id.to_string(),
                });
            }
            Err(holder_pid) => {
                if holder_pid != 0 && !process_alive(holder_pid) {
                    warn!(holder_pid, "removing stale workspace lock");
                    let _ = std::fs::remove_file(&path);
                    if Self::create_lock_file(&path).is_ok() {
                        return Ok(Self {
                            path,
                            workspace_id: workspace_id.to_string(),
                        });
                    }
                }
                // Re-read: the competing holder may differ after the retry.
                let holder_pid = read_holder_pid(&path).unwrap_or(holder_pid);
                Err(LockError::AlreadyLocked {
                    workspace_id: workspace_id.to_string(),
                    holder_pid,
                }
                .into())
            }
        }
    }

    /// Acquire with a wait: poll until the lock frees or `timeout` elapses.
    pub async fn acquire(
        path: PathBuf,
        workspace_id: String,
        timeout: Duration,
    ) -> Result<Self> {
        let deadline = Instant::now() + timeout;
        loop {
            match Self::try_acquire(path.clone(), &workspace_id) {
                Ok(lock) => return Ok(lock),
                Err(e) => {
                    if Instant::now() >= deadline {
                        return Err(e);
                    }
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }

    /// On success the lock file exists and holds our pid. On contention the
    /// current holder pid is returned as the error value (0 when unreadable).
    fn create_lock_file(path: &PathBuf) -> std::result::Result<(), u32> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                Ok(())
            }
            Err(_) => Err(read_holder_pid(path).unwrap_or(0)),
        }
    }

    /// The workspace this lock belongs to.
    pub fn workspace_id(&self) -> &str {
        &self.workspace_id
    }

    /// Release explicitly (drop does the same).
    pub fn release(self) {}
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(
                workspace_id = %self.workspace_id,
                error = %e,
                "failed to remove workspace lock file"
            );
        } else {
            debug!(workspace_id = %self.workspace_id, "workspace lock released");
        }
    }
}

fn read_holder_pid(path: &PathBuf) -> Option<u32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|content| content.trim().parse().ok())
}

/// Liveness probe for a pid. On Linux `/proc/<pid>` existence is exact; on
/// other platforms a held lock is assumed live and never reclaimed.
fn process_alive(pid: u32) -> bool {
    #[cfg(target_os = "linux")]
    {
        PathBuf::from(format!("/proc/{}", pid)).exists()
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = pid;
        true
    }
}
