//! Single-instance lock for the cortex daemon.
//!
//! Startup acquires an exclusive lockfile at a well-known path; a second
//! daemon racing for the same state DB loses the `O_CREAT | O_EXCL` create
//! and exits. The file holds the owning pid for debugging; release on
//! shutdown removes it.
//!
//! Stale locks (owner crashed or was SIGKILLed) are detected with
//! `kill(pid, 0)` and removed automatically, after which acquisition is
//! retried once.

use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

/// Contents of the lockfile, written after a successful exclusive create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lockfile {
    pub pid: u32,
    pub started_at: String,
    /// The state DB this instance owns, for operator debugging.
    pub state_db: String,
}

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("another cortexd is already running (pid={0})")]
    Contended(u32),
    #[error("lockfile i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// An acquired single-instance lock. Dropping it does NOT release the lock;
/// call [`InstanceLock::release`] explicitly at the end of shutdown so a
/// crash leaves the stale file (and its pid) behind for diagnosis.
pub struct InstanceLock {
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock at `path`, retrying once after stale cleanup.
    pub fn acquire(path: impl Into<PathBuf>, state_db: &str) -> Result<Self, LockError> {
        let path = path.into();
        let contents = Lockfile {
            pid: std::process::id(),
            started_at: chrono::Utc::now().to_rfc3339(),
            state_db: state_db.to_string(),
        };

        for attempt in 0..2 {
            match try_create(&path, &contents)? {
                Acquire::Acquired => return Ok(Self { path }),
                Acquire::Held(pid) => return Err(LockError::Contended(pid)),
                Acquire::StaleRemoved if attempt == 0 => {
                    tracing::info!(path = %path.display(), "removed stale lockfile, retrying");
                }
                Acquire::StaleRemoved => {
                    return Err(LockError::Io(std::io::Error::other(
                        "lockfile acquire failed after stale cleanup",
                    )))
                }
            }
        }
        Err(LockError::Io(std::io::Error::other("lockfile acquire failed")))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the lockfile. Called once, at the end of a clean shutdown.
    pub fn release(self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

enum Acquire {
    Acquired,
    Held(u32),
    StaleRemoved,
}

fn try_create(path: &Path, contents: &Lockfile) -> Result<Acquire, LockError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match OpenOptions::new()
        .write(true)
        .create_new(true) // O_CREAT | O_EXCL — exactly one winner
        .open(path)
    {
        Ok(mut file) => {
            let json = serde_json::to_string_pretty(contents)
                .map_err(|e| std::io::Error::other(e))?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
            Ok(Acquire::Acquired)
        }
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            match read_lockfile(path) {
                Some(existing) if pid_alive(existing.pid) => Ok(Acquire::Held(existing.pid)),
                _ => {
                    // Dead owner or corrupt file — clean it up.
                    let _ = std::fs::remove_file(path);
                    Ok(Acquire::StaleRemoved)
                }
            }
        }
        Err(e) => Err(LockError::Io(e)),
    }
}

fn read_lockfile(path: &Path) -> Option<Lockfile> {
    let content = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&content).ok()
}

/// Check whether a process with the given pid is alive.
#[cfg(unix)]
fn pid_alive(pid: u32) -> bool {
    // SAFETY: signal 0 probes existence without delivering a signal.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn pid_alive(_pid: u32) -> bool {
    // Assume alive off-unix; avoids stealing a live daemon's lock.
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
