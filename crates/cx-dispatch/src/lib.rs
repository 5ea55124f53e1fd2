//! Executor dispatch: the backend capability set, the PID and
//! tmux-session implementations, the per-dispatch lifecycle watcher,
//! failure classification, and the bead-source client.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use cx_core::types::Backend;

pub mod beads;
pub mod classify;
pub mod fake;
pub mod pid;
pub mod tmux;
pub mod watcher;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The backend tool (executor CLI, tmux) is not installed or not runnable.
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),
    #[error("workspace missing: {0}")]
    WorkspaceMissing(String),
    /// Too many live sessions for the session backend.
    #[error("resource limit: {0}")]
    ResourceLimit(String),
    #[error("launch failed: {0}")]
    LaunchFailed(String),
}

pub type Result<T> = std::result::Result<T, DispatchError>;

// ---------------------------------------------------------------------------
// Request / state
// ---------------------------------------------------------------------------

/// Prompts above this size move from argv to a file referenced through the
/// child environment.
pub const PROMPT_ARGV_LIMIT: usize = 64 * 1024;

/// Everything a backend needs to launch one executor.
#[derive(Debug, Clone)]
pub struct DispatchRequest {
    pub agent_id: String,
    pub prompt: String,
    /// Executor CLI command, resolved by the scheduler from the provider's
    /// `dispatch.cli` entry (falling back to the provider's cli name).
    pub provider_cmd: String,
    pub model: Option<String>,
    pub thinking_level: Option<String>,
    pub work_dir: PathBuf,
    pub log_path: PathBuf,
    /// Extra environment for downstream auth.
    pub env: Vec<(String, String)>,
}

/// Observed execution state of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(i32),
    Unknown,
}

// ---------------------------------------------------------------------------
// Dispatcher capability set
// ---------------------------------------------------------------------------

/// Backend capability set: launch, liveness, kill, and handle introspection.
///
/// The scheduler never touches OS primitives directly; every kill and probe
/// goes through the backend so session semantics stay encapsulated.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    /// Launch an executor. Returns an integer handle: the OS pid for the pid
    /// backend, a synthetic monotonically increasing id for the session
    /// backend.
    async fn dispatch(&self, req: DispatchRequest) -> Result<i64>;

    /// Liveness probe. Must not block beyond ~50 ms; unknown handles are
    /// dead.
    async fn is_alive(&self, handle: i64) -> bool;

    /// Send the termination signal (session kill for the session backend).
    /// Idempotent; unknown handles return Ok.
    async fn kill(&self, handle: i64) -> Result<()>;

    fn handle_type(&self) -> Backend;

    /// The multiplexer session name behind a handle (session backend only).
    async fn session_name(&self, handle: i64) -> Option<String>;

    async fn process_state(&self, handle: i64) -> ProcessState;

    /// Re-register an execution handle from a durable dispatch row, e.g.
    /// after a daemon restart. Returns the new handle when the backend can
    /// still observe the execution.
    async fn adopt(&self, dispatch: &cx_core::types::Dispatch) -> Option<i64>;
}

/// The pair of configured backends, resolved once at startup from the
/// tier-routing map.
#[derive(Clone)]
pub struct DispatcherSet {
    pid: Arc<dyn Dispatcher>,
    session: Arc<dyn Dispatcher>,
}

impl DispatcherSet {
    pub fn new(pid: Arc<dyn Dispatcher>, session: Arc<dyn Dispatcher>) -> Self {
        Self { pid, session }
    }

    pub fn for_backend(&self, backend: Backend) -> Arc<dyn Dispatcher> {
        match backend {
            Backend::Pid => self.pid.clone(),
            Backend::Session => self.session.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Shared launch helpers
// ---------------------------------------------------------------------------

/// Build the argv tail and extra environment for a request.
///
/// Small prompts ride argv (`-p <prompt>`); large ones are written next to
/// the log file and referenced via `CORTEX_PROMPT_FILE`.
pub(crate) fn prompt_args(req: &DispatchRequest) -> std::io::Result<(Vec<String>, Vec<(String, String)>)> {
    let mut args = Vec::new();
    let mut env = req.env.clone();

    if let Some(model) = &req.model {
        args.push("--model".to_string());
        args.push(model.clone());
    }
    if let Some(level) = &req.thinking_level {
        env.push(("CORTEX_THINKING_LEVEL".to_string(), level.clone()));
    }

    if req.prompt.len() > PROMPT_ARGV_LIMIT {
        let prompt_path = req.log_path.with_extension("prompt");
        std::fs::write(&prompt_path, &req.prompt)?;
        env.push((
            "CORTEX_PROMPT_FILE".to_string(),
            prompt_path.to_string_lossy().into_owned(),
        ));
    } else {
        args.push("-p".to_string());
        args.push(req.prompt.clone());
    }

    Ok((args, env))
}

/// Check whether a pid is alive via signal 0.
#[cfg(unix)]
pub(crate) fn pid_alive(pid: i32) -> bool {
    // SAFETY: signal 0 probes existence without delivering a signal.
    unsafe { libc::kill(pid, 0) == 0 }
}

#[cfg(not(unix))]
pub(crate) fn pid_alive(_pid: i32) -> bool {
    false
}

/// Best-effort SIGTERM.
#[cfg(unix)]
pub(crate) fn send_sigterm(pid: i32) {
    // SAFETY: plain kill(2); ESRCH for already-gone pids is fine.
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}

#[cfg(not(unix))]
pub(crate) fn send_sigterm(_pid: i32) {}
