//! Direct child-process backend.
//!
//! The handle is the OS pid. Children write stdout+stderr to the dispatch
//! log file; liveness uses `kill(pid, 0)` and exit codes are collected with
//! a non-blocking `try_wait` so the probe never stalls the scheduler.

use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use cx_core::types::{Backend, Dispatch};

use crate::{
    pid_alive, prompt_args, send_sigterm, DispatchError, DispatchRequest, Dispatcher,
    ProcessState, Result,
};

#[derive(Clone)]
struct PidEntry {
    pid: i32,
    /// The owned child, present for processes we spawned ourselves. Adopted
    /// handles (daemon restart) have no child and fall back to pid probes.
    child: Option<Arc<tokio::sync::Mutex<Child>>>,
    exit_code: Arc<Mutex<Option<i32>>>,
}

/// PID-backed dispatcher.
#[derive(Default)]
pub struct PidDispatcher {
    entries: DashMap<i64, PidEntry>,
}

impl PidDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clone the entry out so no map guard is held across an await.
    fn entry(&self, handle: i64) -> Option<PidEntry> {
        self.entries.get(&handle).map(|e| e.clone())
    }
}

#[async_trait]
impl Dispatcher for PidDispatcher {
    async fn dispatch(&self, req: DispatchRequest) -> Result<i64> {
        if !req.work_dir.is_dir() {
            return Err(DispatchError::WorkspaceMissing(
                req.work_dir.to_string_lossy().into_owned(),
            ));
        }
        if req.provider_cmd.is_empty() {
            return Err(DispatchError::LaunchFailed("no executor command".into()));
        }

        if let Some(parent) = req.log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DispatchError::LaunchFailed(format!("log dir: {e}")))?;
        }
        let log = std::fs::File::create(&req.log_path)
            .map_err(|e| DispatchError::LaunchFailed(format!("log file: {e}")))?;
        let log_err = log
            .try_clone()
            .map_err(|e| DispatchError::LaunchFailed(format!("log file: {e}")))?;

        let (args, env) =
            prompt_args(&req).map_err(|e| DispatchError::LaunchFailed(format!("prompt file: {e}")))?;

        let child = Command::new(&req.provider_cmd)
            .args(&args)
            .current_dir(&req.work_dir)
            .envs(env)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(false)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    DispatchError::BackendUnavailable(req.provider_cmd.clone())
                }
                _ => DispatchError::LaunchFailed(e.to_string()),
            })?;

        let pid = child.id().map(|p| p as i32).ok_or_else(|| {
            DispatchError::LaunchFailed("child exited before pid was observed".into())
        })?;

        debug!(agent_id = %req.agent_id, pid, cmd = %req.provider_cmd, "executor spawned");
        self.entries.insert(
            pid as i64,
            PidEntry {
                pid,
                child: Some(Arc::new(tokio::sync::Mutex::new(child))),
                exit_code: Arc::new(Mutex::new(None)),
            },
        );
        Ok(pid as i64)
    }

    async fn is_alive(&self, handle: i64) -> bool {
        matches!(self.process_state(handle).await, ProcessState::Running)
    }

    async fn kill(&self, handle: i64) -> Result<()> {
        match self.entry(handle) {
            Some(entry) => {
                send_sigterm(entry.pid);
                Ok(())
            }
            // Unknown handles are already gone.
            None => Ok(()),
        }
    }

    fn handle_type(&self) -> Backend {
        Backend::Pid
    }

    async fn session_name(&self, _handle: i64) -> Option<String> {
        None
    }

    async fn process_state(&self, handle: i64) -> ProcessState {
        let Some(entry) = self.entry(handle) else {
            return ProcessState::Unknown;
        };
        if let Some(code) = *entry.exit_code.lock().expect("exit lock poisoned") {
            return ProcessState::Exited(code);
        }

        match &entry.child {
            Some(child) => {
                let mut child = child.lock().await;
                match child.try_wait() {
                    Ok(Some(status)) => {
                        let code = exit_code_of(&status);
                        *entry.exit_code.lock().expect("exit lock poisoned") = Some(code);
                        ProcessState::Exited(code)
                    }
                    Ok(None) => ProcessState::Running,
                    Err(e) => {
                        warn!(handle, error = %e, "try_wait failed");
                        ProcessState::Unknown
                    }
                }
            }
            // Adopted handle: all we can do is probe the pid. A vanished
            // process has no exit code; report -1.
            None => {
                if pid_alive(entry.pid) {
                    ProcessState::Running
                } else {
                    *entry.exit_code.lock().expect("exit lock poisoned") = Some(-1);
                    ProcessState::Exited(-1)
                }
            }
        }
    }

    async fn adopt(&self, dispatch: &Dispatch) -> Option<i64> {
        let pid = dispatch.pid?;
        self.entries.insert(
            pid as i64,
            PidEntry {
                pid,
                child: None,
                exit_code: Arc::new(Mutex::new(None)),
            },
        );
        Some(pid as i64)
    }
}

#[cfg(unix)]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    // 128+signal mirrors shell convention for signal deaths.
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

#[cfg(not(unix))]
fn exit_code_of(status: &std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
