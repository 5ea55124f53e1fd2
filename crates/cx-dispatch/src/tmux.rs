//! Terminal-multiplexer (tmux) session backend.
//!
//! Gives operators an interactive attach surface for long runs. Handles are
//! synthetic monotonically increasing ids mapped to session names; sessions
//! are created with `remain-on-exit` so a finished executor leaves an
//! observable dead pane instead of tearing the session down underneath us.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::process::Command;
use tracing::{debug, warn};

use cx_core::types::{Backend, Dispatch};

use crate::{prompt_args, DispatchError, DispatchRequest, Dispatcher, ProcessState, Result};

/// Session-name prefix; the reaper sweeps sessions carrying it.
pub const SESSION_PREFIX: &str = "cortex-";

/// tmux-session-backed dispatcher.
pub struct TmuxDispatcher {
    next_handle: AtomicI64,
    sessions: DashMap<i64, String>,
    max_sessions: usize,
}

impl TmuxDispatcher {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            next_handle: AtomicI64::new(1),
            sessions: DashMap::new(),
            max_sessions,
        }
    }

    fn session_for(&self, handle: i64) -> Option<String> {
        self.sessions.get(&handle).map(|s| s.clone())
    }

    async fn live_session_count(&self) -> usize {
        let mut live = 0;
        for entry in self.sessions.iter() {
            if session_exists(entry.value()).await {
                live += 1;
            }
        }
        live
    }
}

#[async_trait]
impl Dispatcher for TmuxDispatcher {
    async fn dispatch(&self, req: DispatchRequest) -> Result<i64> {
        if !req.work_dir.is_dir() {
            return Err(DispatchError::WorkspaceMissing(
                req.work_dir.to_string_lossy().into_owned(),
            ));
        }
        if req.provider_cmd.is_empty() {
            return Err(DispatchError::LaunchFailed("no executor command".into()));
        }
        let live = self.live_session_count().await;
        if live >= self.max_sessions {
            return Err(DispatchError::ResourceLimit(format!(
                "{live} live sessions (max {})",
                self.max_sessions
            )));
        }

        if let Some(parent) = req.log_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| DispatchError::LaunchFailed(format!("log dir: {e}")))?;
        }

        let (args, env) =
            prompt_args(&req).map_err(|e| DispatchError::LaunchFailed(format!("prompt file: {e}")))?;
        let session = sanitize_session_name(&format!("{SESSION_PREFIX}{}", req.agent_id));

        // The executor runs under `sh -c` so its combined output lands in
        // the dispatch log file.
        let inner = format!(
            "{} {} >> {} 2>&1",
            shell_quote(&req.provider_cmd),
            args.iter().map(|a| shell_quote(a)).collect::<Vec<_>>().join(" "),
            shell_quote(&req.log_path.to_string_lossy()),
        );

        let mut cmd = Command::new("tmux");
        cmd.arg("new-session")
            .arg("-d")
            .arg("-s")
            .arg(&session)
            .arg("-c")
            .arg(&req.work_dir);
        for (key, value) in &env {
            cmd.arg("-e").arg(format!("{key}={value}"));
        }
        cmd.arg("sh").arg("-c").arg(&inner);

        let output = cmd.output().await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => DispatchError::BackendUnavailable("tmux".into()),
            _ => DispatchError::LaunchFailed(e.to_string()),
        })?;
        if !output.status.success() {
            return Err(DispatchError::LaunchFailed(format!(
                "tmux new-session: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        // Keep the dead pane around so exit status stays observable.
        let _ = Command::new("tmux")
            .args(["set-option", "-t", &session, "remain-on-exit", "on"])
            .output()
            .await;

        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(handle, session.clone());
        debug!(handle, session = %session, "tmux session launched");
        Ok(handle)
    }

    async fn is_alive(&self, handle: i64) -> bool {
        matches!(self.process_state(handle).await, ProcessState::Running)
    }

    async fn kill(&self, handle: i64) -> Result<()> {
        let Some(session) = self.session_for(handle) else {
            return Ok(());
        };
        let result = Command::new("tmux")
            .args(["kill-session", "-t", &session])
            .output()
            .await;
        match result {
            Ok(output) if !output.status.success() => {
                // Session already gone — kill is idempotent.
                debug!(session = %session, "kill-session on absent session");
            }
            Err(e) => warn!(session = %session, error = %e, "tmux kill-session failed"),
            _ => {}
        }
        Ok(())
    }

    fn handle_type(&self) -> Backend {
        Backend::Session
    }

    async fn session_name(&self, handle: i64) -> Option<String> {
        self.session_for(handle)
    }

    async fn process_state(&self, handle: i64) -> ProcessState {
        let Some(session) = self.session_for(handle) else {
            return ProcessState::Unknown;
        };
        session_state(&session).await
    }

    async fn adopt(&self, dispatch: &Dispatch) -> Option<i64> {
        let session = dispatch.session_name.clone()?;
        if !session_exists(&session).await {
            return None;
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.sessions.insert(handle, session);
        Some(handle)
    }
}

// ---------------------------------------------------------------------------
// tmux probes
// ---------------------------------------------------------------------------

pub(crate) async fn session_exists(session: &str) -> bool {
    Command::new("tmux")
        .args(["has-session", "-t", session])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

/// Execution state of a session: a live pane is Running, a dead pane
/// (remain-on-exit) is Exited with the pane's status.
pub(crate) async fn session_state(session: &str) -> ProcessState {
    let output = Command::new("tmux")
        .args([
            "display-message",
            "-p",
            "-t",
            session,
            "#{pane_dead} #{pane_dead_status}",
        ])
        .output()
        .await;

    let Ok(output) = output else {
        return ProcessState::Unknown;
    };
    if !output.status.success() {
        // Session vanished.
        return ProcessState::Exited(-1);
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let mut parts = text.trim().split_whitespace();
    match parts.next() {
        Some("1") => {
            let code = parts.next().and_then(|s| s.parse().ok()).unwrap_or(-1);
            ProcessState::Exited(code)
        }
        Some("0") => ProcessState::Running,
        _ => ProcessState::Unknown,
    }
}

/// List sessions carrying the cortex prefix with their dead/alive state.
pub async fn list_cortex_sessions() -> Vec<(String, bool)> {
    let output = Command::new("tmux")
        .args(["list-sessions", "-F", "#{session_name}"])
        .output()
        .await;
    let Ok(output) = output else {
        return Vec::new();
    };
    if !output.status.success() {
        return Vec::new();
    }

    let mut sessions = Vec::new();
    for name in String::from_utf8_lossy(&output.stdout).lines() {
        let name = name.trim();
        if !name.starts_with(SESSION_PREFIX) {
            continue;
        }
        let exited = matches!(session_state(name).await, ProcessState::Exited(_));
        sessions.push((name.to_string(), exited));
    }
    sessions
}

/// Kill a session by name (reaper path).
pub async fn kill_session_by_name(session: &str) -> bool {
    Command::new("tmux")
        .args(["kill-session", "-t", session])
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

fn sanitize_session_name(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '-'
            }
        })
        .collect()
}

fn shell_quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_names_are_sanitized() {
        assert_eq!(
            sanitize_session_name("cortex-agent api/server#1"),
            "cortex-agent-api-server-1"
        );
    }

    #[test]
    fn shell_quoting_survives_single_quotes() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote("plain"), "'plain'");
    }

    #[tokio::test]
    async fn unknown_handle_probes() {
        let dispatcher = TmuxDispatcher::new(4);
        assert!(!dispatcher.is_alive(77).await);
        assert_eq!(dispatcher.process_state(77).await, ProcessState::Unknown);
        assert!(dispatcher.session_name(77).await.is_none());
        dispatcher.kill(77).await.unwrap();
    }

    #[tokio::test]
    async fn missing_workspace_is_rejected() {
        let dispatcher = TmuxDispatcher::new(4);
        let req = DispatchRequest {
            agent_id: "agent-x".into(),
            prompt: "p".into(),
            provider_cmd: "true".into(),
            model: None,
            thinking_level: None,
            work_dir: "/definitely/not/here".into(),
            log_path: "/tmp/cortex-test.log".into(),
            env: vec![],
        };
        match dispatcher.dispatch(req).await {
            Err(DispatchError::WorkspaceMissing(_)) => {}
            other => panic!("expected WorkspaceMissing, got {other:?}"),
        }
    }
}
