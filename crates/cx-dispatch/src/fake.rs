//! Scriptable in-memory dispatcher for scheduler, watcher, and API tests.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;

use cx_core::types::{Backend, Dispatch};

use crate::{DispatchError, DispatchRequest, Dispatcher, ProcessState, Result};

/// Fake backend: records launches and kills, and reports whatever state the
/// test scripted for each handle.
pub struct FakeDispatcher {
    backend: Backend,
    next_handle: AtomicI64,
    states: DashMap<i64, ProcessState>,
    launched: Mutex<Vec<DispatchRequest>>,
    killed: Mutex<Vec<i64>>,
    fail_next: Mutex<Option<DispatchError>>,
}

impl FakeDispatcher {
    pub fn new(backend: Backend) -> Self {
        Self {
            backend,
            next_handle: AtomicI64::new(1000),
            states: DashMap::new(),
            launched: Mutex::new(Vec::new()),
            killed: Mutex::new(Vec::new()),
            fail_next: Mutex::new(None),
        }
    }

    /// Script the state reported for a handle.
    pub fn set_state(&self, handle: i64, state: ProcessState) {
        self.states.insert(handle, state);
    }

    /// Make the next `dispatch` call fail with the given error.
    pub fn fail_next_with(&self, err: DispatchError) {
        *self.fail_next.lock().expect("fake lock poisoned") = Some(err);
    }

    pub fn launched(&self) -> Vec<DispatchRequest> {
        self.launched.lock().expect("fake lock poisoned").clone()
    }

    pub fn launch_count(&self) -> usize {
        self.launched.lock().expect("fake lock poisoned").len()
    }

    pub fn killed(&self) -> Vec<i64> {
        self.killed.lock().expect("fake lock poisoned").clone()
    }
}

#[async_trait]
impl Dispatcher for FakeDispatcher {
    async fn dispatch(&self, req: DispatchRequest) -> Result<i64> {
        if let Some(err) = self.fail_next.lock().expect("fake lock poisoned").take() {
            return Err(err);
        }
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.states.insert(handle, ProcessState::Running);
        self.launched.lock().expect("fake lock poisoned").push(req);
        Ok(handle)
    }

    async fn is_alive(&self, handle: i64) -> bool {
        matches!(
            self.states.get(&handle).map(|s| *s),
            Some(ProcessState::Running)
        )
    }

    async fn kill(&self, handle: i64) -> Result<()> {
        self.killed.lock().expect("fake lock poisoned").push(handle);
        if self.states.contains_key(&handle) {
            self.states.insert(handle, ProcessState::Exited(143));
        }
        Ok(())
    }

    fn handle_type(&self) -> Backend {
        self.backend
    }

    async fn session_name(&self, handle: i64) -> Option<String> {
        match self.backend {
            Backend::Session => Some(format!("cortex-fake-{handle}")),
            Backend::Pid => None,
        }
    }

    async fn process_state(&self, handle: i64) -> ProcessState {
        self.states
            .get(&handle)
            .map(|s| *s)
            .unwrap_or(ProcessState::Unknown)
    }

    async fn adopt(&self, dispatch: &Dispatch) -> Option<i64> {
        let handle = self.next_handle.fetch_add(1, Ordering::SeqCst);
        self.states.insert(
            handle,
            if dispatch.pid.is_some() || dispatch.session_name.is_some() {
                ProcessState::Running
            } else {
                ProcessState::Unknown
            },
        );
        Some(handle)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn request() -> DispatchRequest {
        DispatchRequest {
            agent_id: "agent-1".into(),
            prompt: "work".into(),
            provider_cmd: "claude".into(),
            model: None,
            thinking_level: None,
            work_dir: PathBuf::from("/tmp"),
            log_path: PathBuf::from("/tmp/x.log"),
            env: vec![],
        }
    }

    #[tokio::test]
    async fn scripted_lifecycle() {
        let fake = FakeDispatcher::new(Backend::Pid);
        let handle = fake.dispatch(request()).await.unwrap();
        assert!(fake.is_alive(handle).await);

        fake.set_state(handle, ProcessState::Exited(0));
        assert!(!fake.is_alive(handle).await);
        assert_eq!(fake.process_state(handle).await, ProcessState::Exited(0));
        assert_eq!(fake.launch_count(), 1);
    }

    #[tokio::test]
    async fn scripted_failure() {
        let fake = FakeDispatcher::new(Backend::Pid);
        fake.fail_next_with(DispatchError::ResourceLimit("full".into()));
        assert!(fake.dispatch(request()).await.is_err());
        // Next launch succeeds again.
        assert!(fake.dispatch(request()).await.is_ok());
    }

    #[tokio::test]
    async fn session_backend_reports_names() {
        let fake = FakeDispatcher::new(Backend::Session);
        let handle = fake.dispatch(request()).await.unwrap();
        assert_eq!(
            fake.session_name(handle).await,
            Some(format!("cortex-fake-{handle}"))
        );
    }
}
