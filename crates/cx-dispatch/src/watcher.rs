//! Per-dispatch lifecycle watcher.
//!
//! One task per launched executor, parked on process/session exit: it polls
//! the backend, and on exit reads the output tail, classifies the failure,
//! writes the terminal row (conditionally, so cancellations win races), and
//! reports the outcome to the daemon.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use cx_core::store::StateDb;
use cx_core::types::{Dispatch, DispatchStatus, FailureCategory, HealthEventType, Tier};
use cx_harness::shutdown::ShutdownSignal;

use crate::classify::{classify, summarize};
use crate::{Dispatcher, ProcessState};

/// Backend poll cadence.
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Consecutive `Unknown` probes before the watcher gives up on the handle.
const UNKNOWN_GIVE_UP: u32 = 3;

/// How much of the log file the watcher captures as the output tail.
const TAIL_BYTES: u64 = 4096;

/// What the watcher observed when a dispatch reached a terminal state.
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub dispatch_id: i64,
    pub bead_id: String,
    pub project: String,
    pub provider: String,
    pub tier: Tier,
    pub retries: i64,
    pub status: DispatchStatus,
    pub exit_code: i32,
    pub failure_category: Option<FailureCategory>,
}

/// Spawn the watcher task for a freshly launched (or adopted) dispatch.
pub fn spawn_watcher(
    store: Arc<StateDb>,
    dispatcher: Arc<dyn Dispatcher>,
    dispatch: Dispatch,
    handle: i64,
    outcomes: flume::Sender<DispatchOutcome>,
    shutdown: ShutdownSignal,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut rx = shutdown.subscribe();
        let mut ticker = tokio::time::interval(POLL_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut unknown_streak = 0u32;

        loop {
            tokio::select! {
                _ = rx.recv() => {
                    // Shutdown marks still-running dispatches interrupted in
                    // one sweep; the watcher just stops observing.
                    debug!(dispatch_id = dispatch.id, "watcher stopping for shutdown");
                    return;
                }
                _ = ticker.tick() => {
                    match dispatcher.process_state(handle).await {
                        ProcessState::Running => {
                            unknown_streak = 0;
                        }
                        ProcessState::Exited(code) => {
                            finalize(&store, &dispatch, code, &outcomes).await;
                            return;
                        }
                        ProcessState::Unknown => {
                            unknown_streak += 1;
                            if unknown_streak >= UNKNOWN_GIVE_UP {
                                warn!(
                                    dispatch_id = dispatch.id,
                                    handle,
                                    "executor state unknown, marking failed"
                                );
                                finalize(&store, &dispatch, -1, &outcomes).await;
                                return;
                            }
                        }
                    }
                }
            }
        }
    })
}

async fn finalize(
    store: &StateDb,
    dispatch: &Dispatch,
    exit_code: i32,
    outcomes: &flume::Sender<DispatchOutcome>,
) {
    let tail = match &dispatch.log_path {
        Some(path) => read_log_tail(path, TAIL_BYTES).await,
        None => String::new(),
    };

    // Exit 0 still fails when the output shows failing tests.
    let category = classify(&tail);
    let (status, failure_category, failure_summary) =
        if exit_code == 0 && category != FailureCategory::TestFailure {
            (DispatchStatus::Completed, None, None)
        } else {
            (
                DispatchStatus::Failed,
                Some(category),
                Some(summarize(&tail, category)),
            )
        };

    let transitioned = match write_terminal(
        store,
        dispatch.id,
        status,
        exit_code,
        failure_category,
        failure_summary.clone(),
    )
    .await
    {
        Ok(t) => t,
        Err(e) => {
            warn!(dispatch_id = dispatch.id, error = %e, "terminal write failed");
            return;
        }
    };

    if !tail.is_empty() {
        if let Err(e) = store.upsert_output_tail(dispatch.id, &tail).await {
            warn!(dispatch_id = dispatch.id, error = %e, "output tail write failed");
        }
    }

    if !transitioned {
        // Someone else (cancel, stuck detector) owned the transition.
        debug!(dispatch_id = dispatch.id, "row already terminal, watcher exit ignored");
        return;
    }

    let event_type = match status {
        DispatchStatus::Completed => HealthEventType::DispatchCompleted,
        _ => HealthEventType::DispatchFailed,
    };
    let details = match (status, failure_category) {
        (DispatchStatus::Completed, _) => format!("exit_code={exit_code}"),
        (_, Some(category)) => format!("exit_code={exit_code} category={}", category.as_str()),
        _ => format!("exit_code={exit_code}"),
    };
    if let Err(e) = store
        .append_health_event(
            event_type,
            details,
            Some(dispatch.id),
            Some(dispatch.bead_id.clone()),
        )
        .await
    {
        warn!(dispatch_id = dispatch.id, error = %e, "health event write failed");
    }

    info!(
        dispatch_id = dispatch.id,
        bead_id = %dispatch.bead_id,
        status = %status,
        exit_code,
        "dispatch finished"
    );

    let _ = outcomes.send(DispatchOutcome {
        dispatch_id: dispatch.id,
        bead_id: dispatch.bead_id.clone(),
        project: dispatch.project.clone(),
        provider: dispatch.provider.clone(),
        tier: dispatch.tier,
        retries: dispatch.retries,
        status,
        exit_code,
        failure_category,
    });
}

/// Terminal write with a single retry for transient store errors.
async fn write_terminal(
    store: &StateDb,
    id: i64,
    status: DispatchStatus,
    exit_code: i32,
    failure_category: Option<FailureCategory>,
    failure_summary: Option<String>,
) -> Result<bool, cx_core::store::StoreError> {
    match store
        .finish_dispatch(id, status, Some(exit_code), failure_category, failure_summary.clone())
        .await
    {
        Ok(t) => Ok(t),
        Err(first) => {
            warn!(dispatch_id = id, error = %first, "terminal write failed, retrying once");
            tokio::time::sleep(Duration::from_millis(500)).await;
            store
                .finish_dispatch(id, status, Some(exit_code), failure_category, failure_summary)
                .await
        }
    }
}

/// Read the last `max_bytes` of a log file. Missing files yield an empty
/// tail; the executor may have died before writing anything.
pub async fn read_log_tail(path: &str, max_bytes: u64) -> String {
    let path = path.to_string();
    tokio::task::spawn_blocking(move || {
        let Ok(mut file) = std::fs::File::open(&path) else {
            return String::new();
        };
        let len = file.metadata().map(|m| m.len()).unwrap_or(0);
        if len > max_bytes {
            if file.seek(SeekFrom::End(-(max_bytes as i64))).is_err() {
                return String::new();
            }
        }
        let mut buf = Vec::new();
        if file.read_to_end(&mut buf).is_err() {
            return String::new();
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
    .await
    .unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
