use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cx_core::config::{Config, ConfigHandle};
use cx_core::store::StateDb;
use cx_core::types::{Backend, DispatchStatus, HealthEventType, NewDispatch, Tier};
use cx_daemon::scheduler::HandleMap;
use cx_daemon::stuck::{StuckDecision, StuckDetector};
use cx_dispatch::fake::FakeDispatcher;
use cx_dispatch::{DispatcherSet, ProcessState};

struct Fixture {
    detector: StuckDetector,
    store: Arc<StateDb>,
    pid_backend: Arc<FakeDispatcher>,
    handles: HandleMap,
}

async fn fixture(mut config: Config) -> Fixture {
    // Everything running longer than a second is stuck.
    config.general.stuck_timeout = 1;
    config.general.max_retries = 2;

    let store = Arc::new(StateDb::open_in_memory().await.unwrap());
    let pid_backend = Arc::new(FakeDispatcher::new(Backend::Pid));
    let session_backend = Arc::new(FakeDispatcher::new(Backend::Session));
    let dispatchers = DispatcherSet::new(pid_backend.clone(), session_backend);
    let handles: HandleMap = Arc::new(Mutex::new(HashMap::new()));

    let detector = StuckDetector::new(
        store.clone(),
        dispatchers,
        ConfigHandle::new(config),
        handles.clone(),
    );
    Fixture {
        detector,
        store,
        pid_backend,
        handles,
    }
}

async fn running_dispatch(store: &StateDb, bead: &str, tier: Tier, retries: i64) -> i64 {
    store
        .insert_dispatch(NewDispatch {
            bead_id: bead.to_string(),
            project: "alpha".to_string(),
            agent_id: format!("agent-{bead}"),
            provider: "claude-fast".to_string(),
            tier,
            backend: Backend::Pid,
            pid: Some(555),
            session_name: None,
            stage: Some("in_progress".to_string()),
            retries,
            log_path: None,
            authed: true,
        })
        .await
        .unwrap()
}

// ---------------------------------------------------------------------------
// Escalation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stuck_fast_dispatch_is_killed_and_requeued_at_balanced() {
    let fx = fixture(Config::default()).await;
    let id = running_dispatch(&fx.store, "b-1", Tier::Fast, 0).await;

    // Register a live handle, as the scheduler would at launch.
    fx.handles.lock().unwrap().insert(id, 42);
    fx.pid_backend.set_state(42, ProcessState::Running);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let actions = fx.detector.run_sweep().await;

    assert_eq!(actions.len(), 1);
    assert!(actions[0].was_alive);
    assert_eq!(
        actions[0].decision,
        StuckDecision::Requeued { next_tier: Tier::Balanced }
    );
    assert_eq!(fx.pid_backend.killed(), vec![42]);

    let row = fx.store.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(row.status, DispatchStatus::PendingRetry);
    assert_eq!(row.tier, Tier::Balanced);
    assert_eq!(row.retries, 1);
    assert_eq!(row.exit_code, Some(-1));
    assert_eq!(row.stage.as_deref(), Some("failed"));

    let events: Vec<_> = fx
        .store
        .recent_health_events(10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&HealthEventType::StuckKill));
}

#[tokio::test]
async fn dead_executor_records_stuck_dead() {
    let fx = fixture(Config::default()).await;
    let id = running_dispatch(&fx.store, "b-1", Tier::Fast, 0).await;
    fx.handles.lock().unwrap().insert(id, 42);
    fx.pid_backend.set_state(42, ProcessState::Exited(9));

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let actions = fx.detector.run_sweep().await;

    assert_eq!(actions.len(), 1);
    assert!(!actions[0].was_alive);
    assert!(fx.pid_backend.killed().is_empty());

    let events: Vec<_> = fx
        .store
        .recent_health_events(10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&HealthEventType::StuckDead));
}

#[tokio::test]
async fn premium_stays_premium_on_requeue() {
    let fx = fixture(Config::default()).await;
    let id = running_dispatch(&fx.store, "b-1", Tier::Premium, 1).await;
    fx.handles.lock().unwrap().insert(id, 42);
    fx.pid_backend.set_state(42, ProcessState::Running);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let actions = fx.detector.run_sweep().await;
    assert_eq!(
        actions[0].decision,
        StuckDecision::Requeued { next_tier: Tier::Premium }
    );

    let row = fx.store.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(row.tier, Tier::Premium);
    assert_eq!(row.retries, 2);
}

// ---------------------------------------------------------------------------
// Max retries
// ---------------------------------------------------------------------------

#[tokio::test]
async fn max_retries_marks_permanent_failure() {
    let fx = fixture(Config::default()).await;
    let id = running_dispatch(&fx.store, "b-1", Tier::Premium, 2).await;
    fx.handles.lock().unwrap().insert(id, 42);
    fx.pid_backend.set_state(42, ProcessState::Running);

    tokio::time::sleep(Duration::from_millis(1200)).await;
    let actions = fx.detector.run_sweep().await;

    assert_eq!(actions[0].decision, StuckDecision::FailedPermanently);
    let row = fx.store.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(row.status, DispatchStatus::Failed);
    assert_eq!(row.exit_code, Some(-1));
    assert!(fx.store.list_pending_retry().await.unwrap().is_empty());

    let events: Vec<_> = fx
        .store
        .recent_health_events(10)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect();
    assert!(events.contains(&HealthEventType::MaxRetries));
}

// ---------------------------------------------------------------------------
// Idempotence
// ---------------------------------------------------------------------------

#[tokio::test]
async fn sweep_never_touches_terminal_rows() {
    let fx = fixture(Config::default()).await;
    let id = running_dispatch(&fx.store, "b-1", Tier::Fast, 0).await;
    fx.store
        .finish_dispatch(id, DispatchStatus::Completed, Some(0), None, None)
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(1200)).await;
    for _ in 0..3 {
        assert!(fx.detector.run_sweep().await.is_empty());
    }
    let row = fx.store.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(row.status, DispatchStatus::Completed);
}

#[tokio::test]
async fn fresh_dispatches_are_not_stuck() {
    let fx = fixture(Config::default()).await;
    running_dispatch(&fx.store, "b-1", Tier::Fast, 0).await;

    // Not older than the one-second threshold yet.
    assert!(fx.detector.run_sweep().await.is_empty());
}
