use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use cx_api::state::SchedulerControl;
use cx_core::config::{Config, ConfigHandle, ProjectConfig, ProviderConfig};
use cx_core::store::StateDb;
use cx_core::types::{
    Backend, Bead, BeadStage, DispatchStatus, HealthEventType, NewDispatch, Tier,
};
use cx_daemon::scheduler::{HandleMap, Scheduler};
use cx_dispatch::beads::FakeBeadSource;
use cx_dispatch::fake::FakeDispatcher;
use cx_dispatch::watcher::DispatchOutcome;
use cx_dispatch::DispatcherSet;
use cx_harness::rate_limiter::RateLimiter;
use cx_harness::shutdown::ShutdownSignal;
use cx_telemetry::metrics::MetricsCollector;

// ---------------------------------------------------------------------------
// Fixture
// ---------------------------------------------------------------------------

struct Fixture {
    scheduler: Scheduler,
    store: Arc<StateDb>,
    pid_backend: Arc<FakeDispatcher>,
    beads: Arc<FakeBeadSource>,
    outcomes: flume::Receiver<DispatchOutcome>,
    handles: HandleMap,
}

fn base_config() -> Config {
    let mut config = Config::default();
    config.general.max_per_tick = 3;
    config.general.max_retries = 2;
    config.projects.insert(
        "alpha".to_string(),
        ProjectConfig {
            enabled: true,
            priority: 1,
            workspace: "/tmp".to_string(),
            ..ProjectConfig::default()
        },
    );
    config.providers.insert(
        "claude-fast".to_string(),
        ProviderConfig {
            cli: "claude".to_string(),
            tier: Tier::Fast,
            model: None,
            authed: true,
        },
    );
    config.providers.insert(
        "claude-balanced".to_string(),
        ProviderConfig {
            cli: "claude".to_string(),
            tier: Tier::Balanced,
            model: None,
            authed: true,
        },
    );
    config.providers.insert(
        "claude-premium".to_string(),
        ProviderConfig {
            cli: "claude".to_string(),
            tier: Tier::Premium,
            model: None,
            authed: true,
        },
    );
    // Route everything to the pid backend so one fake sees all launches.
    config.dispatch.routing.premium_backend = "pid".to_string();
    config
}

async fn fixture(config: Config) -> Fixture {
    fixture_with(config, false).await
}

async fn fixture_with(config: Config, dry_run: bool) -> Fixture {
    let store = Arc::new(StateDb::open_in_memory().await.unwrap());
    let pid_backend = Arc::new(FakeDispatcher::new(Backend::Pid));
    let session_backend = Arc::new(FakeDispatcher::new(Backend::Session));
    let dispatchers = DispatcherSet::new(pid_backend.clone(), session_backend);
    let beads = Arc::new(FakeBeadSource::new());
    let limiter = Arc::new(RateLimiter::new(config.rate_limits.clone()));
    let metrics = Arc::new(MetricsCollector::new());
    let (tx, rx) = flume::unbounded();
    let handles: HandleMap = Arc::new(Mutex::new(HashMap::new()));

    let scheduler = Scheduler::new(
        store.clone(),
        dispatchers,
        beads.clone(),
        limiter,
        metrics,
        ConfigHandle::new(config),
        tx,
        ShutdownSignal::new(),
        handles.clone(),
        dry_run,
    );

    Fixture {
        scheduler,
        store,
        pid_backend,
        beads,
        outcomes: rx,
        handles,
    }
}

fn ready_bead(id: &str, priority: i64) -> Bead {
    Bead {
        id: id.to_string(),
        project: String::new(),
        priority,
        stage: BeadStage::Ready,
        bead_type: "feature".to_string(),
        labels: vec![],
        dependencies: vec![],
    }
}

async fn event_types(store: &StateDb) -> Vec<HealthEventType> {
    store
        .recent_health_events(100)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.event_type)
        .collect()
}

// ---------------------------------------------------------------------------
// Happy path
// ---------------------------------------------------------------------------

#[tokio::test]
async fn happy_path_admits_one_bead() {
    let fx = fixture(base_config()).await;
    fx.beads.put_beads("alpha", vec![ready_bead("alpha-1", 1)]);

    let report = fx.scheduler.run_tick().await;
    assert_eq!(report.admitted, 1);
    assert_eq!(report.denied, 0);

    let running = fx.store.list_running().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].bead_id, "alpha-1");
    assert_eq!(running[0].tier, Tier::Fast);
    assert_eq!(running[0].provider, "claude-fast");
    assert!(running[0].authed);

    // Bead moved to in_progress in the external store.
    assert_eq!(
        fx.beads.transitions(),
        vec![("alpha-1".to_string(), BeadStage::InProgress)]
    );

    // One executor launched, with the bead in its environment.
    let launched = fx.pid_backend.launched();
    assert_eq!(launched.len(), 1);
    assert!(launched[0]
        .env
        .iter()
        .any(|(k, v)| k == "CORTEX_BEAD_ID" && v == "alpha-1"));

    assert!(event_types(&fx.store).await.contains(&HealthEventType::TickSummary));
}

#[tokio::test]
async fn tick_is_idempotent_for_in_flight_beads() {
    let fx = fixture(base_config()).await;
    fx.beads.put_beads("alpha", vec![ready_bead("alpha-1", 1)]);

    fx.scheduler.run_tick().await;
    let report = fx.scheduler.run_tick().await;

    assert_eq!(report.admitted, 0);
    assert_eq!(fx.store.list_running().await.unwrap().len(), 1);
    assert_eq!(fx.pid_backend.launch_count(), 1);
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

#[tokio::test]
async fn rate_limit_denial_names_the_window() {
    let mut config = base_config();
    config.rate_limits.window_5h_cap = 1;
    let fx = fixture(config).await;

    // The window is already full.
    fx.store
        .insert_dispatch(NewDispatch {
            bead_id: "old".to_string(),
            project: "alpha".to_string(),
            agent_id: "agent-old".to_string(),
            provider: "claude-fast".to_string(),
            tier: Tier::Fast,
            backend: Backend::Pid,
            pid: None,
            session_name: None,
            stage: None,
            retries: 0,
            log_path: None,
            authed: true,
        })
        .await
        .unwrap();

    fx.beads.put_beads("alpha", vec![ready_bead("alpha-1", 1)]);
    let report = fx.scheduler.run_tick().await;

    assert_eq!(report.admitted, 0);
    assert_eq!(report.denied, 1);
    assert_eq!(fx.pid_backend.launch_count(), 0);

    let events = fx.store.recent_health_events(10).await.unwrap();
    let denial = events
        .iter()
        .find(|e| e.event_type == HealthEventType::AdmissionDenied)
        .expect("admission_denied event");
    assert!(denial.details.contains("5h window"), "details: {}", denial.details);
    assert_eq!(denial.bead_id.as_deref(), Some("alpha-1"));
}

#[tokio::test]
async fn max_per_tick_caps_admissions() {
    let mut config = base_config();
    config.general.max_per_tick = 2;
    let fx = fixture(config).await;
    fx.beads.put_beads(
        "alpha",
        vec![
            ready_bead("alpha-1", 1),
            ready_bead("alpha-2", 2),
            ready_bead("alpha-3", 3),
        ],
    );

    let report = fx.scheduler.run_tick().await;
    assert_eq!(report.admitted, 2);
    assert_eq!(fx.store.list_running().await.unwrap().len(), 2);
}

// ---------------------------------------------------------------------------
// Selection rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn candidates_sorted_by_priority_then_id() {
    let mut config = base_config();
    config.general.max_per_tick = 1;
    let fx = fixture(config).await;
    fx.beads.put_beads(
        "alpha",
        vec![
            ready_bead("alpha-9", 5),
            ready_bead("alpha-2", 1),
            ready_bead("alpha-1", 1),
        ],
    );

    fx.scheduler.run_tick().await;
    let running = fx.store.list_running().await.unwrap();
    assert_eq!(running.len(), 1);
    // priority 1 wins; id tie-break picks alpha-1.
    assert_eq!(running[0].bead_id, "alpha-1");
}

#[tokio::test]
async fn non_ready_and_dependent_beads_are_filtered() {
    let fx = fixture(base_config()).await;
    let mut blocked = ready_bead("alpha-2", 1);
    blocked.dependencies = vec!["alpha-1".to_string()];
    let mut in_review = ready_bead("alpha-3", 1);
    in_review.stage = BeadStage::Review;
    // alpha-4 depends on something not in the open listing: resolved.
    let mut resolved = ready_bead("alpha-4", 2);
    resolved.dependencies = vec!["alpha-0".to_string()];

    fx.beads.put_beads(
        "alpha",
        vec![ready_bead("alpha-1", 1), blocked, in_review, resolved],
    );

    fx.scheduler.run_tick().await;
    let mut beads: Vec<String> = fx
        .store
        .list_running()
        .await
        .unwrap()
        .into_iter()
        .map(|d| d.bead_id)
        .collect();
    beads.sort();
    assert_eq!(beads, vec!["alpha-1".to_string(), "alpha-4".to_string()]);
}

#[tokio::test]
async fn projects_interleave_round_robin() {
    let mut config = base_config();
    config.general.max_per_tick = 3;
    config.projects.insert(
        "beta".to_string(),
        ProjectConfig {
            enabled: true,
            priority: 2,
            workspace: "/tmp".to_string(),
            ..ProjectConfig::default()
        },
    );
    let fx = fixture(config).await;
    fx.beads.put_beads(
        "alpha",
        vec![ready_bead("alpha-1", 1), ready_bead("alpha-2", 2)],
    );
    fx.beads.put_beads(
        "beta",
        vec![ready_bead("beta-1", 1), ready_bead("beta-2", 2)],
    );

    fx.scheduler.run_tick().await;

    // One per project per cycle: alpha-1, beta-1, then alpha-2.
    let order: Vec<String> = fx
        .pid_backend
        .launched()
        .iter()
        .map(|req| {
            req.env
                .iter()
                .find(|(k, _)| k == "CORTEX_BEAD_ID")
                .map(|(_, v)| v.clone())
                .unwrap()
        })
        .collect();
    assert_eq!(order, vec!["alpha-1", "beta-1", "alpha-2"]);
}

#[tokio::test]
async fn failing_project_is_skipped_for_the_tick() {
    let mut config = base_config();
    config.projects.insert(
        "beta".to_string(),
        ProjectConfig {
            enabled: true,
            priority: 2,
            workspace: "/tmp".to_string(),
            ..ProjectConfig::default()
        },
    );
    let fx = fixture(config).await;
    fx.beads.fail_project("alpha");
    fx.beads.put_beads("beta", vec![ready_bead("beta-1", 1)]);

    let report = fx.scheduler.run_tick().await;
    assert_eq!(report.skipped_projects, 1);
    assert_eq!(report.admitted, 1);
    let running = fx.store.list_running().await.unwrap();
    assert_eq!(running[0].bead_id, "beta-1");
}

// ---------------------------------------------------------------------------
// Retry consumption
// ---------------------------------------------------------------------------

#[tokio::test]
async fn pending_retry_is_consumed_before_fresh_candidates() {
    let mut config = base_config();
    config.general.max_per_tick = 1;
    let fx = fixture(config).await;

    // A failed fast attempt, requeued at balanced.
    let old_id = fx
        .store
        .insert_dispatch(NewDispatch {
            bead_id: "alpha-1".to_string(),
            project: "alpha".to_string(),
            agent_id: "agent-old".to_string(),
            provider: "claude-fast".to_string(),
            tier: Tier::Fast,
            backend: Backend::Pid,
            pid: Some(11),
            session_name: None,
            stage: None,
            retries: 0,
            log_path: None,
            authed: false,
        })
        .await
        .unwrap();
    fx.store.mark_pending_retry(old_id, Tier::Balanced).await.unwrap();

    // A fresh candidate competes for the single slot.
    fx.beads.put_beads("alpha", vec![ready_bead("alpha-2", 1)]);

    let report = fx.scheduler.run_tick().await;
    assert_eq!(report.retried, 1);
    assert_eq!(report.admitted, 0);

    let old = fx.store.get_dispatch(old_id).await.unwrap().unwrap();
    assert_eq!(old.status, DispatchStatus::Retried);

    let running = fx.store.list_running().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].bead_id, "alpha-1");
    assert_eq!(running[0].tier, Tier::Balanced);
    assert_eq!(running[0].retries, 1);
    assert_eq!(running[0].provider, "claude-balanced");
}

// ---------------------------------------------------------------------------
// Outcome policy (retry escalation, max retries, backoff)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_outcome_requeues_with_escalated_tier() {
    let fx = fixture(base_config()).await;
    fx.beads.put_beads("alpha", vec![ready_bead("alpha-1", 1)]);
    fx.scheduler.run_tick().await;
    let id = fx.store.list_running().await.unwrap()[0].id;

    // Simulate the watcher's failed terminal write plus outcome.
    fx.store
        .finish_dispatch(id, DispatchStatus::Failed, Some(1), None, None)
        .await
        .unwrap();
    fx.scheduler
        .handle_outcome(DispatchOutcome {
            dispatch_id: id,
            bead_id: "alpha-1".to_string(),
            project: "alpha".to_string(),
            provider: "claude-fast".to_string(),
            tier: Tier::Fast,
            retries: 0,
            status: DispatchStatus::Failed,
            exit_code: 1,
            failure_category: None,
        })
        .await;

    let row = fx.store.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(row.status, DispatchStatus::PendingRetry);
    assert_eq!(row.tier, Tier::Balanced);
    assert_eq!(row.retries, 1);
    assert!(fx.handles.lock().unwrap().is_empty());
}

#[tokio::test]
async fn exhausted_retries_block_the_bead() {
    let fx = fixture(base_config()).await;
    fx.beads.put_beads("alpha", vec![ready_bead("alpha-1", 1)]);
    fx.scheduler.run_tick().await;
    let id = fx.store.list_running().await.unwrap()[0].id;

    fx.store
        .finish_dispatch(id, DispatchStatus::Failed, Some(1), None, None)
        .await
        .unwrap();
    // retries == max_retries (2): terminal, no requeue.
    fx.scheduler
        .handle_outcome(DispatchOutcome {
            dispatch_id: id,
            bead_id: "alpha-1".to_string(),
            project: "alpha".to_string(),
            provider: "claude-fast".to_string(),
            tier: Tier::Premium,
            retries: 2,
            status: DispatchStatus::Failed,
            exit_code: 1,
            failure_category: None,
        })
        .await;

    let row = fx.store.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(row.status, DispatchStatus::Failed);
    assert!(event_types(&fx.store).await.contains(&HealthEventType::MaxRetries));

    // The safety block keeps the bead out even though the external store
    // still lists it ready.
    let report = fx.scheduler.run_tick().await;
    assert_eq!(report.admitted, 0);
}

// ---------------------------------------------------------------------------
// Pause / dry-run / overlap
// ---------------------------------------------------------------------------

#[tokio::test]
async fn paused_scheduler_skips_selection() {
    let fx = fixture(base_config()).await;
    fx.beads.put_beads("alpha", vec![ready_bead("alpha-1", 1)]);

    fx.scheduler.pause().await;
    assert!(fx.scheduler.is_paused());
    let report = fx.scheduler.run_tick().await;
    assert!(report.skipped);
    assert_eq!(fx.pid_backend.launch_count(), 0);

    fx.scheduler.resume().await;
    let report = fx.scheduler.run_tick().await;
    assert_eq!(report.admitted, 1);
}

#[tokio::test]
async fn dry_run_selects_without_launching() {
    let fx = fixture_with(base_config(), true).await;
    fx.beads.put_beads("alpha", vec![ready_bead("alpha-1", 1)]);

    let report = fx.scheduler.run_tick().await;
    assert_eq!(report.admitted, 1);
    assert_eq!(fx.pid_backend.launch_count(), 0);
    assert!(fx.store.list_running().await.unwrap().is_empty());
    assert!(fx.beads.transitions().is_empty());
}

// ---------------------------------------------------------------------------
// Launch failure handling
// ---------------------------------------------------------------------------

#[tokio::test]
async fn launch_failure_aborts_only_that_bead() {
    let fx = fixture(base_config()).await;
    fx.pid_backend
        .fail_next_with(cx_dispatch::DispatchError::LaunchFailed("boom".into()));
    fx.beads.put_beads(
        "alpha",
        vec![ready_bead("alpha-1", 1), ready_bead("alpha-2", 2)],
    );

    let report = fx.scheduler.run_tick().await;
    assert_eq!(report.admitted, 1);
    let running = fx.store.list_running().await.unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].bead_id, "alpha-2");
    assert!(event_types(&fx.store)
        .await
        .contains(&HealthEventType::DispatchLaunchFailed));
}

// ---------------------------------------------------------------------------
// Control surface (cancel / retry)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancel_signals_executor_and_is_idempotent() {
    let fx = fixture(base_config()).await;
    fx.beads.put_beads("alpha", vec![ready_bead("alpha-1", 1)]);
    fx.scheduler.run_tick().await;
    let id = fx.store.list_running().await.unwrap()[0].id;

    fx.scheduler.cancel_dispatch(id).await.unwrap();
    let row = fx.store.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(row.status, DispatchStatus::Cancelled);
    assert_eq!(fx.pid_backend.killed().len(), 1);

    // Terminal cancel is a no-op success, no second kill.
    fx.scheduler.cancel_dispatch(id).await.unwrap();
    assert_eq!(fx.pid_backend.killed().len(), 1);
    assert!(event_types(&fx.store)
        .await
        .contains(&HealthEventType::DispatchCancelled));
}

#[tokio::test]
async fn manual_retry_reopens_terminal_dispatch() {
    let fx = fixture(base_config()).await;
    fx.beads.put_beads("alpha", vec![ready_bead("alpha-1", 1)]);
    fx.scheduler.run_tick().await;
    let id = fx.store.list_running().await.unwrap()[0].id;

    // Live dispatch cannot be retried.
    assert!(fx.scheduler.retry_dispatch(id).await.is_err());

    fx.store
        .finish_dispatch(id, DispatchStatus::Failed, Some(1), None, None)
        .await
        .unwrap();
    fx.scheduler.retry_dispatch(id).await.unwrap();
    let row = fx.store.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(row.status, DispatchStatus::PendingRetry);

    // Outcomes channel stays quiet throughout this test.
    assert!(fx.outcomes.try_recv().is_err());
}
