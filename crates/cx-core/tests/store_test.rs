use chrono::{Duration, Utc};
use cx_core::store::StateDb;
use cx_core::types::{Backend, DispatchStatus, FailureCategory, HealthEventType, NewDispatch, Tier};

fn new_dispatch(bead: &str) -> NewDispatch {
    NewDispatch {
        bead_id: bead.to_string(),
        project: "api-server".to_string(),
        agent_id: format!("agent-{bead}"),
        provider: "claude-fast".to_string(),
        tier: Tier::Fast,
        backend: Backend::Pid,
        pid: Some(4242),
        session_name: None,
        stage: Some("ready".to_string()),
        retries: 0,
        log_path: Some("/tmp/cortex/logs/d1.log".to_string()),
        authed: true,
    }
}

#[tokio::test]
async fn insert_and_fetch_roundtrip() {
    let db = StateDb::open_in_memory().await.unwrap();
    let id = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();

    let dispatch = db.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(dispatch.bead_id, "b-1");
    assert_eq!(dispatch.status, DispatchStatus::Running);
    assert_eq!(dispatch.tier, Tier::Fast);
    assert_eq!(dispatch.pid, Some(4242));
    assert!(dispatch.completed_at.is_none());
    assert!(dispatch.authed);
}

#[tokio::test]
async fn finish_is_conditional_and_idempotent() {
    let db = StateDb::open_in_memory().await.unwrap();
    let id = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();

    let first = db
        .finish_dispatch(
            id,
            DispatchStatus::Failed,
            Some(1),
            Some(FailureCategory::TestFailure),
            Some("3 tests failed".to_string()),
        )
        .await
        .unwrap();
    assert!(first);

    // A second terminal write loses the conditional update.
    let second = db
        .finish_dispatch(id, DispatchStatus::Completed, Some(0), None, None)
        .await
        .unwrap();
    assert!(!second);

    let dispatch = db.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Failed);
    assert_eq!(dispatch.failure_category, Some(FailureCategory::TestFailure));
    assert!(dispatch.completed_at.is_some());
    assert!(dispatch.duration_s.is_some());
}

#[tokio::test]
async fn cancel_does_not_get_overwritten_by_watcher() {
    let db = StateDb::open_in_memory().await.unwrap();
    let id = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();

    assert!(db.cancel_dispatch(id).await.unwrap());
    // Watcher observing exit must not clobber the cancelled row.
    let overwrote = db
        .finish_dispatch(id, DispatchStatus::Completed, Some(0), None, None)
        .await
        .unwrap();
    assert!(!overwrote);

    // Cancel is idempotent on terminal rows.
    assert!(!db.cancel_dispatch(id).await.unwrap());
    let dispatch = db.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::Cancelled);
}

#[tokio::test]
async fn pending_retry_escalates_and_blocks_in_flight() {
    let db = StateDb::open_in_memory().await.unwrap();
    let id = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();

    assert!(db.mark_pending_retry(id, Tier::Balanced).await.unwrap());
    let dispatch = db.get_dispatch(id).await.unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::PendingRetry);
    assert_eq!(dispatch.tier, Tier::Balanced);
    assert_eq!(dispatch.retries, 1);
    assert_eq!(dispatch.exit_code, Some(-1));
    assert_eq!(dispatch.stage.as_deref(), Some("failed"));

    // pending_retry keeps the bead in flight.
    let in_flight = db.in_flight_bead_ids().await.unwrap();
    assert!(in_flight.contains("b-1"));

    // Consuming the row marks it retried and frees the bead.
    assert!(db.mark_retried(id).await.unwrap());
    assert!(!db.mark_retried(id).await.unwrap());
    let in_flight = db.in_flight_bead_ids().await.unwrap();
    assert!(!in_flight.contains("b-1"));
}

#[tokio::test]
async fn failed_row_can_move_to_pending_retry() {
    let db = StateDb::open_in_memory().await.unwrap();
    let id = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();
    db.finish_dispatch(id, DispatchStatus::Failed, Some(2), None, None)
        .await
        .unwrap();

    assert!(db.mark_pending_retry(id, Tier::Balanced).await.unwrap());
    let dispatch = db.get_dispatch(id).await.unwrap().unwrap();
    // Completion fields from the failed transition are preserved.
    assert_eq!(dispatch.exit_code, Some(2));
    assert_eq!(dispatch.retries, 1);
}

#[tokio::test]
async fn interrupted_sweep_clears_all_running() {
    let db = StateDb::open_in_memory().await.unwrap();
    db.insert_dispatch(new_dispatch("b-1")).await.unwrap();
    db.insert_dispatch(new_dispatch("b-2")).await.unwrap();
    let done = db.insert_dispatch(new_dispatch("b-3")).await.unwrap();
    db.finish_dispatch(done, DispatchStatus::Completed, Some(0), None, None)
        .await
        .unwrap();

    let swept = db.mark_all_running_interrupted().await.unwrap();
    assert_eq!(swept, 2);
    assert!(db.list_running().await.unwrap().is_empty());

    let d3 = db.get_dispatch(done).await.unwrap().unwrap();
    assert_eq!(d3.status, DispatchStatus::Completed);
}

#[tokio::test]
async fn authed_window_counts() {
    let db = StateDb::open_in_memory().await.unwrap();
    db.insert_dispatch(new_dispatch("b-1")).await.unwrap();
    let mut unauthed = new_dispatch("b-2");
    unauthed.authed = false;
    db.insert_dispatch(unauthed).await.unwrap();

    let five_hours_ago = Utc::now() - Duration::hours(5);
    let count = db.authed_count_since(five_hours_ago).await.unwrap();
    assert_eq!(count, 1);

    let in_the_future = Utc::now() + Duration::minutes(1);
    assert_eq!(db.authed_count_since(in_the_future).await.unwrap(), 0);
}

#[tokio::test]
async fn stuck_query_filters_by_tier_and_age() {
    let db = StateDb::open_in_memory().await.unwrap();
    let id = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();

    // Nothing is older than a cutoff in the past.
    let past = Utc::now() - Duration::hours(1);
    assert!(db.stuck_running_by_tier(Tier::Fast, past).await.unwrap().is_empty());

    // Everything running is older than a cutoff in the future.
    let future = Utc::now() + Duration::seconds(5);
    let stuck = db.stuck_running_by_tier(Tier::Fast, future).await.unwrap();
    assert_eq!(stuck.len(), 1);
    assert_eq!(stuck[0].id, id);

    // Wrong tier never matches.
    assert!(db
        .stuck_running_by_tier(Tier::Premium, future)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn health_events_append_and_probe() {
    let db = StateDb::open_in_memory().await.unwrap();
    db.append_health_event(HealthEventType::TickSummary, "admitted=2", None, None)
        .await
        .unwrap();
    db.append_health_event(
        HealthEventType::AdmissionDenied,
        "5h window cap reached",
        None,
        Some("b-1".to_string()),
    )
    .await
    .unwrap();

    let events = db.recent_health_events(10).await.unwrap();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].event_type, HealthEventType::AdmissionDenied);
    assert_eq!(events[0].bead_id.as_deref(), Some("b-1"));

    let recent = db
        .has_recent_event(HealthEventType::GatewayCritical, Utc::now() - Duration::minutes(5))
        .await
        .unwrap();
    assert!(!recent);
}

#[tokio::test]
async fn lease_is_exclusive_per_bead() {
    let db = StateDb::open_in_memory().await.unwrap();
    let id = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();

    assert!(db.acquire_lease("b-1", "scheduler", Some(id)).await.unwrap());
    assert!(!db.acquire_lease("b-1", "other", Some(id)).await.unwrap());
    assert!(db.heartbeat_lease("b-1").await.unwrap());
    assert!(db.release_lease("b-1").await.unwrap());
    assert!(!db.release_lease("b-1").await.unwrap());
}

#[tokio::test]
async fn lease_gc_drops_stale_and_dangling() {
    let db = StateDb::open_in_memory().await.unwrap();
    let live = db.insert_dispatch(new_dispatch("b-live")).await.unwrap();
    let dead = db.insert_dispatch(new_dispatch("b-dead")).await.unwrap();
    db.finish_dispatch(dead, DispatchStatus::Completed, Some(0), None, None)
        .await
        .unwrap();

    db.acquire_lease("b-live", "scheduler", Some(live)).await.unwrap();
    db.acquire_lease("b-dead", "scheduler", Some(dead)).await.unwrap();
    db.acquire_lease("b-unbound", "scheduler", None).await.unwrap();

    // Cutoff in the past: only dangling leases go.
    let collected = db.gc_leases(Utc::now() - Duration::minutes(4)).await.unwrap();
    assert_eq!(collected, 2);
    assert!(!db.acquire_lease("b-live", "other", Some(live)).await.unwrap());
}

#[tokio::test]
async fn zombie_correlation_window() {
    let db = StateDb::open_in_memory().await.unwrap();
    let id = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();
    db.finish_dispatch(id, DispatchStatus::Failed, Some(1), None, None)
        .await
        .unwrap();

    let day_ago = Utc::now() - Duration::hours(24);
    let hit = db.recent_dispatch_with_pid(4242, day_ago).await.unwrap();
    assert_eq!(hit.map(|d| d.id), Some(id));

    let none = db.recent_dispatch_with_pid(9999, day_ago).await.unwrap();
    assert!(none.is_none());
}

#[tokio::test]
async fn output_tail_upsert() {
    let db = StateDb::open_in_memory().await.unwrap();
    let id = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();

    db.upsert_output_tail(id, "first chunk").await.unwrap();
    db.upsert_output_tail(id, "final tail").await.unwrap();
    assert_eq!(db.output_tail(id).await.unwrap().as_deref(), Some("final tail"));
    assert!(db.output_tail(id + 1).await.unwrap().is_none());
}

#[tokio::test]
async fn bead_history_is_newest_first() {
    let db = StateDb::open_in_memory().await.unwrap();
    let first = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();
    db.finish_dispatch(first, DispatchStatus::Failed, Some(1), None, None)
        .await
        .unwrap();
    let mut retry = new_dispatch("b-1");
    retry.tier = Tier::Balanced;
    retry.retries = 1;
    let second = db.insert_dispatch(retry).await.unwrap();

    let history = db.dispatches_for_bead("b-1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, second);
    assert_eq!(history[0].tier, Tier::Balanced);
    assert_eq!(history[1].id, first);
}

#[tokio::test]
async fn reopen_for_retry_requires_terminal() {
    let db = StateDb::open_in_memory().await.unwrap();
    let running = db.insert_dispatch(new_dispatch("b-1")).await.unwrap();
    assert!(!db.reopen_for_retry(running).await.unwrap());

    db.finish_dispatch(running, DispatchStatus::Failed, Some(1), None, None)
        .await
        .unwrap();
    assert!(db.reopen_for_retry(running).await.unwrap());
    let dispatch = db.get_dispatch(running).await.unwrap().unwrap();
    assert_eq!(dispatch.status, DispatchStatus::PendingRetry);
    assert_eq!(dispatch.retries, 0);
}
