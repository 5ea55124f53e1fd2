//! Tick-driven scheduler: candidate selection, admission, and dispatch.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use cx_api::state::{ControlError, SchedulerControl};
use cx_core::config::{Config, ConfigHandle, ProjectConfig, ProviderConfig};
use cx_core::store::StateDb;
use cx_core::types::{
    Backend, Bead, BeadStage, DispatchStatus, FailureCategory, HealthEventType, NewDispatch, Tier,
};
use cx_dispatch::beads::BeadSource;
use cx_dispatch::watcher::{spawn_watcher, DispatchOutcome};
use cx_dispatch::{DispatchRequest, DispatcherSet};
use cx_harness::rate_limiter::{Admission, RateLimiter};
use cx_harness::shutdown::ShutdownSignal;
use cx_telemetry::metrics::MetricsCollector;

/// Providers with this many consecutive rate-limit/timeout failures are
/// filtered from candidate resolution until they succeed again.
const WEAKNESS_THRESHOLD: u32 = 3;

/// How long a bead sits out after a failed attempt before it may be
/// re-admitted as a fresh candidate.
const RETRY_BACKOFF_SECS: i64 = 120;

/// Live execution handles, keyed by dispatch id. Shared with the stuck
/// detector so kills go through the same backend handle the launch
/// registered.
pub type HandleMap = Arc<Mutex<HashMap<i64, i64>>>;

/// What one tick did; the numbers feed the tick-summary health event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TickReport {
    /// Fresh dispatches launched.
    pub admitted: usize,
    /// pending_retry rows re-launched.
    pub retried: usize,
    /// Candidates turned away by the rate limiter.
    pub denied: usize,
    /// Projects skipped because their bead lister failed.
    pub skipped_projects: usize,
    /// Tick skipped entirely (paused, or a previous tick still running).
    pub skipped: bool,
}

#[derive(Default)]
struct SchedulerInner {
    /// Per-bead earliest next admission after a failure.
    backoffs: HashMap<String, DateTime<Utc>>,
    /// Beads that exhausted max retries; never re-admitted this process
    /// lifetime even if the external store still lists them ready.
    safety_blocks: HashSet<String>,
    /// Consecutive rate-limit/timeout failures per provider.
    weakness: HashMap<String, u32>,
}

/// The tick-driven scheduler.
pub struct Scheduler {
    store: Arc<StateDb>,
    dispatchers: DispatcherSet,
    beads: Arc<dyn BeadSource>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    config: ConfigHandle,
    outcomes: flume::Sender<DispatchOutcome>,
    shutdown: ShutdownSignal,
    handles: HandleMap,
    paused: AtomicBool,
    dry_run: bool,
    /// Ticks never overlap; a tick that would is skipped.
    tick_lock: tokio::sync::Mutex<()>,
    inner: Mutex<SchedulerInner>,
    /// Lease-holder identity for claim leases.
    holder_id: String,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateDb>,
        dispatchers: DispatcherSet,
        beads: Arc<dyn BeadSource>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsCollector>,
        config: ConfigHandle,
        outcomes: flume::Sender<DispatchOutcome>,
        shutdown: ShutdownSignal,
        handles: HandleMap,
        dry_run: bool,
    ) -> Self {
        Self {
            store,
            dispatchers,
            beads,
            limiter,
            metrics,
            config,
            outcomes,
            shutdown,
            handles,
            paused: AtomicBool::new(false),
            dry_run,
            tick_lock: tokio::sync::Mutex::new(()),
            inner: Mutex::new(SchedulerInner::default()),
            holder_id: format!("cortexd-{}", Uuid::new_v4()),
        }
    }

    /// Atomic config swap at a safe boundary; the running tick keeps its
    /// snapshot, the next tick sees the new one.
    pub fn set_config(&self, config: Config) {
        self.config.swap(config);
    }

    /// Periodic tick loop; returns when shutdown triggers.
    pub async fn start(&self) {
        let mut rx = self.shutdown.subscribe();
        let tick_interval =
            std::time::Duration::from_secs(self.config.snapshot().general.tick_interval);
        let mut ticker = tokio::time::interval(tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First interval tick fires immediately; that is the startup tick.

        loop {
            tokio::select! {
                _ = rx.recv() => {
                    info!("scheduler loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.run_tick().await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // The tick
    // -----------------------------------------------------------------------

    /// One admission pass. Idempotent against in-flight work from previous
    /// ticks: a bead with a `running` or `pending_retry` dispatch is never
    /// admitted again.
    pub async fn run_tick(&self) -> TickReport {
        // Ticks run strictly sequentially; an overlapping tick is skipped.
        let Ok(_guard) = self.tick_lock.try_lock() else {
            warn!("previous tick still running, skipping this tick");
            return TickReport { skipped: true, ..TickReport::default() };
        };

        if self.paused.load(Ordering::SeqCst) {
            debug!("scheduler paused, skipping selection");
            return TickReport { skipped: true, ..TickReport::default() };
        }

        let cfg = self.config.snapshot();
        self.limiter.refresh().await;

        let mut report = TickReport::default();
        let budget = cfg.general.max_per_tick;

        // pending_retry rows are consumed before fresh candidates.
        self.consume_pending_retries(&cfg, budget, &mut report).await;

        if report.admitted + report.retried < budget {
            self.admit_fresh_candidates(&cfg, budget, &mut report).await;
        }

        let details = format!(
            "admitted={} retried={} denied={} skipped_projects={}",
            report.admitted, report.retried, report.denied, report.skipped_projects
        );
        if let Err(e) = self
            .store
            .append_health_event(HealthEventType::TickSummary, details, None, None)
            .await
        {
            warn!(error = %e, "tick summary event failed");
        }

        info!(
            admitted = report.admitted,
            retried = report.retried,
            denied = report.denied,
            "tick complete"
        );
        report
    }

    async fn consume_pending_retries(&self, cfg: &Config, budget: usize, report: &mut TickReport) {
        let pending = match self.store.list_pending_retry().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "pending_retry listing failed");
                return;
            }
        };

        for row in pending {
            if report.admitted + report.retried >= budget {
                return;
            }

            let Some((provider_name, provider)) = self.resolve_provider(cfg, row.tier) else {
                warn!(dispatch_id = row.id, tier = %row.tier, "no provider for retry tier");
                continue;
            };

            if provider.authed {
                match self.limiter.admit(&self.store, Utc::now()).await {
                    Ok(Admission::Granted) => {}
                    Ok(Admission::Denied { reason, .. }) => {
                        self.record_denial(&row.bead_id, &reason).await;
                        report.denied += 1;
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "rate limiter unavailable, skipping retry");
                        continue;
                    }
                }
            }

            if self.dry_run {
                info!(dispatch_id = row.id, bead_id = %row.bead_id, "dry-run: would retry");
                report.retried += 1;
                continue;
            }

            let backend = cfg.backend_for_retry(row.tier);
            let project = cfg.projects.get(&row.project).cloned().unwrap_or_default();
            let prompt = format!(
                "Resume work on bead {} in project {}. The previous attempt failed; \
                 review the bead, finish the work, and leave the tree green.",
                row.bead_id, row.project
            );
            let launched = self
                .launch(
                    cfg,
                    &row.project,
                    &project,
                    &row.bead_id,
                    row.tier,
                    backend,
                    &provider_name,
                    &provider,
                    row.retries,
                    prompt,
                )
                .await;

            if launched.is_some() {
                if let Err(e) = self.store.mark_retried(row.id).await {
                    warn!(dispatch_id = row.id, error = %e, "mark_retried failed");
                }
                report.retried += 1;
            }
        }
    }

    async fn admit_fresh_candidates(&self, cfg: &Config, budget: usize, report: &mut TickReport) {
        let in_flight = match self.store.in_flight_bead_ids().await {
            Ok(set) => set,
            Err(e) => {
                warn!(error = %e, "in-flight query failed, aborting tick selection");
                return;
            }
        };

        // One sorted candidate queue per enabled project, in priority order.
        let mut queues: Vec<(String, ProjectConfig, VecDeque<Bead>)> = Vec::new();
        for (name, project) in cfg.projects_in_priority_order() {
            let listing = match self
                .beads
                .list_open(name, std::path::Path::new(&project.workspace), &project.bead_dir)
                .await
            {
                Ok(beads) => beads,
                Err(e) => {
                    warn!(project = name, error = %e, "bead lister failed, skipping project");
                    report.skipped_projects += 1;
                    continue;
                }
            };

            let open_ids: HashSet<&str> = listing.iter().map(|b| b.id.as_str()).collect();
            let now = Utc::now();
            let mut candidates: Vec<Bead> = {
                let inner = self.inner.lock().expect("scheduler lock poisoned");
                listing
                    .iter()
                    .filter(|b| b.stage == BeadStage::Ready)
                    // A dependency listed among open beads is unresolved.
                    .filter(|b| b.dependencies.iter().all(|d| !open_ids.contains(d.as_str())))
                    .filter(|b| !in_flight.contains(&b.id))
                    .filter(|b| inner.backoffs.get(&b.id).map(|until| *until <= now).unwrap_or(true))
                    .filter(|b| !inner.safety_blocks.contains(&b.id))
                    .cloned()
                    .collect()
            };
            candidates.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.id.cmp(&b.id)));

            queues.push((name.to_string(), project.clone(), candidates.into()));
        }

        // Round-robin across projects, popping one candidate per cycle.
        loop {
            let mut progressed = false;
            for (name, project, queue) in &mut queues {
                if report.admitted + report.retried >= budget {
                    return;
                }
                let Some(bead) = queue.pop_front() else {
                    continue;
                };
                progressed = true;
                self.admit_candidate(cfg, name, project, &bead, report).await;
            }
            if !progressed {
                return;
            }
        }
    }

    async fn admit_candidate(
        &self,
        cfg: &Config,
        project_name: &str,
        project: &ProjectConfig,
        bead: &Bead,
        report: &mut TickReport,
    ) {
        let tier = project.default_tier.unwrap_or(Tier::Fast);

        let Some((provider_name, provider)) = self.resolve_provider(cfg, tier) else {
            warn!(bead_id = %bead.id, tier = %tier, "no provider for tier, skipping bead");
            self.record_launch_failure(&bead.id, None, "no provider for tier").await;
            return;
        };

        // A rate-limit denial skips the candidate without consuming a slot.
        if provider.authed {
            match self.limiter.admit(&self.store, Utc::now()).await {
                Ok(Admission::Granted) => {}
                Ok(Admission::Denied { reason, .. }) => {
                    self.record_denial(&bead.id, &reason).await;
                    report.denied += 1;
                    return;
                }
                Err(e) => {
                    warn!(bead_id = %bead.id, error = %e, "rate limiter unavailable");
                    return;
                }
            }
        }

        if self.dry_run {
            info!(
                bead_id = %bead.id,
                project = project_name,
                tier = %tier,
                provider = %provider_name,
                "dry-run: would dispatch"
            );
            report.admitted += 1;
            return;
        }

        let backend = cfg.backend_for_tier(tier);
        let prompt = build_prompt(bead);
        let launched = self
            .launch(
                cfg,
                project_name,
                project,
                &bead.id,
                tier,
                backend,
                &provider_name,
                &provider,
                0,
                prompt,
            )
            .await;

        if launched.is_none() {
            return;
        }
        report.admitted += 1;

        // Stage transition failure never aborts the already-launched process.
        if let Err(e) = self
            .beads
            .set_stage(
                std::path::Path::new(&project.workspace),
                &project.bead_dir,
                &bead.id,
                BeadStage::InProgress,
            )
            .await
        {
            warn!(bead_id = %bead.id, error = %e, "stage transition to in_progress failed");
        }
    }

    /// Launch one executor and record the dispatch row. Returns the new
    /// dispatch id, or None when this bead was aborted (event recorded).
    #[allow(clippy::too_many_arguments)]
    async fn launch(
        &self,
        cfg: &Config,
        project_name: &str,
        project: &ProjectConfig,
        bead_id: &str,
        tier: Tier,
        backend: Backend,
        provider_name: &str,
        provider: &ProviderConfig,
        retries: i64,
        prompt: String,
    ) -> Option<i64> {
        let agent_id = format!("{}-{}", bead_id, &Uuid::new_v4().to_string()[..8]);
        let log_path = PathBuf::from(&cfg.dispatch.log_dir).join(format!("{agent_id}.log"));
        let cmd = cfg
            .dispatch
            .cli
            .get(&provider.cli)
            .map(|c| c.cmd.clone())
            .unwrap_or_else(|| provider.cli.clone());

        let request = DispatchRequest {
            agent_id: agent_id.clone(),
            prompt,
            provider_cmd: cmd,
            model: provider.model.clone(),
            thinking_level: None,
            work_dir: PathBuf::from(&project.workspace),
            log_path: log_path.clone(),
            env: vec![
                ("CORTEX_BEAD_ID".to_string(), bead_id.to_string()),
                ("CORTEX_PROJECT".to_string(), project_name.to_string()),
            ],
        };

        let dispatcher = self.dispatchers.for_backend(backend);
        let handle = match dispatcher.dispatch(request).await {
            Ok(handle) => handle,
            Err(e) => {
                warn!(bead_id = %bead_id, error = %e, "launch failed");
                self.record_launch_failure(bead_id, None, &e.to_string()).await;
                return None;
            }
        };

        let session_name = dispatcher.session_name(handle).await;
        let new = NewDispatch {
            bead_id: bead_id.to_string(),
            project: project_name.to_string(),
            agent_id,
            provider: provider_name.to_string(),
            tier,
            backend,
            pid: (backend == Backend::Pid).then_some(handle as i32),
            session_name,
            stage: Some(BeadStage::InProgress.as_str().to_string()),
            retries,
            log_path: Some(log_path.to_string_lossy().into_owned()),
            authed: provider.authed,
        };

        // The record is what makes the launch durable; if it cannot be
        // written the executor must not keep running.
        let id = match self.insert_with_retry(new).await {
            Ok(id) => id,
            Err(e) => {
                warn!(bead_id = %bead_id, error = %e, "dispatch record failed, killing executor");
                let _ = dispatcher.kill(handle).await;
                self.record_launch_failure(bead_id, None, &format!("record failed: {e}")).await;
                return None;
            }
        };

        self.handles.lock().expect("handle map poisoned").insert(id, handle);
        if let Ok(false) = self.store.acquire_lease(bead_id, &self.holder_id, Some(id)).await {
            debug!(bead_id = %bead_id, "lease already held");
        }

        match self.store.get_dispatch(id).await {
            Ok(Some(row)) => {
                spawn_watcher(
                    self.store.clone(),
                    dispatcher,
                    row,
                    handle,
                    self.outcomes.clone(),
                    self.shutdown.clone(),
                );
            }
            other => warn!(dispatch_id = id, ?other, "dispatch row readback failed"),
        }

        self.metrics.increment_counter("cortex_dispatches_total", &[]);
        info!(
            dispatch_id = id,
            bead_id = %bead_id,
            project = project_name,
            tier = %tier,
            backend = %backend,
            provider = provider_name,
            "dispatch launched"
        );
        Some(id)
    }

    async fn insert_with_retry(
        &self,
        new: NewDispatch,
    ) -> Result<i64, cx_core::store::StoreError> {
        match self.store.insert_dispatch(new.clone()).await {
            Ok(id) => Ok(id),
            Err(first) => {
                warn!(error = %first, "dispatch insert failed, retrying once");
                tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                self.store.insert_dispatch(new).await
            }
        }
    }

    /// First provider whose tier matches, filtered by the known-weakness
    /// tracker; when the filter empties the list the unfiltered list is used
    /// so a misbehaving upstream cannot livelock scheduling.
    fn resolve_provider(&self, cfg: &Config, tier: Tier) -> Option<(String, ProviderConfig)> {
        let matching: Vec<(&String, &ProviderConfig)> = cfg
            .providers
            .iter()
            .filter(|(_, p)| p.tier == tier)
            .collect();
        if matching.is_empty() {
            return None;
        }

        let inner = self.inner.lock().expect("scheduler lock poisoned");
        let healthy: Vec<&(&String, &ProviderConfig)> = matching
            .iter()
            .filter(|(name, _)| {
                inner.weakness.get(name.as_str()).copied().unwrap_or(0) < WEAKNESS_THRESHOLD
            })
            .collect();

        let (name, provider) = healthy.first().copied().unwrap_or(&matching[0]);
        Some(((*name).clone(), (*provider).clone()))
    }

    async fn record_denial(&self, bead_id: &str, reason: &str) {
        info!(bead_id = %bead_id, reason, "admission denied");
        if let Err(e) = self
            .store
            .append_health_event(
                HealthEventType::AdmissionDenied,
                reason.to_string(),
                None,
                Some(bead_id.to_string()),
            )
            .await
        {
            warn!(error = %e, "admission_denied event failed");
        }
    }

    async fn record_launch_failure(&self, bead_id: &str, dispatch_id: Option<i64>, details: &str) {
        if let Err(e) = self
            .store
            .append_health_event(
                HealthEventType::DispatchLaunchFailed,
                details.to_string(),
                dispatch_id,
                Some(bead_id.to_string()),
            )
            .await
        {
            warn!(error = %e, "dispatch_launch_failed event failed");
        }
    }

    // -----------------------------------------------------------------------
    // Outcome handling
    // -----------------------------------------------------------------------

    /// Apply a watcher outcome: provider health, backoff, and the
    /// failed -> pending_retry escalation policy.
    pub async fn handle_outcome(&self, outcome: DispatchOutcome) {
        self.handles
            .lock()
            .expect("handle map poisoned")
            .remove(&outcome.dispatch_id);
        if let Err(e) = self.store.release_lease(&outcome.bead_id).await {
            warn!(bead_id = %outcome.bead_id, error = %e, "lease release failed");
        }

        match outcome.status {
            DispatchStatus::Completed => {
                let mut inner = self.inner.lock().expect("scheduler lock poisoned");
                inner.weakness.remove(&outcome.provider);
            }
            DispatchStatus::Failed => {
                self.metrics.increment_counter("cortex_dispatches_failed_total", &[]);
                {
                    let mut inner = self.inner.lock().expect("scheduler lock poisoned");
                    match outcome.failure_category {
                        Some(FailureCategory::RateLimited) | Some(FailureCategory::Timeout) => {
                            *inner.weakness.entry(outcome.provider.clone()).or_insert(0) += 1;
                        }
                        _ => {
                            inner.weakness.remove(&outcome.provider);
                        }
                    }
                    inner.backoffs.insert(
                        outcome.bead_id.clone(),
                        Utc::now() + ChronoDuration::seconds(RETRY_BACKOFF_SECS),
                    );
                }

                let max_retries = self.config.snapshot().general.max_retries;
                if outcome.retries < max_retries {
                    let next = outcome.tier.escalate();
                    match self.store.mark_pending_retry(outcome.dispatch_id, next).await {
                        Ok(true) => {
                            info!(
                                dispatch_id = outcome.dispatch_id,
                                bead_id = %outcome.bead_id,
                                next_tier = %next,
                                "requeued for retry"
                            );
                        }
                        Ok(false) => {}
                        Err(e) => warn!(error = %e, "pending_retry transition failed"),
                    }
                } else {
                    {
                        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
                        inner.safety_blocks.insert(outcome.bead_id.clone());
                    }
                    if let Err(e) = self
                        .store
                        .append_health_event(
                            HealthEventType::MaxRetries,
                            format!("bead exhausted {} retries", max_retries),
                            Some(outcome.dispatch_id),
                            Some(outcome.bead_id.clone()),
                        )
                        .await
                    {
                        warn!(error = %e, "max_retries event failed");
                    }
                }
            }
            _ => {}
        }
    }

    /// Re-attach watchers to dispatches left running by a previous process
    /// life. Rows whose execution the backend can no longer observe are
    /// closed out as failed.
    pub async fn reattach_running(&self) {
        let running = match self.store.list_running().await {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "running listing failed during reattach");
                return;
            }
        };

        for row in running {
            let dispatcher = self.dispatchers.for_backend(row.backend);
            match dispatcher.adopt(&row).await {
                Some(handle) => {
                    debug!(dispatch_id = row.id, handle, "re-attached running dispatch");
                    self.handles.lock().expect("handle map poisoned").insert(row.id, handle);
                    spawn_watcher(
                        self.store.clone(),
                        dispatcher,
                        row,
                        handle,
                        self.outcomes.clone(),
                        self.shutdown.clone(),
                    );
                }
                None => {
                    warn!(dispatch_id = row.id, "execution no longer observable, failing");
                    if let Err(e) = self
                        .store
                        .finish_dispatch(
                            row.id,
                            DispatchStatus::Failed,
                            Some(-1),
                            Some(FailureCategory::Unknown),
                            Some("execution lost across restart".to_string()),
                        )
                        .await
                    {
                        warn!(dispatch_id = row.id, error = %e, "restart fail-out failed");
                    }
                }
            }
        }
    }
}

fn build_prompt(bead: &Bead) -> String {
    let labels = if bead.labels.is_empty() {
        "none".to_string()
    } else {
        bead.labels.join(", ")
    };
    format!(
        "Work the bead {} in project {}.\nType: {}\nLabels: {}\n\
         Complete the work the bead describes, keep the test suite green, and \
         update the bead with what you did.",
        bead.id, bead.project, bead.bead_type, labels
    )
}

// ---------------------------------------------------------------------------
// SchedulerControl (admin API surface)
// ---------------------------------------------------------------------------

#[async_trait]
impl SchedulerControl for Scheduler {
    async fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("scheduler paused");
    }

    async fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("scheduler resumed");
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn cancel_dispatch(&self, id: i64) -> Result<(), ControlError> {
        let row = self
            .store
            .get_dispatch(id)
            .await
            .map_err(|e| ControlError::Internal(e.to_string()))?
            .ok_or(ControlError::NotFound)?;

        // Cancelling a terminal row is a no-op success.
        if row.status.is_terminal() {
            return Ok(());
        }

        let transitioned = self
            .store
            .cancel_dispatch(id)
            .await
            .map_err(|e| ControlError::Internal(e.to_string()))?;

        // Mark first, then signal: the watcher observing the exit will lose
        // the conditional update and leave the cancelled row alone.
        let dispatcher = self.dispatchers.for_backend(row.backend);
        let handle = {
            let handles = self.handles.lock().expect("handle map poisoned");
            handles.get(&id).copied()
        };
        let handle = match handle {
            Some(h) => Some(h),
            None => dispatcher.adopt(&row).await,
        };
        if let Some(handle) = handle {
            let _ = dispatcher.kill(handle).await;
        }

        if transitioned {
            if let Err(e) = self
                .store
                .append_health_event(
                    HealthEventType::DispatchCancelled,
                    String::new(),
                    Some(id),
                    Some(row.bead_id.clone()),
                )
                .await
            {
                warn!(error = %e, "dispatch_cancelled event failed");
            }
            let _ = self.store.release_lease(&row.bead_id).await;
        }
        Ok(())
    }

    async fn retry_dispatch(&self, id: i64) -> Result<(), ControlError> {
        let row = self
            .store
            .get_dispatch(id)
            .await
            .map_err(|e| ControlError::Internal(e.to_string()))?
            .ok_or(ControlError::NotFound)?;

        if row.status.is_live() {
            return Err(ControlError::Conflict("dispatch is still live".to_string()));
        }

        let in_flight = self
            .store
            .in_flight_bead_ids()
            .await
            .map_err(|e| ControlError::Internal(e.to_string()))?;
        if in_flight.contains(&row.bead_id) {
            return Err(ControlError::Conflict(format!(
                "bead {} already has a live dispatch",
                row.bead_id
            )));
        }

        let reopened = self
            .store
            .reopen_for_retry(id)
            .await
            .map_err(|e| ControlError::Internal(e.to_string()))?;
        if !reopened {
            return Err(ControlError::Conflict(
                "dispatch is not in a retryable state".to_string(),
            ));
        }

        // An operator retry overrides the automatic block and backoff.
        let mut inner = self.inner.lock().expect("scheduler lock poisoned");
        inner.safety_blocks.remove(&row.bead_id);
        inner.backoffs.remove(&row.bead_id);
        Ok(())
    }
}
