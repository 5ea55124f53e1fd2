//! Daemon wiring: owns the store, scheduler, stuck detector, reaper, and
//! admin API server, and drives them with interval loops until shutdown.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use cx_api::routes::api_router;
use cx_api::state::{ApiState, SchedulerControl};
use cx_core::config::ConfigHandle;
use cx_core::store::StateDb;
use cx_dispatch::beads::BeadSource;
use cx_dispatch::watcher::DispatchOutcome;
use cx_dispatch::DispatcherSet;
use cx_harness::rate_limiter::RateLimiter;
use cx_harness::shutdown::{DrainGuard, ShutdownSignal};
use cx_telemetry::metrics::MetricsCollector;

use crate::reaper::Reaper;
use crate::scheduler::{HandleMap, Scheduler, TickReport};
use crate::stuck::StuckDetector;

/// Stuck sweeps run on a fixed one-minute cadence.
const STUCK_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Number of drained loops the shutdown sequence waits for.
const DRAIN_PARTICIPANTS: usize = 4;

pub struct Daemon {
    config: ConfigHandle,
    store: Arc<StateDb>,
    scheduler: Arc<Scheduler>,
    stuck: Arc<StuckDetector>,
    reaper: Arc<Reaper>,
    limiter: Arc<RateLimiter>,
    metrics: Arc<MetricsCollector>,
    shutdown: ShutdownSignal,
    outcome_rx: flume::Receiver<DispatchOutcome>,
}

impl Daemon {
    pub fn new(
        config: ConfigHandle,
        store: Arc<StateDb>,
        dispatchers: DispatcherSet,
        beads: Arc<dyn BeadSource>,
        dry_run: bool,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(config.snapshot().rate_limits.clone()));
        let metrics = Arc::new(MetricsCollector::new());
        let shutdown = ShutdownSignal::new();
        let (outcome_tx, outcome_rx) = flume::unbounded();
        let handles: HandleMap = Arc::new(Mutex::new(HashMap::new()));

        let scheduler = Arc::new(Scheduler::new(
            store.clone(),
            dispatchers.clone(),
            beads,
            limiter.clone(),
            metrics.clone(),
            config.clone(),
            outcome_tx,
            shutdown.clone(),
            handles.clone(),
            dry_run,
        ));
        let stuck = Arc::new(StuckDetector::new(
            store.clone(),
            dispatchers,
            config.clone(),
            handles,
        ));
        let reaper = Arc::new(Reaper::new(store.clone(), config.clone()));

        Self {
            config,
            store,
            scheduler,
            stuck,
            reaper,
            limiter,
            metrics,
            shutdown,
            outcome_rx,
        }
    }

    pub fn shutdown_handle(&self) -> ShutdownSignal {
        self.shutdown.clone()
    }

    pub fn limiter(&self) -> Arc<RateLimiter> {
        self.limiter.clone()
    }

    pub fn config(&self) -> ConfigHandle {
        self.config.clone()
    }

    fn api_state(&self) -> Arc<ApiState> {
        Arc::new(ApiState::new(
            self.store.clone(),
            self.limiter.clone(),
            self.metrics.clone(),
            self.config.clone(),
            self.scheduler.clone() as Arc<dyn SchedulerControl>,
        ))
    }

    /// `--once` mode: re-attach leftovers, run a single tick, and return.
    /// Launched executors keep running; the next daemon run re-attaches
    /// their watchers.
    pub async fn run_once(&self) -> TickReport {
        self.scheduler.reattach_running().await;
        self.scheduler.run_tick().await
    }

    /// Run until shutdown, then drain and mark leftover running dispatches
    /// interrupted.
    pub async fn run(&self, listener: tokio::net::TcpListener) -> Result<()> {
        let router = api_router(self.api_state());
        let bind_addr = listener.local_addr()?;
        let api_handle = tokio::spawn(async move {
            let service = router.into_make_service_with_connect_info::<SocketAddr>();
            if let Err(e) = axum::serve(listener, service).await {
                error!(error = %e, "admin API server error");
            }
        });
        info!(%bind_addr, "admin API listening");

        // Dispatches left running by a previous process life get their
        // watchers back before the first tick.
        self.scheduler.reattach_running().await;

        self.spawn_loops();

        // Park until the signal handler (or an admin action) triggers
        // shutdown.
        let mut rx = self.shutdown.subscribe();
        let _ = rx.recv().await;

        let timeout = Duration::from_secs(self.config.snapshot().general.shutdown_timeout);
        let mut drain = self.shutdown.clone();
        drain.wait_for_drain(DRAIN_PARTICIPANTS, timeout).await;

        match self.store.mark_all_running_interrupted().await {
            Ok(count) if count > 0 => info!(count, "running dispatches marked interrupted"),
            Ok(_) => {}
            Err(e) => error!(error = %e, "interrupted sweep failed"),
        }

        api_handle.abort();
        info!("daemon stopped");
        Ok(())
    }

    fn spawn_loops(&self) {
        // Scheduler tick loop.
        {
            let scheduler = self.scheduler.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let _guard = DrainGuard::new(shutdown);
                scheduler.start().await;
            });
        }

        // Watcher outcome loop.
        {
            let scheduler = self.scheduler.clone();
            let shutdown = self.shutdown.clone();
            let rx = self.outcome_rx.clone();
            tokio::spawn(async move {
                let _guard = DrainGuard::new(shutdown.clone());
                let mut shutdown_rx = shutdown.subscribe();
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        outcome = rx.recv_async() => {
                            match outcome {
                                Ok(outcome) => scheduler.handle_outcome(outcome).await,
                                Err(_) => return,
                            }
                        }
                    }
                }
            });
        }

        // Stuck detector loop.
        {
            let stuck = self.stuck.clone();
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                let _guard = DrainGuard::new(shutdown.clone());
                let mut shutdown_rx = shutdown.subscribe();
                let mut ticker = tokio::time::interval(STUCK_SWEEP_INTERVAL);
                ticker.tick().await; // skip the immediate tick
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        _ = ticker.tick() => {
                            let actions = stuck.run_sweep().await;
                            if !actions.is_empty() {
                                info!(count = actions.len(), "stuck dispatches handled");
                            }
                        }
                    }
                }
            });
        }

        // Reaper loop. Paused schedulers still reap.
        {
            let reaper = self.reaper.clone();
            let shutdown = self.shutdown.clone();
            let interval = Duration::from_secs(self.config.snapshot().health.check_interval);
            tokio::spawn(async move {
                let _guard = DrainGuard::new(shutdown.clone());
                let mut shutdown_rx = shutdown.subscribe();
                let mut ticker = tokio::time::interval(interval);
                ticker.tick().await; // skip the immediate tick
                loop {
                    tokio::select! {
                        _ = shutdown_rx.recv() => return,
                        _ = ticker.tick() => {
                            let report = reaper.run_sweep().await;
                            if report.zombies_killed + report.session_zombies > 0 {
                                warn!(
                                    zombies = report.zombies_killed,
                                    session_zombies = report.session_zombies,
                                    "reaper found zombies"
                                );
                            }
                        }
                    }
                }
            });
        }
    }
}
