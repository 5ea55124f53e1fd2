//! Stuck-dispatch detection, kill, and tier-escalating retry policy.

use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{info, warn};

use cx_core::config::ConfigHandle;
use cx_core::store::StateDb;
use cx_core::types::{DispatchStatus, FailureCategory, HealthEventType, Tier};
use cx_dispatch::DispatcherSet;

use crate::scheduler::HandleMap;

/// What the detector decided for one stuck dispatch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckAction {
    pub dispatch_id: i64,
    pub bead_id: String,
    pub tier: Tier,
    /// Whether the executor still answered liveness before the kill.
    pub was_alive: bool,
    pub decision: StuckDecision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckDecision {
    /// Requeued at the escalated tier.
    Requeued { next_tier: Tier },
    /// Out of retries; terminal failure.
    FailedPermanently,
}

/// Periodic walker over `running` dispatches.
///
/// Tier-specific thresholds apply, with zero meaning the global
/// `stuck_timeout`. Any number of sweeps is safe: the queries only see
/// `running` rows and every transition is conditional, so an
/// already-terminal row is never touched.
pub struct StuckDetector {
    store: Arc<StateDb>,
    dispatchers: DispatcherSet,
    config: ConfigHandle,
    handles: HandleMap,
}

impl StuckDetector {
    pub fn new(
        store: Arc<StateDb>,
        dispatchers: DispatcherSet,
        config: ConfigHandle,
        handles: HandleMap,
    ) -> Self {
        Self {
            store,
            dispatchers,
            config,
            handles,
        }
    }

    /// One sweep across all tiers. Returns the actions taken.
    pub async fn run_sweep(&self) -> Vec<StuckAction> {
        let cfg = self.config.snapshot();
        let now = Utc::now();
        let mut actions = Vec::new();

        for tier in [Tier::Fast, Tier::Balanced, Tier::Premium] {
            let threshold = cfg.stuck_timeout_for(tier);
            let cutoff = now - ChronoDuration::seconds(threshold as i64);
            let stuck = match self.store.stuck_running_by_tier(tier, cutoff).await {
                Ok(rows) => rows,
                Err(e) => {
                    warn!(tier = %tier, error = %e, "stuck query failed");
                    continue;
                }
            };

            for row in stuck {
                let action = self.handle_stuck(&cfg, row, threshold).await;
                if let Some(action) = action {
                    actions.push(action);
                }
            }
        }

        actions
    }

    async fn handle_stuck(
        &self,
        cfg: &cx_core::config::Config,
        row: cx_core::types::Dispatch,
        threshold_secs: u64,
    ) -> Option<StuckAction> {
        let dispatcher = self.dispatchers.for_backend(row.backend);
        let handle = {
            let handles = self.handles.lock().expect("handle map poisoned");
            handles.get(&row.id).copied()
        };
        let handle = match handle {
            Some(h) => Some(h),
            None => dispatcher.adopt(&row).await,
        };

        let was_alive = match handle {
            Some(h) => dispatcher.is_alive(h).await,
            None => false,
        };

        if was_alive {
            // Session backend kills the whole session here; pid backend
            // signals the process.
            if let Some(h) = handle {
                if let Err(e) = dispatcher.kill(h).await {
                    warn!(dispatch_id = row.id, error = %e, "stuck kill failed");
                }
            }
            self.append_event(
                HealthEventType::StuckKill,
                format!("killed after exceeding {threshold_secs}s at tier {}", row.tier),
                &row,
            )
            .await;
        } else {
            self.append_event(
                HealthEventType::StuckDead,
                format!("executor already dead after {threshold_secs}s at tier {}", row.tier),
                &row,
            )
            .await;
        }

        let decision = if row.retries < cfg.general.max_retries {
            let next_tier = row.tier.escalate();
            match self.store.mark_pending_retry(row.id, next_tier).await {
                Ok(true) => {
                    info!(
                        dispatch_id = row.id,
                        bead_id = %row.bead_id,
                        next_tier = %next_tier,
                        retries = row.retries + 1,
                        "stuck dispatch requeued"
                    );
                    StuckDecision::Requeued { next_tier }
                }
                Ok(false) => {
                    // Lost the race against the watcher or a cancel; the row
                    // is no longer running and needs nothing from us.
                    return None;
                }
                Err(e) => {
                    warn!(dispatch_id = row.id, error = %e, "pending_retry transition failed");
                    return None;
                }
            }
        } else {
            match self
                .store
                .finish_dispatch(
                    row.id,
                    DispatchStatus::Failed,
                    Some(-1),
                    Some(FailureCategory::Timeout),
                    Some(format!("stuck beyond {threshold_secs}s, retries exhausted")),
                )
                .await
            {
                Ok(true) => {
                    self.append_event(
                        HealthEventType::MaxRetries,
                        format!("bead exhausted {} retries", cfg.general.max_retries),
                        &row,
                    )
                    .await;
                    StuckDecision::FailedPermanently
                }
                Ok(false) => return None,
                Err(e) => {
                    warn!(dispatch_id = row.id, error = %e, "terminal failure write failed");
                    return None;
                }
            }
        };

        self.handles.lock().expect("handle map poisoned").remove(&row.id);
        Some(StuckAction {
            dispatch_id: row.id,
            bead_id: row.bead_id.clone(),
            tier: row.tier,
            was_alive,
            decision,
        })
    }

    async fn append_event(
        &self,
        event_type: HealthEventType,
        details: String,
        row: &cx_core::types::Dispatch,
    ) {
        if let Err(e) = self
            .store
            .append_health_event(event_type, details, Some(row.id), Some(row.bead_id.clone()))
            .await
        {
            warn!(dispatch_id = row.id, error = %e, "stuck event append failed");
        }
    }
}
