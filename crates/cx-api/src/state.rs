//! Shared state for the admin HTTP handlers.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;

use cx_core::config::ConfigHandle;
use cx_core::store::StateDb;
use cx_harness::rate_limiter::RateLimiter;
use cx_telemetry::metrics::MetricsCollector;

/// Errors a scheduler control operation can surface to the API.
#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("not found")]
    NotFound,
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    Internal(String),
}

/// The daemon-side control surface the API drives. Implemented by the
/// scheduler; kept as a trait so this crate has no dependency on the daemon
/// crate and tests can stub it.
#[async_trait]
pub trait SchedulerControl: Send + Sync {
    async fn pause(&self);
    async fn resume(&self);
    fn is_paused(&self) -> bool;

    /// Idempotent: cancelling an already-terminal dispatch succeeds.
    async fn cancel_dispatch(&self, id: i64) -> Result<(), ControlError>;

    /// Re-queue a terminal dispatch for another attempt.
    async fn retry_dispatch(&self, id: i64) -> Result<(), ControlError>;
}

/// Shared application state for all HTTP handlers.
pub struct ApiState {
    pub store: Arc<StateDb>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Arc<MetricsCollector>,
    pub config: ConfigHandle,
    pub scheduler: Arc<dyn SchedulerControl>,
    pub started_at: Instant,
}

impl ApiState {
    pub fn new(
        store: Arc<StateDb>,
        limiter: Arc<RateLimiter>,
        metrics: Arc<MetricsCollector>,
        config: ConfigHandle,
        scheduler: Arc<dyn SchedulerControl>,
    ) -> Self {
        Self {
            store,
            limiter,
            metrics,
            config,
            scheduler,
            started_at: Instant::now(),
        }
    }
}
