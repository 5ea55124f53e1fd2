use std::sync::RwLock;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use cx_core::config::RateLimitsConfig;
use cx_core::store::{StateDb, StoreError};

/// Rolling window lengths for authed-usage accounting, in seconds.
const WINDOW_5H_SECS: i64 = 5 * 3600;
const WINDOW_WEEKLY_SECS: i64 = 7 * 24 * 3600;

fn window_5h() -> chrono::Duration {
    chrono::Duration::seconds(WINDOW_5H_SECS)
}

fn window_weekly() -> chrono::Duration {
    chrono::Duration::seconds(WINDOW_WEEKLY_SECS)
}

/// How long a counts snapshot may be reused before re-querying the store.
const SNAPSHOT_TTL: Duration = Duration::from_secs(1);

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Outcome of an admission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Denied with the exhausted window named in `reason` and the time until
    /// the oldest in-window dispatch rolls out.
    Denied {
        reason: String,
        retry_after: Duration,
    },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Admission::Granted)
    }
}

/// Usage figures for the admin surface and metrics.
#[derive(Debug, Clone, Copy, serde::Serialize)]
pub struct UsageSnapshot {
    pub used_5h: u64,
    pub cap_5h: u64,
    pub used_weekly: u64,
    pub cap_weekly: u64,
    pub headroom_warning: bool,
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Counts {
    used_5h: u64,
    used_weekly: u64,
    taken: Instant,
}

/// Dual-window rate limiter over authed dispatches.
///
/// The store is the source of truth: no tokens are reserved in memory, so a
/// restart cannot leak quota. Counts only include dispatch rows committed
/// before the admission read; within one tick admissions are serialized by
/// the scheduler, so the freshly inserted row is visible to the next check.
pub struct RateLimiter {
    caps: RwLock<RateLimitsConfig>,
    cached: Mutex<Option<Counts>>,
}

impl RateLimiter {
    pub fn new(caps: RateLimitsConfig) -> Self {
        Self {
            caps: RwLock::new(caps),
            cached: Mutex::new(None),
        }
    }

    /// Swap the caps on config reload.
    pub fn set_caps(&self, caps: RateLimitsConfig) {
        *self.caps.write().expect("rate limit caps lock poisoned") = caps;
    }

    fn caps(&self) -> RateLimitsConfig {
        self.caps.read().expect("rate limit caps lock poisoned").clone()
    }

    /// Drop the cached snapshot so the next check re-reads the store.
    /// The scheduler calls this at the top of every tick.
    pub async fn refresh(&self) {
        *self.cached.lock().await = None;
    }

    /// Decide whether one more authed dispatch may start at `now`.
    pub async fn admit(&self, db: &StateDb, now: DateTime<Utc>) -> Result<Admission, StoreError> {
        let caps = self.caps();
        let counts = self.counts(db, now).await?;

        if counts.used_5h >= caps.window_5h_cap {
            let retry_after = self.window_relief(db, now, window_5h()).await?;
            warn!(
                used = counts.used_5h,
                cap = caps.window_5h_cap,
                "admission denied: 5h window cap reached"
            );
            return Ok(Admission::Denied {
                reason: format!(
                    "5h window cap reached ({}/{})",
                    counts.used_5h, caps.window_5h_cap
                ),
                retry_after,
            });
        }

        if counts.used_weekly >= caps.weekly_cap {
            let retry_after = self.window_relief(db, now, window_weekly()).await?;
            warn!(
                used = counts.used_weekly,
                cap = caps.weekly_cap,
                "admission denied: weekly cap reached"
            );
            return Ok(Admission::Denied {
                reason: format!(
                    "weekly cap reached ({}/{})",
                    counts.used_weekly, caps.weekly_cap
                ),
                retry_after,
            });
        }

        Ok(Admission::Granted)
    }

    /// True when weekly authed usage has crossed the headroom threshold.
    pub async fn is_in_headroom_warning(
        &self,
        db: &StateDb,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let caps = self.caps();
        let counts = self.counts(db, now).await?;
        let threshold = (caps.headroom_warning_pct * caps.weekly_cap as f64).ceil() as u64;
        Ok(counts.used_weekly >= threshold)
    }

    /// Current usage for `/status` and `/metrics`.
    pub async fn usage(&self, db: &StateDb, now: DateTime<Utc>) -> Result<UsageSnapshot, StoreError> {
        let caps = self.caps();
        let counts = self.counts(db, now).await?;
        let threshold = (caps.headroom_warning_pct * caps.weekly_cap as f64).ceil() as u64;
        Ok(UsageSnapshot {
            used_5h: counts.used_5h,
            cap_5h: caps.window_5h_cap,
            used_weekly: counts.used_weekly,
            cap_weekly: caps.weekly_cap,
            headroom_warning: counts.used_weekly >= threshold,
        })
    }

    /// Window counts, re-queried from the store when the snapshot is stale.
    async fn counts(&self, db: &StateDb, now: DateTime<Utc>) -> Result<Counts, StoreError> {
        let mut cached = self.cached.lock().await;
        if let Some(counts) = *cached {
            if counts.taken.elapsed() < SNAPSHOT_TTL {
                return Ok(counts);
            }
        }
        let used_5h = db.authed_count_since(now - window_5h()).await?;
        let used_weekly = db.authed_count_since(now - window_weekly()).await?;
        let counts = Counts {
            used_5h,
            used_weekly,
            taken: Instant::now(),
        };
        *cached = Some(counts);
        Ok(counts)
    }

    /// Time until the oldest dispatch in the window rolls out of it.
    async fn window_relief(
        &self,
        db: &StateDb,
        now: DateTime<Utc>,
        window: chrono::Duration,
    ) -> Result<Duration, StoreError> {
        match db.oldest_authed_since(now - window).await? {
            Some(oldest) => {
                let relief = (oldest + window) - now;
                Ok(relief.to_std().unwrap_or(Duration::ZERO))
            }
            // Cap reached with nothing in the window only happens at cap 0;
            // report a full window.
            None => Ok(window.to_std().unwrap_or(Duration::ZERO)),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
