use std::collections::HashSet;
use std::path::Path;

use chrono::{DateTime, Utc};
use tokio_rusqlite::Connection;

use crate::types::{
    Backend, Dispatch, DispatchStatus, FailureCategory, HealthEvent, HealthEventType, NewDispatch,
    Tier,
};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store: {0}")]
    Db(#[from] tokio_rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ---------------------------------------------------------------------------
// StateDb
// ---------------------------------------------------------------------------

/// Async SQLite-backed durable state: dispatch records, health events,
/// claim leases, and captured output tails.
///
/// All writes are serialized through the single connection; the conditional
/// `WHERE status = 'running'` updates make terminal transitions idempotent
/// under races between the watcher, the stuck detector, and cancellation.
pub struct StateDb {
    conn: Connection,
}

impl StateDb {
    /// Open (or create) a database at the given file path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    /// Create a purely in-memory database (tests).
    pub async fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let db = Self { conn };
        db.init_schema().await?;
        Ok(db)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA busy_timeout=5000;
                    PRAGMA temp_store=MEMORY;

                    CREATE TABLE IF NOT EXISTS dispatches (
                        id               INTEGER PRIMARY KEY AUTOINCREMENT,
                        bead_id          TEXT NOT NULL,
                        project          TEXT NOT NULL,
                        agent_id         TEXT NOT NULL,
                        provider         TEXT NOT NULL,
                        tier             TEXT NOT NULL,
                        backend          TEXT NOT NULL,
                        pid              INTEGER,
                        session_name     TEXT,
                        dispatched_at    TEXT NOT NULL,
                        completed_at     TEXT,
                        duration_s       REAL,
                        status           TEXT NOT NULL,
                        exit_code        INTEGER,
                        stage            TEXT,
                        retries          INTEGER NOT NULL DEFAULT 0,
                        log_path         TEXT,
                        failure_category TEXT,
                        failure_summary  TEXT,
                        authed           INTEGER NOT NULL DEFAULT 0
                    );

                    CREATE INDEX IF NOT EXISTS idx_dispatches_status  ON dispatches(status);
                    CREATE INDEX IF NOT EXISTS idx_dispatches_bead    ON dispatches(bead_id);
                    CREATE INDEX IF NOT EXISTS idx_dispatches_pid     ON dispatches(pid);
                    CREATE INDEX IF NOT EXISTS idx_dispatches_session ON dispatches(session_name);
                    CREATE INDEX IF NOT EXISTS idx_dispatches_started ON dispatches(dispatched_at);

                    CREATE TABLE IF NOT EXISTS health_events (
                        id          INTEGER PRIMARY KEY AUTOINCREMENT,
                        event_type  TEXT NOT NULL,
                        details     TEXT NOT NULL DEFAULT '',
                        dispatch_id INTEGER,
                        bead_id     TEXT,
                        created_at  TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_health_events_type    ON health_events(event_type);
                    CREATE INDEX IF NOT EXISTS idx_health_events_created ON health_events(created_at);

                    CREATE TABLE IF NOT EXISTS claim_leases (
                        bead_id      TEXT PRIMARY KEY,
                        lease_holder TEXT NOT NULL,
                        heartbeat_at TEXT NOT NULL,
                        dispatch_id  INTEGER
                    );

                    CREATE TABLE IF NOT EXISTS dispatch_output (
                        dispatch_id INTEGER PRIMARY KEY,
                        tail        TEXT NOT NULL DEFAULT '',
                        updated_at  TEXT NOT NULL
                    );

                    -- Token accounting is written by the telemetry digester,
                    -- not the core; the schema reserves its place.
                    CREATE TABLE IF NOT EXISTS token_usage (
                        id            INTEGER PRIMARY KEY AUTOINCREMENT,
                        dispatch_id   INTEGER,
                        input_tokens  INTEGER NOT NULL DEFAULT 0,
                        output_tokens INTEGER NOT NULL DEFAULT 0,
                        recorded_at   TEXT NOT NULL
                    );
                    ",
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Dispatch writes
    // -----------------------------------------------------------------------

    /// Record a freshly launched dispatch with `status = running`.
    /// Returns the new row id.
    pub async fn insert_dispatch(&self, new: NewDispatch) -> Result<i64> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO dispatches (bead_id, project, agent_id, provider, tier,
                        backend, pid, session_name, dispatched_at, status, stage, retries,
                        log_path, authed)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,'running',?10,?11,?12,?13)",
                    rusqlite::params![
                        new.bead_id,
                        new.project,
                        new.agent_id,
                        new.provider,
                        new.tier.as_str(),
                        new.backend.as_str(),
                        new.pid,
                        new.session_name,
                        now,
                        new.stage,
                        new.retries,
                        new.log_path,
                        new.authed as i64,
                    ],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Into::into)
    }

    /// Terminal transition for a running dispatch. Conditional on
    /// `status = 'running'` so concurrent writers cannot double-finish a row
    /// or overwrite a cancellation. Returns whether the row transitioned.
    pub async fn finish_dispatch(
        &self,
        id: i64,
        status: DispatchStatus,
        exit_code: Option<i32>,
        failure_category: Option<FailureCategory>,
        failure_summary: Option<String>,
    ) -> Result<bool> {
        debug_assert!(status.is_terminal());
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE dispatches SET
                        status = ?2,
                        completed_at = ?3,
                        duration_s = (julianday(?3) - julianday(dispatched_at)) * 86400.0,
                        exit_code = ?4,
                        failure_category = ?5,
                        failure_summary = ?6
                     WHERE id = ?1 AND status = 'running'",
                    rusqlite::params![
                        id,
                        status.as_str(),
                        now,
                        exit_code,
                        failure_category.map(|c| c.as_str()),
                        failure_summary,
                    ],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Move a `running` or `failed` dispatch to `pending_retry` at the
    /// escalated tier, bumping `retries` and setting stage to `failed`.
    /// Completion fields are filled in if the row never got them (the stuck
    /// path goes straight from `running`).
    pub async fn mark_pending_retry(&self, id: i64, next_tier: Tier) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE dispatches SET
                        status = 'pending_retry',
                        tier = ?2,
                        retries = retries + 1,
                        stage = 'failed',
                        completed_at = COALESCE(completed_at, ?3),
                        duration_s = COALESCE(duration_s,
                            (julianday(?3) - julianday(dispatched_at)) * 86400.0),
                        exit_code = COALESCE(exit_code, -1)
                     WHERE id = ?1 AND status IN ('running', 'failed')",
                    rusqlite::params![id, next_tier.as_str(), now],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Consume a `pending_retry` row: the scheduler has created a fresh
    /// dispatch for it, so the old row becomes `retried`.
    pub async fn mark_retried(&self, id: i64) -> Result<bool> {
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE dispatches SET status = 'retried'
                     WHERE id = ?1 AND status = 'pending_retry'",
                    rusqlite::params![id],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Cancel a live dispatch. Idempotent: cancelling an already-terminal
    /// row changes nothing and returns false.
    pub async fn cancel_dispatch(&self, id: i64) -> Result<bool> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE dispatches SET
                        status = 'cancelled',
                        completed_at = COALESCE(completed_at, ?2),
                        duration_s = COALESCE(duration_s,
                            (julianday(?2) - julianday(dispatched_at)) * 86400.0)
                     WHERE id = ?1 AND status IN ('running', 'pending_retry')",
                    rusqlite::params![id, now],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Shutdown sweep: every still-running dispatch becomes `interrupted`
    /// in a single statement. Returns the number of rows swept.
    pub async fn mark_all_running_interrupted(&self) -> Result<u64> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE dispatches SET
                        status = 'interrupted',
                        completed_at = ?1,
                        duration_s = (julianday(?1) - julianday(dispatched_at)) * 86400.0
                     WHERE status = 'running'",
                    rusqlite::params![now],
                )?;
                Ok(changed as u64)
            })
            .await
            .map_err(Into::into)
    }

    /// Re-open a terminal dispatch as `pending_retry` at its recorded tier
    /// without bumping `retries` (operator-initiated retry).
    pub async fn reopen_for_retry(&self, id: i64) -> Result<bool> {
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE dispatches SET status = 'pending_retry'
                     WHERE id = ?1
                       AND status IN ('failed', 'cancelled', 'interrupted')",
                    rusqlite::params![id],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Dispatch reads
    // -----------------------------------------------------------------------

    pub async fn get_dispatch(&self, id: i64) -> Result<Option<Dispatch>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&select_dispatch("WHERE id = ?1"))?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_dispatch(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    /// Most recent dispatch bound to a multiplexer session name.
    pub async fn get_dispatch_by_session(&self, session: &str) -> Result<Option<Dispatch>> {
        let session = session.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&select_dispatch(
                    "WHERE session_name = ?1 ORDER BY dispatched_at DESC LIMIT 1",
                ))?;
                let mut rows = stmt.query(rusqlite::params![session])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_dispatch(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    /// Dispatch history for a bead, newest first.
    pub async fn dispatches_for_bead(&self, bead_id: &str) -> Result<Vec<Dispatch>> {
        let bead_id = bead_id.to_string();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&select_dispatch(
                    "WHERE bead_id = ?1 ORDER BY dispatched_at DESC, id DESC",
                ))?;
                let mut rows = stmt.query(rusqlite::params![bead_id])?;
                collect_dispatches(&mut rows)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_running(&self) -> Result<Vec<Dispatch>> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&select_dispatch("WHERE status = 'running' ORDER BY id"))?;
                let mut rows = stmt.query([])?;
                collect_dispatches(&mut rows)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn list_pending_retry(&self) -> Result<Vec<Dispatch>> {
        self.conn
            .call(|conn| {
                let mut stmt =
                    conn.prepare(&select_dispatch("WHERE status = 'pending_retry' ORDER BY id"))?;
                let mut rows = stmt.query([])?;
                collect_dispatches(&mut rows)
            })
            .await
            .map_err(Into::into)
    }

    /// Bead ids with a live dispatch (`running` or `pending_retry`). The
    /// scheduler never admits a bead in this set.
    pub async fn in_flight_bead_ids(&self) -> Result<HashSet<String>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT DISTINCT bead_id FROM dispatches
                     WHERE status IN ('running', 'pending_retry')",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = HashSet::new();
                while let Some(row) = rows.next()? {
                    out.insert(row.get::<_, String>(0)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn running_count(&self) -> Result<u64> {
        self.conn
            .call(|conn| {
                let count: u64 = conn
                    .prepare("SELECT COUNT(*) FROM dispatches WHERE status = 'running'")?
                    .query_row([], |r| r.get(0))?;
                Ok(count)
            })
            .await
            .map_err(Into::into)
    }

    /// Running dispatch counts grouped by bead stage.
    pub async fn running_count_by_stage(&self) -> Result<Vec<(String, u64)>> {
        self.conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT COALESCE(stage, 'unknown'), COUNT(*) FROM dispatches
                     WHERE status = 'running' GROUP BY stage ORDER BY 1",
                )?;
                let mut rows = stmt.query([])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push((row.get::<_, String>(0)?, row.get::<_, u64>(1)?));
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Authed dispatches started at or after the cutoff. Drives the
    /// dual-window rate limiter; only committed rows count.
    pub async fn authed_count_since(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let cutoff = cutoff.to_rfc3339();
        self.conn
            .call(move |conn| {
                let count: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM dispatches
                         WHERE authed = 1 AND dispatched_at >= ?1",
                    )?
                    .query_row(rusqlite::params![cutoff], |r| r.get(0))?;
                Ok(count)
            })
            .await
            .map_err(Into::into)
    }

    /// Start time of the oldest authed dispatch at or after the cutoff.
    /// Lets the rate limiter compute when a full window next frees a slot.
    pub async fn oldest_authed_since(&self, cutoff: DateTime<Utc>) -> Result<Option<DateTime<Utc>>> {
        let cutoff = cutoff.to_rfc3339();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT MIN(dispatched_at) FROM dispatches
                     WHERE authed = 1 AND dispatched_at >= ?1",
                )?;
                let raw: Option<String> = stmt.query_row(rusqlite::params![cutoff], |r| r.get(0))?;
                match raw {
                    Some(raw) => Ok(Some(parse_ts(0, &raw)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    /// Running dispatches of a tier older than the cutoff (stuck candidates).
    pub async fn stuck_running_by_tier(
        &self,
        tier: Tier,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<Dispatch>> {
        let cutoff = older_than.to_rfc3339();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&select_dispatch(
                    "WHERE status = 'running' AND tier = ?1 AND dispatched_at < ?2 ORDER BY id",
                ))?;
                let mut rows = stmt.query(rusqlite::params![tier.as_str(), cutoff])?;
                collect_dispatches(&mut rows)
            })
            .await
            .map_err(Into::into)
    }

    /// Most recent dispatch referencing `pid` that started or finished
    /// within the window. Used by the zombie reaper to decide ownership.
    pub async fn recent_dispatch_with_pid(
        &self,
        pid: i32,
        since: DateTime<Utc>,
    ) -> Result<Option<Dispatch>> {
        let since = since.to_rfc3339();
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(&select_dispatch(
                    "WHERE pid = ?1
                       AND (dispatched_at >= ?2 OR completed_at >= ?2)
                     ORDER BY dispatched_at DESC LIMIT 1",
                ))?;
                let mut rows = stmt.query(rusqlite::params![pid, since])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row_to_dispatch(row)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Health events
    // -----------------------------------------------------------------------

    pub async fn append_health_event(
        &self,
        event_type: HealthEventType,
        details: impl Into<String>,
        dispatch_id: Option<i64>,
        bead_id: Option<String>,
    ) -> Result<i64> {
        let details = details.into();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO health_events (event_type, details, dispatch_id, bead_id, created_at)
                     VALUES (?1,?2,?3,?4,?5)",
                    rusqlite::params![event_type.as_str(), details, dispatch_id, bead_id, now],
                )?;
                Ok(conn.last_insert_rowid())
            })
            .await
            .map_err(Into::into)
    }

    /// Latest health events, newest first.
    pub async fn recent_health_events(&self, limit: u32) -> Result<Vec<HealthEvent>> {
        self.conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, event_type, details, dispatch_id, bead_id, created_at
                     FROM health_events ORDER BY id DESC LIMIT ?1",
                )?;
                let mut rows = stmt.query(rusqlite::params![limit])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row_to_health_event(row)?);
                }
                Ok(out)
            })
            .await
            .map_err(Into::into)
    }

    /// Whether an event of this type was appended at or after the cutoff.
    pub async fn has_recent_event(
        &self,
        event_type: HealthEventType,
        since: DateTime<Utc>,
    ) -> Result<bool> {
        let since = since.to_rfc3339();
        self.conn
            .call(move |conn| {
                let count: u64 = conn
                    .prepare(
                        "SELECT COUNT(*) FROM health_events
                         WHERE event_type = ?1 AND created_at >= ?2",
                    )?
                    .query_row(rusqlite::params![event_type.as_str(), since], |r| r.get(0))?;
                Ok(count > 0)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Claim leases
    // -----------------------------------------------------------------------

    /// Take the lease on a bead. Fails (returns false) when another holder
    /// already has it — at most one lease per bead at any instant.
    pub async fn acquire_lease(
        &self,
        bead_id: &str,
        lease_holder: &str,
        dispatch_id: Option<i64>,
    ) -> Result<bool> {
        let bead_id = bead_id.to_string();
        let lease_holder = lease_holder.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "INSERT INTO claim_leases (bead_id, lease_holder, heartbeat_at, dispatch_id)
                     VALUES (?1,?2,?3,?4)
                     ON CONFLICT(bead_id) DO NOTHING",
                    rusqlite::params![bead_id, lease_holder, now, dispatch_id],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn heartbeat_lease(&self, bead_id: &str) -> Result<bool> {
        let bead_id = bead_id.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "UPDATE claim_leases SET heartbeat_at = ?2 WHERE bead_id = ?1",
                    rusqlite::params![bead_id, now],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    pub async fn release_lease(&self, bead_id: &str) -> Result<bool> {
        let bead_id = bead_id.to_string();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM claim_leases WHERE bead_id = ?1",
                    rusqlite::params![bead_id],
                )?;
                Ok(changed > 0)
            })
            .await
            .map_err(Into::into)
    }

    /// Drop leases with a stale heartbeat or no live dispatch behind them.
    /// Returns the number collected.
    pub async fn gc_leases(&self, stale_before: DateTime<Utc>) -> Result<u64> {
        let cutoff = stale_before.to_rfc3339();
        self.conn
            .call(move |conn| {
                let changed = conn.execute(
                    "DELETE FROM claim_leases
                     WHERE heartbeat_at < ?1
                        OR dispatch_id IS NULL
                        OR dispatch_id NOT IN (
                            SELECT id FROM dispatches
                            WHERE status IN ('running', 'pending_retry'))",
                    rusqlite::params![cutoff],
                )?;
                Ok(changed as u64)
            })
            .await
            .map_err(Into::into)
    }

    // -----------------------------------------------------------------------
    // Output tails
    // -----------------------------------------------------------------------

    pub async fn upsert_output_tail(&self, dispatch_id: i64, tail: &str) -> Result<()> {
        let tail = tail.to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO dispatch_output (dispatch_id, tail, updated_at)
                     VALUES (?1,?2,?3)
                     ON CONFLICT(dispatch_id) DO UPDATE SET
                        tail = excluded.tail, updated_at = excluded.updated_at",
                    rusqlite::params![dispatch_id, tail, now],
                )?;
                Ok(())
            })
            .await
            .map_err(Into::into)
    }

    pub async fn output_tail(&self, dispatch_id: i64) -> Result<Option<String>> {
        self.conn
            .call(move |conn| {
                let mut stmt =
                    conn.prepare("SELECT tail FROM dispatch_output WHERE dispatch_id = ?1")?;
                let mut rows = stmt.query(rusqlite::params![dispatch_id])?;
                match rows.next()? {
                    Some(row) => Ok(Some(row.get::<_, String>(0)?)),
                    None => Ok(None),
                }
            })
            .await
            .map_err(Into::into)
    }
}

// ---------------------------------------------------------------------------
// Row mapping helpers
// ---------------------------------------------------------------------------

const DISPATCH_COLUMNS: &str = "id, bead_id, project, agent_id, provider, tier, backend, pid, \
     session_name, dispatched_at, completed_at, duration_s, status, exit_code, stage, retries, \
     log_path, failure_category, failure_summary, authed";

fn select_dispatch(suffix: &str) -> String {
    format!("SELECT {DISPATCH_COLUMNS} FROM dispatches {suffix}")
}

fn conversion_err(idx: usize, msg: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        rusqlite::types::Type::Text,
        msg.into(),
    )
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_err(idx, format!("bad timestamp `{raw}`: {e}")))
}

fn row_to_dispatch(row: &rusqlite::Row<'_>) -> rusqlite::Result<Dispatch> {
    let tier_raw: String = row.get(5)?;
    let backend_raw: String = row.get(6)?;
    let dispatched_raw: String = row.get(9)?;
    let completed_raw: Option<String> = row.get(10)?;
    let status_raw: String = row.get(12)?;
    let category_raw: Option<String> = row.get(17)?;

    let completed_at = match completed_raw {
        Some(raw) => Some(parse_ts(10, &raw)?),
        None => None,
    };
    let failure_category = match category_raw {
        Some(raw) => Some(
            FailureCategory::parse(&raw)
                .ok_or_else(|| conversion_err(17, format!("bad failure category `{raw}`")))?,
        ),
        None => None,
    };

    Ok(Dispatch {
        id: row.get(0)?,
        bead_id: row.get(1)?,
        project: row.get(2)?,
        agent_id: row.get(3)?,
        provider: row.get(4)?,
        tier: Tier::parse(&tier_raw)
            .ok_or_else(|| conversion_err(5, format!("bad tier `{tier_raw}`")))?,
        backend: Backend::parse(&backend_raw)
            .ok_or_else(|| conversion_err(6, format!("bad backend `{backend_raw}`")))?,
        pid: row.get(7)?,
        session_name: row.get(8)?,
        dispatched_at: parse_ts(9, &dispatched_raw)?,
        completed_at,
        duration_s: row.get(11)?,
        status: DispatchStatus::parse(&status_raw)
            .ok_or_else(|| conversion_err(12, format!("bad status `{status_raw}`")))?,
        exit_code: row.get(13)?,
        stage: row.get(14)?,
        retries: row.get(15)?,
        log_path: row.get(16)?,
        failure_category,
        failure_summary: row.get(18)?,
        authed: row.get::<_, i64>(19)? != 0,
    })
}

fn collect_dispatches(rows: &mut rusqlite::Rows<'_>) -> tokio_rusqlite::Result<Vec<Dispatch>> {
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        out.push(row_to_dispatch(row)?);
    }
    Ok(out)
}

fn row_to_health_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<HealthEvent> {
    let type_raw: String = row.get(1)?;
    let created_raw: String = row.get(5)?;
    Ok(HealthEvent {
        id: row.get(0)?,
        event_type: HealthEventType::parse(&type_raw)
            .ok_or_else(|| conversion_err(1, format!("bad event type `{type_raw}`")))?,
        details: row.get(2)?,
        dispatch_id: row.get(3)?,
        bead_id: row.get(4)?,
        created_at: parse_ts(5, &created_raw)?,
    })
}
