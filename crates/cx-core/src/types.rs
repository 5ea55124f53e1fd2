use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Tier
// ---------------------------------------------------------------------------

/// Coarse capability/cost class for an executor.
///
/// Retries escalate monotonically: `fast -> balanced -> premium`, and
/// `premium` stays at `premium`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Fast,
    Balanced,
    Premium,
}

impl Tier {
    /// The tier a retry of this tier runs at.
    pub fn escalate(self) -> Self {
        match self {
            Tier::Fast => Tier::Balanced,
            Tier::Balanced => Tier::Premium,
            Tier::Premium => Tier::Premium,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Fast => "fast",
            Tier::Balanced => "balanced",
            Tier::Premium => "premium",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "fast" => Some(Tier::Fast),
            "balanced" => Some(Tier::Balanced),
            "premium" => Some(Tier::Premium),
            _ => None,
        }
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Backend
// ---------------------------------------------------------------------------

/// The execution substrate for a dispatch: a direct child process or a
/// terminal-multiplexer session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    Pid,
    Session,
}

impl Backend {
    pub fn as_str(self) -> &'static str {
        match self {
            Backend::Pid => "pid",
            Backend::Session => "session",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pid" => Some(Backend::Pid),
            "session" => Some(Backend::Session),
            _ => None,
        }
    }
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// DispatchStatus
// ---------------------------------------------------------------------------

/// Lifecycle state of a dispatch row.
///
/// `Running` and `PendingRetry` are live; everything else is terminal.
/// A bead has at most one live dispatch at any time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    Interrupted,
    Retried,
    PendingRetry,
}

impl DispatchStatus {
    pub fn is_live(self) -> bool {
        matches!(self, DispatchStatus::Running | DispatchStatus::PendingRetry)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_live()
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DispatchStatus::Running => "running",
            DispatchStatus::Completed => "completed",
            DispatchStatus::Failed => "failed",
            DispatchStatus::Cancelled => "cancelled",
            DispatchStatus::Interrupted => "interrupted",
            DispatchStatus::Retried => "retried",
            DispatchStatus::PendingRetry => "pending_retry",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "running" => Some(DispatchStatus::Running),
            "completed" => Some(DispatchStatus::Completed),
            "failed" => Some(DispatchStatus::Failed),
            "cancelled" => Some(DispatchStatus::Cancelled),
            "interrupted" => Some(DispatchStatus::Interrupted),
            "retried" => Some(DispatchStatus::Retried),
            "pending_retry" => Some(DispatchStatus::PendingRetry),
            _ => None,
        }
    }
}

impl std::fmt::Display for DispatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// FailureCategory
// ---------------------------------------------------------------------------

/// Classification of executor output after a failed run.
///
/// Declaration order is the match priority: the first category whose
/// pattern set hits the output wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    TestFailure,
    CompileError,
    PermissionDenied,
    RateLimited,
    Timeout,
    Unknown,
}

impl FailureCategory {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureCategory::TestFailure => "test_failure",
            FailureCategory::CompileError => "compile_error",
            FailureCategory::PermissionDenied => "permission_denied",
            FailureCategory::RateLimited => "rate_limited",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Unknown => "unknown",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "test_failure" => Some(FailureCategory::TestFailure),
            "compile_error" => Some(FailureCategory::CompileError),
            "permission_denied" => Some(FailureCategory::PermissionDenied),
            "rate_limited" => Some(FailureCategory::RateLimited),
            "timeout" => Some(FailureCategory::Timeout),
            "unknown" => Some(FailureCategory::Unknown),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Bead (external view)
// ---------------------------------------------------------------------------

/// Work-item stage as tracked by the external bead tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStage {
    Backlog,
    Planning,
    Ready,
    InProgress,
    Review,
    Done,
}

impl BeadStage {
    pub fn as_str(self) -> &'static str {
        match self {
            BeadStage::Backlog => "backlog",
            BeadStage::Planning => "planning",
            BeadStage::Ready => "ready",
            BeadStage::InProgress => "in_progress",
            BeadStage::Review => "review",
            BeadStage::Done => "done",
        }
    }
}

/// A work item as reported by the external bead lister.
///
/// The lifecycle lives in the external store; cortex only reads this view
/// and writes back stage transitions. `project` is filled in by the caller
/// since the lister is invoked per project workspace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    #[serde(default)]
    pub project: String,
    #[serde(default)]
    pub priority: i64,
    pub stage: BeadStage,
    #[serde(rename = "type", default)]
    pub bead_type: String,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

/// One launched attempt to execute a bead. Durable row in the state store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dispatch {
    pub id: i64,
    pub bead_id: String,
    pub project: String,
    pub agent_id: String,
    pub provider: String,
    pub tier: Tier,
    pub backend: Backend,
    /// OS process id (pid backend).
    pub pid: Option<i32>,
    /// Multiplexer session name (session backend). Non-empty iff
    /// `backend == Session`.
    pub session_name: Option<String>,
    pub dispatched_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_s: Option<f64>,
    pub status: DispatchStatus,
    pub exit_code: Option<i32>,
    pub stage: Option<String>,
    pub retries: i64,
    pub log_path: Option<String>,
    pub failure_category: Option<FailureCategory>,
    pub failure_summary: Option<String>,
    /// Whether this dispatch's provider counts against the shared upstream
    /// quota. Snapshotted at launch so rate-limit accounting survives
    /// provider reconfiguration.
    pub authed: bool,
}

/// Fields the scheduler supplies when recording a freshly launched dispatch.
#[derive(Debug, Clone)]
pub struct NewDispatch {
    pub bead_id: String,
    pub project: String,
    pub agent_id: String,
    pub provider: String,
    pub tier: Tier,
    pub backend: Backend,
    pub pid: Option<i32>,
    pub session_name: Option<String>,
    pub stage: Option<String>,
    pub retries: i64,
    pub log_path: Option<String>,
    pub authed: bool,
}

// ---------------------------------------------------------------------------
// Health events
// ---------------------------------------------------------------------------

/// Vocabulary of the append-only health-event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthEventType {
    TickSummary,
    AdmissionDenied,
    DispatchCompleted,
    DispatchFailed,
    DispatchCancelled,
    DispatchLaunchFailed,
    StuckKill,
    StuckDead,
    MaxRetries,
    ZombieKilled,
    UntrackedProcess,
    SessionCleaned,
    GatewayCritical,
    GatewayRestartSuccess,
    GatewayRestartFailed,
}

impl HealthEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            HealthEventType::TickSummary => "tick_summary",
            HealthEventType::AdmissionDenied => "admission_denied",
            HealthEventType::DispatchCompleted => "dispatch_completed",
            HealthEventType::DispatchFailed => "dispatch_failed",
            HealthEventType::DispatchCancelled => "dispatch_cancelled",
            HealthEventType::DispatchLaunchFailed => "dispatch_launch_failed",
            HealthEventType::StuckKill => "stuck_kill",
            HealthEventType::StuckDead => "stuck_dead",
            HealthEventType::MaxRetries => "max_retries",
            HealthEventType::ZombieKilled => "zombie_killed",
            HealthEventType::UntrackedProcess => "untracked_process",
            HealthEventType::SessionCleaned => "session_cleaned",
            HealthEventType::GatewayCritical => "gateway_critical",
            HealthEventType::GatewayRestartSuccess => "gateway_restart_success",
            HealthEventType::GatewayRestartFailed => "gateway_restart_failed",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "tick_summary" => Some(HealthEventType::TickSummary),
            "admission_denied" => Some(HealthEventType::AdmissionDenied),
            "dispatch_completed" => Some(HealthEventType::DispatchCompleted),
            "dispatch_failed" => Some(HealthEventType::DispatchFailed),
            "dispatch_cancelled" => Some(HealthEventType::DispatchCancelled),
            "dispatch_launch_failed" => Some(HealthEventType::DispatchLaunchFailed),
            "stuck_kill" => Some(HealthEventType::StuckKill),
            "stuck_dead" => Some(HealthEventType::StuckDead),
            "max_retries" => Some(HealthEventType::MaxRetries),
            "zombie_killed" => Some(HealthEventType::ZombieKilled),
            "untracked_process" => Some(HealthEventType::UntrackedProcess),
            "session_cleaned" => Some(HealthEventType::SessionCleaned),
            "gateway_critical" => Some(HealthEventType::GatewayCritical),
            "gateway_restart_success" => Some(HealthEventType::GatewayRestartSuccess),
            "gateway_restart_failed" => Some(HealthEventType::GatewayRestartFailed),
            _ => None,
        }
    }
}

impl std::fmt::Display for HealthEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One row of the health-event log, consumed by the admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    pub id: i64,
    pub event_type: HealthEventType,
    pub details: String,
    pub dispatch_id: Option<i64>,
    pub bead_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Claim lease
// ---------------------------------------------------------------------------

/// Short-lived claim on a bead while a dispatch for it is live. At most one
/// lease exists per bead; leases with a stale heartbeat or a dangling
/// dispatch are garbage-collected by the reaper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimLease {
    pub bead_id: String,
    pub lease_holder: String,
    pub heartbeat_at: DateTime<Utc>,
    pub dispatch_id: Option<i64>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_escalation_is_monotone_and_capped() {
        assert_eq!(Tier::Fast.escalate(), Tier::Balanced);
        assert_eq!(Tier::Balanced.escalate(), Tier::Premium);
        assert_eq!(Tier::Premium.escalate(), Tier::Premium);
        assert!(Tier::Fast < Tier::Balanced);
        assert!(Tier::Balanced < Tier::Premium);
    }

    #[test]
    fn status_liveness_partition() {
        for status in [
            DispatchStatus::Running,
            DispatchStatus::Completed,
            DispatchStatus::Failed,
            DispatchStatus::Cancelled,
            DispatchStatus::Interrupted,
            DispatchStatus::Retried,
            DispatchStatus::PendingRetry,
        ] {
            assert_ne!(status.is_live(), status.is_terminal());
        }
        assert!(DispatchStatus::Running.is_live());
        assert!(DispatchStatus::PendingRetry.is_live());
        assert!(DispatchStatus::Retried.is_terminal());
    }

    #[test]
    fn status_roundtrips_through_str() {
        for status in [
            DispatchStatus::Running,
            DispatchStatus::PendingRetry,
            DispatchStatus::Interrupted,
        ] {
            assert_eq!(DispatchStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(DispatchStatus::parse("bogus"), None);
    }

    #[test]
    fn bead_parses_lister_json() {
        let raw = r#"{
            "id": "cortex-42",
            "priority": 2,
            "stage": "ready",
            "type": "feature",
            "labels": ["backend"],
            "dependencies": ["cortex-41"]
        }"#;
        let bead: Bead = serde_json::from_str(raw).unwrap();
        assert_eq!(bead.id, "cortex-42");
        assert_eq!(bead.stage, BeadStage::Ready);
        assert_eq!(bead.bead_type, "feature");
        assert_eq!(bead.dependencies, vec!["cortex-41".to_string()]);
        // project is filled by the caller, not the lister
        assert!(bead.project.is_empty());
    }

    #[test]
    fn bead_lister_json_tolerates_missing_optionals() {
        let raw = r#"{"id": "x-1", "stage": "ready"}"#;
        let bead: Bead = serde_json::from_str(raw).unwrap();
        assert_eq!(bead.priority, 0);
        assert!(bead.labels.is_empty());
        assert!(bead.dependencies.is_empty());
    }

    #[test]
    fn failure_category_serde_names() {
        let json = serde_json::to_string(&FailureCategory::TestFailure).unwrap();
        assert_eq!(json, "\"test_failure\"");
        assert_eq!(
            FailureCategory::parse("permission_denied"),
            Some(FailureCategory::PermissionDenied)
        );
    }
}
