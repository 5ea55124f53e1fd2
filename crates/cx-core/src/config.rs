use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::types::{Backend, Tier};

/// Immutable configuration snapshot loaded from `~/.cortex/config.toml`.
///
/// The snapshot is read-only after load; a SIGHUP reload parses a fresh
/// snapshot, validates it against the running one, and atomically swaps the
/// `Arc` behind [`ConfigHandle`]. A tick observes either the old or the new
/// snapshot, never a mix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub rate_limits: RateLimitsConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectConfig>,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            rate_limits: RateLimitsConfig::default(),
            dispatch: DispatchConfig::default(),
            projects: BTreeMap::new(),
            providers: BTreeMap::new(),
            health: HealthConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("io: {0}")]
    Io(String),
    #[error("parse: {0}")]
    Parse(String),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("reload requires restart: {0}")]
    RestartRequired(String),
}

// ---------------------------------------------------------------------------
// Load / validate
// ---------------------------------------------------------------------------

impl Config {
    /// Load config from the default path, falling back to defaults when the
    /// file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path. Home-relative state paths are expanded.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text = std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let mut cfg: Config = toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        cfg.general.state_db = expand_home(&cfg.general.state_db);
        cfg.general.lock_file = expand_home(&cfg.general.lock_file);
        cfg.dispatch.log_dir = expand_home(&cfg.dispatch.log_dir);
        Ok(cfg)
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".cortex")
            .join("config.toml")
    }

    /// Startup validation. Any failure here is fatal (`config_invalid`).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.general.tick_interval == 0 {
            return Err(ConfigError::Invalid("general.tick_interval must be > 0".into()));
        }
        if self.general.max_per_tick == 0 {
            return Err(ConfigError::Invalid("general.max_per_tick must be > 0".into()));
        }
        if self.general.stuck_timeout == 0 {
            return Err(ConfigError::Invalid("general.stuck_timeout must be > 0".into()));
        }
        let pct = self.rate_limits.headroom_warning_pct;
        if !(0.0..=1.0).contains(&pct) {
            return Err(ConfigError::Invalid(
                "rate_limits.headroom_warning_pct must be within [0, 1]".into(),
            ));
        }
        for (label, raw) in [
            ("dispatch.routing.fast_backend", &self.dispatch.routing.fast_backend),
            ("dispatch.routing.balanced_backend", &self.dispatch.routing.balanced_backend),
            ("dispatch.routing.premium_backend", &self.dispatch.routing.premium_backend),
            ("dispatch.routing.comms_backend", &self.dispatch.routing.comms_backend),
            ("dispatch.routing.retry_backend", &self.dispatch.routing.retry_backend),
        ] {
            if !raw.is_empty() && Backend::parse(raw).is_none() {
                return Err(ConfigError::Invalid(format!(
                    "{label}: unknown backend `{raw}` (expected `pid` or `session`)"
                )));
            }
        }
        for (name, project) in &self.projects {
            if project.enabled && project.workspace.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "projects.{name}: enabled project needs a workspace"
                )));
            }
        }
        for (name, provider) in &self.providers {
            if provider.cli.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "providers.{name}: cli command must not be empty"
                )));
            }
        }
        if self.api.security.enabled && self.api.security.allowed_tokens.is_empty() {
            return Err(ConfigError::Invalid(
                "api.security.enabled requires at least one allowed token".into(),
            ));
        }
        Ok(())
    }

    /// Reload validation against the running snapshot. Changing the state DB
    /// path or the admin bind address requires a restart; the reload is
    /// rejected and the old snapshot stays active.
    pub fn validate_reload(&self, active: &Config) -> Result<(), ConfigError> {
        if self.general.state_db != active.general.state_db {
            return Err(ConfigError::RestartRequired("general.state_db changed".into()));
        }
        if self.api.bind != active.api.bind {
            return Err(ConfigError::RestartRequired("api.bind changed".into()));
        }
        self.validate()
    }

    /// Routing lookup: the backend a dispatch at `tier` launches on.
    pub fn backend_for_tier(&self, tier: Tier) -> Backend {
        let raw = match tier {
            Tier::Fast => &self.dispatch.routing.fast_backend,
            Tier::Balanced => &self.dispatch.routing.balanced_backend,
            Tier::Premium => &self.dispatch.routing.premium_backend,
        };
        Backend::parse(raw).unwrap_or(Backend::Pid)
    }

    /// Routing lookup for retry dispatches: the dedicated retry backend when
    /// configured, otherwise the tier's backend.
    pub fn backend_for_retry(&self, tier: Tier) -> Backend {
        match Backend::parse(&self.dispatch.routing.retry_backend) {
            Some(backend) => backend,
            None => self.backend_for_tier(tier),
        }
    }

    /// Enabled projects in scheduling order: configured priority ascending,
    /// ties broken by project name ascending.
    pub fn projects_in_priority_order(&self) -> Vec<(&str, &ProjectConfig)> {
        let mut projects: Vec<(&str, &ProjectConfig)> = self
            .projects
            .iter()
            .filter(|(_, p)| p.enabled)
            .map(|(name, p)| (name.as_str(), p))
            .collect();
        projects.sort_by(|a, b| a.1.priority.cmp(&b.1.priority).then(a.0.cmp(b.0)));
        projects
    }

    /// The per-tier stuck threshold in seconds; a zero tier-specific value
    /// falls back to the global `stuck_timeout`.
    pub fn stuck_timeout_for(&self, tier: Tier) -> u64 {
        let specific = match tier {
            Tier::Fast => self.general.stuck_timeout_fast,
            Tier::Balanced => self.general.stuck_timeout_balanced,
            Tier::Premium => self.general.stuck_timeout_premium,
        };
        if specific == 0 {
            self.general.stuck_timeout
        } else {
            specific
        }
    }
}

/// Expand a leading `~/` against the home directory.
fn expand_home(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest).to_string_lossy().into_owned();
        }
    }
    path.to_string()
}

// ---------------------------------------------------------------------------
// ConfigHandle — atomic snapshot swap
// ---------------------------------------------------------------------------

/// Shared handle to the active config snapshot.
///
/// Readers take a cheap `Arc` clone; a reload swaps the pointer at a safe
/// boundary (between ticks).
#[derive(Clone)]
pub struct ConfigHandle {
    inner: Arc<RwLock<Arc<Config>>>,
}

impl ConfigHandle {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    /// The current snapshot.
    pub fn snapshot(&self) -> Arc<Config> {
        self.inner.read().expect("config lock poisoned").clone()
    }

    /// Swap in a new snapshot.
    pub fn swap(&self, config: Config) {
        *self.inner.write().expect("config lock poisoned") = Arc::new(config);
    }
}

// ---------------------------------------------------------------------------
// Section structs
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GeneralConfig {
    /// Seconds between scheduler ticks.
    #[serde(default = "default_tick_interval")]
    pub tick_interval: u64,
    /// Maximum new dispatches admitted per tick.
    #[serde(default = "default_max_per_tick")]
    pub max_per_tick: usize,
    #[serde(default = "default_state_db")]
    pub state_db: String,
    #[serde(default = "default_lock_file")]
    pub lock_file: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Global stuck threshold in seconds, used when no tier-specific value
    /// is set.
    #[serde(default = "default_stuck_timeout")]
    pub stuck_timeout: u64,
    /// Tier-specific stuck thresholds in seconds; 0 means use the global
    /// `stuck_timeout`.
    #[serde(default)]
    pub stuck_timeout_fast: u64,
    #[serde(default)]
    pub stuck_timeout_balanced: u64,
    #[serde(default)]
    pub stuck_timeout_premium: u64,
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: i64,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            tick_interval: default_tick_interval(),
            max_per_tick: default_max_per_tick(),
            state_db: default_state_db(),
            lock_file: default_lock_file(),
            log_level: default_log_level(),
            stuck_timeout: default_stuck_timeout(),
            stuck_timeout_fast: 0,
            stuck_timeout_balanced: 0,
            stuck_timeout_premium: 0,
            shutdown_timeout: default_shutdown_timeout(),
            max_retries: default_max_retries(),
        }
    }
}

fn default_tick_interval() -> u64 {
    60
}
fn default_max_per_tick() -> usize {
    3
}
fn default_state_db() -> String {
    "~/.cortex/state.db".into()
}
fn default_lock_file() -> String {
    "~/.cortex/cortexd.lock".into()
}
fn default_log_level() -> String {
    "info".into()
}
fn default_stuck_timeout() -> u64 {
    3600
}
fn default_shutdown_timeout() -> u64 {
    60
}
fn default_max_retries() -> i64 {
    2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitsConfig {
    /// Authed dispatches allowed in any rolling 5-hour window.
    #[serde(default = "default_window_5h_cap")]
    pub window_5h_cap: u64,
    /// Authed dispatches allowed in any rolling 7-day window.
    #[serde(default = "default_weekly_cap")]
    pub weekly_cap: u64,
    /// Fraction of the weekly cap at which the headroom warning raises.
    #[serde(default = "default_headroom_warning_pct")]
    pub headroom_warning_pct: f64,
}

impl Default for RateLimitsConfig {
    fn default() -> Self {
        Self {
            window_5h_cap: default_window_5h_cap(),
            weekly_cap: default_weekly_cap(),
            headroom_warning_pct: default_headroom_warning_pct(),
        }
    }
}

fn default_window_5h_cap() -> u64 {
    20
}
fn default_weekly_cap() -> u64 {
    400
}
fn default_headroom_warning_pct() -> f64 {
    0.8
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Named executor CLI commands; providers reference these by name.
    #[serde(default)]
    pub cli: BTreeMap<String, CliToolConfig>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default = "default_log_dir")]
    pub log_dir: String,
    #[serde(default = "default_log_retention_days")]
    pub log_retention_days: u64,
    #[serde(default)]
    pub git: GitConfig,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            cli: BTreeMap::new(),
            routing: RoutingConfig::default(),
            log_dir: default_log_dir(),
            log_retention_days: default_log_retention_days(),
            git: GitConfig::default(),
        }
    }
}

fn default_log_dir() -> String {
    "~/.cortex/logs".into()
}
fn default_log_retention_days() -> u64 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliToolConfig {
    pub cmd: String,
}

/// Backend routing per tier, plus the comms and retry lanes.
///
/// An empty retry lane means "use the tier's backend"; an empty comms lane
/// disables the comms relay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_pid_backend")]
    pub fast_backend: String,
    #[serde(default = "default_pid_backend")]
    pub balanced_backend: String,
    #[serde(default = "default_session_backend")]
    pub premium_backend: String,
    #[serde(default)]
    pub comms_backend: String,
    #[serde(default)]
    pub retry_backend: String,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            fast_backend: default_pid_backend(),
            balanced_backend: default_pid_backend(),
            premium_backend: default_session_backend(),
            comms_backend: String::new(),
            retry_backend: String::new(),
        }
    }
}

fn default_pid_backend() -> String {
    "pid".into()
}
fn default_session_backend() -> String {
    "session".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    #[serde(default = "default_branch_prefix")]
    pub branch_prefix: String,
    #[serde(default = "default_branch_cleanup_days")]
    pub branch_cleanup_days: u64,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            branch_prefix: default_branch_prefix(),
            branch_cleanup_days: default_branch_cleanup_days(),
        }
    }
}

fn default_branch_prefix() -> String {
    "cortex/".into()
}
fn default_branch_cleanup_days() -> u64 {
    7
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Scheduling priority, ascending (1 runs before 2).
    #[serde(default = "default_project_priority")]
    pub priority: i64,
    #[serde(default)]
    pub workspace: String,
    #[serde(default)]
    pub bead_dir: String,
    /// Project-level override of `dispatch.git.branch_prefix`.
    #[serde(default)]
    pub branch_prefix: Option<String>,
    #[serde(default)]
    pub use_branches: bool,
    /// Chat room for the external comms relay; not consumed by the core.
    #[serde(default)]
    pub chat_room: Option<String>,
    /// Tier fresh dispatches start at; falls back to `fast`.
    #[serde(default)]
    pub default_tier: Option<Tier>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            priority: default_project_priority(),
            workspace: String::new(),
            bead_dir: String::new(),
            branch_prefix: None,
            use_branches: false,
            chat_room: None,
            default_tier: None,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_project_priority() -> i64 {
    100
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Name of the executor CLI entry in `dispatch.cli`.
    pub cli: String,
    pub tier: Tier,
    #[serde(default)]
    pub model: Option<String>,
    /// Whether this provider's credentials count against the shared
    /// upstream quota.
    #[serde(default)]
    pub authed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Seconds between reaper/health sweeps.
    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
    /// Service-manager unit probed by the gateway check; empty disables it.
    #[serde(default)]
    pub gateway_unit: String,
    /// Whether the gateway unit is a user service (`systemctl --user`).
    #[serde(default)]
    pub gateway_user_service: bool,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            check_interval: default_check_interval(),
            gateway_unit: String::new(),
            gateway_user_service: false,
        }
    }
}

fn default_check_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_bind")]
    pub bind: String,
    #[serde(default)]
    pub security: SecurityConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: default_api_bind(),
            security: SecurityConfig::default(),
        }
    }
}

fn default_api_bind() -> String {
    "127.0.0.1:7077".into()
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// When false, write endpoints are open (development mode).
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allowed_tokens: Vec<String>,
    /// Reject write requests from non-loopback, non-private peers.
    #[serde(default)]
    pub require_local_only: bool,
    /// JSONL audit log path; empty disables auditing.
    #[serde(default)]
    pub audit_log: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
