//! Periodic housekeeping: zombie executors, dead multiplexer sessions,
//! stale branches, stale logs, dangling claim leases, and the gateway
//! service probe.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use cx_core::config::{Config, ConfigHandle};
use cx_core::store::StateDb;
use cx_core::types::HealthEventType;

/// How far back a dispatch may be and still claim ownership of an
/// untracked executor process, in seconds.
const ZOMBIE_CORRELATION_WINDOW_SECS: i64 = 24 * 3600;

/// Claim leases with a heartbeat older than this are collected, in seconds.
const LEASE_STALE_SECS: i64 = 4 * 60;

/// Counts from one reaper sweep.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReapReport {
    pub zombies_killed: usize,
    pub untracked_seen: usize,
    pub sessions_cleaned: usize,
    pub session_zombies: usize,
    pub branches_pruned: usize,
    pub logs_pruned: usize,
    pub leases_collected: u64,
}

// ---------------------------------------------------------------------------
// Collaborator seams
// ---------------------------------------------------------------------------

/// OS process listing/killing, pluggable for tests.
#[async_trait]
pub trait ProcessProbe: Send + Sync {
    /// Pids of processes that look like one of the executor commands.
    async fn list_executor_pids(&self, commands: &[String]) -> Vec<i32>;
    fn kill(&self, pid: i32);
}

/// pgrep-based probe.
pub struct PgrepProbe;

#[async_trait]
impl ProcessProbe for PgrepProbe {
    async fn list_executor_pids(&self, commands: &[String]) -> Vec<i32> {
        let own = std::process::id() as i32;
        let mut pids = HashSet::new();
        for cmd in commands {
            let output = tokio::process::Command::new("pgrep")
                .arg("-f")
                .arg(cmd)
                .output()
                .await;
            let Ok(output) = output else { continue };
            for line in String::from_utf8_lossy(&output.stdout).lines() {
                if let Ok(pid) = line.trim().parse::<i32>() {
                    if pid != own {
                        pids.insert(pid);
                    }
                }
            }
        }
        pids.into_iter().collect()
    }

    #[cfg(unix)]
    fn kill(&self, pid: i32) {
        // SAFETY: plain kill(2); ESRCH is fine.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
    }

    #[cfg(not(unix))]
    fn kill(&self, _pid: i32) {}
}

/// Multiplexer session listing/killing, pluggable for tests.
#[async_trait]
pub trait SessionProbe: Send + Sync {
    /// `(session_name, exited)` for sessions with the cortex prefix.
    async fn list_sessions(&self) -> Vec<(String, bool)>;
    async fn kill_session(&self, name: &str) -> bool;
}

/// tmux-based probe.
pub struct TmuxProbe;

#[async_trait]
impl SessionProbe for TmuxProbe {
    async fn list_sessions(&self) -> Vec<(String, bool)> {
        cx_dispatch::tmux::list_cortex_sessions().await
    }

    async fn kill_session(&self, name: &str) -> bool {
        cx_dispatch::tmux::kill_session_by_name(name).await
    }
}

/// Git invocation seam (branch pruning).
pub trait GitRunner: Send + Sync {
    fn run_git(&self, dir: &str, args: &[&str]) -> Result<GitOutput, String>;
}

#[derive(Debug, Clone)]
pub struct GitOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Shells out to the system `git`.
pub struct SystemGit;

impl GitRunner for SystemGit {
    fn run_git(&self, dir: &str, args: &[&str]) -> Result<GitOutput, String> {
        let output = std::process::Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .map_err(|e| e.to_string())?;
        Ok(GitOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Service-manager probe for the gateway unit.
#[async_trait]
pub trait GatewayProbe: Send + Sync {
    async fn is_active(&self, unit: &str, user_service: bool) -> bool;
    async fn restart(&self, unit: &str, user_service: bool) -> bool;
}

/// systemctl-based probe.
pub struct SystemdProbe;

#[async_trait]
impl GatewayProbe for SystemdProbe {
    async fn is_active(&self, unit: &str, user_service: bool) -> bool {
        systemctl(&["is-active", unit], user_service).await
    }

    async fn restart(&self, unit: &str, user_service: bool) -> bool {
        systemctl(&["restart", unit], user_service).await
    }
}

async fn systemctl(args: &[&str], user_service: bool) -> bool {
    let mut cmd = tokio::process::Command::new("systemctl");
    if user_service {
        cmd.arg("--user");
    }
    cmd.args(args)
        .output()
        .await
        .map(|o| o.status.success())
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Reaper
// ---------------------------------------------------------------------------

pub struct Reaper {
    store: Arc<StateDb>,
    config: ConfigHandle,
    processes: Arc<dyn ProcessProbe>,
    sessions: Arc<dyn SessionProbe>,
    git: Arc<dyn GitRunner>,
    gateway: Arc<dyn GatewayProbe>,
}

impl Reaper {
    pub fn new(store: Arc<StateDb>, config: ConfigHandle) -> Self {
        Self::with_probes(
            store,
            config,
            Arc::new(PgrepProbe),
            Arc::new(TmuxProbe),
            Arc::new(SystemGit),
            Arc::new(SystemdProbe),
        )
    }

    pub fn with_probes(
        store: Arc<StateDb>,
        config: ConfigHandle,
        processes: Arc<dyn ProcessProbe>,
        sessions: Arc<dyn SessionProbe>,
        git: Arc<dyn GitRunner>,
        gateway: Arc<dyn GatewayProbe>,
    ) -> Self {
        Self {
            store,
            config,
            processes,
            sessions,
            git,
            gateway,
        }
    }

    /// One full housekeeping sweep.
    pub async fn run_sweep(&self) -> ReapReport {
        let cfg = self.config.snapshot();
        let mut report = ReapReport::default();

        self.reap_zombie_processes(&cfg, &mut report).await;
        self.reap_dead_sessions(&mut report).await;
        self.reap_stale_branches(&cfg, &mut report);
        self.reap_stale_logs(&cfg, &mut report).await;

        match self
            .store
            .gc_leases(Utc::now() - ChronoDuration::seconds(LEASE_STALE_SECS))
            .await
        {
            Ok(collected) => report.leases_collected = collected,
            Err(e) => warn!(error = %e, "lease gc failed"),
        }

        self.check_gateway(&cfg).await;

        debug!(
            zombies = report.zombies_killed,
            sessions = report.sessions_cleaned,
            branches = report.branches_pruned,
            logs = report.logs_pruned,
            "reaper sweep complete"
        );
        report
    }

    /// Kill executor-like processes that no live dispatch tracks — but only
    /// when a recent dispatch proves the process is ours. Foreign processes
    /// get a diagnostic event and are left alone.
    async fn reap_zombie_processes(&self, cfg: &Config, report: &mut ReapReport) {
        let commands = executor_commands(cfg);
        if commands.is_empty() {
            return;
        }
        let listed = self.processes.list_executor_pids(&commands).await;
        if listed.is_empty() {
            return;
        }

        let tracked: HashSet<i32> = match self.store.list_running().await {
            Ok(rows) => rows.iter().filter_map(|d| d.pid).collect(),
            Err(e) => {
                warn!(error = %e, "running listing failed, skipping zombie sweep");
                return;
            }
        };

        for pid in listed {
            if tracked.contains(&pid) {
                continue;
            }
            let correlated = self
                .store
                .recent_dispatch_with_pid(
                    pid,
                    Utc::now() - ChronoDuration::seconds(ZOMBIE_CORRELATION_WINDOW_SECS),
                )
                .await;
            match correlated {
                Ok(Some(dispatch)) => {
                    info!(pid, dispatch_id = dispatch.id, "killing zombie executor");
                    self.processes.kill(pid);
                    report.zombies_killed += 1;
                    self.append_event(
                        HealthEventType::ZombieKilled,
                        format!("pid={pid}"),
                        Some(dispatch.id),
                        Some(dispatch.bead_id),
                    )
                    .await;
                }
                Ok(None) => {
                    // Not ours — diagnostic only.
                    report.untracked_seen += 1;
                    self.append_event(
                        HealthEventType::UntrackedProcess,
                        format!("pid={pid} matches executor pattern but has no dispatch"),
                        None,
                        None,
                    )
                    .await;
                }
                Err(e) => warn!(pid, error = %e, "zombie correlation failed"),
            }
        }
    }

    /// Kill exited sessions with the cortex prefix. A session whose
    /// dispatch already reached a terminal status is routine cleanup;
    /// anything else is alert-worthy.
    async fn reap_dead_sessions(&self, report: &mut ReapReport) {
        for (name, exited) in self.sessions.list_sessions().await {
            if !exited {
                continue;
            }
            let correlated = self.store.get_dispatch_by_session(&name).await;
            let (event_type, dispatch_id, bead_id) = match correlated {
                Ok(Some(d)) if d.status.is_terminal() => {
                    report.sessions_cleaned += 1;
                    (HealthEventType::SessionCleaned, Some(d.id), Some(d.bead_id))
                }
                Ok(Some(d)) => {
                    report.session_zombies += 1;
                    (HealthEventType::ZombieKilled, Some(d.id), Some(d.bead_id))
                }
                Ok(None) => {
                    report.session_zombies += 1;
                    (HealthEventType::ZombieKilled, None, None)
                }
                Err(e) => {
                    warn!(session = %name, error = %e, "session correlation failed");
                    continue;
                }
            };

            if self.sessions.kill_session(&name).await {
                info!(session = %name, event = %event_type, "dead session removed");
            }
            self.append_event(event_type, format!("session={name}"), dispatch_id, bead_id)
                .await;
        }
    }

    /// Prune branches under the configured prefix older than the cleanup
    /// window, per enabled project that uses branches.
    fn reap_stale_branches(&self, cfg: &Config, report: &mut ReapReport) {
        let now = Utc::now().timestamp();
        let max_age_secs = (cfg.dispatch.git.branch_cleanup_days * 86_400) as i64;

        for (name, project) in cfg.projects_in_priority_order() {
            if !project.use_branches {
                continue;
            }
            let prefix = project
                .branch_prefix
                .clone()
                .unwrap_or_else(|| cfg.dispatch.git.branch_prefix.clone());

            let listing = self.git.run_git(
                &project.workspace,
                &[
                    "for-each-ref",
                    "--format",
                    "%(refname:short) %(committerdate:unix)",
                    "refs/heads/",
                ],
            );
            let listing = match listing {
                Ok(out) if out.success => out.stdout,
                Ok(out) => {
                    warn!(project = name, stderr = %out.stderr.trim(), "branch listing failed");
                    continue;
                }
                Err(e) => {
                    warn!(project = name, error = %e, "git unavailable");
                    continue;
                }
            };

            for line in listing.lines() {
                let mut parts = line.split_whitespace();
                let (Some(branch), Some(ts)) = (parts.next(), parts.next()) else {
                    continue;
                };
                if !branch.starts_with(&prefix) {
                    continue;
                }
                let Ok(ts) = ts.parse::<i64>() else { continue };
                if now - ts <= max_age_secs {
                    continue;
                }

                match self.git.run_git(&project.workspace, &["branch", "-D", branch]) {
                    Ok(out) if out.success => {
                        info!(project = name, branch, "stale branch pruned");
                        report.branches_pruned += 1;
                    }
                    Ok(out) => {
                        warn!(project = name, branch, stderr = %out.stderr.trim(), "branch delete failed");
                    }
                    Err(e) => warn!(project = name, branch, error = %e, "git unavailable"),
                }
            }
        }
    }

    /// Remove dispatch log files older than the retention window.
    async fn reap_stale_logs(&self, cfg: &Config, report: &mut ReapReport) {
        let log_dir = cfg.dispatch.log_dir.clone();
        let max_age = Duration::from_secs(cfg.dispatch.log_retention_days * 86_400);

        let pruned = tokio::task::spawn_blocking(move || {
            let mut pruned = 0usize;
            let Ok(entries) = std::fs::read_dir(&log_dir) else {
                return pruned;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                let is_log = matches!(
                    path.extension().and_then(|e| e.to_str()),
                    Some("log") | Some("prompt")
                );
                if !is_log {
                    continue;
                }
                let stale = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|t| t.elapsed().ok())
                    .map(|age| age > max_age)
                    .unwrap_or(false);
                if stale && std::fs::remove_file(&path).is_ok() {
                    pruned += 1;
                }
            }
            pruned
        })
        .await
        .unwrap_or(0);

        report.logs_pruned = pruned;
    }

    /// Probe the gateway unit; on failure attempt a restart and record the
    /// outcome, escalating to `gateway_critical` when the restart fails.
    async fn check_gateway(&self, cfg: &Config) {
        let unit = &cfg.health.gateway_unit;
        if unit.is_empty() {
            return;
        }
        let user = cfg.health.gateway_user_service;

        if self.gateway.is_active(unit, user).await {
            return;
        }
        warn!(unit = %unit, "gateway unit inactive, attempting restart");

        if self.gateway.restart(unit, user).await {
            self.append_event(
                HealthEventType::GatewayRestartSuccess,
                format!("unit={unit}"),
                None,
                None,
            )
            .await;
        } else {
            self.append_event(
                HealthEventType::GatewayRestartFailed,
                format!("unit={unit}"),
                None,
                None,
            )
            .await;
            self.append_event(
                HealthEventType::GatewayCritical,
                format!("unit={unit} failed to restart"),
                None,
                None,
            )
            .await;
        }
    }

    async fn append_event(
        &self,
        event_type: HealthEventType,
        details: String,
        dispatch_id: Option<i64>,
        bead_id: Option<String>,
    ) {
        if let Err(e) = self
            .store
            .append_health_event(event_type, details, dispatch_id, bead_id)
            .await
        {
            warn!(error = %e, "reaper event append failed");
        }
    }
}

/// Distinct executor commands the zombie sweep greps for.
fn executor_commands(cfg: &Config) -> Vec<String> {
    let mut commands = HashSet::new();
    for provider in cfg.providers.values() {
        let cmd = cfg
            .dispatch
            .cli
            .get(&provider.cli)
            .map(|c| c.cmd.clone())
            .unwrap_or_else(|| provider.cli.clone());
        if !cmd.is_empty() {
            commands.insert(cmd);
        }
    }
    commands.into_iter().collect()
}
