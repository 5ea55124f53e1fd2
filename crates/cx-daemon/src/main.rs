//! cortexd — single-node orchestrator for AI coding agents working a pool
//! of tracked beads.
//!
//! Exit codes: 0 clean shutdown, 1 config/lock/store failures,
//! 2 dispatcher misconfiguration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use cx_core::config::{Config, ConfigHandle};
use cx_core::lockfile::InstanceLock;
use cx_core::store::StateDb;
use cx_core::types::Backend;
use cx_daemon::daemon::Daemon;
use cx_dispatch::beads::BdCli;
use cx_dispatch::pid::PidDispatcher;
use cx_dispatch::tmux::TmuxDispatcher;
use cx_dispatch::DispatcherSet;

#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

/// Cap on concurrent live tmux sessions.
const MAX_SESSIONS: usize = 16;

struct Args {
    config_path: Option<PathBuf>,
    once: bool,
    dry_run: bool,
}

fn parse_args() -> Args {
    let mut args = Args {
        config_path: None,
        once: false,
        dry_run: false,
    };
    let mut iter = std::env::args().skip(1);
    while let Some(arg) = iter.next() {
        match arg.as_str() {
            "--config" => args.config_path = iter.next().map(PathBuf::from),
            "--once" => args.once = true,
            "--dry-run" => args.dry_run = true,
            other => {
                eprintln!("unknown argument: {other}");
                std::process::exit(1);
            }
        }
    }
    args
}

#[tokio::main]
async fn main() {
    let args = parse_args();

    // --- Config (exit 1 on load/validate failure) ---
    let config_path = args
        .config_path
        .clone()
        .unwrap_or_else(Config::default_path);
    let config = match load_config(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("config error: {e}");
            std::process::exit(1);
        }
    };

    let log_handle = cx_telemetry::logging::init_logging("cortexd", &config.general.log_level);
    info!(version = env!("CARGO_PKG_VERSION"), pid = std::process::id(), "cortexd starting");

    // --- Single-instance lock (exit 1 on contention) ---
    let lock = match InstanceLock::acquire(&config.general.lock_file, &config.general.state_db) {
        Ok(lock) => lock,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };
    info!(path = %lock.path().display(), "instance lock acquired");

    // --- State store (exit 1 on open failure) ---
    if let Some(parent) = std::path::Path::new(&config.general.state_db).parent() {
        let _ = std::fs::create_dir_all(parent);
    }
    let store = match StateDb::open(&config.general.state_db).await {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!("state store error: {e}");
            std::process::exit(1);
        }
    };

    // --- Dispatch backends (exit 2 on misconfiguration) ---
    let dispatchers = match build_dispatchers(&config) {
        Ok(set) => set,
        Err(e) => {
            eprintln!("dispatcher misconfiguration: {e}");
            std::process::exit(2);
        }
    };

    let config_handle = ConfigHandle::new(config);
    let beads = Arc::new(BdCli::new());
    let daemon = Daemon::new(
        config_handle.clone(),
        store,
        dispatchers,
        beads,
        args.dry_run,
    );

    if args.once {
        let report = daemon.run_once().await;
        info!(
            admitted = report.admitted,
            retried = report.retried,
            denied = report.denied,
            "single tick complete"
        );
        lock.release();
        return;
    }

    // --- Signals ---
    let shutdown = daemon.shutdown_handle();
    spawn_signal_handlers(
        shutdown,
        config_path,
        config_handle.clone(),
        daemon.limiter(),
        log_handle,
    );

    // --- Admin API listener (exit 1 on bind failure) ---
    let bind = config_handle.snapshot().api.bind.clone();
    let listener = match tokio::net::TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(e) => {
            eprintln!("failed to bind admin API on {bind}: {e}");
            lock.release();
            std::process::exit(1);
        }
    };

    if let Err(e) = daemon.run(listener).await {
        eprintln!("daemon error: {e:#}");
        lock.release();
        std::process::exit(1);
    }

    lock.release();
}

fn load_config(path: &std::path::Path) -> anyhow::Result<Config> {
    let config = if path.exists() {
        Config::load_from(path).with_context(|| format!("loading {}", path.display()))?
    } else {
        Config::default()
    };
    config.validate().context("validating config")?;
    Ok(config)
}

/// Resolve the configured backends. Routing to the session backend
/// requires tmux on PATH.
fn build_dispatchers(config: &Config) -> Result<DispatcherSet, String> {
    let routing = &config.dispatch.routing;
    let wants_session = [
        &routing.fast_backend,
        &routing.balanced_backend,
        &routing.premium_backend,
        &routing.comms_backend,
        &routing.retry_backend,
    ]
    .iter()
    .any(|raw| Backend::parse(raw) == Some(Backend::Session));

    if wants_session {
        let probe = std::process::Command::new("tmux").arg("-V").output();
        if !probe.map(|o| o.status.success()).unwrap_or(false) {
            return Err("routing selects the session backend but tmux is not available".into());
        }
    }

    Ok(DispatcherSet::new(
        Arc::new(PidDispatcher::new()),
        Arc::new(TmuxDispatcher::new(MAX_SESSIONS)),
    ))
}

/// SIGINT/SIGTERM trigger shutdown; SIGHUP reloads config.
fn spawn_signal_handlers(
    shutdown: cx_harness::shutdown::ShutdownSignal,
    config_path: PathBuf,
    config_handle: ConfigHandle,
    limiter: Arc<cx_harness::rate_limiter::RateLimiter>,
    log_handle: cx_telemetry::logging::LogLevelHandle,
) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let stop = shutdown.clone();
        tokio::spawn(async move {
            let mut interrupt = match signal(SignalKind::interrupt()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "SIGINT handler unavailable");
                    return;
                }
            };
            let mut terminate = match signal(SignalKind::terminate()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "SIGTERM handler unavailable");
                    return;
                }
            };
            tokio::select! {
                _ = interrupt.recv() => info!("SIGINT received"),
                _ = terminate.recv() => info!("SIGTERM received"),
            }
            stop.trigger();
        });

        tokio::spawn(async move {
            let mut hangup = match signal(SignalKind::hangup()) {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "SIGHUP handler unavailable");
                    return;
                }
            };
            while hangup.recv().await.is_some() {
                reload_config(&config_path, &config_handle, &limiter, &log_handle);
            }
        });
    }

    #[cfg(not(unix))]
    {
        let _ = (config_path, config_handle, limiter, log_handle);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("ctrl-c received");
                shutdown.trigger();
            }
        });
    }
}

/// Parse, validate against the running snapshot, and swap. A rejected
/// reload keeps the old snapshot.
fn reload_config(
    path: &std::path::Path,
    handle: &ConfigHandle,
    limiter: &cx_harness::rate_limiter::RateLimiter,
    log_handle: &cx_telemetry::logging::LogLevelHandle,
) {
    info!(path = %path.display(), "SIGHUP: reloading config");
    let next = match Config::load_from(path) {
        Ok(next) => next,
        Err(e) => {
            warn!(error = %e, "reload parse failed, keeping old config");
            return;
        }
    };

    let active = handle.snapshot();
    if let Err(e) = next.validate_reload(&active) {
        warn!(error = %e, "reload rejected, keeping old config");
        return;
    }

    limiter.set_caps(next.rate_limits.clone());
    if let Err(e) = log_handle.set_level(&next.general.log_level) {
        warn!(error = %e, "log level re-derive failed");
    }
    handle.swap(next);
    info!("config reloaded");
}
