use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, reload, EnvFilter, Registry};

/// Handle for re-deriving log verbosity at runtime (SIGHUP reload).
pub struct LogLevelHandle {
    handle: reload::Handle<EnvFilter, Registry>,
}

impl LogLevelHandle {
    /// Swap the active filter for one built from `level`
    /// (e.g. "info", "debug", "cx_daemon=debug,warn").
    pub fn set_level(&self, level: &str) -> Result<(), String> {
        self.handle
            .reload(EnvFilter::new(level))
            .map_err(|e| e.to_string())
    }
}

/// Initialize logging with human-readable output.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies. Safe to call
/// more than once (tests) -- later calls keep the first subscriber but still
/// return a usable handle.
pub fn init_logging(service_name: &str, default_level: &str) -> LogLevelHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (human-readable)");
    LogLevelHandle { handle }
}

/// Initialize logging with JSON output (log shippers).
pub fn init_logging_json(service_name: &str, default_level: &str) -> LogLevelHandle {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let (filter, handle) = reload::Layer::new(filter);

    tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .json()
                .with_target(true)
                .with_file(true)
                .with_line_number(true),
        )
        .try_init()
        .ok();

    tracing::info!(service = service_name, "logging initialised (json)");
    LogLevelHandle { handle }
}
