//! Logging initialisation and the metrics collector behind `/metrics`.

pub mod logging;
pub mod metrics;
