//! Core domain types, configuration, durable state, and process-exclusivity
//! primitives for the cortex orchestrator.

pub mod config;
pub mod lockfile;
pub mod store;
pub mod types;
