//! Tandem daemon: pairs anonymous participants and relays their messages.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// CLI argument parsing and server configuration.
pub mod config;
/// Error types for daemon operations.
pub mod error;
mod gateway;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Outbound delivery capabilities and the gateway-backed implementation.
pub mod notify;
/// Per-participant relay cooldown.
pub mod ratelimit;
/// Waiting queue and pairing state.
pub mod registry;
/// Command dispatch and message relay.
pub mod relay;
/// Accept loop and shared server state.
pub mod server;
/// Snapshot file persistence.
pub mod store;

pub use server::{run, run_with_shutdown, ServerState};
