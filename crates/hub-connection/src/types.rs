//! Public types for the hub client.

use std::time::Duration;

use serde::Serialize;

/// Connection state of a [`HubClient`](crate::HubClient).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No live transport handle.
    Disconnected,
    /// Authentication/connect sequence in progress.
    Connecting,
    /// Connected and authenticated.
    Connected,
}

/// Where the reconnection controller currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectPhase {
    /// Nothing scheduled.
    Idle,
    /// Waiting `delay` before attempt `attempt`.
    Scheduling { attempt: u32, delay: Duration },
    /// Attempt `attempt` is running.
    Attempting { attempt: u32 },
    /// The attempt ceiling was hit; only a manual `connect()` recovers.
    Exhausted,
}

/// Outcome of [`HubClient::validate_connection`](crate::HubClient::validate_connection).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationReport {
    pub success: bool,
    pub message: String,
    /// Round trip of a no-op query; only set on success.
    pub latency_ms: Option<u64>,
}
