//! Client configuration.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::logger::Logger;

/// Automatic reconnection with exponential backoff and an attempt ceiling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectionPolicy {
    pub enabled: bool,
    /// Delay before the first attempt.
    pub initial_delay_ms: u64,
    /// Backoff ceiling.
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Consecutive failed attempts before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 1000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            max_attempts: 10,
        }
    }
}

impl ReconnectionPolicy {
    /// A policy that never reconnects.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let ms = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exp);
        let capped = ms.min(self.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped.round() as u64)
    }
}

/// TTL cache in front of state queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CachePolicy {
    pub enabled: bool,
    pub ttl_ms: u64,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_ms: 5000,
        }
    }
}

impl CachePolicy {
    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }
}

/// Everything a [`HubClient`](crate::HubClient) needs. Read-only once the
/// client is built.
#[derive(Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint, e.g. `ws://hub.local:8123/api/websocket`.
    pub url: String,
    /// Long-lived access token.
    pub token: String,
    /// `None` means [`ReconnectionPolicy::default`].
    pub reconnection: Option<ReconnectionPolicy>,
    /// `None` disables caching.
    pub cache: Option<CachePolicy>,
    /// `None` means [`TracingLogger`](crate::logger::TracingLogger).
    pub logger: Option<Arc<dyn Logger>>,
    pub debug: bool,
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: token.into(),
            reconnection: None,
            cache: None,
            logger: None,
            debug: false,
        }
    }

    pub fn with_reconnection(mut self, policy: ReconnectionPolicy) -> Self {
        self.reconnection = Some(policy);
        self
    }

    pub fn with_cache(mut self, policy: CachePolicy) -> Self {
        self.cache = Some(policy);
        self
    }

    pub fn with_logger(mut self, logger: Arc<dyn Logger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// The effective reconnection policy.
    pub fn reconnection_policy(&self) -> ReconnectionPolicy {
        self.reconnection.clone().unwrap_or_default()
    }

    /// The effective cache policy, `None` when caching is off.
    pub fn cache_policy(&self) -> Option<&CachePolicy> {
        self.cache.as_ref().filter(|c| c.enabled)
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("url", &self.url)
            .field("token", &"<redacted>")
            .field("reconnection", &self.reconnection)
            .field("cache", &self.cache)
            .field("logger", &self.logger.as_ref().map(|_| "custom"))
            .field("debug", &self.debug)
            .finish()
    }
}
