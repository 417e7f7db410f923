//! Pluggable log sink for client lifecycle messages.

use std::sync::Arc;

/// Destination for the client's lifecycle log lines.
///
/// The default sink is [`TracingLogger`]; supply your own through
/// [`ConnectionConfig::with_logger`](crate::ConnectionConfig::with_logger).
pub trait Logger: Send + Sync {
    fn debug(&self, message: &str);
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
}

/// Forwards to `tracing` under the `hubwire` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn debug(&self, message: &str) {
        tracing::debug!(target: "hubwire", "{message}");
    }

    fn info(&self, message: &str) {
        tracing::info!(target: "hubwire", "{message}");
    }

    fn warn(&self, message: &str) {
        tracing::warn!(target: "hubwire", "{message}");
    }

    fn error(&self, message: &str) {
        tracing::error!(target: "hubwire", "{message}");
    }
}

/// The configured sink plus the debug gate.
#[derive(Clone)]
pub(crate) struct LogSink {
    inner: Arc<dyn Logger>,
    debug: bool,
}

impl LogSink {
    pub(crate) fn new(logger: Option<Arc<dyn Logger>>, debug: bool) -> Self {
        Self {
            inner: logger.unwrap_or_else(|| Arc::new(TracingLogger)),
            debug,
        }
    }

    /// Dropped unless the client was configured with `debug`.
    pub(crate) fn debug(&self, message: impl AsRef<str>) {
        if self.debug {
            self.inner.debug(message.as_ref());
        }
    }

    pub(crate) fn info(&self, message: impl AsRef<str>) {
        self.inner.info(message.as_ref());
    }

    pub(crate) fn warn(&self, message: impl AsRef<str>) {
        self.inner.warn(message.as_ref());
    }

    pub(crate) fn error(&self, message: impl AsRef<str>) {
        self.inner.error(message.as_ref());
    }
}
