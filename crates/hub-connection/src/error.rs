//! Caller-facing error taxonomy.

use crate::transport::TransportError;

/// Errors returned by [`HubClient`](crate::HubClient) operations.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    /// The hub rejected the credentials. Never retried automatically.
    #[error("authentication failed: {original_error}")]
    Authentication {
        #[source]
        original_error: TransportError,
    },

    /// Transport failure while connecting to (or querying) `url`.
    #[error("connection to {url} failed: {original_error}")]
    Connection {
        url: String,
        #[source]
        original_error: TransportError,
    },

    #[error("subscription to '{event_type}' failed: {original_error}")]
    Subscription {
        event_type: String,
        #[source]
        original_error: TransportError,
    },

    #[error("service call {domain}.{service} failed: {original_error}")]
    ServiceCall {
        domain: String,
        service: String,
        #[source]
        original_error: TransportError,
    },

    #[error("not connected")]
    NotConnected,

    #[error("already connected")]
    AlreadyConnected,

    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("entity not found: {0}")]
    EntityNotFound(String),
}

/// Result type for hub client operations.
pub type Result<T> = std::result::Result<T, HubError>;

impl HubError {
    /// Classifies a failed connection attempt.
    pub(crate) fn from_connect(url: &str, err: TransportError) -> Self {
        if err.is_auth_failure() {
            HubError::Authentication {
                original_error: err,
            }
        } else {
            HubError::Connection {
                url: url.to_string(),
                original_error: err,
            }
        }
    }

    /// Returns `true` if retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HubError::Connection { .. })
    }

    /// Returns `true` if the caller must fix its credentials.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, HubError::Authentication { .. })
    }
}
