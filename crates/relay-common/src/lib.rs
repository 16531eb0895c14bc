//! Shared error taxonomy and the wire envelope the front end emits for
//! relay-originated failures.

use serde::{Deserialize, Serialize};

pub type RelayResult<T> = Result<T, RelayError>;

/// Terminal failures a task can resolve with. Upstream HTTP responses,
/// including 4xx/5xx, are not errors; these cover the relay's own failure
/// modes only.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RelayError {
    #[error("queue full: {current_size}/{limit} waiting")]
    QueueFull { current_size: usize, limit: usize },
    #[error("queue wait timeout after {waited_ms}ms (budget {budget_ms}ms)")]
    QueueTimeout { waited_ms: u64, budget_ms: u64 },
    #[error("cancelled: {reason}")]
    Cancelled { reason: String },
    #[error("upstream network error: {cause}")]
    UpstreamNetwork { cause: String },
    #[error("Proxy timeout")]
    UpstreamTimeout,
    #[error("Client disconnected")]
    ClientDisconnected,
    #[error("cannot translate upstream payload: {field}")]
    ConverterInvalid { field: String },
}

impl RelayError {
    pub fn cancelled(reason: impl Into<String>) -> Self {
        RelayError::Cancelled {
            reason: reason.into(),
        }
    }

    /// HTTP status the front end renders for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            RelayError::QueueFull { .. } | RelayError::QueueTimeout { .. } => 503,
            RelayError::Cancelled { .. } | RelayError::ClientDisconnected => 499,
            RelayError::UpstreamNetwork { .. }
            | RelayError::UpstreamTimeout
            | RelayError::ConverterInvalid { .. } => 502,
        }
    }

    /// Machine-readable code included in the JSON envelope, when one exists.
    pub fn code(&self) -> Option<&'static str> {
        match self {
            RelayError::QueueFull { .. } | RelayError::QueueTimeout { .. } => {
                Some("QUEUE_FULL_OR_TIMEOUT")
            }
            RelayError::UpstreamNetwork { .. }
            | RelayError::UpstreamTimeout
            | RelayError::ConverterInvalid { .. } => Some("PROXY_ERROR"),
            RelayError::Cancelled { .. } | RelayError::ClientDisconnected => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl ErrorBody {
    pub fn from_error(err: &RelayError) -> Self {
        Self {
            error: err.to_string(),
            code: err.code().map(str::to_string),
        }
    }
}
