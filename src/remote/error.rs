use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::retry::RetryAction;

/// Typed remote errors enabling retry classification.
///
/// `is_transient()` separates failures worth retrying (rate limits, server
/// errors, dropped connections, truncated bodies) from permanent ones
/// (authorization, missing paths, malformed responses, local disk errors).
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("Rate limited on {path}")]
    RateLimited {
        path: String,
        retry_after: Option<Duration>,
    },

    #[error("Server error {status} on {path}")]
    Server {
        status: u16,
        path: String,
        retry_after: Option<Duration>,
    },

    #[error("Request for {path} timed out")]
    Timeout { path: String },

    #[error("Transport error on {path}: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("Truncated transfer of {path}: expected {expected} bytes, received {received}")]
    Truncated {
        path: String,
        expected: u64,
        received: u64,
    },

    #[error("Content hash mismatch for {0}")]
    HashMismatch(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("API error {status} on {path}: {message}")]
    Api {
        status: u16,
        path: String,
        message: String,
    },

    #[error("Invalid response for {path}: {message}")]
    InvalidResponse { path: String, message: String },

    #[error("Local write to {path} failed: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl RemoteError {
    /// Whether this error is transient and worth retrying.
    ///
    /// Truncated bodies and hash mismatches are retryable because they
    /// indicate a dropped transfer, not a changed file.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::RateLimited { .. }
            | RemoteError::Server { .. }
            | RemoteError::Timeout { .. }
            | RemoteError::Transport { .. }
            | RemoteError::Truncated { .. }
            | RemoteError::HashMismatch(_) => true,
            RemoteError::NotFound(_)
            | RemoteError::Unauthorized(_)
            | RemoteError::Api { .. }
            | RemoteError::InvalidResponse { .. }
            | RemoteError::Io { .. } => false,
        }
    }

    pub fn is_rate_limit(&self) -> bool {
        matches!(self, RemoteError::RateLimited { .. })
    }

    /// Server-suggested backoff, when the response carried one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            RemoteError::RateLimited { retry_after, .. }
            | RemoteError::Server { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    /// Classifier for [`crate::retry::retry_with_backoff`].
    pub fn retry_action(&self) -> RetryAction {
        if self.is_transient() {
            RetryAction::Retry {
                after: self.retry_after(),
                rate_limited: self.is_rate_limit(),
            }
        } else {
            RetryAction::Abort
        }
    }
}
