//! Error taxonomy for the sync engine.
//!
//! The variants separate "skip this document" ([`SyncError::Decode`]) from
//! "end this taxpayer's cycle" (everything else) so the orchestrator can
//! branch on the kind of failure without inspecting message text.

use std::time::Duration;

use thiserror::Error;

/// Result type for engine operations.
pub type SyncResult<T> = Result<T, SyncError>;

/// Errors produced by the protocol codec, unpacker, classifier and stores.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Network, TLS or HTTP-level failure. Never touches the quota ledger.
    #[error("transport error: {message}")]
    Transport {
        /// Error message.
        message: String,
        /// Whether the call can be retried.
        retryable: bool,
    },

    /// The response body did not have the expected shape.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The taxpayer is inside a rate-limit cool-down.
    #[error("quota exceeded for {taxpayer_id} at NSU {position}, retry in {} min", retry_minutes(.retry_after))]
    QuotaExceeded {
        /// Taxpayer whose budget is exhausted.
        taxpayer_id: String,
        /// Cursor position at the rejection.
        position: String,
        /// Time left before another call may be made.
        retry_after: Duration,
    },

    /// The certificate is not allowed to read this taxpayer or document.
    #[error("permission denied ({code}): {reason}")]
    PermissionDenied {
        /// Authority status code.
        code: String,
        /// Authority reason text.
        reason: String,
    },

    /// A single document could not be decoded or classified.
    #[error("decode error: {0}")]
    Decode(String),

    /// Persistence backend failure.
    #[error("store error: {0}")]
    Store(String),

    /// The signing identity could not be resolved or loaded.
    #[error("identity error: {0}")]
    Identity(String),

    /// The caller cancelled the operation.
    #[error("sync cancelled")]
    Cancelled,
}

fn retry_minutes(d: &Duration) -> u64 {
    d.as_secs().div_ceil(60)
}

impl SyncError {
    /// Creates a retryable transport error.
    pub fn transport_retryable(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: true,
        }
    }

    /// Creates a non-retryable transport error.
    pub fn transport_fatal(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            retryable: false,
        }
    }

    /// Returns true if the failed call may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transport {
                retryable: true,
                ..
            }
        )
    }

    /// Returns true for per-document failures that must not abort a batch.
    pub fn is_per_document(&self) -> bool {
        matches!(self, SyncError::Decode(_))
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        SyncError::Store(e.to_string())
    }
}

impl From<reqwest::Error> for SyncError {
    fn from(e: reqwest::Error) -> Self {
        let retryable = e.is_timeout() || e.is_connect() || e.is_request();
        SyncError::Transport {
            message: e.to_string(),
            retryable,
        }
    }
}
