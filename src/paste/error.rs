//! Error taxonomy and retry classification for background transfers.
//!
//! Failures fall into two buckets:
//!
//! - **Retryable**: transient network conditions (refused, reset, timed out,
//!   unreachable). Jobs hitting these go back to the queue with backoff.
//! - **Non-retryable**: authentication rejections and remote refusals
//!   (permission denied on the destination, quota, invalid path). Retrying
//!   these wastes time and can lock accounts, so the job aborts immediately.
//!
//! The SSH stack surfaces many failures as plain text, so alongside the
//! typed [`TransferError`] there is a message classifier that maps error
//! strings onto the taxonomy. Authentication patterns are checked before
//! connection patterns; a message matching both is treated as
//! non-retryable.

use thiserror::Error;

/// A failure during the background portion of a transfer.
#[derive(Debug, Clone, Error)]
pub enum TransferError {
    /// Transient network failure. Retryable.
    #[error("connection failed: {0}")]
    Connection(String),

    /// An operation exceeded its deadline. Retryable.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Credentials were rejected. Never retried.
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// The remote side refused the transfer (permissions, quota, bad path).
    /// Never retried.
    #[error("remote rejected transfer: {0}")]
    RemoteRejection(String),

    /// The engine is shutting down and the job was cancelled.
    #[error("transfer cancelled")]
    Cancelled,
}

impl TransferError {
    /// Whether a job failing with this error should return to the queue.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransferError::Connection(_) | TransferError::Timeout(_))
    }
}

/// A submission rejected before any path was handed out.
///
/// Everything discoverable synchronously must surface here: once `submit`
/// returns a path, failures are reported only through completion events.
#[derive(Debug, Clone, Error)]
pub enum SubmitError {
    #[error("payload of {size} bytes exceeds the configured limit of {limit} bytes")]
    PayloadTooLarge { size: u64, limit: u64 },
}

/// Authentication failure patterns. Matching messages are never retried.
const AUTH_ERRORS: &[&str] = &[
    "authentication failed",
    "authentication rejected",
    "password authentication failed",
    "key authentication failed",
    "agent authentication failed",
    "publickey",
    "auth fail",
    "no authentication",
    "all authentication methods failed",
    "no identities",
];

/// Remote-side refusal patterns. The session is healthy but the operation
/// is not allowed; retrying cannot help.
const REJECTION_ERRORS: &[&str] = &[
    "permission denied",
    "access denied",
    "quota exceeded",
    "disk quota",
    "no space left",
    "read-only file system",
    "invalid path",
    "is a directory",
];

/// Transient connection failure patterns worth retrying.
const RETRYABLE_ERRORS: &[&str] = &[
    "connection refused",
    "connection reset",
    "connection timed out",
    "timeout",
    "timed out",
    "network is unreachable",
    "no route to host",
    "host is down",
    "temporary failure",
    "resource temporarily unavailable",
    "handshake failed",
    "failed to connect",
    "broken pipe",
    "would block",
    "eof",
];

/// Classify an error message from the SSH stack into the transfer taxonomy.
///
/// Order matters: authentication patterns win over rejection patterns, and
/// both win over connection patterns, so "permission denied (publickey)"
/// aborts instead of retrying. Messages matching nothing are treated as
/// transient connection failures, which only costs a bounded number of
/// redundant attempts.
pub fn classify_error_message(message: &str) -> TransferError {
    let lower = message.to_lowercase();

    for pattern in AUTH_ERRORS {
        if lower.contains(pattern) {
            return TransferError::Authentication(message.to_string());
        }
    }

    for pattern in REJECTION_ERRORS {
        if lower.contains(pattern) {
            return TransferError::RemoteRejection(message.to_string());
        }
    }

    for pattern in RETRYABLE_ERRORS {
        if lower.contains(pattern) {
            if lower.contains("timed out") || lower.contains("timeout") {
                return TransferError::Timeout(message.to_string());
            }
            return TransferError::Connection(message.to_string());
        }
    }

    TransferError::Connection(message.to_string())
}
