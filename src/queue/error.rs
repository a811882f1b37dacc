//! Queue-specific error types.

use thiserror::Error;

/// Errors that can occur in the offline queue.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Durable storage read or write failed.
    #[error("queue storage error: {0}")]
    Io(#[from] std::io::Error),

    /// Entry could not be encoded or decoded.
    #[error("queue json error: {0}")]
    Json(#[from] serde_json::Error),

    /// Appending would exceed the configured capacity.
    #[error("queue full: {size_bytes} of {max_bytes} bytes used")]
    Full { size_bytes: u64, max_bytes: u64 },

    /// Entry without any delivery target.
    #[error("entry has no delivery targets")]
    NoTargets,
}
