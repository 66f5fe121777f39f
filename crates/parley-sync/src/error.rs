use parley_store::StoreError;
use thiserror::Error;

/// Failures reported by a remote bridge.
///
/// Timeouts are the bridge's concern and surface as [`BridgeError::Network`];
/// this crate treats every variant as "the remote call did not succeed".
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Transport failure or timeout; retrying later may succeed.
    #[error("Network error: {0}")]
    Network(String),

    /// The remote rejected a write because local state was stale.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// The conversation or contact no longer exists remotely.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The remote refused the request (validation, permissions).
    #[error("Rejected: {0}")]
    Rejected(String),
}

impl BridgeError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network(_))
    }
}

/// Errors surfaced to callers of the sync layer. Remote failures are never
/// reported through this type; they become ERROR rows, empty batches or
/// unregistered contacts instead.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local storage failure. Always propagated since it implies data loss.
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// A detached background task panicked or was aborted.
    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SyncError>;
