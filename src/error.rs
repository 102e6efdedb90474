//! Error types for pool operations.

use thiserror::Error;

/// Errors that can occur while leasing, returning or closing pooled
/// connections.
///
/// `E` is the error type of the connection manager; factory and closer
/// failures are carried through unchanged.
#[derive(Error, Debug)]
pub enum PoolError<E> {
    /// No idle connection and the pool is already at capacity.
    #[error("Connection pool at capacity: {max} connections live")]
    CapacityExceeded { max: usize },

    /// The connection handed back does not belong to this pool.
    #[error("Connection does not belong to this pool")]
    InvalidConnection,

    /// The pool has been shut down.
    #[error("Connection pool has been closed")]
    PoolClosed,

    /// The connection factory failed to open a connection.
    #[error("Failed to open connection: {0}")]
    Factory(#[source] E),

    /// The connection closer failed to tear a connection down.
    #[error("Failed to close connection: {0}")]
    Closer(#[source] E),
}

/// Result type alias for pool operations.
pub type Result<T, E> = std::result::Result<T, PoolError<E>>;

impl<E> PoolError<E> {
    /// Check if the caller may reasonably try again later.
    ///
    /// Only capacity exhaustion is transient from the pool's point of view;
    /// factory errors are the manager's to classify.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::CapacityExceeded { .. })
    }

    /// Check if this error is terminal for the pool instance.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::PoolClosed)
    }
}
