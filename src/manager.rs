//! Collaborator traits the pool uses to open, close and probe connections.
//!
//! The pool never touches a transport directly. Everything it needs to know
//! about a connection goes through one of these traits, so the same pool
//! works for raw sockets, TLS streams or protocol clients.

use std::error::Error as StdError;

/// Opens, closes and probes connections for a blocking
/// [`ConnectionPool`](crate::connection::ConnectionPool).
pub trait ManageConnection: Send + Sync + 'static {
    /// The transport handle being pooled.
    type Connection: Send + Sync + 'static;
    /// Error reported by [`connect`](Self::connect) and [`close`](Self::close).
    type Error: StdError + Send + Sync + 'static;

    /// Open a new connection to `addr`.
    ///
    /// Called without the pool lock held, so it may block on network I/O.
    fn connect(&self, addr: &str) -> Result<Self::Connection, Self::Error>;

    /// Tear a connection down.
    fn close(&self, conn: Self::Connection) -> Result<(), Self::Error>;

    /// Check whether a connection is still usable.
    ///
    /// Called with the pool lock held. Must be cheap and must not block.
    fn is_alive(&self, conn: &Self::Connection) -> bool;
}

/// Async counterpart of [`ManageConnection`] for an
/// [`AsyncConnectionPool`](crate::connection::AsyncConnectionPool).
#[cfg(feature = "tokio")]
#[async_trait::async_trait]
pub trait AsyncManageConnection: Send + Sync + 'static {
    /// The transport handle being pooled.
    type Connection: Send + Sync + 'static;
    /// Error reported by [`connect`](Self::connect) and [`close`](Self::close).
    type Error: StdError + Send + Sync + 'static;

    /// Open a new connection to `addr`.
    async fn connect(&self, addr: &str) -> Result<Self::Connection, Self::Error>;

    /// Tear a connection down.
    async fn close(&self, conn: Self::Connection) -> Result<(), Self::Error>;

    /// Check whether a connection is still usable.
    ///
    /// Runs while the pool lock is held and must not block.
    fn is_alive(&self, conn: &Self::Connection) -> bool;
}
