//! Connection pooling for a single remote endpoint.
//!
//! This module provides:
//! - A blocking pool with a background sweeper thread
//! - An async pool with a cancellable sweeper task (`tokio` feature)
//! - Configuration for capacity, idle timeout, lifetime and sweeping
//!
//! # Example
//!
//! ```no_run
//! use leasepool::connection::{ConnectionConfig, ConnectionPool, PoolConfig};
//! use leasepool::transport::TcpConnector;
//! use std::io::Write;
//! use std::time::Duration;
//!
//! let config = PoolConfig::new("127.0.0.1:9090")
//!     .with_max_connections(10)
//!     .with_idle_timeout(Duration::from_secs(60));
//! let connector = TcpConnector::new(ConnectionConfig::default());
//!
//! let pool = ConnectionPool::new(config, connector);
//!
//! let mut conn = pool.lease().unwrap();
//! match conn.write_all(b"ping\n") {
//!     Ok(()) => pool.put(conn).unwrap(),
//!     Err(_) => pool.report_broken(conn).unwrap(),
//! }
//!
//! pool.shutdown();
//! ```
//!
//! # Eviction
//!
//! Idle connections are closed when they sit unused longer than the idle
//! timeout, outlive the optional maximum lifetime, fail the manager's
//! liveness check, or when idle connections make up a quarter or more of a
//! pool holding more than four of them.

mod config;
mod pool;
mod state;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConnectionConfig, PoolConfig, DEFAULT_SWEEP_INTERVAL};
pub use pool::ConnectionPool;
pub use state::{Connection, PoolStats};

// Async variant (requires tokio feature)
#[cfg(feature = "tokio")]
mod pool_async;

#[cfg(feature = "tokio")]
pub use pool_async::AsyncConnectionPool;
