//! A bounded connection pool for a single remote endpoint.
//!
//! The pool hands out exclusive leases on persistent connections, takes
//! them back for reuse, and closes them when they go stale, die, or the
//! pool holds more idle connections than it needs. Opening, closing and
//! probing connections is delegated to a [`ManageConnection`]
//! implementation, so the pool knows nothing about the protocol spoken on
//! top.
//!
//! # Features
//!
//! - Non-blocking capacity control: leasing at capacity fails immediately
//! - FIFO reuse of idle connections with idle timeout and maximum lifetime
//! - Background sweeper that expires and shrinks the idle queue
//! - Network I/O (connect and close) always runs outside the pool lock
//! - Injectable [`Clock`] for deterministic tests
//! - Async pool on Tokio behind the `tokio` feature
//!
//! # Example
//!
//! ```no_run
//! use leasepool::{ConnectionPool, PoolConfig, PoolError};
//! use leasepool::transport::TcpConnector;
//! use std::io::Write;
//!
//! let pool = ConnectionPool::new(
//!     PoolConfig::new("127.0.0.1:9090").with_max_connections(2),
//!     TcpConnector::default(),
//! );
//!
//! match pool.lease() {
//!     Ok(mut conn) => {
//!         conn.write_all(b"hello").unwrap();
//!         pool.put(conn).unwrap();
//!     }
//!     Err(PoolError::CapacityExceeded { .. }) => println!("pool busy, try later"),
//!     Err(e) => eprintln!("lease failed: {e}"),
//! }
//! ```
//!
//! # Lifecycle
//!
//! ```text
//!            lease (miss)            put (healthy)
//!  factory ───────────────► leased ───────────────► idle queue
//!                             │  ▲                     │
//!              report_broken  │  └──── lease (hit) ────┤
//!              put (dead)     ▼                        │ stale / dead /
//!                           closer ◄───────────────────┘ excess / shutdown
//! ```

pub mod clock;
pub mod connection;
pub mod error;
pub mod manager;
pub mod transport;

// Async modules (require tokio feature)
#[cfg(feature = "tokio")]
pub mod transport_async;

// Re-export commonly used types at the crate root
pub use clock::{Clock, ManualClock, SystemClock};
pub use connection::{Connection, ConnectionConfig, ConnectionPool, PoolConfig, PoolStats};
pub use error::{PoolError, Result};
pub use manager::ManageConnection;

#[cfg(feature = "tokio")]
pub use connection::AsyncConnectionPool;
#[cfg(feature = "tokio")]
pub use manager::AsyncManageConnection;
