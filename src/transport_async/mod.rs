//! Async connection managers using Tokio.
//!
//! # Example
//!
//! ```no_run
//! use leasepool::connection::{AsyncConnectionPool, ConnectionConfig, PoolConfig};
//! use leasepool::transport_async::AsyncTcpConnector;
//! use tokio::io::AsyncWriteExt;
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let pool = AsyncConnectionPool::new(
//!         PoolConfig::new("127.0.0.1:9090"),
//!         AsyncTcpConnector::new(ConnectionConfig::default()),
//!     );
//!
//!     let mut conn = pool.lease().await?;
//!     conn.write_all(b"ping\n").await?;
//!     pool.put(conn).await?;
//!
//!     pool.shutdown().await;
//!     Ok(())
//! }
//! ```

mod tcp;

pub use tcp::AsyncTcpConnector;
