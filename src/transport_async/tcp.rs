//! Async TCP connection manager.

use std::io;
use std::task::{Context, Poll, Waker};

use tokio::io::{AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;

use crate::connection::ConnectionConfig;
use crate::manager::AsyncManageConnection;

/// Opens, closes and probes tokio [`TcpStream`]s.
///
/// Read and write timeouts in the [`ConnectionConfig`] are not applied;
/// wrap individual operations in [`tokio::time::timeout`] instead.
#[derive(Debug, Clone, Default)]
pub struct AsyncTcpConnector {
    config: ConnectionConfig,
}

impl AsyncTcpConnector {
    /// Create a connector with the given socket configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// The socket configuration applied to new connections.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }
}

#[async_trait::async_trait]
impl AsyncManageConnection for AsyncTcpConnector {
    type Connection = TcpStream;
    type Error = io::Error;

    async fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let stream = match timeout(self.config.connect_timeout, TcpStream::connect(addr)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "Connection timeout",
                ))
            }
        };
        stream.set_nodelay(self.config.nodelay)?;
        Ok(stream)
    }

    async fn close(&self, mut stream: TcpStream) -> io::Result<()> {
        match stream.shutdown().await {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    fn is_alive(&self, stream: &TcpStream) -> bool {
        if !matches!(stream.take_error(), Ok(None)) {
            return false;
        }

        // Single non-blocking peek; idle sockets have no reader to wake.
        let mut cx = Context::from_waker(Waker::noop());
        let mut byte = [0u8; 1];
        let mut buf = ReadBuf::new(&mut byte);
        match stream.poll_peek(&mut cx, &mut buf) {
            Poll::Ready(Ok(0)) => false,
            Poll::Ready(Ok(_)) => true,
            Poll::Ready(Err(_)) => false,
            Poll::Pending => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_async_connect_and_check_liveness() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let connector = AsyncTcpConnector::default();

        let stream = connector.connect(&addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        assert!(connector.is_alive(&stream));

        drop(server_side);
        let mut alive = true;
        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            alive = connector.is_alive(&stream);
            if !alive {
                break;
            }
        }
        assert!(!alive);

        connector.close(stream).await.unwrap();
    }

    #[tokio::test]
    async fn test_async_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        assert!(AsyncTcpConnector::default().connect(&addr).await.is_err());
    }
}
