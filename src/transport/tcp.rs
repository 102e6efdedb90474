//! Blocking TCP connection manager.

use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};

use crate::connection::ConnectionConfig;
use crate::manager::ManageConnection;

/// Opens, closes and probes blocking [`TcpStream`]s.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector {
    config: ConnectionConfig,
}

impl TcpConnector {
    /// Create a connector with the given socket configuration.
    pub fn new(config: ConnectionConfig) -> Self {
        Self { config }
    }

    /// The socket configuration applied to new connections.
    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    fn configure(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(self.config.nodelay)?;
        stream.set_read_timeout(self.config.read_timeout)?;
        stream.set_write_timeout(self.config.write_timeout)?;
        Ok(())
    }
}

impl ManageConnection for TcpConnector {
    type Connection = TcpStream;
    type Error = io::Error;

    /// Try every resolved address in turn, each bounded by the connect
    /// timeout.
    fn connect(&self, addr: &str) -> io::Result<TcpStream> {
        let mut last_err = None;
        for candidate in addr.to_socket_addrs()? {
            match TcpStream::connect_timeout(&candidate, self.config.connect_timeout) {
                Ok(stream) => {
                    self.configure(&stream)?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "No address provided")
        }))
    }

    fn close(&self, stream: TcpStream) -> io::Result<()> {
        match stream.shutdown(Shutdown::Both) {
            Err(e) if e.kind() != io::ErrorKind::NotConnected => Err(e),
            _ => Ok(()),
        }
    }

    /// Peek one byte without blocking. End of stream or a pending socket
    /// error means the peer is gone.
    fn is_alive(&self, stream: &TcpStream) -> bool {
        if !matches!(stream.take_error(), Ok(None)) {
            return false;
        }
        if stream.set_nonblocking(true).is_err() {
            return false;
        }

        let mut buf = [0u8; 1];
        let alive = match stream.peek(&mut buf) {
            Ok(0) => false,
            Ok(_) => true,
            Err(e) => e.kind() == io::ErrorKind::WouldBlock,
        };

        stream.set_nonblocking(false).is_ok() && alive
    }
}
