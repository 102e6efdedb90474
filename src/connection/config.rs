//! Pool and connector configuration types.

use std::time::Duration;

/// Sweep interval used when none (or zero) is configured.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Socket-level configuration for the bundled TCP connectors.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Connection timeout.
    pub connect_timeout: Duration,
    /// Read timeout.
    pub read_timeout: Option<Duration>,
    /// Write timeout.
    pub write_timeout: Option<Duration>,
    /// Disable Nagle's algorithm on new sockets.
    pub nodelay: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            read_timeout: None,
            write_timeout: None,
            nodelay: true,
        }
    }
}

impl ConnectionConfig {
    /// Set the connection timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the read timeout.
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Set the write timeout.
    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Enable or disable `TCP_NODELAY`.
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Endpoint every pooled connection is opened against.
    pub address: String,
    /// Hard cap on simultaneously live connections.
    pub max_connections: usize,
    /// How long a connection may sit idle before it is stale.
    pub idle_timeout: Duration,
    /// Maximum age of a connection, measured from creation.
    pub max_lifetime: Option<Duration>,
    /// Period between background maintenance passes.
    pub sweep_interval: Duration,
}

impl PoolConfig {
    /// Create a configuration for `address` with default limits.
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            max_connections: 10,
            idle_timeout: Duration::from_secs(60),
            max_lifetime: None,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
        }
    }

    /// Set the maximum number of live connections.
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Set the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Set the maximum lifetime.
    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Disable maximum lifetime.
    pub fn without_max_lifetime(mut self) -> Self {
        self.max_lifetime = None;
        self
    }

    /// Set the sweep interval. Zero selects [`DEFAULT_SWEEP_INTERVAL`].
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// The sweep interval actually used by the background sweeper.
    pub fn effective_sweep_interval(&self) -> Duration {
        if self.sweep_interval.is_zero() {
            DEFAULT_SWEEP_INTERVAL
        } else {
            self.sweep_interval
        }
    }
}
