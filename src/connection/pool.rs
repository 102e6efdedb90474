//! Blocking connection pool for a single endpoint.

use std::fmt;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{PoolError, Result};
use crate::manager::ManageConnection;

use super::config::PoolConfig;
use super::state::{next_pool_id, Checkin, Checkout, Connection, PoolState, PoolStats, Refusal};

/// Handle to the background sweeper thread.
struct Sweeper {
    cancel: Sender<()>,
    handle: JoinHandle<()>,
}

/// State shared between pool handles and the sweeper thread.
struct Shared<M: ManageConnection> {
    id: u64,
    config: PoolConfig,
    manager: M,
    clock: Arc<dyn Clock>,
    state: RwLock<PoolState<M::Connection>>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl<M: ManageConnection> Shared<M> {
    fn read(&self) -> RwLockReadGuard<'_, PoolState<M::Connection>> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, PoolState<M::Connection>> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn refusal(&self, refusal: Refusal) -> PoolError<M::Error> {
        match refusal {
            Refusal::Closed => PoolError::PoolClosed,
            Refusal::AtCapacity => PoolError::CapacityExceeded {
                max: self.config.max_connections,
            },
        }
    }

    fn sweep(&self) -> usize {
        let started = Instant::now();
        let now = self.clock.now();
        let doomed = self.write().sweep(now, |conn| self.manager.is_alive(conn));

        let closed = doomed.len();
        self.close_batch(doomed, "sweep");
        debug!(
            addr = %self.config.address,
            elapsed_ms = started.elapsed().as_millis() as u64,
            closed,
            "idle sweep complete"
        );
        closed
    }

    /// Close connections already removed from the books. Failures are only
    /// logged.
    fn close_batch(&self, conns: Vec<Connection<M::Connection>>, reason: &'static str) {
        for conn in conns {
            if let Err(e) = self.manager.close(conn.into_inner()) {
                warn!(addr = %self.config.address, reason, error = %e, "failed to close pooled connection");
            }
        }
    }

    fn stop_sweeper(&self) {
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(sweeper) = sweeper {
            let _ = sweeper.cancel.send(());
            if sweeper.handle.join().is_err() {
                warn!(addr = %self.config.address, "idle sweeper panicked");
            }
        }
    }
}

impl<M: ManageConnection> Drop for Shared<M> {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.is_closed() {
            return;
        }

        let drained = state.shut_down();
        if !drained.is_empty() {
            debug!(addr = %self.config.address, idle = drained.len(), "pool dropped, closing idle connections");
        }
        self.close_batch(drained, "drop");
    }
}

fn run_sweeper<M: ManageConnection>(pool: Weak<Shared<M>>, cancel: Receiver<()>, interval: Duration) {
    loop {
        match cancel.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }

        let Some(shared) = pool.upgrade() else {
            break;
        };
        shared.sweep();
    }
    trace!("idle sweeper stopped");
}

/// A bounded pool of connections to one endpoint.
///
/// Connections are opened lazily by the [`ManageConnection`] on a pool
/// miss and reused in FIFO order. A background thread periodically closes
/// idle connections that went stale or make up too large a share of the
/// pool.
///
/// Leasing never waits: when every slot is taken the call fails with
/// [`PoolError::CapacityExceeded`].
///
/// Dropping the last handle closes the idle connections the same way
/// [`shutdown`](ConnectionPool::shutdown) does. Connections still leased at
/// that point are dropped without reaching the closer.
pub struct ConnectionPool<M: ManageConnection> {
    shared: Arc<Shared<M>>,
}

impl<M: ManageConnection> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: ManageConnection> ConnectionPool<M> {
    /// Create a new connection pool and start its sweeper.
    pub fn new(config: PoolConfig, manager: M) -> Self {
        Self::with_clock(config, manager, SystemClock)
    }

    /// Create a pool that reads "now" from the given clock.
    pub fn with_clock(config: PoolConfig, manager: M, clock: impl Clock) -> Self {
        let interval = config.effective_sweep_interval();
        let shared = Arc::new(Shared {
            id: next_pool_id(),
            state: RwLock::new(PoolState::new(&config)),
            config,
            manager,
            clock: Arc::new(clock),
            sweeper: Mutex::new(None),
        });

        let (cancel, cancelled) = mpsc::channel();
        let weak = Arc::downgrade(&shared);
        let spawned = thread::Builder::new()
            .name("leasepool-sweeper".into())
            .spawn(move || run_sweeper(weak, cancelled, interval));

        match spawned {
            Ok(handle) => {
                *shared.sweeper.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(Sweeper { cancel, handle });
            }
            Err(e) => {
                warn!(addr = %shared.config.address, error = %e, "failed to spawn idle sweeper");
            }
        }

        Self { shared }
    }

    /// The endpoint this pool connects to.
    pub fn address(&self) -> &str {
        &self.shared.config.address
    }

    /// The pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Lease a connection.
    ///
    /// Reuses the oldest idle connection that is still alive and fresh,
    /// closing any stale ones found on the way. Otherwise reserves a slot
    /// and opens a new connection outside the pool lock.
    pub fn lease(&self) -> Result<Connection<M::Connection>, M::Error> {
        let shared = &self.shared;
        let now = shared.clock.now();
        let decision = shared.write().checkout(now, |conn| shared.manager.is_alive(conn));
        let (checkout, stale) = decision.map_err(|refusal| shared.refusal(refusal))?;

        shared.close_batch(stale, "stale");

        match checkout {
            Checkout::Reuse(conn) => {
                trace!(addr = %shared.config.address, "reusing idle connection");
                Ok(conn)
            }
            Checkout::Create => match shared.manager.connect(&shared.config.address) {
                Ok(inner) => {
                    debug!(addr = %shared.config.address, "opened pooled connection");
                    Ok(Connection::new(inner, shared.clock.now(), shared.id))
                }
                Err(e) => {
                    shared.write().connect_failed();
                    warn!(addr = %shared.config.address, error = %e, "failed to open connection");
                    Err(PoolError::Factory(e))
                }
            },
        }
    }

    /// Return a leased connection for reuse.
    ///
    /// The connection is closed instead of queued when the pool is shut
    /// down, over capacity, or the connection fails its liveness check.
    ///
    /// A connection leased from another pool is rejected with
    /// [`PoolError::InvalidConnection`] and dropped; its slot stays taken in
    /// the pool it came from. Check [`owns`](Self::owns) first when handles
    /// from several pools are mixed.
    pub fn put(&self, conn: Connection<M::Connection>) -> Result<(), M::Error> {
        let shared = &self.shared;
        if !self.owns(&conn) {
            return Err(PoolError::InvalidConnection);
        }

        let now = shared.clock.now();
        let outcome = shared.write().checkin(conn, now, |c| shared.manager.is_alive(c));
        match outcome {
            Checkin::Queued => Ok(()),
            Checkin::Close(conn) => shared
                .manager
                .close(conn.into_inner())
                .map_err(PoolError::Closer),
        }
    }

    /// Close a connection the caller found broken. It is never reused.
    ///
    /// Foreign connections are rejected as in [`put`](Self::put).
    pub fn report_broken(&self, conn: Connection<M::Connection>) -> Result<(), M::Error> {
        let shared = &self.shared;
        if !self.owns(&conn) {
            return Err(PoolError::InvalidConnection);
        }

        shared.write().discard();
        shared
            .manager
            .close(conn.into_inner())
            .map_err(PoolError::Closer)
    }

    /// Whether `conn` was leased from this pool.
    pub fn owns(&self, conn: &Connection<M::Connection>) -> bool {
        conn.pool_id() == self.shared.id
    }

    /// Run one maintenance pass now. Returns the number of connections
    /// closed.
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Close the pool.
    ///
    /// Stops the sweeper, marks the pool closed and closes every idle
    /// connection. Leased connections are closed as they come back.
    /// Calling this again is harmless.
    pub fn shutdown(&self) {
        let shared = &self.shared;
        shared.stop_sweeper();

        let drained = shared.write().shut_down();
        debug!(addr = %shared.config.address, idle = drained.len(), "pool shut down");
        shared.close_batch(drained, "shutdown");
    }

    /// Stop the background sweeper without closing the pool.
    pub fn stop_sweeper(&self) {
        self.shared.stop_sweeper();
    }

    /// Whether the background sweeper is still running.
    pub fn is_sweeper_running(&self) -> bool {
        self.shared
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|s| !s.handle.is_finished())
    }

    /// Number of idle connections.
    pub fn idle_count(&self) -> usize {
        self.shared.read().idle_len()
    }

    /// Number of live connections, leased and idle.
    pub fn live_count(&self) -> usize {
        self.shared.read().live()
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.read().is_closed()
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> PoolStats {
        self.shared.read().stats()
    }
}

impl<M: ManageConnection> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.read();
        f.debug_struct("ConnectionPool")
            .field("address", &self.shared.config.address)
            .field("live", &state.live())
            .field("idle", &state.idle_len())
            .field("closed", &state.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::connection::testing::MockManager;

    const IDLE_TIMEOUT: Duration = Duration::from_secs(10);

    fn pool(max: usize) -> (ConnectionPool<MockManager>, MockManager, ManualClock) {
        let manager = MockManager::new();
        let clock = ManualClock::new();
        let config = PoolConfig::new("mock:1")
            .with_max_connections(max)
            .with_idle_timeout(IDLE_TIMEOUT)
            .with_sweep_interval(Duration::from_secs(3600));
        let pool = ConnectionPool::with_clock(config, manager.clone(), clock.clone());
        (pool, manager, clock)
    }

    #[test]
    fn test_lease_until_capacity() {
        let (pool, manager, _) = pool(2);

        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        let err = pool.lease().unwrap_err();

        assert!(matches!(err, PoolError::CapacityExceeded { max: 2 }));
        assert_eq!(manager.connects(), 2);
        assert_eq!(pool.live_count(), 2);
        assert_eq!(pool.stats().capacity_rejections, 1);

        pool.put(a).unwrap();
        pool.put(b).unwrap();
    }

    #[test]
    fn test_put_then_lease_reuses() {
        let (pool, manager, _) = pool(2);

        let conn = pool.lease().unwrap();
        let id = conn.id;
        pool.put(conn).unwrap();
        assert_eq!(pool.idle_count(), 1);

        let again = pool.lease().unwrap();
        assert_eq!(again.id, id);
        assert_eq!(manager.connects(), 1);
        assert_eq!(pool.stats().reused, 1);
        pool.put(again).unwrap();
    }

    #[test]
    fn test_stale_connection_replaced() {
        let (pool, manager, clock) = pool(2);

        let conn = pool.lease().unwrap();
        let id = conn.id;
        pool.put(conn).unwrap();

        clock.advance(IDLE_TIMEOUT + Duration::from_secs(1));
        let fresh = pool.lease().unwrap();

        assert_ne!(fresh.id, id);
        assert_eq!(manager.closed_ids(), vec![id]);
        assert_eq!(manager.connects(), 2);
        assert_eq!(pool.live_count(), 1);
        pool.put(fresh).unwrap();
    }

    #[test]
    fn test_idle_exactly_timeout_is_reused() {
        let (pool, manager, clock) = pool(2);

        let conn = pool.lease().unwrap();
        pool.put(conn).unwrap();
        clock.advance(IDLE_TIMEOUT);

        let again = pool.lease().unwrap();
        assert_eq!(manager.connects(), 1);
        pool.put(again).unwrap();
    }

    #[test]
    fn test_put_dead_connection_closes() {
        let (pool, manager, _) = pool(2);

        let conn = pool.lease().unwrap();
        conn.kill();
        pool.put(conn).unwrap();

        assert_eq!(manager.closes(), 1);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_put_surfaces_closer_error() {
        let (pool, manager, _) = pool(2);

        let conn = pool.lease().unwrap();
        conn.kill();
        manager.fail_close(true);

        let err = pool.put(conn).unwrap_err();
        assert!(matches!(err, PoolError::Closer(_)));
        assert_eq!(pool.live_count(), 0);
    }

    #[test]
    fn test_factory_failure_releases_slot() {
        let (pool, manager, _) = pool(1);
        manager.fail_connect(true);

        let err = pool.lease().unwrap_err();
        assert!(matches!(err, PoolError::Factory(_)));
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.stats().factory_failures, 1);

        manager.fail_connect(false);
        let conn = pool.lease().unwrap();
        pool.put(conn).unwrap();
    }

    #[test]
    fn test_report_broken_never_requeues() {
        let (pool, manager, _) = pool(2);

        let conn = pool.lease().unwrap();
        pool.report_broken(conn).unwrap();

        assert_eq!(manager.closes(), 1);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_foreign_connection_rejected() {
        let (pool, _, _) = pool(2);
        let (other, other_manager, _) = self::pool(2);

        let conn = other.lease().unwrap();
        assert!(!pool.owns(&conn));
        assert!(other.owns(&conn));
        assert!(matches!(pool.put(conn), Err(PoolError::InvalidConnection)));
        assert_eq!(other.live_count(), 1);

        let conn = other.lease().unwrap();
        assert!(matches!(pool.report_broken(conn), Err(PoolError::InvalidConnection)));
        assert_eq!(other_manager.closes(), 0);
        assert_eq!(other.live_count(), 2);
    }

    #[test]
    fn test_owns_routes_mixed_handles_home() {
        let (pool, _, _) = pool(1);
        let (other, _, _) = self::pool(1);

        let mine = pool.lease().unwrap();
        let theirs = other.lease().unwrap();
        for conn in [mine, theirs] {
            if pool.owns(&conn) {
                pool.put(conn).unwrap();
            } else {
                other.put(conn).unwrap();
            }
        }

        assert_eq!(pool.idle_count(), 1);
        assert_eq!(other.idle_count(), 1);
        assert!(pool.lease().is_ok());
        assert!(other.lease().is_ok());
    }

    #[test]
    fn test_sweep_shrinks_idle_queue() {
        let (pool, manager, _) = pool(10);

        let conns: Vec<_> = (0..6).map(|_| pool.lease().unwrap()).collect();
        for conn in conns {
            pool.put(conn).unwrap();
        }
        assert_eq!(pool.idle_count(), 6);

        assert_eq!(pool.sweep(), 2);
        assert_eq!(manager.closed_ids(), vec![0, 1]);
        assert_eq!(pool.idle_count(), 4);
        assert_eq!(pool.live_count(), 4);
    }

    #[test]
    fn test_sweep_expires_stale_and_dead() {
        let (pool, manager, clock) = pool(10);

        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        let c = pool.lease().unwrap();
        let b_handle = b.get_ref().clone();

        pool.put(a).unwrap();
        clock.advance(IDLE_TIMEOUT + Duration::from_secs(1));
        pool.put(b).unwrap();
        pool.put(c).unwrap();
        // Dies while idle.
        b_handle.kill();

        assert_eq!(pool.sweep(), 2);
        assert_eq!(manager.closed_ids(), vec![0, 1]);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.live_count(), 1);

        let conn = pool.lease().unwrap();
        assert_eq!(conn.id, 2);
        assert_eq!(manager.connects(), 3);
        pool.put(conn).unwrap();
    }

    #[test]
    fn test_sweep_closer_failure_not_fatal() {
        let (pool, manager, clock) = pool(10);

        let conn = pool.lease().unwrap();
        pool.put(conn).unwrap();
        clock.advance(IDLE_TIMEOUT * 2);
        manager.fail_close(true);

        assert_eq!(pool.sweep(), 1);
        assert_eq!(pool.live_count(), 0);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_shutdown_twice() {
        let (pool, manager, _) = pool(4);

        let a = pool.lease().unwrap();
        let b = pool.lease().unwrap();
        let leased = pool.lease().unwrap();
        pool.put(a).unwrap();
        pool.put(b).unwrap();

        pool.shutdown();
        assert_eq!(manager.closes(), 2);
        assert!(pool.is_closed());
        assert!(!pool.is_sweeper_running());
        assert_eq!(pool.live_count(), 0);

        pool.shutdown();
        assert_eq!(manager.closes(), 2);

        assert!(matches!(pool.lease(), Err(PoolError::PoolClosed)));

        // Returned after shutdown: closed on the spot.
        pool.put(leased).unwrap();
        assert_eq!(manager.closes(), 3);
        assert_eq!(pool.idle_count(), 0);
    }

    #[test]
    fn test_idle_never_exceeds_live() {
        let (pool, _, clock) = pool(3);
        let mut held = Vec::new();

        for round in 0..30 {
            if round % 3 == 2 {
                if let Some(conn) = held.pop() {
                    pool.put(conn).unwrap();
                }
            } else if let Ok(conn) = pool.lease() {
                held.push(conn);
            }
            if round % 7 == 0 {
                clock.advance(IDLE_TIMEOUT);
                pool.sweep();
            }
            assert!(pool.idle_count() <= pool.live_count());
            assert!(pool.live_count() <= 3);
        }

        for conn in held {
            pool.put(conn).unwrap();
        }
        assert!(pool.idle_count() <= pool.live_count());
    }

    #[test]
    fn test_concurrent_leases_respect_capacity() {
        let (pool, manager, _) = pool(4);

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    for _ in 0..200 {
                        match pool.lease() {
                            Ok(conn) => {
                                assert!(pool.live_count() <= 4);
                                pool.put(conn).unwrap();
                            }
                            Err(e) => assert!(e.is_retryable()),
                        }
                    }
                })
            })
            .collect();

        for worker in workers {
            worker.join().unwrap();
        }

        assert!(manager.connects() <= 4);
        assert_eq!(pool.live_count(), pool.idle_count());
        assert!(pool.live_count() <= 4);
    }

    #[test]
    fn test_background_sweeper_runs() {
        let manager = MockManager::new();
        let clock = ManualClock::new();
        let config = PoolConfig::new("mock:1")
            .with_idle_timeout(IDLE_TIMEOUT)
            .with_sweep_interval(Duration::from_millis(10));
        let pool = ConnectionPool::with_clock(config, manager.clone(), clock.clone());

        let conn = pool.lease().unwrap();
        pool.put(conn).unwrap();
        clock.advance(IDLE_TIMEOUT * 2);

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.idle_count() > 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(manager.closes(), 1);
        assert!(pool.stats().sweeps >= 1);

        assert!(pool.is_sweeper_running());
        pool.stop_sweeper();
        assert!(!pool.is_sweeper_running());
    }

    #[test]
    fn test_drop_closes_idle_connections() {
        let (pool, manager, _) = pool(2);

        let idle = pool.lease().unwrap();
        let leased = pool.lease().unwrap();
        pool.put(idle).unwrap();
        drop(pool);

        assert_eq!(manager.closed_ids(), vec![0]);
        drop(leased);
    }

    #[test]
    fn test_drop_after_shutdown_closes_nothing_twice() {
        let (pool, manager, _) = pool(2);

        let conn = pool.lease().unwrap();
        pool.put(conn).unwrap();
        pool.shutdown();
        drop(pool);

        assert_eq!(manager.closes(), 1);
    }

    #[test]
    fn test_sweeper_exits_when_pool_dropped() {
        let manager = MockManager::new();
        let config = PoolConfig::new("mock:1").with_sweep_interval(Duration::from_millis(5));
        let pool = ConnectionPool::new(config, manager);
        let weak = Arc::downgrade(&pool.shared);

        drop(pool);
        let deadline = Instant::now() + Duration::from_secs(5);
        while weak.upgrade().is_some() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(weak.upgrade().is_none());
    }
}
