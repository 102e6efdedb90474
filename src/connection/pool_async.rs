//! Async connection pool for a single endpoint.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{PoolError, Result};
use crate::manager::AsyncManageConnection;

use super::config::PoolConfig;
use super::state::{next_pool_id, Checkin, Checkout, Connection, PoolState, PoolStats, Refusal};

/// State shared between pool handles and the sweeper task.
struct AsyncShared<M: AsyncManageConnection> {
    id: u64,
    config: PoolConfig,
    manager: Arc<M>,
    clock: Arc<dyn Clock>,
    state: RwLock<PoolState<M::Connection>>,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl<M: AsyncManageConnection> AsyncShared<M> {
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

    async fn sweep(&self) -> usize {
        let started = Instant::now();
        let now = self.clock.now();
        let doomed = self.write().sweep(now, |conn| self.manager.is_alive(conn));

        let closed = doomed.len();
        self.close_batch(doomed, "sweep").await;
        debug!(
            addr = %self.config.address,
            elapsed_ms = started.elapsed().as_millis() as u64,
            closed,
            "idle sweep complete"
        );
        closed
    }

    async fn close_batch(&self, conns: Vec<Connection<M::Connection>>, reason: &'static str) {
        close_all(&*self.manager, &self.config.address, conns, reason).await;
    }

    /// Close connections from a context that cannot await, such as `Drop`.
    fn close_detached(&self, conns: Vec<Connection<M::Connection>>, reason: &'static str) {
        if conns.is_empty() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let manager = Arc::clone(&self.manager);
                let addr = self.config.address.clone();
                runtime.spawn(async move {
                    close_all(&*manager, &addr, conns, reason).await;
                });
            }
            Err(e) => {
                warn!(
                    addr = %self.config.address,
                    reason,
                    dropped = conns.len(),
                    error = %e,
                    "no tokio runtime, dropping connections unclosed"
                );
            }
        }
    }

    fn take_sweeper(&self) -> Option<JoinHandle<()>> {
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

async fn close_all<M: AsyncManageConnection>(
    manager: &M,
    addr: &str,
    conns: Vec<Connection<M::Connection>>,
    reason: &'static str,
) {
    for conn in conns {
        if let Err(e) = manager.close(conn.into_inner()).await {
            warn!(addr, reason, error = %e, "failed to close pooled connection");
        }
    }
}

impl<M: AsyncManageConnection> Drop for AsyncShared<M> {
    fn drop(&mut self) {
        self.cancel.cancel();

        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.is_closed() {
            return;
        }
        let drained = state.shut_down();
        self.close_detached(drained, "drop");
    }
}

/// Pool bookkeeping for a lease that has not reached the caller yet.
///
/// If the lease future is dropped first, a slot reserved for a new
/// connection is handed back, and a connection already taken off the idle
/// queue is uncounted and closed in the background.
struct Reservation<'a, M: AsyncManageConnection> {
    shared: &'a AsyncShared<M>,
    reused: Option<Connection<M::Connection>>,
    armed: bool,
}

impl<'a, M: AsyncManageConnection> Reservation<'a, M> {
    fn new(shared: &'a AsyncShared<M>, checkout: Checkout<M::Connection>) -> Self {
        let reused = match checkout {
            Checkout::Reuse(conn) => Some(conn),
            Checkout::Create => None,
        };
        Self {
            shared,
            reused,
            armed: true,
        }
    }

    fn take_reused(&mut self) -> Option<Connection<M::Connection>> {
        let conn = self.reused.take();
        if conn.is_some() {
            self.armed = false;
        }
        conn
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<M: AsyncManageConnection> Drop for Reservation<'_, M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        match self.reused.take() {
            None => self.shared.write().release_slot(),
            Some(conn) => {
                self.shared.write().discard();
                trace!(addr = %self.shared.config.address, "lease cancelled, closing reused connection");
                self.shared.close_detached(vec![conn], "cancelled");
            }
        }
    }
}

async fn run_sweeper<M: AsyncManageConnection>(
    pool: Weak<AsyncShared<M>>,
    cancel: CancellationToken,
    interval: Duration,
) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            () = sleep(interval) => {}
        }

        let Some(shared) = pool.upgrade() else {
            break;
        };
        shared.sweep().await;
    }
    trace!("idle sweeper stopped");
}

/// An async bounded pool of connections to one endpoint.
///
/// Behaves like [`ConnectionPool`](super::ConnectionPool), with the
/// factory and closer awaited instead of blocking and the sweeper running
/// as a tokio task. The sweeper stops when the pool shuts down, when the
/// last pool handle is dropped, or when the parent token passed to
/// [`with_cancellation`](Self::with_cancellation) is cancelled.
///
/// Dropping the last handle hands the idle connections to the closer on a
/// background task. Outside a tokio runtime they are dropped unclosed, so
/// prefer [`shutdown`](Self::shutdown) when the closer must finish before
/// moving on.
pub struct AsyncConnectionPool<M: AsyncManageConnection> {
    shared: Arc<AsyncShared<M>>,
}

impl<M: AsyncManageConnection> Clone for AsyncConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<M: AsyncManageConnection> AsyncConnectionPool<M> {
    /// Create a new async connection pool.
    ///
    /// The sweeper is spawned on the current tokio runtime; outside a
    /// runtime the pool works but never sweeps on its own.
    pub fn new(config: PoolConfig, manager: M) -> Self {
        Self::with_clock(config, manager, SystemClock)
    }

    /// Create a pool that reads "now" from the given clock.
    pub fn with_clock(config: PoolConfig, manager: M, clock: impl Clock) -> Self {
        Self::with_cancellation(config, manager, clock, &CancellationToken::new())
    }

    /// Create a pool whose sweeper also stops when `parent` is cancelled.
    pub fn with_cancellation(
        config: PoolConfig,
        manager: M,
        clock: impl Clock,
        parent: &CancellationToken,
    ) -> Self {
        let interval = config.effective_sweep_interval();
        let cancel = parent.child_token();
        let shared = Arc::new(AsyncShared {
            id: next_pool_id(),
            state: RwLock::new(PoolState::new(&config)),
            config,
            manager: Arc::new(manager),
            clock: Arc::new(clock),
            cancel: cancel.clone(),
            sweeper: Mutex::new(None),
        });

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let handle = runtime.spawn(run_sweeper(Arc::downgrade(&shared), cancel, interval));
                *shared.sweeper.lock().unwrap_or_else(PoisonError::into_inner) = Some(handle);
            }
            Err(e) => {
                warn!(addr = %shared.config.address, error = %e, "no tokio runtime, idle sweeper disabled");
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
    /// otherwise opens a new one. Fails immediately when the pool is full.
    pub async fn lease(&self) -> Result<Connection<M::Connection>, M::Error> {
        let shared = &*self.shared;
        let now = shared.clock.now();
        let decision = shared.write().checkout(now, |conn| shared.manager.is_alive(conn));
        let (checkout, stale) = decision.map_err(|refusal| shared.refusal(refusal))?;

        let mut reservation = Reservation::new(shared, checkout);
        shared.close_batch(stale, "stale").await;

        if let Some(conn) = reservation.take_reused() {
            trace!(addr = %shared.config.address, "reusing idle connection");
            return Ok(conn);
        }

        match shared.manager.connect(&shared.config.address).await {
            Ok(inner) => {
                reservation.disarm();
                debug!(addr = %shared.config.address, "opened pooled connection");
                Ok(Connection::new(inner, shared.clock.now(), shared.id))
            }
            Err(e) => {
                reservation.disarm();
                shared.write().connect_failed();
                warn!(addr = %shared.config.address, error = %e, "failed to open connection");
                Err(PoolError::Factory(e))
            }
        }
    }

    /// Return a leased connection for reuse.
    ///
    /// The connection is closed instead of queued when the pool is shut
    /// down, over capacity, or the connection fails its liveness check.
    /// A connection from another pool is rejected with
    /// [`PoolError::InvalidConnection`] and dropped; see
    /// [`owns`](Self::owns).
    pub async fn put(&self, conn: Connection<M::Connection>) -> Result<(), M::Error> {
        let shared = &*self.shared;
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
                .await
                .map_err(PoolError::Closer),
        }
    }

    /// Close a connection the caller found broken. It is never reused.
    pub async fn report_broken(&self, conn: Connection<M::Connection>) -> Result<(), M::Error> {
        let shared = &*self.shared;
        if !self.owns(&conn) {
            return Err(PoolError::InvalidConnection);
        }

        shared.write().discard();
        shared
            .manager
            .close(conn.into_inner())
            .await
            .map_err(PoolError::Closer)
    }

    /// Whether `conn` was leased from this pool.
    pub fn owns(&self, conn: &Connection<M::Connection>) -> bool {
        conn.pool_id() == self.shared.id
    }

    /// Run one maintenance pass now. Returns the number of connections
    /// closed.
    pub async fn sweep(&self) -> usize {
        self.shared.sweep().await
    }

    /// Close the pool.
    ///
    /// Stops the sweeper, marks the pool closed and closes every idle
    /// connection. Calling this again is harmless.
    pub async fn shutdown(&self) {
        let shared = &*self.shared;
        shared.cancel.cancel();
        if let Some(handle) = shared.take_sweeper() {
            if let Err(e) = handle.await {
                warn!(addr = %shared.config.address, error = %e, "idle sweeper failed");
            }
        }

        let drained = shared.write().shut_down();
        debug!(addr = %shared.config.address, idle = drained.len(), "pool shut down");
        shared.close_batch(drained, "shutdown").await;
    }

    /// Whether the background sweeper is still running.
    pub fn is_sweeper_running(&self) -> bool {
        self.shared
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
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

impl<M: AsyncManageConnection> fmt::Debug for AsyncConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.read();
        f.debug_struct("AsyncConnectionPool")
            .field("address", &self.shared.config.address)
            .field("live", &state.live())
            .field("idle", &state.idle_len())
            .field("closed", &state.is_closed())
            .finish()
    }
}
