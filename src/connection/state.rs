//! Pool bookkeeping shared by the blocking and async pools.
//!
//! Everything in here runs with the pool lock held and never performs I/O.
//! Operations that need a connection opened or closed hand the work back to
//! the caller, which performs it after the lock is released.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::config::PoolConfig;

/// Idle entries the sweeper never shrinks below.
pub(crate) const SHRINK_FLOOR: usize = 4;

/// The sweeper shrinks while `live <= idle * SHRINK_RATIO`.
pub(crate) const SHRINK_RATIO: usize = 4;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_pool_id() -> u64 {
    NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed)
}

/// A connection leased from a pool.
///
/// The handle must go back to the pool it came from, either through
/// `put` when it is healthy or `report_broken` when the caller saw a
/// transport failure. Dropping it instead leaks a slot of the pool's
/// capacity.
#[must_use = "leased connections must be returned or reported broken"]
pub struct Connection<C> {
    inner: C,
    created_at: Instant,
    pool_id: u64,
}

impl<C> Connection<C> {
    pub(crate) fn new(inner: C, created_at: Instant, pool_id: u64) -> Self {
        Self {
            inner,
            created_at,
            pool_id,
        }
    }

    /// Get a reference to the underlying transport.
    pub fn get_ref(&self) -> &C {
        &self.inner
    }

    /// Get a mutable reference to the underlying transport.
    pub fn get_mut(&mut self) -> &mut C {
        &mut self.inner
    }

    /// When the connection was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn pool_id(&self) -> u64 {
        self.pool_id
    }

    pub(crate) fn into_inner(self) -> C {
        self.inner
    }
}

impl<C> Deref for Connection<C> {
    type Target = C;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl<C> DerefMut for Connection<C> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner
    }
}

impl<C: fmt::Debug> fmt::Debug for Connection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("inner", &self.inner)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// An idle connection and the instant it was handed back.
pub(crate) struct IdleEntry<C> {
    conn: Connection<C>,
    enqueued_at: Instant,
}

/// FIFO of idle connections. Reuse pops from the front, returns push to
/// the back.
pub(crate) struct IdleQueue<C> {
    entries: VecDeque<IdleEntry<C>>,
}

impl<C> Default for IdleQueue<C> {
    fn default() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }
}

impl<C> IdleQueue<C> {
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn push_back(&mut self, conn: Connection<C>, now: Instant) {
        self.entries.push_back(IdleEntry {
            conn,
            enqueued_at: now,
        });
    }

    pub(crate) fn pop_front(&mut self) -> Option<IdleEntry<C>> {
        self.entries.pop_front()
    }

    /// Remove every entry matching `pred`, keeping the order of the rest.
    fn remove_where(&mut self, mut pred: impl FnMut(&IdleEntry<C>) -> bool) -> Vec<Connection<C>> {
        let mut removed = Vec::new();
        let mut kept = VecDeque::with_capacity(self.entries.len());
        for entry in self.entries.drain(..) {
            if pred(&entry) {
                removed.push(entry.conn);
            } else {
                kept.push_back(entry);
            }
        }
        self.entries = kept;
        removed
    }

    fn into_connections(self) -> Vec<Connection<C>> {
        self.entries.into_iter().map(|e| e.conn).collect()
    }
}

/// Staleness rules for idle entries.
#[derive(Debug, Clone, Copy)]
struct Expiry {
    idle_timeout: Duration,
    max_lifetime: Option<Duration>,
}

impl Expiry {
    fn is_stale<C>(&self, entry: &IdleEntry<C>, now: Instant) -> bool {
        if now.saturating_duration_since(entry.enqueued_at) > self.idle_timeout {
            return true;
        }

        match self.max_lifetime {
            Some(max) => now.saturating_duration_since(entry.conn.created_at) > max,
            None => false,
        }
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Connections handed out by the factory (including in-flight opens).
    pub created: u64,
    /// Leases served from the idle queue.
    pub reused: u64,
    /// Connections handed to the closer.
    pub destroyed: u64,
    /// Factory calls that failed.
    pub factory_failures: u64,
    /// Leases refused because the pool was full.
    pub capacity_rejections: u64,
    /// Maintenance passes run.
    pub sweeps: u64,
}

/// Why a lease was refused before touching the idle queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Refusal {
    Closed,
    AtCapacity,
}

/// Outcome of a successful checkout decision.
pub(crate) enum Checkout<C> {
    /// An idle connection passed every check.
    Reuse(Connection<C>),
    /// A slot was reserved; the caller must open a connection.
    Create,
}

/// Outcome of handing a connection back.
pub(crate) enum Checkin<C> {
    Queued,
    /// The connection must be closed by the caller.
    Close(Connection<C>),
}

/// Lock-protected state of a pool.
pub(crate) struct PoolState<C> {
    max_connections: usize,
    expiry: Expiry,
    live: usize,
    closed: bool,
    idle: IdleQueue<C>,
    connect_attempts: u64,
    stats: PoolStats,
}

impl<C> PoolState<C> {
    pub(crate) fn new(config: &PoolConfig) -> Self {
        Self {
            max_connections: config.max_connections,
            expiry: Expiry {
                idle_timeout: config.idle_timeout,
                max_lifetime: config.max_lifetime,
            },
            live: 0,
            closed: false,
            idle: IdleQueue::default(),
            connect_attempts: 0,
            stats: PoolStats::default(),
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }

    pub(crate) fn idle_len(&self) -> usize {
        self.idle.len()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn stats(&self) -> PoolStats {
        PoolStats {
            created: self.connect_attempts - self.stats.factory_failures,
            ..self.stats.clone()
        }
    }

    /// Decide how to serve a lease.
    ///
    /// Stale or dead idle entries found on the way are returned alongside
    /// the decision; they are already uncounted and must be closed.
    pub(crate) fn checkout(
        &mut self,
        now: Instant,
        is_alive: impl Fn(&C) -> bool,
    ) -> Result<(Checkout<C>, Vec<Connection<C>>), Refusal> {
        if self.closed {
            return Err(Refusal::Closed);
        }

        if self.idle.is_empty() && self.live >= self.max_connections {
            self.stats.capacity_rejections += 1;
            return Err(Refusal::AtCapacity);
        }

        let mut stale = Vec::new();
        while let Some(entry) = self.idle.pop_front() {
            if self.expiry.is_stale(&entry, now) || !is_alive(entry.conn.get_ref()) {
                self.live = self.live.saturating_sub(1);
                stale.push(entry.conn);
                continue;
            }

            self.stats.reused += 1;
            self.stats.destroyed += stale.len() as u64;
            return Ok((Checkout::Reuse(entry.conn), stale));
        }

        self.stats.destroyed += stale.len() as u64;
        self.live += 1;
        self.connect_attempts += 1;
        Ok((Checkout::Create, stale))
    }

    /// Give back the slot reserved by a [`Checkout::Create`] whose factory
    /// call failed.
    pub(crate) fn connect_failed(&mut self) {
        self.live = self.live.saturating_sub(1);
        self.stats.factory_failures += 1;
    }

    /// Give back a reserved slot whose open was abandoned before the
    /// factory finished.
    pub(crate) fn release_slot(&mut self) {
        self.live = self.live.saturating_sub(1);
        self.connect_attempts = self.connect_attempts.saturating_sub(1);
    }

    /// Queue a returned connection, or decide it must be closed.
    pub(crate) fn checkin(
        &mut self,
        conn: Connection<C>,
        now: Instant,
        is_alive: impl Fn(&C) -> bool,
    ) -> Checkin<C> {
        if self.closed {
            // Shutdown already zeroed the counter.
            self.stats.destroyed += 1;
            return Checkin::Close(conn);
        }

        if self.live > self.max_connections || !is_alive(conn.get_ref()) {
            self.live = self.live.saturating_sub(1);
            self.stats.destroyed += 1;
            return Checkin::Close(conn);
        }

        self.idle.push_back(conn, now);
        Checkin::Queued
    }

    /// Uncount a connection the caller reported broken.
    pub(crate) fn discard(&mut self) {
        self.live = self.live.saturating_sub(1);
        self.stats.destroyed += 1;
    }

    /// Run the expiry and shrink scans, returning the connections to close.
    pub(crate) fn sweep(&mut self, now: Instant, is_alive: impl Fn(&C) -> bool) -> Vec<Connection<C>> {
        let expiry = self.expiry;
        let mut doomed = self
            .idle
            .remove_where(|entry| expiry.is_stale(entry, now) || !is_alive(entry.conn.get_ref()));
        self.live = self.live.saturating_sub(doomed.len());

        while self.idle.len() > SHRINK_FLOOR && self.live <= self.idle.len() * SHRINK_RATIO {
            let Some(entry) = self.idle.pop_front() else {
                break;
            };
            self.live = self.live.saturating_sub(1);
            doomed.push(entry.conn);
        }

        self.stats.sweeps += 1;
        self.stats.destroyed += doomed.len() as u64;
        doomed
    }

    /// Close the pool and detach every idle connection.
    pub(crate) fn shut_down(&mut self) -> Vec<Connection<C>> {
        self.closed = true;
        self.live = 0;
        let drained = std::mem::take(&mut self.idle).into_connections();
        self.stats.destroyed += drained.len() as u64;
        drained
    }
}
