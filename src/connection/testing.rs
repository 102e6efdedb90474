//! Scripted connection manager for pool tests.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use crate::manager::ManageConnection;

/// A fake transport whose liveness can be flipped from the test.
#[derive(Debug, Clone)]
pub(crate) struct MockConn {
    pub(crate) id: usize,
    alive: Arc<AtomicBool>,
}

impl MockConn {
    pub(crate) fn kill(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct Counters {
    next_id: AtomicUsize,
    connects: AtomicUsize,
    closed: Mutex<Vec<usize>>,
    fail_connect: AtomicBool,
    fail_close: AtomicBool,
    #[cfg(feature = "tokio")]
    hang_close: AtomicBool,
}

/// Counts factory and closer calls. Clones share counters.
#[derive(Debug, Clone, Default)]
pub(crate) struct MockManager {
    counters: Arc<Counters>,
}

impl MockManager {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connects(&self) -> usize {
        self.counters.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn closes(&self) -> usize {
        self.closed_ids().len()
    }

    pub(crate) fn closed_ids(&self) -> Vec<usize> {
        self.counters.closed.lock().unwrap().clone()
    }

    pub(crate) fn fail_connect(&self, fail: bool) {
        self.counters.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn fail_close(&self, fail: bool) {
        self.counters.fail_close.store(fail, Ordering::SeqCst);
    }

    /// Make async closes pend forever.
    #[cfg(feature = "tokio")]
    pub(crate) fn hang_close(&self, hang: bool) {
        self.counters.hang_close.store(hang, Ordering::SeqCst);
    }

    fn open(&self) -> io::Result<MockConn> {
        if self.counters.fail_connect.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"));
        }
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        Ok(MockConn {
            id: self.counters.next_id.fetch_add(1, Ordering::SeqCst),
            alive: Arc::new(AtomicBool::new(true)),
        })
    }

    fn shut(&self, conn: MockConn) -> io::Result<()> {
        self.counters.closed.lock().unwrap().push(conn.id);
        if self.counters.fail_close.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "close failed"));
        }
        Ok(())
    }

    fn probe(&self, conn: &MockConn) -> bool {
        conn.alive.load(Ordering::SeqCst)
    }
}

impl ManageConnection for MockManager {
    type Connection = MockConn;
    type Error = io::Error;

    fn connect(&self, _addr: &str) -> io::Result<MockConn> {
        self.open()
    }

    fn close(&self, conn: MockConn) -> io::Result<()> {
        self.shut(conn)
    }

    fn is_alive(&self, conn: &MockConn) -> bool {
        self.probe(conn)
    }
}

#[cfg(feature = "tokio")]
#[async_trait::async_trait]
impl crate::manager::AsyncManageConnection for MockManager {
    type Connection = MockConn;
    type Error = io::Error;

    async fn connect(&self, _addr: &str) -> io::Result<MockConn> {
        tokio::task::yield_now().await;
        self.open()
    }

    async fn close(&self, conn: MockConn) -> io::Result<()> {
        if self.counters.hang_close.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        self.shut(conn)
    }

    fn is_alive(&self, conn: &MockConn) -> bool {
        self.probe(conn)
    }
}
