//! Bounded pool of store connections
//!
//! Callers that find the pool exhausted queue up in FIFO order. A released
//! connection is handed directly to the oldest waiter, so nobody polls and
//! nobody is overtaken.

use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use library_core::{Store, StoreConnection, StoreError};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors when acquiring a connection
#[derive(Debug, Error)]
pub enum PoolError {
    /// Opening a new connection failed
    #[error(transparent)]
    Store(#[from] StoreError),
    /// No connection became available in time
    #[error("no store connection available within {0:?}")]
    Timeout(Duration),
}

/// What a release hands to a waiter
enum Grant {
    /// A ready connection
    Connection(Box<dyn StoreConnection>),
    /// Permission to open a connection; the live count already includes it
    Slot,
}

struct Waiter {
    id: u64,
    sender: Sender<Grant>,
}

struct PoolState {
    /// Idle connections, most recently released last
    idle: Vec<Box<dyn StoreConnection>>,
    /// Connections in existence, idle or handed out
    live: usize,
    waiters: VecDeque<Waiter>,
    next_waiter: u64,
}

impl PoolState {
    /// Give `grant` to the oldest waiter still listening
    ///
    /// Returns the grant if nobody took it.
    fn hand_off(&mut self, mut grant: Grant) -> Option<Grant> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.sender.try_send(grant) {
                Ok(()) => return None,
                Err(e) => grant = e.into_inner(),
            }
        }
        Some(grant)
    }
}

struct PoolInner {
    store: Arc<dyn Store>,
    min: usize,
    max: usize,
    state: Mutex<PoolState>,
}

/// Snapshot of the pool's bookkeeping
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PoolStats {
    pub min: usize,
    pub max: usize,
    pub live: usize,
    pub idle: usize,
    pub waiters: usize,
}

/// Bounded pool of store connections
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Create a new [`ConnectionPool`] and open `min` connections eagerly
    pub fn new(store: Arc<dyn Store>, min: usize, max: usize) -> Result<Self, StoreError> {
        let max = max.max(1);
        let min = min.min(max);
        let mut idle = Vec::with_capacity(max);
        for _ in 0..min {
            idle.push(store.connect()?);
        }
        debug!(min, max, "connection pool ready");
        Ok(Self {
            inner: Arc::new(PoolInner {
                store,
                min,
                max,
                state: Mutex::new(PoolState {
                    live: idle.len(),
                    idle,
                    waiters: VecDeque::new(),
                    next_waiter: 0,
                }),
            }),
        })
    }

    /// Get a connection, blocking until one is available
    pub fn acquire(&self) -> Result<PooledConnection, PoolError> {
        match self.try_acquire_or_enqueue()? {
            Ok(conn) => Ok(conn),
            Err((_, receiver)) => match receiver.recv() {
                Ok(grant) => self.claim(grant),
                Err(_) => Err(StoreError::Unavailable("connection pool closed".into()).into()),
            },
        }
    }

    /// Get a connection, giving up after `timeout`
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<PooledConnection, PoolError> {
        let (id, receiver) = match self.try_acquire_or_enqueue()? {
            Ok(conn) => return Ok(conn),
            Err(waiting) => waiting,
        };
        match receiver.recv_timeout(timeout) {
            Ok(grant) => self.claim(grant),
            Err(RecvTimeoutError::Timeout) => {
                let mut state = self.inner.state.lock();
                if let Some(pos) = state.waiters.iter().position(|w| w.id == id) {
                    state.waiters.remove(pos);
                    return Err(PoolError::Timeout(timeout));
                }
                drop(state);
                // A release picked us between the timeout and the lock; the
                // grant is already in the channel.
                match receiver.try_recv() {
                    Ok(grant) => self.claim(grant),
                    Err(_) => Err(PoolError::Timeout(timeout)),
                }
            }
            Err(RecvTimeoutError::Disconnected) => {
                Err(StoreError::Unavailable("connection pool closed".into()).into())
            }
        }
    }

    /// Current bookkeeping numbers
    pub fn stats(&self) -> PoolStats {
        let state = self.inner.state.lock();
        PoolStats {
            min: self.inner.min,
            max: self.inner.max,
            live: state.live,
            idle: state.idle.len(),
            waiters: state.waiters.len(),
        }
    }

    /// Take an idle connection, reserve a slot for a new one, or join the
    /// wait queue
    #[allow(clippy::type_complexity)]
    fn try_acquire_or_enqueue(
        &self,
    ) -> Result<Result<PooledConnection, (u64, Receiver<Grant>)>, PoolError> {
        let mut state = self.inner.state.lock();
        if let Some(conn) = state.idle.pop() {
            return Ok(Ok(self.wrap(conn)));
        }
        if state.live < self.inner.max {
            state.live += 1;
            drop(state);
            return self.open_reserved().map(Ok);
        }
        let (sender, receiver) = bounded(1);
        let id = state.next_waiter;
        state.next_waiter += 1;
        state.waiters.push_back(Waiter { id, sender });
        debug!(waiters = state.waiters.len(), "connection pool exhausted, waiting");
        Ok(Err((id, receiver)))
    }

    fn claim(&self, grant: Grant) -> Result<PooledConnection, PoolError> {
        match grant {
            Grant::Connection(conn) => Ok(self.wrap(conn)),
            Grant::Slot => self.open_reserved(),
        }
    }

    /// Open a connection for a slot already counted as live
    fn open_reserved(&self) -> Result<PooledConnection, PoolError> {
        match self.inner.store.connect() {
            Ok(conn) => Ok(self.wrap(conn)),
            Err(e) => {
                warn!(error = %e, "could not open store connection");
                let mut state = self.inner.state.lock();
                // Pass the slot on so a waiter is not stranded.
                if state.hand_off(Grant::Slot).is_some() {
                    state.live -= 1;
                }
                Err(e.into())
            }
        }
    }

    fn wrap(&self, conn: Box<dyn StoreConnection>) -> PooledConnection {
        PooledConnection {
            conn: Some(conn),
            pool: self.inner.clone(),
        }
    }
}

impl PoolInner {
    fn release(&self, mut conn: Box<dyn StoreConnection>) {
        conn.rollback();
        let mut state = self.state.lock();
        let closed = match state.hand_off(Grant::Connection(conn)) {
            None => None,
            Some(Grant::Connection(conn)) if state.idle.len() < self.max => {
                state.idle.push(conn);
                None
            }
            Some(Grant::Connection(conn)) => {
                state.live -= 1;
                Some(conn)
            }
            Some(Grant::Slot) => {
                state.live -= 1;
                None
            }
        };
        drop(state);
        drop(closed);
    }
}

/// A connection on loan from the [`ConnectionPool`]
///
/// Dropping it releases the connection back to the pool; any uncommitted
/// writes are rolled back first.
pub struct PooledConnection {
    conn: Option<Box<dyn StoreConnection>>,
    pool: Arc<PoolInner>,
}

impl PooledConnection {
    /// Return the connection to the pool
    pub fn release(self) {
        drop(self)
    }
}

impl Deref for PooledConnection {
    type Target = dyn StoreConnection;

    fn deref(&self) -> &Self::Target {
        self.conn
            .as_deref()
            .expect("pooled connection is present until released")
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn
            .as_deref_mut()
            .expect("pooled connection is present until released")
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Instant;

    use proptest::prelude::*;

    use super::*;
    use crate::store::MemoryStore;

    fn pool(store: &MemoryStore, min: usize, max: usize) -> ConnectionPool {
        ConnectionPool::new(Arc::new(store.clone()), min, max).unwrap()
    }

    /// Wait until `cond` holds, for at most two seconds
    fn eventually(cond: impl Fn() -> bool) {
        let start = Instant::now();
        while !cond() {
            assert!(start.elapsed() < Duration::from_secs(2), "condition not reached");
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn opens_min_connections_eagerly() {
        let store = MemoryStore::new();
        let pool = pool(&store, 2, 5);
        assert_eq!(store.open_connections(), 2);
        let stats = pool.stats();
        assert_eq!((stats.live, stats.idle), (2, 2));
    }

    #[test]
    fn reuses_most_recently_released() {
        let store = MemoryStore::new();
        let pool = pool(&store, 0, 3);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_eq!(pool.stats().live, 2);
        drop(a);
        drop(b);
        let _c = pool.acquire().unwrap();
        assert_eq!(pool.stats().live, 2);
        assert_eq!(pool.stats().idle, 1);
        assert_eq!(store.open_connections(), 2);
    }

    #[test]
    fn release_rolls_back_uncommitted_writes() {
        let store = MemoryStore::with_sample_data();
        let pool = pool(&store, 1, 1);
        let mut conn = pool.acquire().unwrap();
        conn.decrement_available("978-0132350884").unwrap();
        conn.release();

        let mut conn = pool.acquire().unwrap();
        conn.commit().unwrap();
        assert_eq!(
            store.committed_book("978-0132350884").unwrap().available_copies,
            5
        );
    }

    #[test]
    fn blocked_caller_gets_released_connection() {
        let store = MemoryStore::new();
        let pool = pool(&store, 0, 1);
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|_| ()).is_ok())
        };
        eventually(|| pool.stats().waiters == 1);
        drop(held);
        assert!(waiter.join().unwrap());
        assert_eq!(store.open_connections(), 1);
    }

    #[test]
    fn waiters_are_served_in_arrival_order() {
        let store = MemoryStore::new();
        let pool = pool(&store, 0, 1);
        let held = pool.acquire().unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..3 {
            let worker_pool = pool.clone();
            let order = order.clone();
            handles.push(thread::spawn(move || {
                let conn = worker_pool.acquire().unwrap();
                order.lock().push(i);
                drop(conn);
            }));
            eventually(|| pool.stats().waiters == i + 1);
        }
        drop(held);
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*order.lock(), vec![0, 1, 2]);
    }

    #[test]
    fn timed_out_waiter_leaves_the_queue() {
        let store = MemoryStore::new();
        let pool = pool(&store, 0, 1);
        let held = pool.acquire().unwrap();

        let err = pool
            .acquire_timeout(Duration::from_millis(20))
            .map(|_| ())
            .unwrap_err();
        assert!(matches!(err, PoolError::Timeout(_)));
        assert_eq!(pool.stats().waiters, 0);

        drop(held);
        let stats = pool.stats();
        assert_eq!((stats.live, stats.idle), (1, 1));
    }

    #[test]
    fn creation_failure_surfaces_as_unavailable() {
        let store = MemoryStore::new();
        let pool = pool(&store, 0, 2);
        store.set_online(false);

        let err = pool.acquire().map(|_| ()).unwrap_err();
        assert!(matches!(err, PoolError::Store(StoreError::Unavailable(_))));
        assert_eq!(pool.stats().live, 0);

        store.set_online(true);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn concurrent_callers_never_exceed_max() {
        let store = MemoryStore::new();
        let pool = pool(&store, 1, 3);
        let in_use = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let store = store.clone();
                let in_use = in_use.clone();
                let peak = peak.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let conn = pool.acquire().unwrap();
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        assert!(store.open_connections() <= 3);
                        thread::yield_now();
                        in_use.fetch_sub(1, Ordering::SeqCst);
                        drop(conn);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        let stats = pool.stats();
        assert!(stats.live <= 3);
        assert_eq!(stats.idle, stats.live);
    }

    proptest! {
        #[test]
        fn live_count_stays_bounded(
            max in 1usize..6,
            ops in proptest::collection::vec(any::<bool>(), 1..64),
        ) {
            let store = MemoryStore::new();
            let pool = pool(&store, 0, max);
            let mut held = Vec::new();
            for acquire in ops {
                if acquire {
                    if let Ok(conn) = pool.acquire_timeout(Duration::ZERO) {
                        held.push(conn);
                    }
                } else if let Some(conn) = held.pop() {
                    drop(conn);
                }
                let stats = pool.stats();
                prop_assert!(stats.live <= max);
                prop_assert!(stats.idle <= stats.live);
                prop_assert!(held.len() <= max);
                prop_assert_eq!(store.open_connections(), stats.live);
            }
        }
    }
}
