//! Implementation of the batch queue worker
//!
//! The worker is the only writer of book availability. It drains the pending
//! queue in FIFO order and applies each batch in one store transaction.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Utc;
use library_core::{
    book_cache_key, Book, Config, ReservationId, ReservationRequest, ReservationStatus,
    StoreConnection, StoreError,
};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::cache::RecencyCache;
use crate::lifecycle::ShutdownSignal;
use crate::pool::{ConnectionPool, PoolError};
use crate::queue::{Next, QueueConsumer};
use crate::sla::SlaTracker;

/// Why a batch was rolled back
#[derive(Debug, Error)]
pub enum BatchError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Timing knobs of the worker loop
#[derive(Clone, Copy, Debug)]
pub struct BatchSettings {
    /// Maximum number of requests per batch
    pub batch_size: usize,
    /// Pause after a committed batch
    pub batch_interval: Duration,
    /// How long to wait for work when the queue is empty
    pub idle_interval: Duration,
    /// Pause after a failed batch
    pub error_backoff: Duration,
    /// Artificial delay per request
    pub processing_delay: Duration,
}

impl From<&Config> for BatchSettings {
    fn from(config: &Config) -> Self {
        Self {
            batch_size: config.batch_size.max(1),
            batch_interval: config.batch_interval,
            idle_interval: config.idle_interval,
            error_backoff: config.error_backoff,
            processing_delay: config.processing_delay,
        }
    }
}

/// Outcome of one request in a committed batch
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Processed {
    pub id: ReservationId,
    pub isbn: String,
    pub status: ReservationStatus,
}

/// Single consumer of the pending-reservation queue
pub struct BatchQueueWorker {
    consumer: QueueConsumer,
    pool: ConnectionPool,
    cache: Arc<RecencyCache<String, Book>>,
    sla: Arc<SlaTracker>,
    settings: BatchSettings,
}

impl BatchQueueWorker {
    /// Create a new [`BatchQueueWorker`]
    pub fn new(
        consumer: QueueConsumer,
        pool: ConnectionPool,
        cache: Arc<RecencyCache<String, Book>>,
        sla: Arc<SlaTracker>,
        settings: BatchSettings,
    ) -> Self {
        Self {
            consumer,
            pool,
            cache,
            sla,
            settings,
        }
    }

    /// Run the worker on its own thread until `shutdown` is triggered
    pub fn spawn(self, shutdown: ShutdownSignal) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("batch-worker".into())
            .spawn(move || self.run(&shutdown))
    }

    /// The worker's main routine
    ///
    /// Returns after the batch in progress when shutdown is requested.
    pub fn run(&self, shutdown: &ShutdownSignal) {
        info!(batch_size = self.settings.batch_size, "batch worker started");
        loop {
            let items = match self.take_batch(shutdown) {
                Next::Batch { items, .. } => items,
                Next::Idle => continue,
                Next::Shutdown => break,
            };

            let pause = match self.process_batch(&items) {
                Ok(processed) => {
                    debug!(processed = processed.len(), "batch committed");
                    self.settings.batch_interval
                }
                Err(e) => {
                    error!(error = %e, batch = items.len(), "error processing reservation batch, rolled back");
                    self.settings.error_backoff
                }
            };
            if shutdown.wait(pause) {
                break;
            }
        }
        info!("batch worker stopped");
    }

    /// Extract the next batch and publish the backlog left behind it
    pub(crate) fn take_batch(&self, shutdown: &ShutdownSignal) -> Next {
        let next = self.consumer.next_batch(
            self.settings.batch_size,
            self.settings.idle_interval,
            shutdown,
        );
        if let Next::Batch { remaining, .. } = &next {
            self.sla.set_queue_depth(*remaining);
        }
        next
    }

    /// Apply one batch in a single transaction
    ///
    /// Either every request of the batch leaves `pending` or none does. Cache
    /// entries are invalidated and latencies recorded only once the commit
    /// succeeded.
    pub(crate) fn process_batch(
        &self,
        items: &[ReservationRequest],
    ) -> Result<Vec<Processed>, BatchError> {
        let mut conn = self.pool.acquire()?;
        let mut processed = Vec::with_capacity(items.len());
        let mut elapsed = Vec::with_capacity(items.len());

        for item in items {
            let start = Instant::now();
            match self.process_one(&mut *conn, item) {
                Ok(status) => {
                    processed.push(Processed {
                        id: item.id,
                        isbn: item.isbn.clone(),
                        status,
                    });
                    elapsed.push(start.elapsed());
                }
                Err(e) => {
                    conn.rollback();
                    return Err(e.into());
                }
            }
        }
        if let Err(e) = conn.commit() {
            conn.rollback();
            return Err(e.into());
        }
        conn.release();

        for (outcome, took) in processed.iter().zip(elapsed) {
            let start = Instant::now();
            self.cache.invalidate(&book_cache_key(&outcome.isbn));
            self.sla.record_sample(took + start.elapsed());
            info!(reservation = outcome.id, status = %outcome.status, "processed reservation");
        }
        Ok(processed)
    }

    fn process_one(
        &self,
        conn: &mut dyn StoreConnection,
        item: &ReservationRequest,
    ) -> Result<ReservationStatus, StoreError> {
        if !self.settings.processing_delay.is_zero() {
            thread::sleep(self.settings.processing_delay);
        }
        // A book that does not exist has no copies either.
        let status = match conn.available_copies(&item.isbn)? {
            Some(available) if available > 0 => {
                conn.decrement_available(&item.isbn)?;
                ReservationStatus::Confirmed
            }
            _ => ReservationStatus::Waitlisted,
        };
        conn.set_status(item.id, status, Utc::now())?;
        Ok(status)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::DateTime;
    use library_core::{NewBook, NewUser, ReservationRecord, Store, User};

    use super::*;
    use crate::lifecycle::Shutdown;
    use crate::queue::{reservation_queue, QueueProducer};
    use crate::store::MemoryStore;

    const SCARCE: &str = "978-0000000001";

    /// Store whose connections fail the `n`-th status update (1-based)
    struct FailingStore {
        inner: MemoryStore,
        fail_at: usize,
        calls: Arc<AtomicUsize>,
    }

    struct FailingConnection {
        inner: Box<dyn StoreConnection>,
        fail_at: usize,
        calls: Arc<AtomicUsize>,
    }

    impl Store for FailingStore {
        fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
            Ok(Box::new(FailingConnection {
                inner: self.inner.connect()?,
                fail_at: self.fail_at,
                calls: self.calls.clone(),
            }))
        }
    }

    impl StoreConnection for FailingConnection {
        fn book(&mut self, isbn: &str) -> Result<Option<Book>, StoreError> {
            self.inner.book(isbn)
        }
        fn books(&mut self, category: Option<&str>) -> Result<Vec<Book>, StoreError> {
            self.inner.books(category)
        }
        fn available_copies(&mut self, isbn: &str) -> Result<Option<u32>, StoreError> {
            self.inner.available_copies(isbn)
        }
        fn decrement_available(&mut self, isbn: &str) -> Result<(), StoreError> {
            self.inner.decrement_available(isbn)
        }
        fn set_status(
            &mut self,
            id: ReservationId,
            status: ReservationStatus,
            processed_at: DateTime<Utc>,
        ) -> Result<(), StoreError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call == self.fail_at {
                return Err(StoreError::Transaction("injected failure".into()));
            }
            self.inner.set_status(id, status, processed_at)
        }
        fn insert_book(&mut self, book: Book) -> Result<(), StoreError> {
            self.inner.insert_book(book)
        }
        fn insert_user(&mut self, user: NewUser) -> Result<User, StoreError> {
            self.inner.insert_user(user)
        }
        fn user(&mut self, user_id: &str) -> Result<Option<User>, StoreError> {
            self.inner.user(user_id)
        }
        fn insert_reservation(
            &mut self,
            user_id: &str,
            isbn: &str,
        ) -> Result<ReservationRecord, StoreError> {
            self.inner.insert_reservation(user_id, isbn)
        }
        fn reservation(
            &mut self,
            id: ReservationId,
        ) -> Result<Option<ReservationRecord>, StoreError> {
            self.inner.reservation(id)
        }
        fn reservations_for_user(
            &mut self,
            user_id: &str,
        ) -> Result<Vec<ReservationRecord>, StoreError> {
            self.inner.reservations_for_user(user_id)
        }
        fn commit(&mut self) -> Result<(), StoreError> {
            self.inner.commit()
        }
        fn rollback(&mut self) {
            self.inner.rollback()
        }
    }

    fn settings() -> BatchSettings {
        BatchSettings {
            batch_size: 10,
            batch_interval: Duration::from_millis(1),
            idle_interval: Duration::from_millis(5),
            error_backoff: Duration::from_millis(1),
            processing_delay: Duration::ZERO,
        }
    }

    fn store_with_scarce_book(copies: u32) -> MemoryStore {
        let store = MemoryStore::with_sample_data();
        let mut conn = store.connect().unwrap();
        conn.insert_book(
            NewBook {
                isbn: SCARCE.into(),
                title: "Scarce Book".into(),
                author: "Some Author".into(),
                category: "Test".into(),
                total_copies: copies,
            }
            .into_book(),
        )
        .unwrap();
        conn.commit().unwrap();
        store
    }

    /// Create `n` committed pending reservations and their work items
    fn pending(store: &MemoryStore, isbn: &str, n: usize) -> Vec<ReservationRequest> {
        let mut conn = store.connect().unwrap();
        let records: Vec<_> = (0..n)
            .map(|_| conn.insert_reservation("USR001", isbn).unwrap())
            .collect();
        conn.commit().unwrap();
        records.iter().map(ReservationRequest::for_record).collect()
    }

    struct Fixture {
        worker: BatchQueueWorker,
        producer: QueueProducer,
        cache: Arc<RecencyCache<String, Book>>,
        sla: Arc<SlaTracker>,
    }

    fn fixture(store: Arc<dyn Store>) -> Fixture {
        let (producer, consumer) = reservation_queue();
        let pool = ConnectionPool::new(store, 1, 2).unwrap();
        let cache = Arc::new(RecencyCache::new(16));
        let sla = Arc::new(SlaTracker::new(100));
        Fixture {
            worker: BatchQueueWorker::new(consumer, pool, cache.clone(), sla.clone(), settings()),
            producer,
            cache,
            sla,
        }
    }

    #[test]
    fn last_copy_goes_to_the_first_request() {
        let store = store_with_scarce_book(1);
        let fx = fixture(Arc::new(store.clone()));
        let items = pending(&store, SCARCE, 2);

        let processed = fx.worker.process_batch(&items).unwrap();
        let statuses: Vec<_> = processed.iter().map(|p| p.status).collect();
        assert_eq!(
            statuses,
            vec![ReservationStatus::Confirmed, ReservationStatus::Waitlisted]
        );
        assert_eq!(store.committed_book(SCARCE).unwrap().available_copies, 0);
        let first = store.committed_reservation(items[0].id).unwrap();
        assert_eq!(first.status, ReservationStatus::Confirmed);
        assert!(first.processed_at.is_some());
        assert_eq!(
            store.committed_reservation(items[1].id).unwrap().status,
            ReservationStatus::Waitlisted
        );
        assert_eq!(fx.sla.compliance_snapshot().sample_count, 2);
    }

    #[test]
    fn failure_mid_batch_commits_nothing() {
        let store = store_with_scarce_book(5);
        let failing = FailingStore {
            inner: store.clone(),
            fail_at: 2,
            calls: Arc::new(AtomicUsize::new(0)),
        };
        let fx = fixture(Arc::new(failing));
        let items = pending(&store, SCARCE, 3);
        fx.cache.put(book_cache_key(SCARCE), store.committed_book(SCARCE).unwrap());

        let err = fx.worker.process_batch(&items).unwrap_err();
        assert!(matches!(err, BatchError::Store(StoreError::Transaction(_))));

        assert_eq!(store.committed_book(SCARCE).unwrap().available_copies, 5);
        for item in &items {
            let record = store.committed_reservation(item.id).unwrap();
            assert_eq!(record.status, ReservationStatus::Pending);
            assert!(record.processed_at.is_none());
        }
        // Nothing changed, so the cached entry is still accurate.
        assert!(fx.cache.get(&book_cache_key(SCARCE)).is_some());
        assert_eq!(fx.sla.compliance_snapshot().sample_count, 0);
    }

    #[test]
    fn missing_book_is_waitlisted() {
        let store = store_with_scarce_book(1);
        let fx = fixture(Arc::new(store.clone()));
        let mut items = pending(&store, SCARCE, 1);
        items[0].isbn = "978-9999999999".into();

        let processed = fx.worker.process_batch(&items).unwrap();
        assert_eq!(processed[0].status, ReservationStatus::Waitlisted);
    }

    #[test]
    fn committed_batch_invalidates_cached_books() {
        let store = store_with_scarce_book(2);
        let fx = fixture(Arc::new(store.clone()));
        let key = book_cache_key(SCARCE);
        fx.cache.put(key.clone(), store.committed_book(SCARCE).unwrap());
        let items = pending(&store, SCARCE, 1);

        fx.worker.process_batch(&items).unwrap();
        assert!(fx.cache.get(&key).is_none());
        assert_eq!(store.committed_book(SCARCE).unwrap().available_copies, 1);
    }

    #[test]
    fn queue_gauge_tracks_backlog_after_each_extraction() {
        let store = store_with_scarce_book(1);
        let fx = fixture(Arc::new(store.clone()));
        for item in pending(&store, SCARCE, 25) {
            fx.producer.enqueue(item).unwrap();
        }
        let shutdown = Shutdown::new();
        let signal = shutdown.signal();

        for (taken, left) in [(10, 15), (10, 5), (5, 0)] {
            match fx.worker.take_batch(&signal) {
                Next::Batch { items, remaining } => {
                    assert_eq!(items.len(), taken);
                    assert_eq!(remaining, left);
                }
                _ => panic!("expected a batch"),
            }
            assert_eq!(fx.sla.queue_depth(), left);
            assert_eq!(fx.producer.len(), left);
        }
    }

    #[test]
    fn background_loop_drains_queue_in_order() {
        let store = store_with_scarce_book(2);
        let Fixture {
            worker,
            producer,
            sla,
            ..
        } = fixture(Arc::new(store.clone()));
        let items = pending(&store, SCARCE, 13);
        for item in items.iter().cloned() {
            producer.enqueue(item).unwrap();
        }

        let shutdown = Shutdown::new();
        let handle = worker.spawn(shutdown.signal()).unwrap();
        let start = Instant::now();
        while sla.compliance_snapshot().sample_count < items.len() {
            assert!(start.elapsed() < Duration::from_secs(5), "worker too slow");
            thread::sleep(Duration::from_millis(2));
        }
        shutdown.trigger();
        handle.join().unwrap();

        let statuses: Vec<_> = items
            .iter()
            .map(|i| store.committed_reservation(i.id).unwrap().status)
            .collect();
        assert_eq!(&statuses[..2], &[ReservationStatus::Confirmed; 2]);
        assert!(statuses[2..]
            .iter()
            .all(|s| *s == ReservationStatus::Waitlisted));
        assert_eq!(sla.queue_depth(), 0);
    }
}
