//! Implementation of a backend replica: the catalog and reservation API
//!
//! A replica owns the connection pool, the book cache, the SLA tracker and
//! the producer side of the pending queue. Its background threads (the batch
//! worker and the SLA reporter) are bound to the replica's [`Shutdown`].

use std::sync::Arc;
use std::thread::JoinHandle;

use chrono::{DateTime, Utc};
use library_core::{
    book_cache_key, Book, Config, Method, NewBook, NewUser, Request, RequestHandler,
    ReservationRecord, ReservationRequest, ReservationStatus, Response, Store, StoreError,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::cache::RecencyCache;
use crate::lifecycle::Shutdown;
use crate::pool::{ConnectionPool, PoolError, PooledConnection};
use crate::queue::{reservation_queue, QueueProducer};
use crate::report;
use crate::sla::{SlaTracker, QUEUE_DEPTH_TARGET};
use crate::worker::{BatchQueueWorker, BatchSettings};
use crate::LaunchError;

/// Error of one API call, rendered as `{"detail": ...}`
#[derive(Debug, Error)]
enum ApiError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Unprocessable(String),
    #[error("{0}")]
    Unavailable(String),
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> u16 {
        match self {
            ApiError::NotFound(_) => 404,
            ApiError::BadRequest(_) => 400,
            ApiError::Unprocessable(_) => 422,
            ApiError::Unavailable(_) => 503,
            ApiError::Internal(_) => 500,
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Unavailable(msg) => ApiError::Unavailable(msg),
            StoreError::BookNotFound(_) => ApiError::NotFound("Book not found".into()),
            StoreError::UserNotFound(_) => ApiError::NotFound("User not found".into()),
            StoreError::ReservationNotFound(_) => {
                ApiError::NotFound("Reservation not found".into())
            }
            StoreError::Duplicate(what) => ApiError::BadRequest(format!("{what} already exists")),
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl From<PoolError> for ApiError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Store(e) => e.into(),
            PoolError::Timeout(_) => ApiError::Unavailable(e.to_string()),
        }
    }
}

type ApiResult = Result<Response, ApiError>;

/// Body of `POST /reservations`
#[derive(Deserialize)]
struct ReservationCreate {
    user_id: String,
    isbn: String,
}

/// A reservation joined with its book's title
#[derive(Serialize)]
struct ReservationView {
    id: u64,
    user_id: String,
    isbn: String,
    book_title: String,
    status: ReservationStatus,
    created_at: DateTime<Utc>,
    processed_at: Option<DateTime<Utc>>,
}

impl ReservationView {
    fn new(record: ReservationRecord, book_title: String) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id,
            isbn: record.isbn,
            book_title,
            status: record.status,
            created_at: record.created_at,
            processed_at: record.processed_at,
        }
    }
}

fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn parse_body<T: DeserializeOwned>(request: &Request) -> Result<T, ApiError> {
    serde_json::from_slice(&request.body).map_err(|e| ApiError::Unprocessable(e.to_string()))
}

/// One backend replica of the library API
pub struct Replica {
    config: Config,
    pool: ConnectionPool,
    cache: Arc<RecencyCache<String, Book>>,
    sla: Arc<SlaTracker>,
    producer: QueueProducer,
    shutdown: Shutdown,
    worker: JoinHandle<()>,
    reporter: JoinHandle<()>,
}

impl Replica {
    /// Build every component and start the background threads
    pub fn start(config: Config, store: Arc<dyn Store>) -> Result<Self, LaunchError> {
        let pool = ConnectionPool::new(store, config.min_connections, config.max_connections)?;
        let cache = Arc::new(RecencyCache::new(config.cache_size));
        let sla = Arc::new(SlaTracker::new(config.sla_window));
        let (producer, consumer) = reservation_queue();
        let shutdown = Shutdown::new();

        let worker = BatchQueueWorker::new(
            consumer,
            pool.clone(),
            cache.clone(),
            sla.clone(),
            BatchSettings::from(&config),
        )
        .spawn(shutdown.signal())?;
        let reporter = report::spawn_sla_reporter(sla.clone(), config.clone(), shutdown.signal())?;

        info!(environment = %config.environment, "library system started");
        Ok(Self {
            config,
            pool,
            cache,
            sla,
            producer,
            shutdown,
            worker,
            reporter,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sla(&self) -> &SlaTracker {
        &self.sla
    }

    fn connection(&self) -> Result<PooledConnection, ApiError> {
        Ok(self.pool.acquire()?)
    }

    fn route(&self, request: &Request) -> ApiResult {
        let path = request.path().trim_end_matches('/');
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        match (request.method, segments.as_slice()) {
            (Method::Get, []) => Ok(self.root()),
            (Method::Get, ["books"]) => self.list_books(request.query_param("category")),
            (Method::Post, ["books"]) => self.add_book(parse_body(request)?),
            (Method::Get, ["books", isbn]) => self.get_book(isbn),
            (Method::Post, ["users"]) => self.create_user(parse_body(request)?),
            (Method::Get, ["users", user_id]) => self.get_user(user_id),
            (Method::Post, ["reservations"]) => self.create_reservation(parse_body(request)?),
            (Method::Get, ["reservations", "my", user_id]) => self.my_reservations(user_id),
            (Method::Get, ["sla"]) => Ok(self.sla_status()),
            (Method::Get, ["metrics"]) => Ok(self.metrics()),
            (Method::Get, ["health"]) => Ok(self.health()),
            _ => Err(ApiError::NotFound("Not Found".into())),
        }
    }

    fn root(&self) -> Response {
        Response::json(
            200,
            &json!({
                "message": "Library Book Reservation System",
                "version": env!("CARGO_PKG_VERSION"),
                "environment": self.config.environment,
                "features": [
                    "Batch reservation processing",
                    "LRU book cache and bounded connection pool",
                    "SLA monitoring (95% < 2s, 99% uptime, < 50 queued)"
                ],
                "endpoints": {
                    "books": ["/books", "/books/{isbn}"],
                    "users": ["/users", "/users/{user_id}"],
                    "reservations": ["/reservations", "/reservations/my/{user_id}"],
                    "monitoring": ["/sla", "/metrics", "/health"]
                }
            }),
        )
    }

    fn list_books(&self, category: Option<String>) -> ApiResult {
        let books = self.connection()?.books(category.as_deref())?;
        Ok(Response::json(200, &books))
    }

    fn get_book(&self, isbn: &str) -> ApiResult {
        let key = book_cache_key(isbn);
        if let Some(book) = self.cache.get(&key) {
            return Ok(Response::json(200, &*book));
        }
        // Read the epoch first: if the worker invalidates the key while we
        // load, the loaded value must not end up in the cache.
        let epoch = self.cache.epoch();
        let book = self
            .connection()?
            .book(isbn)?
            .ok_or_else(|| ApiError::NotFound("Book not found".into()))?;
        let book = self.cache.put_if_unchanged(key, book, epoch);
        Ok(Response::json(200, &*book))
    }

    fn add_book(&self, book: NewBook) -> ApiResult {
        let isbn = book.isbn.clone();
        let mut conn = self.connection()?;
        let result = conn.insert_book(book.into_book()).and_then(|()| conn.commit());
        match result {
            Ok(()) => Ok(Response::json(
                200,
                &json!({ "message": "Book added successfully", "isbn": isbn }),
            )),
            Err(StoreError::Duplicate(_)) => Err(ApiError::BadRequest(
                "Book with this ISBN already exists".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn create_user(&self, user: NewUser) -> ApiResult {
        let mut conn = self.connection()?;
        let result = conn.insert_user(user).and_then(|user| {
            conn.commit()?;
            Ok(user)
        });
        match result {
            Ok(user) => Ok(Response::json(
                200,
                &json!({ "message": "User created successfully", "user_id": user.user_id }),
            )),
            Err(StoreError::Duplicate(_)) => Err(ApiError::BadRequest(
                "User ID or email already exists".into(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    fn get_user(&self, user_id: &str) -> ApiResult {
        match self.connection()?.user(user_id)? {
            Some(user) => Ok(Response::json(200, &user)),
            None => Err(ApiError::NotFound("User not found".into())),
        }
    }

    /// Persist a pending reservation, then hand it to the worker
    fn create_reservation(&self, body: ReservationCreate) -> ApiResult {
        let mut conn = self.connection()?;
        if conn.user(&body.user_id)?.is_none() {
            return Err(ApiError::NotFound("User not found".into()));
        }
        if conn.book(&body.isbn)?.is_none() {
            return Err(ApiError::NotFound("Book not found".into()));
        }
        let record = conn.insert_reservation(&body.user_id, &body.isbn)?;
        conn.commit()?;
        conn.release();

        // The queue-depth gauge belongs to the worker, which sets it after
        // every extraction.
        self.producer
            .enqueue(ReservationRequest::for_record(&record))
            .map_err(|e| {
                error!(reservation = record.id, error = %e, "could not enqueue reservation");
                ApiError::Unavailable(e.to_string())
            })?;
        info!(reservation = record.id, "reservation queued for processing");

        Ok(Response::json(
            200,
            &json!({
                "message": "Reservation created and queued for processing",
                "reservation_id": record.id,
                "estimated_processing_time":
                    format!("{} seconds", self.config.batch_interval.as_secs()),
            }),
        ))
    }

    fn my_reservations(&self, user_id: &str) -> ApiResult {
        let mut conn = self.connection()?;
        let records = conn.reservations_for_user(user_id)?;
        let mut views = Vec::with_capacity(records.len());
        for record in records {
            // Books are never deleted, so a missing one is skipped rather than
            // reported.
            match conn.book(&record.isbn)? {
                Some(book) => views.push(ReservationView::new(record, book.title)),
                None => debug!(reservation = record.id, "reservation without book"),
            }
        }
        Ok(Response::json(200, &views))
    }

    fn sla_status(&self) -> Response {
        let status = self.sla.status();
        Response::json(
            200,
            &json!({
                "timestamp": Utc::now().to_rfc3339(),
                "environment": self.config.environment,
                "sla_targets": {
                    "reservation_processing": "95% < 2 seconds",
                    "system_availability": "99% uptime",
                    "queue_depth": format!("< {QUEUE_DEPTH_TARGET} pending"),
                },
                "current_status": {
                    "reservation_sla_met": status.sla_met,
                    "avg_processing_time": round_to(status.average, 3),
                    "95th_percentile_time": round_to(status.p95, 3),
                    "uptime_percentage": round_to(status.uptime_percentage, 2),
                    "current_queue_depth": status.queue_depth,
                    "queue_sla_met": status.queue_within_target(),
                },
                "total_processed": status.total_processed,
            }),
        )
    }

    fn metrics(&self) -> Response {
        let cache = self.cache.stats();
        let pool = self.pool.stats();
        Response::json(
            200,
            &json!({
                "timestamp": Utc::now().to_rfc3339(),
                "environment": self.config.environment,
                "configuration": {
                    "handler_threads": self.config.handler_threads,
                    "cache_size": self.config.cache_size,
                    "batch_size": self.config.batch_size,
                    "batch_interval": self.config.batch_interval.as_secs_f64(),
                },
                "performance": {
                    "cache_size": cache.len,
                    "cache_capacity": cache.capacity,
                    "cache_hits": cache.hits,
                    "cache_misses": cache.misses,
                    "active_connections": pool.live,
                    "pool_size": pool.idle,
                    "pool_waiters": pool.waiters,
                    "queue_depth": self.sla.queue_depth(),
                },
                "sla_compliance": self.sla.compliance_snapshot(),
            }),
        )
    }

    fn health(&self) -> Response {
        let health = self.sla.health();
        Response::json(
            200,
            &json!({
                "status": health.status,
                "timestamp": Utc::now().to_rfc3339(),
                "environment": self.config.environment,
                "database": "connected",
                "worker": if self.worker.is_finished() { "stopped" } else { "running" },
                "issues": health.issues,
            }),
        )
    }
}

impl RequestHandler for Replica {
    fn handle(&self, request: Request) -> Response {
        match self.route(&request) {
            Ok(response) => response,
            Err(e) => {
                if e.status() >= 500 {
                    error!(method = %request.method, path = %request.url, error = %e, "request failed");
                } else {
                    debug!(method = %request.method, path = %request.url, error = %e, "request rejected");
                }
                Response::error(e.status(), e.to_string())
            }
        }
    }

    fn shutdown(self) {
        self.shutdown.trigger();
        if self.worker.join().is_err() {
            warn!("batch worker panicked");
        }
        if self.reporter.join().is_err() {
            warn!("SLA reporter panicked");
        }
        info!("replica shut down");
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use serde_json::Value;

    use super::*;
    use crate::store::MemoryStore;

    const CLEAN_CODE: &str = "978-0132350884";

    fn config() -> Config {
        Config {
            batch_interval: Duration::from_millis(1),
            idle_interval: Duration::from_millis(5),
            error_backoff: Duration::from_millis(1),
            sla_report_interval: Duration::from_secs(3600),
            ..Config::default()
        }
    }

    fn replica() -> (Replica, MemoryStore) {
        let store = MemoryStore::with_sample_data();
        let replica = Replica::start(config(), Arc::new(store.clone())).unwrap();
        (replica, store)
    }

    fn get(replica: &Replica, url: &str) -> (u16, Value) {
        let response = replica.handle(Request::new(Method::Get, url));
        (response.status, response.body_json().unwrap())
    }

    fn post(replica: &Replica, url: &str, body: Value) -> (u16, Value) {
        let response = replica.handle(Request::new(Method::Post, url).with_json(&body));
        (response.status, response.body_json().unwrap())
    }

    #[test]
    fn lists_and_filters_books_by_title() {
        let (replica, _) = replica();
        let (status, books) = get(&replica, "/books");
        assert_eq!(status, 200);
        let titles: Vec<&str> = books
            .as_array()
            .unwrap()
            .iter()
            .map(|b| b["title"].as_str().unwrap())
            .collect();
        let mut sorted = titles.clone();
        sorted.sort();
        assert_eq!(titles, sorted);
        assert_eq!(titles.len(), 8);

        let (_, systems) = get(&replica, "/books?category=Systems");
        assert_eq!(systems.as_array().unwrap().len(), 1);
        let (_, architecture) = get(&replica, "/books?category=Software+Architecture");
        assert_eq!(architecture.as_array().unwrap().len(), 2);
        replica.shutdown();
    }

    #[test]
    fn book_lookup_is_cached() {
        let (replica, _) = replica();
        let (status, book) = get(&replica, &format!("/books/{CLEAN_CODE}"));
        assert_eq!(status, 200);
        assert_eq!(book["title"], "Clean Code");
        get(&replica, &format!("/books/{CLEAN_CODE}"));
        let stats = replica.cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.len), (1, 1, 1));

        let (status, body) = get(&replica, "/books/978-0000000000");
        assert_eq!(status, 404);
        assert_eq!(body["detail"], "Book not found");
        replica.shutdown();
    }

    #[test]
    fn duplicates_are_rejected() {
        let (replica, _) = replica();
        let book = json!({
            "isbn": "978-1234567890",
            "title": "Test Programming Book",
            "author": "Test Author",
            "category": "Programming",
            "total_copies": 3
        });
        assert_eq!(post(&replica, "/books", book.clone()).0, 200);
        let (status, body) = post(&replica, "/books", book);
        assert_eq!(status, 400);
        assert_eq!(body["detail"], "Book with this ISBN already exists");

        let user = json!({
            "user_id": "USR100",
            "name": "Test User",
            "email": "alice@university.edu",
            "membership_type": "student"
        });
        let (status, body) = post(&replica, "/users", user);
        assert_eq!(status, 400);
        assert_eq!(body["detail"], "User ID or email already exists");
        replica.shutdown();
    }

    #[test]
    fn malformed_body_and_unknown_route() {
        let (replica, _) = replica();
        let response = replica.handle(Request::new(Method::Post, "/reservations").with_body("{"));
        assert_eq!(response.status, 422);
        let (status, _) = post(&replica, "/users", json!({ "user_id": "USR9" }));
        assert_eq!(status, 422);
        assert_eq!(get(&replica, "/nowhere").0, 404);
        assert_eq!(
            replica.handle(Request::new(Method::Delete, "/books")).status,
            404
        );
        replica.shutdown();
    }

    #[test]
    fn reservation_requires_known_user_and_book() {
        let (replica, _) = replica();
        let (status, body) = post(
            &replica,
            "/reservations",
            json!({ "user_id": "NOBODY", "isbn": CLEAN_CODE }),
        );
        assert_eq!((status, body["detail"].as_str()), (404, Some("User not found")));
        let (status, body) = post(
            &replica,
            "/reservations",
            json!({ "user_id": "USR001", "isbn": "978-0000000000" }),
        );
        assert_eq!((status, body["detail"].as_str()), (404, Some("Book not found")));
        replica.shutdown();
    }

    #[test]
    fn reservation_is_confirmed_and_cache_refreshed() {
        let (replica, store) = replica();
        let url = format!("/books/{CLEAN_CODE}");
        let (_, before) = get(&replica, &url);
        assert_eq!(before["available_copies"], 5);

        let (status, body) = post(
            &replica,
            "/reservations",
            json!({ "user_id": "USR001", "isbn": CLEAN_CODE }),
        );
        assert_eq!(status, 200);
        let id = body["reservation_id"].as_u64().unwrap();

        let start = Instant::now();
        while store.committed_reservation(id).unwrap().status == ReservationStatus::Pending {
            assert!(start.elapsed() < Duration::from_secs(5), "reservation not processed");
            thread::sleep(Duration::from_millis(2));
        }
        // Invalidation happens right after the commit; give it a moment.
        let start = Instant::now();
        while replica.sla().compliance_snapshot().sample_count == 0 {
            assert!(start.elapsed() < Duration::from_secs(5));
            thread::sleep(Duration::from_millis(2));
        }

        let (_, after) = get(&replica, &url);
        assert_eq!(after["available_copies"], 4);

        let (_, mine) = get(&replica, "/reservations/my/USR001");
        let mine = mine.as_array().unwrap();
        assert_eq!(mine.len(), 1);
        assert_eq!(mine[0]["status"], "confirmed");
        assert_eq!(mine[0]["book_title"], "Clean Code");
        assert!(mine[0]["processed_at"].is_string());
        replica.shutdown();
    }

    #[test]
    fn queue_gauge_is_left_to_the_worker() {
        let store = MemoryStore::with_sample_data();
        let config = Config {
            processing_delay: Duration::from_millis(300),
            ..config()
        };
        let replica = Replica::start(config, Arc::new(store.clone())).unwrap();
        let reserve = |user: &str| {
            let (status, body) = post(
                &replica,
                "/reservations",
                json!({ "user_id": user, "isbn": CLEAN_CODE }),
            );
            assert_eq!(status, 200);
            body["reservation_id"].as_u64().unwrap()
        };

        let first = reserve("USR001");
        let start = Instant::now();
        while !replica.producer.is_empty() {
            assert!(start.elapsed() < Duration::from_secs(5), "batch not extracted");
            thread::sleep(Duration::from_millis(1));
        }
        // The worker is busy with the first batch; a new reservation waits in
        // the queue without touching the gauge.
        let second = reserve("USR002");
        assert_eq!(replica.producer.len(), 1);
        assert_eq!(replica.sla().queue_depth(), 0);

        let start = Instant::now();
        for id in [first, second] {
            while store.committed_reservation(id).unwrap().status == ReservationStatus::Pending {
                assert!(start.elapsed() < Duration::from_secs(5), "reservation not processed");
                thread::sleep(Duration::from_millis(2));
            }
        }
        assert_eq!(replica.sla().queue_depth(), 0);
        let (_, health) = get(&replica, "/health");
        assert_eq!(health["status"], "healthy");
        replica.shutdown();
    }

    #[test]
    fn monitoring_endpoints() {
        let (replica, _) = replica();
        let (status, sla) = get(&replica, "/sla");
        assert_eq!(status, 200);
        assert_eq!(sla["current_status"]["reservation_sla_met"], true);
        assert_eq!(sla["current_status"]["queue_sla_met"], true);
        assert_eq!(sla["total_processed"], 0);

        let (_, metrics) = get(&replica, "/metrics");
        assert_eq!(metrics["performance"]["cache_capacity"], 1000);
        assert_eq!(metrics["sla_compliance"]["within_target"], true);

        let (_, health) = get(&replica, "/health");
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["worker"], "running");
        assert_eq!(health["issues"], json!([]));
        replica.shutdown();
    }
}
