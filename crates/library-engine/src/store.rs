//! In-memory implementation of the persistent store
//!
//! Committed state lives behind one lock. Each connection stages its writes
//! privately and applies them in a single critical section on commit, after
//! re-validating them against the committed state.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use library_core::{
    Book, MembershipType, NewUser, ReservationId, ReservationRecord, ReservationStatus, Store,
    StoreConnection, StoreError, User,
};
use parking_lot::Mutex;

#[derive(Default)]
struct Tables {
    books: BTreeMap<String, Book>,
    users: BTreeMap<String, User>,
    reservations: BTreeMap<ReservationId, ReservationRecord>,
}

struct Shared {
    tables: Mutex<Tables>,
    /// Next reservation id; never reused, even if the insert is rolled back
    next_id: AtomicU64,
    online: AtomicBool,
    /// Number of connections currently open
    open: AtomicUsize,
}

/// Transactional in-memory store
#[derive(Clone)]
pub struct MemoryStore {
    shared: Arc<Shared>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty [`MemoryStore`]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                tables: Mutex::new(Tables::default()),
                next_id: AtomicU64::new(1),
                online: AtomicBool::new(true),
                open: AtomicUsize::new(0),
            }),
        }
    }

    /// Create a store holding the sample catalog and users
    pub fn with_sample_data() -> Self {
        let store = Self::new();
        store.seed_sample_data();
        store
    }

    /// Insert the sample catalog and users if the catalog is empty
    pub fn seed_sample_data(&self) {
        let mut tables = self.shared.tables.lock();
        if !tables.books.is_empty() {
            return;
        }
        let books = [
            ("978-0134685991", "Effective Java", "Joshua Bloch", "Programming", 5),
            ("978-0135957059", "The Pragmatic Programmer", "David Thomas", "Programming", 3),
            ("978-0596517748", "JavaScript: The Good Parts", "Douglas Crockford", "Programming", 4),
            ("978-0321125215", "Domain-Driven Design", "Eric Evans", "Software Architecture", 2),
            ("978-0134494166", "Clean Architecture", "Robert Martin", "Software Architecture", 3),
            ("978-1449373320", "Designing Data-Intensive Applications", "Martin Kleppmann", "Systems", 2),
            ("978-0201633610", "Design Patterns", "Gang of Four", "Programming", 4),
            ("978-0132350884", "Clean Code", "Robert Martin", "Programming", 5),
        ];
        for (isbn, title, author, category, copies) in books {
            tables.books.insert(
                isbn.to_string(),
                Book {
                    isbn: isbn.to_string(),
                    title: title.to_string(),
                    author: author.to_string(),
                    category: category.to_string(),
                    total_copies: copies,
                    available_copies: copies,
                },
            );
        }
        let users = [
            ("USR001", "Alice Johnson", "alice@university.edu", MembershipType::Student),
            ("USR002", "Bob Smith", "bob@university.edu", MembershipType::Faculty),
            ("USR003", "Carol Davis", "carol@public.library", MembershipType::Public),
            ("USR004", "David Wilson", "david@university.edu", MembershipType::Student),
            ("USR005", "Eva Brown", "eva@university.edu", MembershipType::Faculty),
        ];
        let now = Utc::now();
        for (user_id, name, email, membership_type) in users {
            tables.users.insert(
                user_id.to_string(),
                User {
                    user_id: user_id.to_string(),
                    name: name.to_string(),
                    email: email.to_string(),
                    membership_type,
                    created_at: now,
                },
            );
        }
        tracing::info!(books = books.len(), users = users.len(), "sample data added to store");
    }

    /// Simulate an outage: while offline, [`Store::connect()`] fails
    pub fn set_online(&self, online: bool) {
        self.shared.online.store(online, Ordering::SeqCst);
    }

    /// Number of connections currently open
    pub fn open_connections(&self) -> usize {
        self.shared.open.load(Ordering::SeqCst)
    }

    /// Committed state of one book
    pub fn committed_book(&self, isbn: &str) -> Option<Book> {
        self.shared.tables.lock().books.get(isbn).cloned()
    }

    /// Committed state of one reservation
    pub fn committed_reservation(&self, id: ReservationId) -> Option<ReservationRecord> {
        self.shared.tables.lock().reservations.get(&id).cloned()
    }
}

impl Store for MemoryStore {
    fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError> {
        if !self.shared.online.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".into()));
        }
        self.shared.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection {
            shared: self.shared.clone(),
            staged: Staged::default(),
        }))
    }
}

/// Writes of one open transaction
#[derive(Default)]
struct Staged {
    books: BTreeMap<String, Book>,
    /// Copies taken per isbn, applied as deltas on commit
    taken: HashMap<String, u32>,
    users: BTreeMap<String, User>,
    reservations: BTreeMap<ReservationId, ReservationRecord>,
    statuses: BTreeMap<ReservationId, (ReservationStatus, DateTime<Utc>)>,
}

impl Staged {
    fn is_empty(&self) -> bool {
        self.books.is_empty()
            && self.taken.is_empty()
            && self.users.is_empty()
            && self.reservations.is_empty()
            && self.statuses.is_empty()
    }
}

struct MemoryConnection {
    shared: Arc<Shared>,
    staged: Staged,
}

impl MemoryConnection {
    /// Book as seen by this transaction
    fn visible_book(&self, tables: &Tables, isbn: &str) -> Option<Book> {
        let mut book = tables
            .books
            .get(isbn)
            .or_else(|| self.staged.books.get(isbn))
            .cloned()?;
        let taken = self.staged.taken.get(isbn).copied().unwrap_or(0);
        book.available_copies = book.available_copies.saturating_sub(taken);
        Some(book)
    }

    fn visible_reservation(&self, tables: &Tables, id: ReservationId) -> Option<ReservationRecord> {
        let mut record = tables
            .reservations
            .get(&id)
            .or_else(|| self.staged.reservations.get(&id))
            .cloned()?;
        if let Some((status, at)) = self.staged.statuses.get(&id) {
            record.status = *status;
            record.processed_at = Some(*at);
        }
        Some(record)
    }

    fn user_visible(&self, tables: &Tables, user_id: &str) -> bool {
        tables.users.contains_key(user_id) || self.staged.users.contains_key(user_id)
    }
}

/// Check every staged write against the committed state
fn validate(staged: &Staged, tables: &Tables) -> Result<(), StoreError> {
    for isbn in staged.books.keys() {
        if tables.books.contains_key(isbn) {
            return Err(StoreError::Duplicate(format!("isbn `{isbn}`")));
        }
    }
    for (isbn, taken) in &staged.taken {
        let book = tables
            .books
            .get(isbn)
            .or_else(|| staged.books.get(isbn))
            .ok_or_else(|| StoreError::BookNotFound(isbn.clone()))?;
        if book.available_copies < *taken {
            return Err(StoreError::Constraint(format!(
                "`{isbn}` has {} copies available, {taken} requested",
                book.available_copies
            )));
        }
    }
    for user in staged.users.values() {
        if tables.users.contains_key(&user.user_id) {
            return Err(StoreError::Duplicate(format!("user id `{}`", user.user_id)));
        }
        if tables.users.values().any(|u| u.email == user.email) {
            return Err(StoreError::Duplicate(format!("email `{}`", user.email)));
        }
    }
    for id in staged.statuses.keys() {
        match tables.reservations.get(id) {
            Some(record) if record.status.is_terminal() => {
                return Err(StoreError::Constraint(format!(
                    "reservation {id} is already {}",
                    record.status
                )));
            }
            Some(_) => {}
            None if staged.reservations.contains_key(id) => {}
            None => return Err(StoreError::ReservationNotFound(*id)),
        }
    }
    Ok(())
}

impl StoreConnection for MemoryConnection {
    fn book(&mut self, isbn: &str) -> Result<Option<Book>, StoreError> {
        let tables = self.shared.tables.lock();
        Ok(self.visible_book(&tables, isbn))
    }

    fn books(&mut self, category: Option<&str>) -> Result<Vec<Book>, StoreError> {
        let tables = self.shared.tables.lock();
        // Another connection may have committed an isbn staged here.
        let isbns: BTreeSet<&String> = tables
            .books
            .keys()
            .chain(self.staged.books.keys())
            .collect();
        let mut books: Vec<Book> = isbns
            .into_iter()
            .filter_map(|isbn| self.visible_book(&tables, isbn))
            .filter(|book| category.map_or(true, |c| book.category == c))
            .collect();
        books.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.isbn.cmp(&b.isbn)));
        Ok(books)
    }

    fn available_copies(&mut self, isbn: &str) -> Result<Option<u32>, StoreError> {
        let tables = self.shared.tables.lock();
        Ok(self
            .visible_book(&tables, isbn)
            .map(|book| book.available_copies))
    }

    fn decrement_available(&mut self, isbn: &str) -> Result<(), StoreError> {
        let tables = self.shared.tables.lock();
        let book = self
            .visible_book(&tables, isbn)
            .ok_or_else(|| StoreError::BookNotFound(isbn.to_string()))?;
        if book.available_copies == 0 {
            return Err(StoreError::Constraint(format!("`{isbn}` has no copies left")));
        }
        drop(tables);
        *self.staged.taken.entry(isbn.to_string()).or_insert(0) += 1;
        Ok(())
    }

    fn set_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tables = self.shared.tables.lock();
        let record = self
            .visible_reservation(&tables, id)
            .ok_or(StoreError::ReservationNotFound(id))?;
        drop(tables);
        if record.status.is_terminal() || !status.is_terminal() {
            return Err(StoreError::Constraint(format!(
                "reservation {id} cannot move from {} to {status}",
                record.status
            )));
        }
        self.staged.statuses.insert(id, (status, processed_at));
        Ok(())
    }

    fn insert_book(&mut self, book: Book) -> Result<(), StoreError> {
        if book.available_copies > book.total_copies {
            return Err(StoreError::Constraint(format!(
                "`{}` cannot have more available than total copies",
                book.isbn
            )));
        }
        let tables = self.shared.tables.lock();
        if self.visible_book(&tables, &book.isbn).is_some() {
            return Err(StoreError::Duplicate(format!("isbn `{}`", book.isbn)));
        }
        drop(tables);
        self.staged.books.insert(book.isbn.clone(), book);
        Ok(())
    }

    fn insert_user(&mut self, user: NewUser) -> Result<User, StoreError> {
        let tables = self.shared.tables.lock();
        if self.user_visible(&tables, &user.user_id) {
            return Err(StoreError::Duplicate(format!("user id `{}`", user.user_id)));
        }
        let email_taken = tables
            .users
            .values()
            .chain(self.staged.users.values())
            .any(|u| u.email == user.email);
        if email_taken {
            return Err(StoreError::Duplicate(format!("email `{}`", user.email)));
        }
        drop(tables);
        let user = User {
            user_id: user.user_id,
            name: user.name,
            email: user.email,
            membership_type: user.membership_type,
            created_at: Utc::now(),
        };
        self.staged.users.insert(user.user_id.clone(), user.clone());
        Ok(user)
    }

    fn user(&mut self, user_id: &str) -> Result<Option<User>, StoreError> {
        let tables = self.shared.tables.lock();
        Ok(tables
            .users
            .get(user_id)
            .or_else(|| self.staged.users.get(user_id))
            .cloned())
    }

    fn insert_reservation(
        &mut self,
        user_id: &str,
        isbn: &str,
    ) -> Result<ReservationRecord, StoreError> {
        let tables = self.shared.tables.lock();
        if !self.user_visible(&tables, user_id) {
            return Err(StoreError::UserNotFound(user_id.to_string()));
        }
        if self.visible_book(&tables, isbn).is_none() {
            return Err(StoreError::BookNotFound(isbn.to_string()));
        }
        drop(tables);
        let record = ReservationRecord {
            id: self.shared.next_id.fetch_add(1, Ordering::SeqCst),
            user_id: user_id.to_string(),
            isbn: isbn.to_string(),
            status: ReservationStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
        };
        self.staged.reservations.insert(record.id, record.clone());
        Ok(record)
    }

    fn reservation(&mut self, id: ReservationId) -> Result<Option<ReservationRecord>, StoreError> {
        let tables = self.shared.tables.lock();
        Ok(self.visible_reservation(&tables, id))
    }

    fn reservations_for_user(
        &mut self,
        user_id: &str,
    ) -> Result<Vec<ReservationRecord>, StoreError> {
        let tables = self.shared.tables.lock();
        let ids: Vec<ReservationId> = tables
            .reservations
            .values()
            .chain(self.staged.reservations.values())
            .filter(|r| r.user_id == user_id)
            .map(|r| r.id)
            .collect();
        let mut records: Vec<ReservationRecord> = ids
            .into_iter()
            .filter_map(|id| self.visible_reservation(&tables, id))
            .collect();
        // Ids are monotonic, so descending id order is newest first.
        records.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(records)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        if self.staged.is_empty() {
            return Ok(());
        }
        // A failed commit aborts the transaction: the staged writes are gone.
        let staged = std::mem::take(&mut self.staged);
        let mut tables = self.shared.tables.lock();
        validate(&staged, &tables)?;

        for (isbn, book) in staged.books {
            tables.books.insert(isbn, book);
        }
        for (isbn, taken) in staged.taken {
            if let Some(book) = tables.books.get_mut(&isbn) {
                book.available_copies -= taken;
            }
        }
        for (user_id, user) in staged.users {
            tables.users.insert(user_id, user);
        }
        for (id, record) in staged.reservations {
            tables.reservations.insert(id, record);
        }
        for (id, (status, at)) in staged.statuses {
            if let Some(record) = tables.reservations.get_mut(&id) {
                record.status = status;
                record.processed_at = Some(at);
            }
        }
        Ok(())
    }

    fn rollback(&mut self) {
        self.staged = Staged::default();
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.shared.open.fetch_sub(1, Ordering::SeqCst);
    }
}
