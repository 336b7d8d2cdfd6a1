//! Interface of the persistent store
//!
//! The engine only talks to the store through these traits. Handles are
//! obtained through the connection pool; every write is staged until
//! [`StoreConnection::commit()`].

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::model::{Book, NewUser, ReservationId, ReservationRecord, ReservationStatus, User};

/// Errors reported by the store
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not hand out a connection
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("book `{0}` not found")]
    BookNotFound(String),
    #[error("reservation {0} not found")]
    ReservationNotFound(ReservationId),
    #[error("user `{0}` not found")]
    UserNotFound(String),
    /// A unique key is already taken
    #[error("duplicate {0}")]
    Duplicate(String),
    /// The transaction would break a catalog invariant and was not applied
    #[error("constraint violated: {0}")]
    Constraint(String),
    #[error("transaction failed: {0}")]
    Transaction(String),
}

/// Source of store connections
///
/// 📌 Hint: The connection pool calls [`Store::connect()`] whenever it needs a
/// new live handle.
pub trait Store: Send + Sync {
    /// Open a new connection
    fn connect(&self) -> Result<Box<dyn StoreConnection>, StoreError>;
}

/// One handle to the store with its own open transaction
///
/// Reads observe the handle's own staged writes. Nothing is visible to other
/// handles until [`Self::commit()`]; [`Self::rollback()`] discards every
/// staged write.
pub trait StoreConnection: Send {
    /// Look up a single book
    fn book(&mut self, isbn: &str) -> Result<Option<Book>, StoreError>;

    /// All books, optionally restricted to one category, ordered by title
    fn books(&mut self, category: Option<&str>) -> Result<Vec<Book>, StoreError>;

    /// Current number of available copies, [`None`] for an unknown isbn
    fn available_copies(&mut self, isbn: &str) -> Result<Option<u32>, StoreError>;

    /// Take one copy of `isbn` out of circulation
    fn decrement_available(&mut self, isbn: &str) -> Result<(), StoreError>;

    /// Move a reservation out of `pending`
    fn set_status(
        &mut self,
        id: ReservationId,
        status: ReservationStatus,
        processed_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    fn insert_book(&mut self, book: Book) -> Result<(), StoreError>;

    fn insert_user(&mut self, user: NewUser) -> Result<User, StoreError>;

    fn user(&mut self, user_id: &str) -> Result<Option<User>, StoreError>;

    /// Create a `pending` reservation and return it with its assigned id
    ///
    /// Ids are unique and increase monotonically, even across rollbacks.
    fn insert_reservation(
        &mut self,
        user_id: &str,
        isbn: &str,
    ) -> Result<ReservationRecord, StoreError>;

    fn reservation(&mut self, id: ReservationId) -> Result<Option<ReservationRecord>, StoreError>;

    /// Reservations of one user, newest first
    fn reservations_for_user(&mut self, user_id: &str)
        -> Result<Vec<ReservationRecord>, StoreError>;

    /// Make every staged write visible atomically
    fn commit(&mut self) -> Result<(), StoreError>;

    /// Discard every staged write
    fn rollback(&mut self);
}
