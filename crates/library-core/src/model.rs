//! Catalog and reservation records

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Store-assigned reservation id
pub type ReservationId = u64;

/// A book in the catalog
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct Book {
    /// Unique key
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub category: String,
    pub total_copies: u32,
    /// Always `<= total_copies`
    pub available_copies: u32,
}

/// Payload for adding a book; all copies start out available
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct NewBook {
    pub isbn: String,
    pub title: String,
    pub author: String,
    pub category: String,
    pub total_copies: u32,
}

impl NewBook {
    /// Turn the payload into a book with every copy available
    pub fn into_book(self) -> Book {
        Book {
            isbn: self.isbn,
            title: self.title,
            author: self.author,
            category: self.category,
            total_copies: self.total_copies,
            available_copies: self.total_copies,
        }
    }
}

/// Kind of library membership
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum MembershipType {
    Student,
    Faculty,
    Public,
}

/// Payload for registering a library user
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct NewUser {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub membership_type: MembershipType,
}

/// A registered library user
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct User {
    pub user_id: String,
    pub name: String,
    pub email: String,
    pub membership_type: MembershipType,
    pub created_at: DateTime<Utc>,
}

/// Lifecycle of a reservation record
///
/// `Pending` moves to exactly one of the terminal states and never back.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Debug)]
#[serde(rename_all = "lowercase")]
pub enum ReservationStatus {
    Pending,
    Confirmed,
    Waitlisted,
}

impl ReservationStatus {
    /// Whether no further transition is allowed
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ReservationStatus::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationStatus::Pending => "pending",
            ReservationStatus::Confirmed => "confirmed",
            ReservationStatus::Waitlisted => "waitlisted",
        }
    }
}

impl fmt::Display for ReservationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReservationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "confirmed" => Ok(Self::Confirmed),
            "waitlisted" => Ok(Self::Waitlisted),
            other => Err(format!("unknown reservation status `{other}`")),
        }
    }
}

/// Reservation as stored by the persistent store
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Debug)]
pub struct ReservationRecord {
    pub id: ReservationId,
    pub user_id: String,
    pub isbn: String,
    pub status: ReservationStatus,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

/// Work item handed to the batch worker once the pending record is durable
///
/// Immutable after construction; the worker consumes each one exactly once.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct ReservationRequest {
    pub id: ReservationId,
    pub user_id: String,
    pub isbn: String,
    pub enqueued_at: DateTime<Utc>,
}

impl ReservationRequest {
    /// Build the work item for a freshly created pending record
    pub fn for_record(record: &ReservationRecord) -> Self {
        Self {
            id: record.id,
            user_id: record.user_id.clone(),
            isbn: record.isbn.clone(),
            enqueued_at: Utc::now(),
        }
    }
}

/// Cache key under which a book's catalog entry is kept
pub fn book_cache_key(isbn: &str) -> String {
    format!("book:{isbn}")
}
