//! 🏗 Shared types of the library reservation system: configuration, the
//! catalog model, HTTP messages, and the interface of the persistent store.

mod config;
mod model;
mod request;
mod store;

pub use config::{Config, ConfigError};
pub use model::{
    book_cache_key, Book, MembershipType, NewBook, NewUser, ReservationId, ReservationRecord,
    ReservationRequest, ReservationStatus, User,
};
pub use request::{Headers, Method, Request, RequestHandler, Response};
pub use store::{Store, StoreConnection, StoreError};
