//! Transactional core of a guestbook service.
//!
//! Books own Greetings and carry Tags. All writes go through an
//! [`EntityStore`] transaction; uniqueness is enforced by conditional writes
//! rather than by the store.

pub mod config;
pub mod db;
pub mod logging;
pub mod model;
pub mod service;
pub mod store;

pub use config::{BookNamePolicy, GuestbookConfig, RenameStrategy, RetryConfig, StoreConfig};
pub use db::{open_db, open_db_in_memory, DbError, DbResult};
pub use logging::{default_log_level, init_logging, logging_status, LoggingError};
pub use model::entity::{Entity, EntityId, EntityKey, Kind, PropertyValue};
pub use model::guestbook::{Book, BookId, BookRef, Greeting, GreetingId, Tag, DEFAULT_BOOK_NAME};
pub use service::conditional_writer::{ConditionalWriter, CreateOutcome, RenameResult};
pub use service::guestbook_service::{
    GreetingsListResult, GuestbookService, RenameOutcome, ServiceError, ServiceResult,
};
pub use store::{
    EntityStore, MemoryEntityStore, Query, SortDirection, SqliteEntityStore, StoreError,
    StoreResult, Transaction,
};

/// Returns the core crate version.
pub fn core_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
