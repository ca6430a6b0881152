//! Transactional document store contract.
//!
//! # Responsibility
//! - Define the `EntityStore` / `Transaction` contract consumed by the
//!   conditional writer and the guestbook service.
//! - Own the shared retry loop and the per-transaction group accounting.
//! - Provide an in-process optimistic store and a SQLite-backed store.
//!
//! # Invariants
//! - Reads inside one transaction see a single consistent state plus that
//!   transaction's own pending writes.
//! - A transaction commits all of its writes or none of them.
//! - Conflicts are retried up to `RetryConfig::max_retries`, then surface as
//!   `TransactionConflict`.
//! - Touching more than `max_groups_per_transaction` distinct keys fails with
//!   `TooManyGroups` and is never retried.

use crate::config::RetryConfig;
use crate::db::DbError;
use crate::model::entity::{Entity, EntityKey, Kind};
use log::{error, warn};
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

pub mod memory;
pub mod query;
pub mod sqlite;

pub use memory::MemoryEntityStore;
pub use query::{Filter, Order, Query, SortDirection};
pub use sqlite::SqliteEntityStore;

pub type StoreResult<T> = Result<T, StoreError>;

/// Store-level error.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying SQLite/bootstrap error.
    Db(DbError),
    /// Entity document could not be encoded or decoded.
    Codec(serde_json::Error),
    /// Persisted data does not match the expected record shape.
    InvalidData(String),
    /// Optimistic conflicts persisted through every retry.
    TransactionConflict { attempts: usize },
    /// Transaction touched more distinct keys than the store allows.
    TooManyGroups { limit: usize, touched: usize },
}

impl StoreError {
    /// Whether the error is SQLite lock contention (retried as a conflict).
    pub fn is_busy(&self) -> bool {
        match self {
            Self::Db(DbError::Sqlite(rusqlite::Error::SqliteFailure(failure, _))) => matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            _ => false,
        }
    }
}

impl Display for StoreError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Db(err) => write!(f, "{err}"),
            Self::Codec(err) => write!(f, "entity codec error: {err}"),
            Self::InvalidData(message) => write!(f, "invalid stored entity: {message}"),
            Self::TransactionConflict { attempts } => {
                write!(f, "transaction conflict after {attempts} attempt(s)")
            }
            Self::TooManyGroups { limit, touched } => write!(
                f,
                "transaction touched {touched} entity groups; limit is {limit}"
            ),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Db(err) => Some(err),
            Self::Codec(err) => Some(err),
            Self::InvalidData(_) => None,
            Self::TransactionConflict { .. } => None,
            Self::TooManyGroups { .. } => None,
        }
    }
}

impl From<DbError> for StoreError {
    fn from(value: DbError) -> Self {
        Self::Db(value)
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Db(DbError::Sqlite(value))
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(value: serde_json::Error) -> Self {
        Self::Codec(value)
    }
}

/// Transactional view handed to `EntityStore::transaction` closures.
pub trait Transaction {
    /// Reads one entity, seeing this transaction's pending writes.
    fn get(&mut self, key: &EntityKey) -> StoreResult<Option<Entity>>;
    /// Buffers a write and returns the written key.
    fn put(&mut self, entity: Entity) -> StoreResult<EntityKey>;
    /// Buffers a delete. Deleting an absent key is a no-op.
    fn delete(&mut self, key: &EntityKey) -> StoreResult<()>;
    /// Runs a query; the result set is validated at commit.
    fn query(&mut self, query: &Query) -> StoreResult<Vec<Entity>>;
    /// Allocates a fresh numeric id for `kind`. Does not count as a group.
    fn allocate_id(&mut self, kind: Kind) -> StoreResult<i64>;
}

/// Document store keyed by `(kind, identifier)` with optimistic transactions.
pub trait EntityStore {
    fn get(&self, key: &EntityKey) -> StoreResult<Option<Entity>>;
    fn put(&self, entity: Entity) -> StoreResult<EntityKey>;
    /// Deleting an absent key is a no-op.
    fn delete(&self, key: &EntityKey) -> StoreResult<()>;
    fn query(&self, query: &Query) -> StoreResult<Vec<Entity>>;
    /// Allocates a fresh numeric id, monotonic per kind.
    fn allocate_id(&self, kind: Kind) -> StoreResult<i64>;
    /// Runs `f` atomically, re-running it on conflict.
    ///
    /// `f` may run more than once and must not have side effects outside
    /// the transaction view.
    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnMut(&mut dyn Transaction) -> StoreResult<T>;
}

impl<S: EntityStore> EntityStore for Arc<S> {
    fn get(&self, key: &EntityKey) -> StoreResult<Option<Entity>> {
        (**self).get(key)
    }

    fn put(&self, entity: Entity) -> StoreResult<EntityKey> {
        (**self).put(entity)
    }

    fn delete(&self, key: &EntityKey) -> StoreResult<()> {
        (**self).delete(key)
    }

    fn query(&self, query: &Query) -> StoreResult<Vec<Entity>> {
        (**self).query(query)
    }

    fn allocate_id(&self, kind: Kind) -> StoreResult<i64> {
        (**self).allocate_id(kind)
    }

    fn transaction<T, F>(&self, f: F) -> StoreResult<T>
    where
        F: FnMut(&mut dyn Transaction) -> StoreResult<T>,
    {
        (**self).transaction(f)
    }
}

/// Outcome of one failed transaction attempt.
#[derive(Debug)]
pub(crate) enum AttemptError {
    /// Concurrent modification; the attempt may be re-run.
    Conflict(String),
    /// Anything else; surfaced unchanged.
    Fatal(StoreError),
}

impl From<StoreError> for AttemptError {
    fn from(value: StoreError) -> Self {
        if value.is_busy() {
            Self::Conflict(value.to_string())
        } else {
            Self::Fatal(value)
        }
    }
}

/// Runs `attempt` until it succeeds, fails fatally, or exhausts `retry`.
pub(crate) fn run_with_retry<T>(
    retry: &RetryConfig,
    store: &'static str,
    mut attempt: impl FnMut() -> Result<T, AttemptError>,
) -> StoreResult<T> {
    let max_attempts = retry.max_attempts();
    for attempt_index in 0..max_attempts {
        match attempt() {
            Ok(value) => return Ok(value),
            Err(AttemptError::Fatal(err)) => return Err(err),
            Err(AttemptError::Conflict(reason)) => {
                if attempt_index + 1 == max_attempts {
                    error!(
                        "event=txn_conflict module=store status=error store={store} attempts={max_attempts} reason={reason}"
                    );
                    break;
                }
                let delay = retry.delay_for(attempt_index);
                warn!(
                    "event=txn_retry module=store status=retry store={store} attempt={} delay_ms={} reason={reason}",
                    attempt_index + 1,
                    delay.as_millis()
                );
                std::thread::sleep(delay);
            }
        }
    }

    Err(StoreError::TransactionConflict {
        attempts: max_attempts,
    })
}

/// Distinct keys touched by one transaction attempt.
///
/// Every key is top-level, so each key is its own entity group.
#[derive(Debug)]
pub(crate) struct GroupTracker {
    limit: usize,
    touched: BTreeSet<EntityKey>,
}

impl GroupTracker {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            limit,
            touched: BTreeSet::new(),
        }
    }

    pub(crate) fn touch(&mut self, key: &EntityKey) -> StoreResult<()> {
        if self.touched.contains(key) {
            return Ok(());
        }
        if self.touched.len() >= self.limit {
            return Err(StoreError::TooManyGroups {
                limit: self.limit,
                touched: self.touched.len() + 1,
            });
        }
        self.touched.insert(key.clone());
        Ok(())
    }

    pub(crate) fn touch_all<'a>(
        &mut self,
        keys: impl IntoIterator<Item = &'a EntityKey>,
    ) -> StoreResult<()> {
        keys.into_iter().try_for_each(|key| self.touch(key))
    }
}
