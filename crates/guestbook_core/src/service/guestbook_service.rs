//! Guestbook use-case service.
//!
//! # Responsibility
//! - Provide book, greeting and tag APIs over an `EntityStore`.
//! - Resolve `BookRef` values by id, through the name index, or by a name
//!   query depending on `BookNamePolicy`.
//! - Route every uniqueness-sensitive write through `ConditionalWriter`.
//!
//! # Invariants
//! - Greeting listings are ordered by `timestamp DESC`, ties by id DESC.
//! - Book listings are ordered by `name ASC`, ties by id ASC.
//! - Book existence is checked in the same transaction as the write that
//!   depends on it.
//! - `add_book` with a tag is two transactions; a tag may outlive a book
//!   write that never happened.

use crate::config::{BookNamePolicy, GuestbookConfig, RenameStrategy};
use crate::model::entity::{Entity, EntityKey, Kind};
use crate::model::guestbook::{
    book_key, book_name_key, greeting_key, normalize_book_name, normalize_tag_type, tag_key, Book,
    BookId, BookRef, Greeting, GreetingId, Tag, BOOK_ID_PROPERTY, NAME_PROPERTY, TAGS_PROPERTY,
    TIMESTAMP_PROPERTY, TYPE_PROPERTY,
};
use crate::service::conditional_writer::{
    create_if_absent_in, index_target, ConditionalWriter, CreateOutcome, RenameResult,
};
use crate::store::{EntityStore, Query, SortDirection, StoreError, StoreResult, Transaction};
use log::{info, warn};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::time::{SystemTime, UNIX_EPOCH};

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Service error for guestbook use-cases.
#[derive(Debug)]
pub enum ServiceError {
    /// Referenced book does not exist.
    BookNotFound(BookRef),
    /// Tag input is blank.
    InvalidTag(String),
    /// Store conflicts persisted through every retry; the whole call may be
    /// retried.
    TransactionConflict { attempts: usize },
    /// Operation needs more entity groups than one transaction allows.
    TooManyGroups { limit: usize, touched: usize },
    /// Persistence-layer failure.
    Store(StoreError),
    /// Internal consistency mismatch between write and read-back.
    InconsistentState(&'static str),
}

impl Display for ServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BookNotFound(book) => write!(f, "book not found: {book}"),
            Self::InvalidTag(value) => write!(f, "invalid tag: `{value}`"),
            Self::TransactionConflict { attempts } => {
                write!(f, "transaction conflict after {attempts} attempt(s)")
            }
            Self::TooManyGroups { limit, touched } => write!(
                f,
                "operation touches {touched} entity groups; limit is {limit}"
            ),
            Self::Store(err) => write!(f, "{err}"),
            Self::InconsistentState(details) => {
                write!(f, "inconsistent guestbook state: {details}")
            }
        }
    }
}

impl Error for ServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Store(err) => Some(err),
            _ => None,
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(value: StoreError) -> Self {
        match value {
            StoreError::TransactionConflict { attempts } => Self::TransactionConflict { attempts },
            StoreError::TooManyGroups { limit, touched } => Self::TooManyGroups { limit, touched },
            other => Self::Store(other),
        }
    }
}

/// List result envelope used by service callers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetingsListResult {
    /// Greetings sorted by `timestamp DESC, id DESC`.
    pub items: Vec<Greeting>,
    /// Effective limit after defaulting and clamping.
    pub applied_limit: u32,
}

/// Result of [`GuestbookService::rename_book`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameOutcome {
    /// `false` when the target name was already taken.
    pub renamed: bool,
    /// Book after the call: renamed (possibly under a new id) or unchanged.
    pub book: Book,
}

/// Guestbook service over any entity store.
pub struct GuestbookService<S: EntityStore> {
    store: S,
    config: GuestbookConfig,
}

impl<S: EntityStore> GuestbookService<S> {
    pub fn new(store: S, config: GuestbookConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    fn writer(&self) -> ConditionalWriter<'_, S> {
        ConditionalWriter::new(&self.store)
    }

    /// Creates a book, optionally linked to a tag created on demand.
    ///
    /// Under `BookNamePolicy::Unique` an existing book with the same name is
    /// returned with `created = false`; under `AllowDuplicates` a new book
    /// is always written.
    ///
    /// # Errors
    /// - `InvalidTag` when `tag_type` is blank.
    pub fn add_book(
        &self,
        name: &str,
        tag_type: Option<&str>,
    ) -> ServiceResult<CreateOutcome<Book>> {
        let name = normalize_book_name(name);
        let tags = match tag_type {
            Some(raw) => vec![self.ensure_tag(raw)?],
            None => Vec::new(),
        };
        let make_book = |id: BookId| {
            Book {
                id,
                name: name.clone(),
                tags: tags.clone(),
            }
            .to_entity()
        };

        let outcome = match self.config.book_names {
            BookNamePolicy::Unique => {
                self.writer()
                    .create_unique(&book_name_key(&name), Kind::Book, make_book)?
            }
            BookNamePolicy::AllowDuplicates => {
                let entity = self.store.transaction(|txn| {
                    let entity = make_book(txn.allocate_id(Kind::Book)?);
                    txn.put(entity.clone())?;
                    Ok(entity)
                })?;
                CreateOutcome {
                    created: true,
                    entity,
                }
            }
        };
        let outcome = outcome.try_map(|entity| Book::from_entity(&entity))?;
        info!(
            "event=book_create module=service status=ok book_id={} created={} tagged={}",
            outcome.entity.id,
            outcome.created,
            tag_type.is_some()
        );
        Ok(outcome)
    }

    /// Returns the referenced book, if any.
    pub fn get_book(&self, book: impl Into<BookRef>) -> ServiceResult<Option<Book>> {
        let book = book.into();
        Ok(resolve_book(&mut Committed(&self.store), &book, self.config.book_names)?)
    }

    /// Renames a book.
    ///
    /// Under `Unique` the rename goes through the name index and follows the
    /// configured `RenameStrategy`; a taken name returns `renamed = false`
    /// with the book unchanged. Under `AllowDuplicates` the name is updated
    /// in place.
    pub fn rename_book(
        &self,
        book: impl Into<BookRef>,
        new_name: &str,
    ) -> ServiceResult<RenameOutcome> {
        let book = book.into();
        let new_name = normalize_book_name(new_name);
        let policy = self.config.book_names;

        if policy == BookNamePolicy::AllowDuplicates {
            let renamed = self.store.transaction(|txn| {
                let Some(mut current) = resolve_book(txn, &book, policy)? else {
                    return Ok(None);
                };
                current.name = new_name.clone();
                txn.put(current.to_entity())?;
                Ok(Some(current))
            })?;
            let renamed = renamed.ok_or_else(|| ServiceError::BookNotFound(book.clone()))?;
            info!(
                "event=book_rename module=service status=ok book_id={} renamed=true",
                renamed.id
            );
            return Ok(RenameOutcome {
                renamed: true,
                book: renamed,
            });
        }

        let current = self
            .get_book(book.clone())?
            .ok_or_else(|| ServiceError::BookNotFound(book.clone()))?;
        let copy_children = self.config.rename == RenameStrategy::CopyChildren;
        match self
            .writer()
            .rename_if_absent_at_target(current.id, &new_name, copy_children)?
        {
            RenameResult::Renamed(renamed) => Ok(RenameOutcome {
                renamed: true,
                book: renamed,
            }),
            RenameResult::TargetTaken(unchanged) => Ok(RenameOutcome {
                renamed: false,
                book: unchanged,
            }),
            RenameResult::BookMissing => Err(ServiceError::BookNotFound(book)),
        }
    }

    /// Lists books ordered by name, optionally restricted to one tag.
    ///
    /// An unknown tag yields an empty list.
    ///
    /// # Errors
    /// - `InvalidTag` when `tag_type` is blank.
    pub fn list_books(&self, tag_type: Option<&str>) -> ServiceResult<Vec<Book>> {
        let mut query = Query::kind(Kind::Book).order_by(NAME_PROPERTY, SortDirection::Ascending);
        if let Some(raw) = tag_type {
            let key = tag_key(&parse_tag_type(raw)?);
            if self.store.get(&key)?.is_none() {
                return Ok(Vec::new());
            }
            query = query.filter_eq(TAGS_PROPERTY, key);
        }
        let books = decode_all(&self.store.query(&query)?, Book::from_entity)?;
        Ok(books)
    }

    /// Adds a greeting to an existing book.
    ///
    /// # Errors
    /// - `BookNotFound` when `book` does not resolve.
    pub fn add_greeting(
        &self,
        book: impl Into<BookRef>,
        content: &str,
    ) -> ServiceResult<Greeting> {
        let book = book.into();
        let policy = self.config.book_names;
        let greeting = self.store.transaction(|txn| {
            let Some(owner) = resolve_book(txn, &book, policy)? else {
                return Ok(None);
            };
            let greeting = Greeting {
                id: txn.allocate_id(Kind::Greeting)?,
                book_id: owner.id,
                content: content.to_string(),
                timestamp: now_epoch_ms(),
            };
            txn.put(greeting.to_entity())?;
            Ok(Some(greeting))
        })?;

        match greeting {
            Some(greeting) => {
                info!(
                    "event=greeting_create module=service status=ok book_id={} greeting_id={}",
                    greeting.book_id, greeting.id
                );
                Ok(greeting)
            }
            None => {
                warn!("event=greeting_create module=service status=error error_code=book_not_found");
                Err(ServiceError::BookNotFound(book))
            }
        }
    }

    /// Lists a book's greetings, newest first.
    ///
    /// `limit` of `None` or `0` uses the configured page size; larger
    /// values are clamped to it.
    pub fn list_greetings(
        &self,
        book: impl Into<BookRef>,
        limit: Option<u32>,
    ) -> ServiceResult<GreetingsListResult> {
        let book = book.into();
        let applied_limit = self.config.greeting_limit(limit);
        let owner = resolve_book(&mut Committed(&self.store), &book, self.config.book_names)?
            .ok_or_else(|| ServiceError::BookNotFound(book.clone()))?;

        let query = Query::kind(Kind::Greeting)
            .filter_eq(BOOK_ID_PROPERTY, owner.id)
            .order_by(TIMESTAMP_PROPERTY, SortDirection::Descending)
            .limit(applied_limit as usize);
        let items = decode_all(&self.store.query(&query)?, Greeting::from_entity)?;
        if items.iter().any(|greeting| greeting.book_id != owner.id) {
            return Err(ServiceError::InconsistentState(
                "greeting listing returned another book's greeting",
            ));
        }
        Ok(GreetingsListResult {
            items,
            applied_limit,
        })
    }

    /// Deletes a greeting if it exists and belongs to `book`.
    ///
    /// Idempotent: a missing greeting, a greeting of another book or an
    /// unresolvable book is a no-op. Returns whether something was deleted.
    pub fn delete_greeting(
        &self,
        book: impl Into<BookRef>,
        greeting_id: GreetingId,
    ) -> ServiceResult<bool> {
        let book = book.into();
        let policy = self.config.book_names;
        let key = greeting_key(greeting_id);
        let deleted = self.store.transaction(|txn| {
            let Some(owner) = resolve_book(txn, &book, policy)? else {
                return Ok(false);
            };
            let Some(entity) = txn.get(&key)? else {
                return Ok(false);
            };
            if Greeting::from_entity(&entity)?.book_id != owner.id {
                return Ok(false);
            }
            txn.delete(&key)?;
            Ok(true)
        })?;
        info!(
            "event=greeting_delete module=service status=ok greeting_id={greeting_id} deleted={deleted}"
        );
        Ok(deleted)
    }

    /// Links a tag to a book, creating the tag on first use.
    ///
    /// Book read, tag creation and book write share one transaction, so
    /// concurrent calls create the tag once and link it once.
    pub fn add_tag_to_book(
        &self,
        book: impl Into<BookRef>,
        tag_type: &str,
    ) -> ServiceResult<Book> {
        let book = book.into();
        let tag = Tag::new(parse_tag_type(tag_type)?);
        let tag_key = tag.key();
        let policy = self.config.book_names;

        let linked = self.store.transaction(|txn| {
            let Some(mut owner) = resolve_book(txn, &book, policy)? else {
                return Ok(None);
            };
            let created = create_if_absent_in(txn, &tag_key, || tag.to_entity())?.created;
            let newly_linked = !owner.has_tag(&tag_key);
            if newly_linked {
                owner.tags.push(tag_key.clone());
                txn.put(owner.to_entity())?;
            }
            Ok(Some((owner, created, newly_linked)))
        })?;

        let (owner, tag_created, newly_linked) =
            linked.ok_or_else(|| ServiceError::BookNotFound(book.clone()))?;
        info!(
            "event=tag_link module=service status=ok book_id={} tag_created={tag_created} linked={newly_linked}",
            owner.id
        );
        Ok(owner)
    }

    /// Lists all tags ordered by type.
    pub fn list_tags(&self) -> ServiceResult<Vec<Tag>> {
        let query = Query::kind(Kind::Tag).order_by(TYPE_PROPERTY, SortDirection::Ascending);
        Ok(decode_all(&self.store.query(&query)?, Tag::from_entity)?)
    }

    fn ensure_tag(&self, raw: &str) -> ServiceResult<EntityKey> {
        let tag = Tag::new(parse_tag_type(raw)?);
        let outcome = self.writer().create_if_absent(&tag.key(), || tag.to_entity())?;
        if outcome.created {
            info!("event=tag_create module=service status=ok key={}", outcome.entity.key);
        }
        Ok(outcome.entity.key)
    }
}

/// Read access shared by committed-state and transactional lookups.
trait EntityReader {
    fn read(&mut self, key: &EntityKey) -> StoreResult<Option<Entity>>;
    fn find(&mut self, query: &Query) -> StoreResult<Vec<Entity>>;
}

impl EntityReader for dyn Transaction + '_ {
    fn read(&mut self, key: &EntityKey) -> StoreResult<Option<Entity>> {
        self.get(key)
    }

    fn find(&mut self, query: &Query) -> StoreResult<Vec<Entity>> {
        self.query(query)
    }
}

/// Reads committed state outside any transaction.
struct Committed<'a, S>(&'a S);

impl<S: EntityStore> EntityReader for Committed<'_, S> {
    fn read(&mut self, key: &EntityKey) -> StoreResult<Option<Entity>> {
        self.0.get(key)
    }

    fn find(&mut self, query: &Query) -> StoreResult<Vec<Entity>> {
        self.0.query(query)
    }
}

fn resolve_book<R: EntityReader + ?Sized>(
    reader: &mut R,
    book: &BookRef,
    policy: BookNamePolicy,
) -> StoreResult<Option<Book>> {
    let entity = match book {
        BookRef::Id(id) => reader.read(&book_key(*id))?,
        BookRef::Name(name) => {
            let name = normalize_book_name(name);
            match policy {
                BookNamePolicy::Unique => match reader.read(&book_name_key(&name))? {
                    Some(entry) => reader.read(&index_target(&entry)?)?,
                    None => None,
                },
                BookNamePolicy::AllowDuplicates => {
                    let query = Query::kind(Kind::Book)
                        .filter_eq(NAME_PROPERTY, name)
                        .limit(1);
                    reader.find(&query)?.into_iter().next()
                }
            }
        }
    };
    entity.as_ref().map(Book::from_entity).transpose()
}

fn parse_tag_type(raw: &str) -> ServiceResult<String> {
    normalize_tag_type(raw).ok_or_else(|| ServiceError::InvalidTag(raw.to_string()))
}

fn decode_all<T>(
    entities: &[Entity],
    decode: impl Fn(&Entity) -> StoreResult<T>,
) -> StoreResult<Vec<T>> {
    entities.iter().map(decode).collect()
}

fn now_epoch_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| {
            i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
        })
}

#[cfg(test)]
mod tests {
    use super::{GuestbookService, ServiceError};
    use crate::config::GuestbookConfig;
    use crate::store::{MemoryEntityStore, StoreError};

    fn service() -> GuestbookService<MemoryEntityStore> {
        GuestbookService::new(MemoryEntityStore::new(), GuestbookConfig::default())
    }

    #[test]
    fn store_conflict_maps_to_service_conflict() {
        let err = ServiceError::from(StoreError::TransactionConflict { attempts: 4 });
        assert!(matches!(err, ServiceError::TransactionConflict { attempts: 4 }));
        let err = ServiceError::from(StoreError::InvalidData("x".to_string()));
        assert!(matches!(err, ServiceError::Store(_)));
    }

    #[test]
    fn blank_book_name_uses_default_name() {
        let service = service();
        let outcome = service.add_book("   ", None).unwrap();
        assert_eq!(outcome.entity.name, "*notitle*");
        assert_eq!(
            service.get_book("").unwrap().map(|book| book.id),
            Some(outcome.entity.id)
        );
    }

    #[test]
    fn blank_tag_is_rejected_before_any_write() {
        let service = service();
        let err = service.add_book("Visitors", Some("  ")).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTag(_)));
        assert!(service.store().is_empty());
    }

    #[test]
    fn greeting_for_missing_book_is_not_found() {
        let service = service();
        let err = service.add_greeting(42, "hello").unwrap_err();
        assert!(matches!(err, ServiceError::BookNotFound(_)));
        assert!(service.store().is_empty());
    }
}
