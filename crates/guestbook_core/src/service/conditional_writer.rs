//! Conditional writes on top of `EntityStore`.
//!
//! # Responsibility
//! - Create an entity only when its key is absent.
//! - Create an entity guarded by an explicit uniqueness index entry.
//! - Rename a book only when the target name is free.
//!
//! # Invariants
//! - Every operation runs inside exactly one store transaction.
//! - Among callers racing on one key, at most one observes `created = true`.
//! - Index entries reference the guarded entity through their `target`
//!   property; an entry is removed only by the entity it points at.

use crate::model::entity::{Entity, EntityKey, Kind};
use crate::model::guestbook::{
    book_key, book_name_key, Book, BookId, Greeting, BOOK_ID_PROPERTY,
};
use crate::store::{EntityStore, Query, StoreError, StoreResult, Transaction};
use log::info;

/// Property on index entries holding the guarded entity key.
pub const INDEX_TARGET_PROPERTY: &str = "target";

/// Result of a create-if-absent style write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOutcome<T> {
    /// `true` only for the caller whose write was committed.
    pub created: bool,
    /// Newly written entity, or the one already stored.
    pub entity: T,
}

impl<T> CreateOutcome<T> {
    pub fn try_map<U, E>(
        self,
        f: impl FnOnce(T) -> Result<U, E>,
    ) -> Result<CreateOutcome<U>, E> {
        Ok(CreateOutcome {
            created: self.created,
            entity: f(self.entity)?,
        })
    }
}

/// Result of [`ConditionalWriter::rename_if_absent_at_target`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenameResult {
    /// Rename committed; carries the book as it now exists.
    Renamed(Book),
    /// Target name already indexed. Nothing changed; carries the book as
    /// read inside the refused transaction.
    TargetTaken(Book),
    /// Source book does not exist. Nothing changed.
    BookMissing,
}

impl RenameResult {
    pub fn is_renamed(&self) -> bool {
        matches!(self, Self::Renamed(_))
    }
}

/// Conditional write helper bound to one store.
pub struct ConditionalWriter<'s, S: EntityStore> {
    store: &'s S,
}

impl<'s, S: EntityStore> ConditionalWriter<'s, S> {
    pub fn new(store: &'s S) -> Self {
        Self { store }
    }

    /// Writes `make_entity()` at `key` unless something is stored there.
    ///
    /// `make_entity` runs at most once per transaction attempt and only
    /// when the key is absent.
    ///
    /// # Errors
    /// - `TransactionConflict` after retries are exhausted; nothing written.
    /// - `InvalidData` when `make_entity` returns an entity for another key.
    pub fn create_if_absent<F>(
        &self,
        key: &EntityKey,
        mut make_entity: F,
    ) -> StoreResult<CreateOutcome<Entity>>
    where
        F: FnMut() -> Entity,
    {
        let outcome = self
            .store
            .transaction(|txn| create_if_absent_in(txn, key, &mut make_entity))?;
        info!(
            "event=entity_create module=writer status=ok key={key} created={}",
            outcome.created
        );
        Ok(outcome)
    }

    /// Allocates a `kind` id and writes `make_entity(id)` unless `index_key`
    /// already points at an entity, in which case that entity is returned.
    ///
    /// # Errors
    /// - `InvalidData` when the index points at a missing entity or
    ///   `make_entity` ignores the allocated id.
    pub fn create_unique<F>(
        &self,
        index_key: &EntityKey,
        kind: Kind,
        mut make_entity: F,
    ) -> StoreResult<CreateOutcome<Entity>>
    where
        F: FnMut(i64) -> Entity,
    {
        let outcome = self.store.transaction(|txn| {
            if let Some(entry) = txn.get(index_key)? {
                let target = index_target(&entry)?;
                let existing = txn.get(&target)?.ok_or_else(|| {
                    StoreError::InvalidData(format!(
                        "index {index_key} points at missing {target}"
                    ))
                })?;
                return Ok(CreateOutcome {
                    created: false,
                    entity: existing,
                });
            }

            let id = txn.allocate_id(kind)?;
            let entity = make_entity(id);
            let expected_key = EntityKey::numeric(kind, id);
            if entity.key != expected_key {
                return Err(StoreError::InvalidData(format!(
                    "expected entity {expected_key}, got {}",
                    entity.key
                )));
            }
            txn.put(index_entry(index_key, &entity.key))?;
            txn.put(entity.clone())?;
            Ok(CreateOutcome {
                created: true,
                entity,
            })
        })?;
        info!(
            "event=entity_create module=writer status=ok key={} index={index_key} created={}",
            outcome.entity.key, outcome.created
        );
        Ok(outcome)
    }

    /// Renames book `book_id` to `new_name` if no book is indexed under it.
    ///
    /// `new_name` is used verbatim; callers default blank names. With
    /// `copy_children`, the book moves to a fresh id together with copies of
    /// its greetings (original content and timestamp), and the old book,
    /// greetings and index entry are deleted.
    ///
    /// # Errors
    /// - `TooManyGroups` when the move does not fit one transaction.
    pub fn rename_if_absent_at_target(
        &self,
        book_id: BookId,
        new_name: &str,
        copy_children: bool,
    ) -> StoreResult<RenameResult> {
        let target_index = book_name_key(new_name);
        let result = self.store.transaction(|txn| {
            let Some(entity) = txn.get(&book_key(book_id))? else {
                return Ok(RenameResult::BookMissing);
            };
            let book = Book::from_entity(&entity)?;
            if txn.get(&target_index)?.is_some() {
                return Ok(RenameResult::TargetTaken(book));
            }
            if copy_children {
                move_book(txn, book, &target_index, new_name)
            } else {
                rename_in_place(txn, book, &target_index, new_name)
            }
        })?;

        let (outcome, new_book_id) = match &result {
            RenameResult::Renamed(book) => ("renamed", Some(book.id)),
            RenameResult::TargetTaken(_) => ("target_taken", None),
            RenameResult::BookMissing => ("book_missing", None),
        };
        info!(
            "event=book_rename module=writer status=ok book_id={book_id} new_book_id={new_book_id:?} copy_children={copy_children} outcome={outcome}"
        );
        Ok(result)
    }
}

/// `create_if_absent` against a caller-owned transaction.
pub fn create_if_absent_in(
    txn: &mut dyn Transaction,
    key: &EntityKey,
    make_entity: impl FnOnce() -> Entity,
) -> StoreResult<CreateOutcome<Entity>> {
    if let Some(existing) = txn.get(key)? {
        return Ok(CreateOutcome {
            created: false,
            entity: existing,
        });
    }
    let entity = make_entity();
    if &entity.key != key {
        return Err(StoreError::InvalidData(format!(
            "expected entity {key}, got {}",
            entity.key
        )));
    }
    txn.put(entity.clone())?;
    Ok(CreateOutcome {
        created: true,
        entity,
    })
}

/// Builds the index entry stored at `index_key` for `target`.
pub fn index_entry(index_key: &EntityKey, target: &EntityKey) -> Entity {
    Entity::new(index_key.clone()).with(INDEX_TARGET_PROPERTY, target.clone())
}

/// Reads the guarded key from an index entry.
pub fn index_target(entry: &Entity) -> StoreResult<EntityKey> {
    entry
        .key_ref(INDEX_TARGET_PROPERTY)
        .cloned()
        .ok_or_else(|| {
            StoreError::InvalidData(format!(
                "index entry {} has no `{INDEX_TARGET_PROPERTY}` key",
                entry.key
            ))
        })
}

fn rename_in_place(
    txn: &mut dyn Transaction,
    book: Book,
    target_index: &EntityKey,
    new_name: &str,
) -> StoreResult<RenameResult> {
    remove_index_if_owned(txn, &book_name_key(&book.name), &book.key())?;
    let renamed = Book {
        name: new_name.to_string(),
        ..book
    };
    txn.put(index_entry(target_index, &renamed.key()))?;
    txn.put(renamed.to_entity())?;
    Ok(RenameResult::Renamed(renamed))
}

fn move_book(
    txn: &mut dyn Transaction,
    old: Book,
    target_index: &EntityKey,
    new_name: &str,
) -> StoreResult<RenameResult> {
    let children = txn.query(&Query::kind(Kind::Greeting).filter_eq(BOOK_ID_PROPERTY, old.id))?;

    let moved = Book {
        id: txn.allocate_id(Kind::Book)?,
        name: new_name.to_string(),
        tags: old.tags.clone(),
    };
    txn.put(moved.to_entity())?;
    txn.put(index_entry(target_index, &moved.key()))?;

    for child in &children {
        let greeting = Greeting::from_entity(child)?;
        let copy = Greeting {
            id: txn.allocate_id(Kind::Greeting)?,
            book_id: moved.id,
            ..greeting
        };
        txn.put(copy.to_entity())?;
        txn.delete(&child.key)?;
    }

    remove_index_if_owned(txn, &book_name_key(&old.name), &old.key())?;
    txn.delete(&old.key())?;
    Ok(RenameResult::Renamed(moved))
}

fn remove_index_if_owned(
    txn: &mut dyn Transaction,
    index_key: &EntityKey,
    owner: &EntityKey,
) -> StoreResult<()> {
    if let Some(entry) = txn.get(index_key)? {
        if &index_target(&entry)? == owner {
            txn.delete(index_key)?;
        }
    }
    Ok(())
}
