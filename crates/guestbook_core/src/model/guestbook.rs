//! Guestbook domain records.
//!
//! # Responsibility
//! - Define typed `Book`, `Greeting` and `Tag` records.
//! - Convert records to and from store documents.
//! - Default blank book names and reject blank tag types.
//!
//! # Invariants
//! - Book and Greeting ids are store-allocated numbers.
//! - Tag identity is its `type` string, exactly as supplied.
//! - Non-blank book names and tag types are stored verbatim; distinct strings
//!   are distinct keys.
//! - Greeting `timestamp` is set once at creation and copied verbatim on
//!   migration.
//! - Decoding rejects documents with missing or mistyped properties instead
//!   of masking them.

use crate::model::entity::{Entity, EntityKey, Kind, PropertyValue};
use crate::store::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};

/// Store-allocated book identifier.
pub type BookId = i64;
/// Store-allocated greeting identifier.
pub type GreetingId = i64;

/// Name used when a book is created or addressed with a blank name.
pub const DEFAULT_BOOK_NAME: &str = "*notitle*";

pub const NAME_PROPERTY: &str = "name";
pub const TAGS_PROPERTY: &str = "tags";
pub const BOOK_ID_PROPERTY: &str = "book_id";
pub const CONTENT_PROPERTY: &str = "content";
pub const TIMESTAMP_PROPERTY: &str = "timestamp";
pub const TYPE_PROPERTY: &str = "type";

/// Guestbook container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Book {
    pub id: BookId,
    /// Display name. Unique only under `BookNamePolicy::Unique`.
    pub name: String,
    /// Keys of linked tags, in link order.
    pub tags: Vec<EntityKey>,
}

impl Book {
    pub fn new(id: BookId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            tags: Vec::new(),
        }
    }

    pub fn key(&self) -> EntityKey {
        book_key(self.id)
    }

    pub fn has_tag(&self, tag_key: &EntityKey) -> bool {
        self.tags.iter().any(|key| key == tag_key)
    }

    /// Tag types in link order.
    pub fn tag_types(&self) -> Vec<&str> {
        self.tags.iter().filter_map(EntityKey::name).collect()
    }

    pub fn to_entity(&self) -> Entity {
        let tags = self
            .tags
            .iter()
            .cloned()
            .map(PropertyValue::Key)
            .collect::<Vec<_>>();
        Entity::new(self.key())
            .with(NAME_PROPERTY, self.name.as_str())
            .with(TAGS_PROPERTY, PropertyValue::List(tags))
    }

    pub fn from_entity(entity: &Entity) -> StoreResult<Self> {
        let id = expect_numeric(entity, Kind::Book)?;
        let name = entity
            .text(NAME_PROPERTY)
            .ok_or_else(|| missing_property(entity, NAME_PROPERTY))?;
        let tags = entity
            .key_list(TAGS_PROPERTY)
            .ok_or_else(|| missing_property(entity, TAGS_PROPERTY))?;
        if let Some(bad) = tags.iter().find(|key| key.kind != Kind::Tag) {
            return Err(StoreError::InvalidData(format!(
                "book {} links non-tag key {bad}",
                entity.key
            )));
        }
        Ok(Self {
            id,
            name: name.to_string(),
            tags,
        })
    }
}

/// One guestbook entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Greeting {
    pub id: GreetingId,
    /// Owning book. Explicit foreign key, queried by `list_greetings`.
    pub book_id: BookId,
    pub content: String,
    /// Creation time in epoch milliseconds.
    pub timestamp: i64,
}

impl Greeting {
    pub fn key(&self) -> EntityKey {
        greeting_key(self.id)
    }

    pub fn to_entity(&self) -> Entity {
        Entity::new(self.key())
            .with(BOOK_ID_PROPERTY, self.book_id)
            .with(CONTENT_PROPERTY, self.content.as_str())
            .with(TIMESTAMP_PROPERTY, self.timestamp)
    }

    pub fn from_entity(entity: &Entity) -> StoreResult<Self> {
        let id = expect_numeric(entity, Kind::Greeting)?;
        Ok(Self {
            id,
            book_id: entity
                .integer(BOOK_ID_PROPERTY)
                .ok_or_else(|| missing_property(entity, BOOK_ID_PROPERTY))?,
            content: entity
                .text(CONTENT_PROPERTY)
                .ok_or_else(|| missing_property(entity, CONTENT_PROPERTY))?
                .to_string(),
            timestamp: entity
                .integer(TIMESTAMP_PROPERTY)
                .ok_or_else(|| missing_property(entity, TIMESTAMP_PROPERTY))?,
        })
    }
}

/// Self-keyed label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type")]
    pub tag_type: String,
}

impl Tag {
    pub fn new(tag_type: impl Into<String>) -> Self {
        Self {
            tag_type: tag_type.into(),
        }
    }

    pub fn key(&self) -> EntityKey {
        tag_key(&self.tag_type)
    }

    pub fn to_entity(&self) -> Entity {
        Entity::new(self.key()).with(TYPE_PROPERTY, self.tag_type.as_str())
    }

    pub fn from_entity(entity: &Entity) -> StoreResult<Self> {
        let Some(key_name) = entity.key.name().filter(|_| entity.key.kind == Kind::Tag) else {
            return Err(StoreError::InvalidData(format!(
                "expected named Tag key, got {}",
                entity.key
            )));
        };
        let tag_type = entity
            .text(TYPE_PROPERTY)
            .ok_or_else(|| missing_property(entity, TYPE_PROPERTY))?;
        if tag_type != key_name {
            return Err(StoreError::InvalidData(format!(
                "tag {} has mismatched type `{tag_type}`",
                entity.key
            )));
        }
        Ok(Self::new(tag_type))
    }
}

/// Way a caller addresses a book.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookRef {
    Id(BookId),
    /// Resolved through the name index or a name query, depending on policy.
    Name(String),
}

impl Display for BookRef {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Id(id) => write!(f, "id {id}"),
            Self::Name(name) => write!(f, "name `{name}`"),
        }
    }
}

impl From<BookId> for BookRef {
    fn from(value: BookId) -> Self {
        Self::Id(value)
    }
}

impl From<&str> for BookRef {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for BookRef {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

impl From<&Book> for BookRef {
    fn from(value: &Book) -> Self {
        Self::Id(value.id)
    }
}

pub fn book_key(id: BookId) -> EntityKey {
    EntityKey::numeric(Kind::Book, id)
}

pub fn greeting_key(id: GreetingId) -> EntityKey {
    EntityKey::numeric(Kind::Greeting, id)
}

pub fn tag_key(tag_type: &str) -> EntityKey {
    EntityKey::named(Kind::Tag, tag_type)
}

/// Key of the uniqueness index entry for one book name.
pub fn book_name_key(name: &str) -> EntityKey {
    EntityKey::named(Kind::BookName, name)
}

/// Maps a blank book name to [`DEFAULT_BOOK_NAME`]; any other name is kept
/// as given.
pub fn normalize_book_name(name: &str) -> String {
    if name.trim().is_empty() {
        DEFAULT_BOOK_NAME.to_string()
    } else {
        name.to_string()
    }
}

/// Returns the tag type as given, or `None` when it is blank.
pub fn normalize_tag_type(tag_type: &str) -> Option<String> {
    if tag_type.trim().is_empty() {
        None
    } else {
        Some(tag_type.to_string())
    }
}

fn expect_numeric(entity: &Entity, kind: Kind) -> StoreResult<i64> {
    match entity.key.numeric_id() {
        Some(id) if entity.key.kind == kind => Ok(id),
        _ => Err(StoreError::InvalidData(format!(
            "expected numeric {kind} key, got {}",
            entity.key
        ))),
    }
}

fn missing_property(entity: &Entity, property: &str) -> StoreError {
    StoreError::InvalidData(format!(
        "{} is missing or has mistyped property `{property}`",
        entity.key
    ))
}
