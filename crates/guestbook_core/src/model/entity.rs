//! Storage-level document model.
//!
//! # Responsibility
//! - Define the kinds, identifiers and keys addressed by `EntityStore`.
//! - Define the property values carried by entity documents.
//!
//! # Invariants
//! - `EntityKey` ordering is total: kind first, then identifier.
//! - Every key is top-level. Parent/child links are plain `Key` properties,
//!   never key prefixes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};

/// Entity kind stored in the document store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Kind {
    /// Guestbook container.
    Book,
    /// Uniqueness index entry mapping a book name to its book key.
    BookName,
    /// One guestbook entry.
    Greeting,
    /// Self-keyed label attached to books.
    Tag,
}

impl Kind {
    /// Stable storage name of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Book => "Book",
            Self::BookName => "BookName",
            Self::Greeting => "Greeting",
            Self::Tag => "Tag",
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifier of an entity within its kind.
///
/// Numeric ids are allocated by the store; names are chosen by callers.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityId {
    Id(i64),
    Name(String),
}

impl EntityId {
    /// Encodes the identifier into its storage text form.
    ///
    /// `Id(42)` -> `id:42`, `Name("x")` -> `name:x`.
    pub fn encode(&self) -> String {
        match self {
            Self::Id(id) => format!("id:{id}"),
            Self::Name(name) => format!("name:{name}"),
        }
    }

    /// Decodes a storage text form produced by [`EntityId::encode`].
    pub fn decode(value: &str) -> Option<Self> {
        if let Some(rest) = value.strip_prefix("id:") {
            return rest.parse().ok().map(Self::Id);
        }
        value
            .strip_prefix("name:")
            .map(|rest| Self::Name(rest.to_string()))
    }
}

impl Display for EntityId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Full address of one entity: `(kind, identifier)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub kind: Kind,
    pub id: EntityId,
}

impl EntityKey {
    pub fn new(kind: Kind, id: EntityId) -> Self {
        Self { kind, id }
    }

    /// Key with a store-allocated numeric id.
    pub fn numeric(kind: Kind, id: i64) -> Self {
        Self::new(kind, EntityId::Id(id))
    }

    /// Key with a caller-chosen name.
    pub fn named(kind: Kind, name: impl Into<String>) -> Self {
        Self::new(kind, EntityId::Name(name.into()))
    }

    /// Returns the numeric id, if this key has one.
    pub fn numeric_id(&self) -> Option<i64> {
        match self.id {
            EntityId::Id(id) => Some(id),
            EntityId::Name(_) => None,
        }
    }

    /// Returns the name, if this key is named.
    pub fn name(&self) -> Option<&str> {
        match &self.id {
            EntityId::Id(_) => None,
            EntityId::Name(name) => Some(name.as_str()),
        }
    }
}

impl Display for EntityKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({})", self.kind, self.id)
    }
}

/// One property value inside an entity document.
///
/// Values of different variants order by variant first, so sorting a
/// property with mixed types is deterministic.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum PropertyValue {
    Integer(i64),
    Text(String),
    Key(EntityKey),
    List(Vec<PropertyValue>),
}

impl PropertyValue {
    /// Equality predicate used by store queries.
    ///
    /// A list matches when any element equals `operand`.
    pub fn matches_equality(&self, operand: &PropertyValue) -> bool {
        match self {
            Self::List(items) if !matches!(operand, Self::List(_)) => {
                items.iter().any(|item| item == operand)
            }
            other => other == operand,
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<EntityKey> for PropertyValue {
    fn from(value: EntityKey) -> Self {
        Self::Key(value)
    }
}

/// Document stored under one key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    pub key: EntityKey,
    pub properties: BTreeMap<String, PropertyValue>,
}

impl Entity {
    /// Creates an entity without properties.
    pub fn new(key: EntityKey) -> Self {
        Self {
            key,
            properties: BTreeMap::new(),
        }
    }

    /// Builder-style property setter.
    pub fn with(mut self, name: &str, value: impl Into<PropertyValue>) -> Self {
        self.set(name, value);
        self
    }

    pub fn set(&mut self, name: &str, value: impl Into<PropertyValue>) {
        self.properties.insert(name.to_string(), value.into());
    }

    pub fn get(&self, name: &str) -> Option<&PropertyValue> {
        self.properties.get(name)
    }

    pub fn text(&self, name: &str) -> Option<&str> {
        match self.get(name) {
            Some(PropertyValue::Text(value)) => Some(value.as_str()),
            _ => None,
        }
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        match self.get(name) {
            Some(PropertyValue::Integer(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn key_ref(&self, name: &str) -> Option<&EntityKey> {
        match self.get(name) {
            Some(PropertyValue::Key(value)) => Some(value),
            _ => None,
        }
    }

    /// Reads a list of keys. Returns `None` when the property is missing or
    /// holds anything other than keys.
    pub fn key_list(&self, name: &str) -> Option<Vec<EntityKey>> {
        match self.get(name) {
            Some(PropertyValue::List(items)) => items
                .iter()
                .map(|item| match item {
                    PropertyValue::Key(key) => Some(key.clone()),
                    _ => None,
                })
                .collect(),
            _ => None,
        }
    }
}
