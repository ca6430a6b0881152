//! SQLite-backed entity store.
//!
//! # Responsibility
//! - Persist entity documents as JSON rows in the `entities` table.
//! - Allocate numeric ids from the `id_sequences` table.
//! - Run store transactions as SQLite `IMMEDIATE` transactions.
//!
//! # Invariants
//! - Only migrated connections are accepted.
//! - Transaction closures run while holding the SQLite write lock, so
//!   concurrent writers on other connections are serialized; lock timeouts
//!   (`SQLITE_BUSY`) are treated as conflicts and retried.
//! - The group limit is enforced the same way as in the memory store.
//! - Property filtering and ordering reuse `Query::apply`; SQL narrows by
//!   kind only.

use super::{
    run_with_retry, AttemptError, EntityStore, GroupTracker, Query, StoreError, StoreResult,
    Transaction,
};
use crate::config::StoreConfig;
use crate::db::migrations::{latest_version, schema_version};
use crate::db::DbError;
use crate::model::entity::{Entity, EntityId, EntityKey, Kind, PropertyValue};
use log::debug;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use std::collections::BTreeMap;

const STORE_NAME: &str = "sqlite";

/// Entity store over one borrowed SQLite connection.
///
/// Open one connection per thread (`db::open_db`) against the same file to
/// share a database between concurrent callers.
pub struct SqliteEntityStore<'conn> {
    conn: &'conn Connection,
    config: StoreConfig,
}

impl<'conn> SqliteEntityStore<'conn> {
    /// Wraps a migrated connection using default store settings.
    pub fn try_new(conn: &'conn Connection) -> StoreResult<Self> {
        Self::with_config(conn, StoreConfig::default())
    }

    /// Wraps a migrated connection.
    ///
    /// # Errors
    /// - `DbError::UninitializedConnection` when the schema version differs
    ///   from [`latest_version`].
    pub fn with_config(conn: &'conn Connection, config: StoreConfig) -> StoreResult<Self> {
        let actual_version = schema_version(conn)?;
        let expected_version = latest_version();
        if actual_version != expected_version {
            return Err(DbError::UninitializedConnection {
                expected_version,
                actual_version,
            }
            .into());
        }
        Ok(Self { conn, config })
    }
}

impl EntityStore for SqliteEntityStore<'_> {
    fn get(&self, key: &EntityKey) -> StoreResult<Option<Entity>> {
        load_entity(self.conn, key)
    }

    fn put(&self, entity: Entity) -> StoreResult<EntityKey> {
        store_entity(self.conn, &entity)?;
        Ok(entity.key)
    }

    fn delete(&self, key: &EntityKey) -> StoreResult<()> {
        remove_entity(self.conn, key)
    }

    fn query(&self, query: &Query) -> StoreResult<Vec<Entity>> {
        query_entities(self.conn, query)
    }

    fn allocate_id(&self, kind: Kind) -> StoreResult<i64> {
        next_id(self.conn, kind)
    }

    fn transaction<T, F>(&self, mut f: F) -> StoreResult<T>
    where
        F: FnMut(&mut dyn Transaction) -> StoreResult<T>,
    {
        run_with_retry(&self.config.retry, STORE_NAME, || {
            let tx = rusqlite::Transaction::new_unchecked(self.conn, TransactionBehavior::Immediate)
                .map_err(StoreError::from)?;
            let value = {
                let mut view = SqliteTransaction {
                    conn: &tx,
                    groups: GroupTracker::new(self.config.max_groups_per_transaction),
                };
                f(&mut view)?
            };
            tx.commit().map_err(StoreError::from)?;
            debug!("event=txn_commit module=store status=ok store={STORE_NAME}");
            Ok::<T, AttemptError>(value)
        })
    }
}

struct SqliteTransaction<'t> {
    conn: &'t Connection,
    groups: GroupTracker,
}

impl Transaction for SqliteTransaction<'_> {
    fn get(&mut self, key: &EntityKey) -> StoreResult<Option<Entity>> {
        self.groups.touch(key)?;
        load_entity(self.conn, key)
    }

    fn put(&mut self, entity: Entity) -> StoreResult<EntityKey> {
        self.groups.touch(&entity.key)?;
        store_entity(self.conn, &entity)?;
        Ok(entity.key)
    }

    fn delete(&mut self, key: &EntityKey) -> StoreResult<()> {
        self.groups.touch(key)?;
        remove_entity(self.conn, key)
    }

    fn query(&mut self, query: &Query) -> StoreResult<Vec<Entity>> {
        let result = query_entities(self.conn, query)?;
        self.groups
            .touch_all(result.iter().map(|entity| &entity.key))?;
        Ok(result)
    }

    fn allocate_id(&mut self, kind: Kind) -> StoreResult<i64> {
        next_id(self.conn, kind)
    }
}

fn load_entity(conn: &Connection, key: &EntityKey) -> StoreResult<Option<Entity>> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM entities WHERE kind = ?1 AND entity_id = ?2;",
            params![key.kind.as_str(), key.id.encode()],
            |row| row.get(0),
        )
        .optional()?;
    body.map(|body| decode_entity(key.clone(), &body))
        .transpose()
}

fn store_entity(conn: &Connection, entity: &Entity) -> StoreResult<()> {
    let body = serde_json::to_string(&entity.properties)?;
    conn.execute(
        "INSERT INTO entities (kind, entity_id, body)
         VALUES (?1, ?2, ?3)
         ON CONFLICT (kind, entity_id) DO UPDATE
         SET
            body = excluded.body,
            updated_at = (strftime('%s', 'now') * 1000);",
        params![entity.key.kind.as_str(), entity.key.id.encode(), body],
    )?;
    Ok(())
}

fn remove_entity(conn: &Connection, key: &EntityKey) -> StoreResult<()> {
    conn.execute(
        "DELETE FROM entities WHERE kind = ?1 AND entity_id = ?2;",
        params![key.kind.as_str(), key.id.encode()],
    )?;
    Ok(())
}

fn query_entities(conn: &Connection, query: &Query) -> StoreResult<Vec<Entity>> {
    let mut stmt = conn.prepare("SELECT entity_id, body FROM entities WHERE kind = ?1;")?;
    let mut rows = stmt.query([query.kind.as_str()])?;
    let mut candidates = Vec::new();
    while let Some(row) = rows.next()? {
        let id_text: String = row.get("entity_id")?;
        let id = EntityId::decode(&id_text).ok_or_else(|| {
            StoreError::InvalidData(format!(
                "invalid entity id `{id_text}` in entities.entity_id"
            ))
        })?;
        let body: String = row.get("body")?;
        candidates.push(decode_entity(EntityKey::new(query.kind, id), &body)?);
    }
    Ok(query.apply(candidates))
}

fn next_id(conn: &Connection, kind: Kind) -> StoreResult<i64> {
    let id = conn.query_row(
        "INSERT INTO id_sequences (kind, last_id)
         VALUES (?1, 1)
         ON CONFLICT (kind) DO UPDATE SET last_id = last_id + 1
         RETURNING last_id;",
        [kind.as_str()],
        |row| row.get(0),
    )?;
    Ok(id)
}

fn decode_entity(key: EntityKey, body: &str) -> StoreResult<Entity> {
    let properties: BTreeMap<String, PropertyValue> = serde_json::from_str(body)?;
    Ok(Entity { key, properties })
}
