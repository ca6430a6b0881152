//! In-process optimistic entity store.
//!
//! # Responsibility
//! - Provide an `EntityStore` with real optimistic concurrency for tests
//!   and single-process hosts.
//!
//! # Invariants
//! - Committed state is an immutable `Arc<EntityMap>`; writers swap in a new
//!   map under the write lock, so a snapshot never changes underneath a
//!   running transaction.
//! - Each commit stamps its writes with one new sequence number.
//! - Commit fails with a conflict when any key read or written, or any
//!   query result, differs from what the transaction observed.
//! - Read-only transactions commit without validation; their snapshot is
//!   already consistent.

use super::{
    run_with_retry, AttemptError, EntityStore, GroupTracker, Query, StoreResult, Transaction,
};
use crate::config::StoreConfig;
use crate::model::entity::{Entity, EntityKey, Kind};
use log::debug;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::Arc;

const STORE_NAME: &str = "memory";

#[derive(Debug, Clone)]
struct Versioned {
    entity: Entity,
    version: u64,
}

type EntityMap = BTreeMap<EntityKey, Versioned>;

/// `(key, version)` pairs a query returned, in result order.
type QueryFingerprint = Vec<(EntityKey, u64)>;

#[derive(Debug, Default)]
struct Committed {
    entities: Arc<EntityMap>,
    sequence: u64,
}

/// Optimistic in-memory store.
///
/// Share across threads with `Arc<MemoryEntityStore>`; `Arc` implements
/// `EntityStore` as well.
#[derive(Debug)]
pub struct MemoryEntityStore {
    config: StoreConfig,
    committed: RwLock<Committed>,
    next_ids: Mutex<BTreeMap<Kind, i64>>,
}

impl Default for MemoryEntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEntityStore {
    pub fn new() -> Self {
        Self::with_config(StoreConfig::default())
    }

    pub fn with_config(config: StoreConfig) -> Self {
        Self {
            config,
            committed: RwLock::new(Committed::default()),
            next_ids: Mutex::new(BTreeMap::new()),
        }
    }

    /// Number of committed entities across all kinds.
    pub fn len(&self) -> usize {
        self.committed.read().entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sequence number of the latest commit.
    pub fn commit_sequence(&self) -> u64 {
        self.committed.read().sequence
    }

    fn snapshot(&self) -> Arc<EntityMap> {
        Arc::clone(&self.committed.read().entities)
    }

    fn apply_writes(&self, writes: BTreeMap<EntityKey, Option<Entity>>) {
        let mut guard = self.committed.write();
        apply_locked(&mut guard, writes);
    }
}

impl EntityStore for MemoryEntityStore {
    fn get(&self, key: &EntityKey) -> StoreResult<Option<Entity>> {
        Ok(self
            .committed
            .read()
            .entities
            .get(key)
            .map(|versioned| versioned.entity.clone()))
    }

    fn put(&self, entity: Entity) -> StoreResult<EntityKey> {
        let key = entity.key.clone();
        self.apply_writes(BTreeMap::from([(key.clone(), Some(entity))]));
        Ok(key)
    }

    fn delete(&self, key: &EntityKey) -> StoreResult<()> {
        self.apply_writes(BTreeMap::from([(key.clone(), None)]));
        Ok(())
    }

    fn query(&self, query: &Query) -> StoreResult<Vec<Entity>> {
        let snapshot = self.snapshot();
        Ok(query.apply(candidates(&snapshot, query.kind)))
    }

    fn allocate_id(&self, kind: Kind) -> StoreResult<i64> {
        let mut next_ids = self.next_ids.lock();
        let slot = next_ids.entry(kind).or_insert(0);
        *slot += 1;
        Ok(*slot)
    }

    fn transaction<T, F>(&self, mut f: F) -> StoreResult<T>
    where
        F: FnMut(&mut dyn Transaction) -> StoreResult<T>,
    {
        run_with_retry(&self.config.retry, STORE_NAME, || {
            let mut txn = MemoryTransaction::begin(self);
            let value = f(&mut txn).map_err(AttemptError::Fatal)?;
            txn.commit()?;
            Ok(value)
        })
    }
}

struct MemoryTransaction<'s> {
    store: &'s MemoryEntityStore,
    snapshot: Arc<EntityMap>,
    reads: BTreeMap<EntityKey, Option<u64>>,
    queries: Vec<(Query, QueryFingerprint)>,
    writes: BTreeMap<EntityKey, Option<Entity>>,
    groups: GroupTracker,
}

impl<'s> MemoryTransaction<'s> {
    fn begin(store: &'s MemoryEntityStore) -> Self {
        Self {
            store,
            snapshot: store.snapshot(),
            reads: BTreeMap::new(),
            queries: Vec::new(),
            writes: BTreeMap::new(),
            groups: GroupTracker::new(store.config.max_groups_per_transaction),
        }
    }

    fn commit(self) -> Result<(), AttemptError> {
        if self.writes.is_empty() {
            return Ok(());
        }

        let mut guard = self.store.committed.write();
        let current = &guard.entities;

        for (key, seen) in &self.reads {
            if version_of(current, key) != *seen {
                return Err(AttemptError::Conflict(format!("read of {key} is stale")));
            }
        }
        for key in self.writes.keys() {
            if version_of(current, key) != version_of(&self.snapshot, key) {
                return Err(AttemptError::Conflict(format!(
                    "{key} was written concurrently"
                )));
            }
        }
        for (query, fingerprint) in &self.queries {
            if fingerprint_of(current, query) != *fingerprint {
                return Err(AttemptError::Conflict(format!(
                    "query over {} changed",
                    query.kind
                )));
            }
        }

        let write_count = self.writes.len();
        apply_locked(&mut guard, self.writes);
        debug!(
            "event=txn_commit module=store status=ok store={STORE_NAME} sequence={} writes={write_count}",
            guard.sequence
        );
        Ok(())
    }
}

impl Transaction for MemoryTransaction<'_> {
    fn get(&mut self, key: &EntityKey) -> StoreResult<Option<Entity>> {
        self.groups.touch(key)?;
        if let Some(pending) = self.writes.get(key) {
            return Ok(pending.clone());
        }
        let current = self.snapshot.get(key);
        self.reads
            .entry(key.clone())
            .or_insert_with(|| current.map(|versioned| versioned.version));
        Ok(current.map(|versioned| versioned.entity.clone()))
    }

    fn put(&mut self, entity: Entity) -> StoreResult<EntityKey> {
        self.groups.touch(&entity.key)?;
        let key = entity.key.clone();
        self.writes.insert(key.clone(), Some(entity));
        Ok(key)
    }

    fn delete(&mut self, key: &EntityKey) -> StoreResult<()> {
        self.groups.touch(key)?;
        self.writes.insert(key.clone(), None);
        Ok(())
    }

    fn query(&mut self, query: &Query) -> StoreResult<Vec<Entity>> {
        let mut merged = candidates(&self.snapshot, query.kind)
            .map(|entity| (entity.key.clone(), entity))
            .collect::<BTreeMap<_, _>>();
        for (key, pending) in &self.writes {
            if key.kind != query.kind {
                continue;
            }
            match pending {
                Some(entity) => merged.insert(key.clone(), entity.clone()),
                None => merged.remove(key),
            };
        }
        let result = query.apply(merged.into_values());
        self.groups.touch_all(result.iter().map(|entity| &entity.key))?;
        self.queries
            .push((query.clone(), fingerprint_of(&self.snapshot, query)));
        Ok(result)
    }

    fn allocate_id(&mut self, kind: Kind) -> StoreResult<i64> {
        self.store.allocate_id(kind)
    }
}

fn apply_locked(committed: &mut Committed, writes: BTreeMap<EntityKey, Option<Entity>>) {
    committed.sequence += 1;
    let sequence = committed.sequence;
    let entities = Arc::make_mut(&mut committed.entities);
    for (key, write) in writes {
        match write {
            Some(entity) => {
                entities.insert(
                    key,
                    Versioned {
                        entity,
                        version: sequence,
                    },
                );
            }
            None => {
                entities.remove(&key);
            }
        }
    }
}

fn candidates(entities: &EntityMap, kind: Kind) -> impl Iterator<Item = Entity> + '_ {
    entities
        .values()
        .filter(move |versioned| versioned.entity.key.kind == kind)
        .map(|versioned| versioned.entity.clone())
}

fn version_of(entities: &EntityMap, key: &EntityKey) -> Option<u64> {
    entities.get(key).map(|versioned| versioned.version)
}

fn fingerprint_of(entities: &EntityMap, query: &Query) -> QueryFingerprint {
    query
        .apply(candidates(entities, query.kind))
        .into_iter()
        .map(|entity| {
            let version = version_of(entities, &entity.key).unwrap_or_default();
            (entity.key, version)
        })
        .collect()
}
