//! The entity store: every durable entity keyed by its natural key, mutated
//! through transactions that commit atomically.
//!
//! A [`Transaction`] holds the store lock for its whole lifetime and writes
//! straight into the tables, remembering the prior content of every row it
//! touches. [`Transaction::commit`] hands the rows that actually changed to the
//! [`Persistence`] backend; dropping a transaction without a successful commit
//! puts every touched row back. Writers are therefore serialized, which keeps
//! get-or-create atomic per key no matter how the static sync and the live
//! poller interleave.

mod entities;
mod persistence;
mod rows;
mod tables;

pub use entities::{
    Bus, BusId, DirectionCode, Entity, Fare, FromKey, Line, LineChange, LineId, NewsId,
    NewsMessage, Route, RouteId, RouteStop, Stop, StopId, route_id,
};
pub use persistence::{MemoryPersistence, Persistence, SqlitePersistence};
pub use rows::{Change, Row, RowKey};
pub use tables::{SyncMeta, Tables};

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::ops::Deref;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use tracing::debug;

use crate::error::StoreError;

pub struct EntityStore {
    tables: Mutex<Tables>,
    persistence: Box<dyn Persistence>,
}

impl EntityStore {
    /// A store that lives only as long as the process.
    pub fn in_memory() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            persistence: Box::new(MemoryPersistence),
        }
    }

    /// Opens (or creates) a SQLite-backed store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::with_persistence(SqlitePersistence::open(path.as_ref())?)
    }

    pub fn with_persistence(persistence: impl Persistence + 'static) -> Result<Self, StoreError> {
        let tables = persistence.load()?;
        Ok(Self {
            tables: Mutex::new(tables),
            persistence: Box::new(persistence),
        })
    }

    pub fn begin(&self) -> Result<Transaction<'_>, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(Transaction {
            tables,
            before: BTreeMap::new(),
            persistence: self.persistence.as_ref(),
            committed: false,
        })
    }

    /// Runs `f` against the committed tables.
    pub fn read<R>(&self, f: impl FnOnce(&Tables) -> R) -> Result<R, StoreError> {
        let tables = self.tables.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(f(&tables))
    }

    pub fn get<E: Entity>(&self, key: &E::Key) -> Result<Option<E>, StoreError> {
        self.read(|t| t.get::<E>(key).cloned())
    }
}

pub struct Transaction<'s> {
    tables: MutexGuard<'s, Tables>,
    /// Content of every touched row as it was before its first touch.
    before: BTreeMap<RowKey, Option<Row>>,
    persistence: &'s dyn Persistence,
    committed: bool,
}

impl Deref for Transaction<'_> {
    type Target = Tables;

    fn deref(&self) -> &Tables {
        &self.tables
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        for (key, row) in std::mem::take(&mut self.before) {
            self.tables.restore(key, row);
        }
    }
}

impl Transaction<'_> {
    fn touch(&mut self, key: RowKey) {
        if let Entry::Vacant(slot) = self.before.entry(key) {
            let prior = self.tables.row(slot.key());
            slot.insert(prior);
        }
    }

    /// Looks up an entity that must already exist.
    pub fn require<E: Entity>(&self, key: &E::Key) -> Result<&E, StoreError> {
        self.tables.get::<E>(key).ok_or_else(|| missing::<E>(key))
    }

    pub fn require_mut<E: Entity>(&mut self, key: &E::Key) -> Result<&mut E, StoreError> {
        if self.tables.get::<E>(key).is_none() {
            return Err(missing::<E>(key));
        }
        self.touch(E::row_key(key));
        E::table_mut(&mut self.tables)
            .get_mut(key)
            .ok_or_else(|| missing::<E>(key))
    }

    /// Returns the entity stored under `key`, creating a bare one on a miss.
    /// The flag is `true` when this call created it.
    pub fn get_or_create<E: FromKey>(&mut self, key: E::Key) -> (&mut E, bool) {
        let seed = key.clone();
        self.get_or_create_with(key, || E::from_key(seed))
    }

    /// Like [`Transaction::get_or_create`], building the new entity with `make`.
    pub fn get_or_create_with<E: Entity>(
        &mut self,
        key: E::Key,
        make: impl FnOnce() -> E,
    ) -> (&mut E, bool) {
        self.touch(E::row_key(&key));
        match E::table_mut(&mut self.tables).entry(key) {
            Entry::Occupied(slot) => (slot.into_mut(), false),
            Entry::Vacant(slot) => {
                let entity = make();
                debug_assert!(entity.key() == *slot.key(), "constructed {} under a foreign key", E::NAME);
                debug!(entity = E::NAME, key = ?slot.key(), "Created entity");
                (slot.insert(entity), true)
            }
        }
    }

    /// Inserts a new entity, refusing to overwrite an existing one.
    pub fn insert<E: Entity>(&mut self, entity: E) -> Result<&mut E, StoreError> {
        let key = entity.key();
        if self.tables.get::<E>(&key).is_some() {
            return Err(StoreError::Duplicate {
                entity: E::NAME,
                key: format!("{key:?}"),
            });
        }
        self.touch(E::row_key(&key));
        Ok(E::table_mut(&mut self.tables).entry(key).or_insert(entity))
    }

    /// Replaces the ordered stop sequence of `route`.
    ///
    /// Every stop must already exist. A stop listed twice keeps its first
    /// position so positions stay contiguous. Rows for stops no longer on the
    /// route are removed.
    pub fn replace_route_stops(
        &mut self,
        route: RouteId,
        stops: &[StopId],
    ) -> Result<Vec<RouteStop>, StoreError> {
        for stop in stops {
            self.require::<Stop>(stop)?;
        }

        let mut seen = BTreeSet::new();
        let sequence: Vec<RouteStop> = stops
            .iter()
            .filter(|stop| seen.insert(**stop))
            .enumerate()
            .map(|(position, &stop_id)| RouteStop {
                route_id: route,
                stop_id,
                position: position as u32,
            })
            .collect();

        let stale: Vec<(RouteId, StopId)> = self
            .tables
            .route_stops
            .range((route, StopId::MIN)..=(route, StopId::MAX))
            .map(|(key, _)| *key)
            .collect();
        let touched: Vec<RowKey> = stale
            .iter()
            .map(|&(route_id, stop_id)| RowKey::RouteStop(route_id, stop_id))
            .chain(sequence.iter().map(|rs| RowKey::RouteStop(rs.route_id, rs.stop_id)))
            .collect();
        for key in touched {
            self.touch(key);
        }

        let table = &mut self.tables.route_stops;
        for key in &stale {
            table.remove(key);
        }
        table.extend(sequence.iter().map(|rs| ((rs.route_id, rs.stop_id), rs.clone())));

        Ok(sequence)
    }

    pub fn meta_mut(&mut self) -> &mut SyncMeta {
        self.touch(RowKey::Meta);
        &mut self.tables.meta
    }

    /// Persists every row this transaction changed. On error the transaction
    /// is dropped and the touched rows are put back.
    pub fn commit(mut self) -> Result<(), StoreError> {
        let changes: Vec<Change> = self
            .before
            .iter()
            .filter_map(|(key, prior)| {
                let current = self.tables.row(key);
                if current == *prior {
                    return None;
                }
                Some(match current {
                    Some(row) => Change::Upsert(row),
                    None => Change::Delete(key.clone()),
                })
            })
            .collect();

        if !changes.is_empty() {
            self.persistence.save(&changes)?;
        }
        debug!(touched = self.before.len(), changed = changes.len(), "Committed");
        self.committed = true;
        Ok(())
    }
}

fn missing<E: Entity>(key: &E::Key) -> StoreError {
    StoreError::Missing {
        entity: E::NAME,
        key: format!("{key:?}"),
    }
}
