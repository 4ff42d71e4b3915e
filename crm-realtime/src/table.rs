//! Version-ordered entity tables
//!
//! One table per entity kind. A table only ever moves forward in version per
//! id: stale and duplicate events are discarded, deletes leave a tombstone so a
//! reordered older insert cannot resurrect the row, and a strictly newer insert
//! can.
//!
//! Tombstones are bounded: each snapshot load forgets those created before the
//! previous snapshot, and past `tombstone_capacity` the oldest are evicted.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crm_common::types::{Entity, EntityId, EntityKind, EntityRecord};

type Records<T> = HashMap<EntityId, Arc<EntityRecord<T>>>;

/// Tombstones kept per table before the oldest are evicted
pub const DEFAULT_TOMBSTONE_CAPACITY: usize = 10_000;

#[derive(Debug, Clone, Copy)]
struct Tombstone {
    version: u64,
    seq: u64,
}

/// Result of applying one mutation to a table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    Updated,
    Deleted,
    /// Delete for an id not present; only the tombstone was recorded
    Tombstoned,
    /// Version not newer than what the table already holds
    Stale { stored: u64 },
    /// Nothing to do (delete of an unknown id without a version)
    Noop,
}

impl ApplyOutcome {
    /// Whether the visible contents of the table changed
    #[must_use]
    pub fn is_mutation(self) -> bool {
        matches!(self, Self::Inserted | Self::Updated | Self::Deleted)
    }
}

/// In-memory table of one entity kind
#[derive(Debug)]
pub struct EntityTable<T> {
    records: Arc<Records<T>>,
    tombstones: HashMap<EntityId, Tombstone>,
    /// Creation order; entries whose tombstone was replaced or lifted are skipped
    tombstone_order: VecDeque<(u64, EntityId)>,
    next_tombstone: u64,
    /// Tombstones older than this predate the previous snapshot
    horizon: u64,
    tombstone_capacity: usize,
    generation: u64,
}

impl<T: Entity> EntityTable<T> {
    pub fn new() -> Self {
        Self::with_records(Arc::new(HashMap::new()), 0)
    }

    /// Start from a previously published view
    pub fn from_view(view: &TableView<T>) -> Self {
        Self::with_records(Arc::clone(&view.records), view.generation)
    }

    fn with_records(records: Arc<Records<T>>, generation: u64) -> Self {
        Self {
            records,
            tombstones: HashMap::new(),
            tombstone_order: VecDeque::new(),
            next_tombstone: 0,
            horizon: 0,
            tombstone_capacity: DEFAULT_TOMBSTONE_CAPACITY,
            generation,
        }
    }

    #[must_use]
    pub fn with_tombstone_capacity(mut self, capacity: usize) -> Self {
        self.tombstone_capacity = capacity.max(1);
        self
    }

    #[must_use]
    pub fn kind(&self) -> EntityKind {
        T::KIND
    }

    /// Insert or replace a record if `version` is newer than anything seen for `id`
    pub fn upsert(&mut self, id: EntityId, version: u64, data: T, at: DateTime<Utc>) -> ApplyOutcome {
        if let Some(tombstone) = self.tombstone(&id) {
            if version <= tombstone {
                return ApplyOutcome::Stale { stored: tombstone };
            }
        }
        let existed = match self.records.get(&id) {
            Some(stored) if version <= stored.version => {
                return ApplyOutcome::Stale {
                    stored: stored.version,
                };
            }
            Some(_) => true,
            None => false,
        };

        self.tombstones.remove(&id);
        let record = EntityRecord {
            id: id.clone(),
            version,
            data,
            last_mutated_at: at,
        };
        Arc::make_mut(&mut self.records).insert(id, Arc::new(record));
        self.generation += 1;

        if existed {
            ApplyOutcome::Updated
        } else {
            ApplyOutcome::Inserted
        }
    }

    /// Remove a record. A delete wins a tie with a record of the same version.
    pub fn remove(&mut self, id: &EntityId, version: Option<u64>) -> ApplyOutcome {
        let stored = self.records.get(id).map(|r| r.version);
        let Some(version) = version else {
            // No version on the wire: drop whatever is there at its own version.
            return match stored {
                Some(stored) => self.drop_record(id, stored),
                None => ApplyOutcome::Noop,
            };
        };

        if let Some(tombstone) = self.tombstone(id) {
            if version <= tombstone {
                return ApplyOutcome::Stale { stored: tombstone };
            }
        }
        match stored {
            Some(stored) if version < stored => ApplyOutcome::Stale { stored },
            Some(_) => self.drop_record(id, version),
            None => {
                self.bury(id, version);
                ApplyOutcome::Tombstoned
            }
        }
    }

    fn drop_record(&mut self, id: &EntityId, tombstone: u64) -> ApplyOutcome {
        Arc::make_mut(&mut self.records).remove(id);
        self.bury(id, tombstone);
        self.generation += 1;
        ApplyOutcome::Deleted
    }

    fn bury(&mut self, id: &EntityId, version: u64) {
        let seq = self.next_tombstone;
        self.next_tombstone += 1;
        self.tombstones.insert(id.clone(), Tombstone { version, seq });
        self.tombstone_order.push_back((seq, id.clone()));

        while self.tombstones.len() > self.tombstone_capacity {
            let Some((seq, id)) = self.tombstone_order.pop_front() else {
                break;
            };
            if self.tombstones.get(&id).is_some_and(|t| t.seq == seq) {
                self.tombstones.remove(&id);
            }
        }
        if self.tombstone_order.len() > self.tombstone_capacity.saturating_mul(2) {
            self.prune_order();
        }
    }

    fn prune_order(&mut self) {
        let tombstones = &self.tombstones;
        self.tombstone_order
            .retain(|(seq, id)| tombstones.get(id).is_some_and(|t| t.seq == *seq));
    }

    /// Forget tombstones created before the previous call. Run once per
    /// snapshot load; returns how many were dropped.
    pub fn compact_tombstones(&mut self) -> usize {
        let horizon = self.horizon;
        self.horizon = self.next_tombstone;
        let before = self.tombstones.len();
        self.tombstones.retain(|_, t| t.seq >= horizon);
        self.prune_order();
        before - self.tombstones.len()
    }

    /// Remove every record whose id is not in `keep`; returns the pruned ids
    pub fn retain_ids(&mut self, keep: &HashSet<EntityId>) -> Vec<EntityId> {
        let absent: Vec<(EntityId, u64)> = self
            .records
            .values()
            .filter(|r| !keep.contains(&r.id))
            .map(|r| (r.id.clone(), r.version))
            .collect();
        for (id, version) in &absent {
            self.drop_record(id, *version);
        }
        absent.into_iter().map(|(id, _)| id).collect()
    }

    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<Arc<EntityRecord<T>>> {
        self.records.get(id).cloned()
    }

    /// Version of the tombstone left by a delete, if any
    #[must_use]
    pub fn tombstone(&self, id: &EntityId) -> Option<u64> {
        self.tombstones.get(id).map(|t| t.version)
    }

    #[must_use]
    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Mutation counter of this table
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Immutable view sharing storage with the table until its next write
    #[must_use]
    pub fn view(&self) -> TableView<T> {
        TableView {
            records: Arc::clone(&self.records),
            generation: self.generation,
        }
    }

    pub fn clear(&mut self) {
        self.records = Arc::new(HashMap::new());
        self.tombstones.clear();
        self.tombstone_order.clear();
        self.generation += 1;
    }
}

impl<T: Entity> Default for EntityTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only snapshot of one table
#[derive(Debug)]
pub struct TableView<T> {
    records: Arc<Records<T>>,
    generation: u64,
}

impl<T> Clone for TableView<T> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            generation: self.generation,
        }
    }
}

impl<T> TableView<T> {
    #[must_use]
    pub fn empty() -> Self {
        Self {
            records: Arc::new(HashMap::new()),
            generation: 0,
        }
    }

    #[must_use]
    pub fn get(&self, id: &EntityId) -> Option<&Arc<EntityRecord<T>>> {
        self.records.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<EntityRecord<T>>> {
        self.records.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Whether both views share the same storage
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.records, &other.records)
    }
}

impl<T: Entity> TableView<T> {
    /// Records belonging to one workspace
    pub fn in_workspace<'a>(
        &'a self,
        workspace_id: &'a EntityId,
    ) -> impl Iterator<Item = &'a Arc<EntityRecord<T>>> + 'a {
        self.records
            .values()
            .filter(move |r| r.data.workspace_id() == Some(workspace_id))
    }
}
