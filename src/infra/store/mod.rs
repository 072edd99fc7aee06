//! Persistent store backends.
//!
//! Both backends share [`Store`]: a record index plus the identity cache.
//! They differ only in their [`Journal`], which is a no-op in memory and an
//! append-only JSONL file on disk.

mod cache;
pub mod file;
pub mod memory;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::error::StoreError;
use crate::core::ids::{Locator, ResourceId};
use crate::core::resource::Resource;
use crate::core::store::{PersistentStore, RecordFilter, ResourceRecord};

pub use cache::EvictionCallback;
pub use file::{FileStore, JsonlJournal};
pub use memory::{InMemoryStore, NoJournal};

use cache::IdentityCache;

/// One change of the record index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum JournalEntry {
    /// Insert or replace a record.
    Put {
        /// Snapshot with its id set.
        record: ResourceRecord,
    },
    /// Remove a record.
    Delete {
        /// Removed id.
        id: ResourceId,
    },
    /// Next id to assign, so ids of deleted resources are never reused.
    NextId {
        /// Id counter.
        next_id: u64,
    },
}

/// Durable sink of index changes.
pub trait Journal: Send {
    /// Persist one entry before the change becomes visible.
    ///
    /// # Errors
    ///
    /// Backend failures; the change is then not applied.
    fn append(&mut self, entry: &JournalEntry) -> Result<(), StoreError>;
}

/// Records by id, with the locator and consumer lookups the scheduler needs.
#[derive(Debug)]
pub struct RecordIndex {
    records: BTreeMap<ResourceId, ResourceRecord>,
    by_locator: HashMap<Locator, ResourceId>,
    consumers: HashMap<ResourceId, BTreeSet<ResourceId>>,
    next_id: u64,
}

impl Default for RecordIndex {
    fn default() -> Self {
        Self {
            records: BTreeMap::new(),
            by_locator: HashMap::new(),
            consumers: HashMap::new(),
            next_id: 1,
        }
    }
}

impl RecordIndex {
    /// Apply a replayed journal entry.
    pub fn apply(&mut self, entry: JournalEntry) {
        match entry {
            JournalEntry::Put { record } => {
                if let Some(id) = record.id {
                    self.next_id = self.next_id.max(id.0 + 1);
                    self.put(id, record);
                }
            }
            JournalEntry::Delete { id } => {
                self.remove(id);
            }
            JournalEntry::NextId { next_id } => self.next_id = self.next_id.max(next_id),
        }
    }

    /// Entries that rebuild this index from scratch.
    pub fn snapshot(&self) -> Vec<JournalEntry> {
        let mut entries = Vec::with_capacity(self.records.len() + 1);
        entries.push(JournalEntry::NextId { next_id: self.next_id });
        entries.extend(
            self.records
                .values()
                .map(|record| JournalEntry::Put { record: record.clone() }),
        );
        entries
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the index holds no record.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn allocate(&mut self) -> ResourceId {
        let id = ResourceId(self.next_id);
        self.next_id += 1;
        id
    }

    fn put(&mut self, id: ResourceId, record: ResourceRecord) {
        self.unlink(id);
        for producer in record.producers() {
            self.consumers.entry(producer).or_default().insert(id);
        }
        self.by_locator.insert(record.locator.clone(), id);
        self.records.insert(id, record);
    }

    fn remove(&mut self, id: ResourceId) -> Option<ResourceRecord> {
        self.unlink(id);
        let record = self.records.remove(&id)?;
        self.by_locator.remove(&record.locator);
        self.consumers.remove(&id);
        Some(record)
    }

    fn unlink(&mut self, id: ResourceId) {
        let Some(previous) = self.records.get(&id) else {
            return;
        };
        for producer in previous.producers() {
            if let Some(set) = self.consumers.get_mut(&producer) {
                set.remove(&id);
                if set.is_empty() {
                    self.consumers.remove(&producer);
                }
            }
        }
    }
}

struct Indexed<J> {
    index: RecordIndex,
    journal: J,
}

/// Identity-mapped store over a record index and a journal.
///
/// Lock order is cache then index; only inserts hold both.
pub struct Store<J> {
    indexed: Mutex<Indexed<J>>,
    cache: IdentityCache,
}

impl<J: Journal> Store<J> {
    fn with_index(index: RecordIndex, journal: J, capacity: usize) -> Self {
        Self {
            indexed: Mutex::new(Indexed { index, journal }),
            cache: IdentityCache::new(capacity),
        }
    }

    /// Call `callback` with the id of each instance the cache unpins.
    #[must_use]
    pub fn with_eviction_callback(mut self, callback: EvictionCallback) -> Self {
        self.cache.set_eviction_callback(callback);
        self
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.indexed.lock().index.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.indexed.lock().index.is_empty()
    }

    /// Instances currently pinned by the cache.
    pub fn pinned(&self) -> usize {
        self.cache.pinned_len()
    }

    fn insert(&self, resource: &Arc<Resource>, mut record: ResourceRecord) -> Result<ResourceId, StoreError> {
        let mut evicted = Vec::new();
        let id = {
            let mut cache = self.cache.lock();
            let mut indexed = self.indexed.lock();
            if indexed.index.by_locator.contains_key(&record.locator) {
                return Err(StoreError::AlreadyExists(record.locator));
            }
            let id = indexed.index.allocate();
            record.id = Some(id);
            let entry = JournalEntry::Put { record };
            indexed.journal.append(&entry)?;
            if let JournalEntry::Put { record } = entry {
                indexed.index.put(id, record);
            }
            cache.admit(id, Arc::clone(resource), &mut evicted);
            id
        };
        self.cache.report(evicted);
        debug!(resource = %id, locator = %resource.locator(), "resource stored");
        Ok(id)
    }

    fn update(&self, mut record: ResourceRecord) -> Result<ResourceId, StoreError> {
        let id = record.id.ok_or(StoreError::Unsaved)?;
        let mut indexed = self.indexed.lock();
        if !indexed.index.records.contains_key(&id) {
            return Err(StoreError::NotFound(id));
        }
        record.id = Some(id);
        let entry = JournalEntry::Put { record };
        indexed.journal.append(&entry)?;
        if let JournalEntry::Put { record } = entry {
            indexed.index.put(id, record);
        }
        Ok(id)
    }
}

impl<J: Journal> PersistentStore for Store<J> {
    fn get(&self, id: ResourceId) -> Result<Option<Arc<Resource>>, StoreError> {
        let mut evicted = Vec::new();
        let cached = self.cache.lock().lookup(id, &mut evicted);
        if let Some(resource) = cached {
            self.cache.report(evicted);
            return Ok(Some(resource));
        }
        let Some(record) = self.indexed.lock().index.records.get(&id).cloned() else {
            return Ok(None);
        };
        let fresh = Resource::from_record(record);
        let resource = self.cache.lock().admit(id, fresh, &mut evicted);
        self.cache.report(evicted);
        Ok(Some(resource))
    }

    fn find_by_locator(&self, locator: &Locator) -> Result<Option<ResourceId>, StoreError> {
        Ok(self.indexed.lock().index.by_locator.get(locator).copied())
    }

    fn save(&self, resource: &Arc<Resource>, record: ResourceRecord, is_update: bool) -> Result<ResourceId, StoreError> {
        if is_update {
            self.update(record)
        } else {
            self.insert(resource, record)
        }
    }

    fn replace(&self, id: ResourceId, resource: &Arc<Resource>, mut record: ResourceRecord) -> Result<(), StoreError> {
        let mut evicted = Vec::new();
        {
            let mut cache = self.cache.lock();
            let mut indexed = self.indexed.lock();
            let Some(previous) = indexed.index.records.get(&id) else {
                return Err(StoreError::NotFound(id));
            };
            if previous.locator != record.locator {
                return Err(StoreError::AlreadyExists(record.locator));
            }
            record.id = Some(id);
            let entry = JournalEntry::Put { record };
            indexed.journal.append(&entry)?;
            if let JournalEntry::Put { record } = entry {
                indexed.index.put(id, record);
            }
            cache.remove(id);
            cache.admit(id, Arc::clone(resource), &mut evicted);
        }
        self.cache.report(evicted);
        debug!(resource = %id, locator = %resource.locator(), "resource replaced");
        Ok(())
    }

    fn delete(&self, id: ResourceId) -> Result<(), StoreError> {
        {
            let mut indexed = self.indexed.lock();
            if !indexed.index.records.contains_key(&id) {
                return Err(StoreError::NotFound(id));
            }
            indexed.journal.append(&JournalEntry::Delete { id })?;
            indexed.index.remove(id);
        }
        self.cache.lock().remove(id);
        debug!(resource = %id, "resource deleted");
        Ok(())
    }

    fn find(&self, filter: RecordFilter<'_>) -> Result<Vec<ResourceId>, StoreError> {
        let indexed = self.indexed.lock();
        Ok(indexed
            .index
            .records
            .iter()
            .filter(|(_, record)| filter(record))
            .map(|(id, _)| *id)
            .collect())
    }

    fn record(&self, id: ResourceId) -> Result<Option<ResourceRecord>, StoreError> {
        Ok(self.indexed.lock().index.records.get(&id).cloned())
    }

    fn outgoing(&self, producer: ResourceId) -> Result<Vec<ResourceId>, StoreError> {
        Ok(self
            .indexed
            .lock()
            .index
            .consumers
            .get(&producer)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::dependency::{AccessMode, DependencyKind};
    use crate::core::state::{DependencyStatus, ResourceState};
    use crate::core::store::{DependencyRecord, JobRecord, KindRecord};

    fn job_record(locator: &str, id: u64, producers: &[u64]) -> ResourceRecord {
        ResourceRecord {
            id: Some(ResourceId(id)),
            locator: Locator::new(locator),
            state: ResourceState::Waiting,
            notified_state: ResourceState::Waiting,
            kind: KindRecord::Job(JobRecord {
                priority: 0,
                timestamp_ms: 0,
                nb_unsatisfied: 0,
                nb_holding: 0,
                start_ms: None,
                end_ms: None,
                held: false,
                pid: None,
                locks: Vec::new(),
                dependencies: producers
                    .iter()
                    .map(|from| DependencyRecord {
                        from: ResourceId(*from),
                        kind: DependencyKind::ReadWrite { mode: AccessMode::Read },
                        status: DependencyStatus::Wait,
                        lock: None,
                    })
                    .collect(),
            }),
        }
    }

    #[test]
    fn test_consumer_links_follow_updates() {
        let mut index = RecordIndex::default();
        index.apply(JournalEntry::Put { record: job_record("/a", 3, &[1, 2]) });
        assert!(index.consumers[&ResourceId(1)].contains(&ResourceId(3)));

        index.apply(JournalEntry::Put { record: job_record("/a", 3, &[2]) });
        assert!(!index.consumers.contains_key(&ResourceId(1)));
        assert_eq!(index.next_id, 4);

        index.apply(JournalEntry::Delete { id: ResourceId(3) });
        assert!(index.consumers.is_empty());
        assert!(index.by_locator.is_empty());
    }

    #[test]
    fn test_snapshot_keeps_id_counter() {
        let mut index = RecordIndex::default();
        index.apply(JournalEntry::Put { record: job_record("/a", 7, &[]) });
        index.apply(JournalEntry::Delete { id: ResourceId(7) });

        let mut rebuilt = RecordIndex::default();
        for entry in index.snapshot() {
            rebuilt.apply(entry);
        }
        assert_eq!(rebuilt.allocate(), ResourceId(8));
    }
}
