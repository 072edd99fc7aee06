//! In-memory store backend for development/testing.

use super::{Journal, JournalEntry, RecordIndex, Store};
use crate::core::error::StoreError;

/// Journal that keeps nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoJournal;

impl Journal for NoJournal {
    fn append(&mut self, _entry: &JournalEntry) -> Result<(), StoreError> {
        Ok(())
    }
}

/// Store whose records live only as long as the process.
pub type InMemoryStore = Store<NoJournal>;

impl Store<NoJournal> {
    /// Create an empty store pinning up to `cache_capacity` instances.
    #[must_use]
    pub fn new(cache_capacity: usize) -> Self {
        Self::with_index(RecordIndex::default(), NoJournal, cache_capacity)
    }
}
