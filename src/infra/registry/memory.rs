//! In-memory lock registry for development/testing.

use std::collections::HashMap;

use parking_lot::Mutex;

use super::Holders;
use crate::core::error::LockError;
use crate::core::ids::{Locator, OwnerId};
use crate::core::lock::{LockCounts, LockMode, LockRegistry};

/// Registry whose records live only as long as the process.
#[derive(Debug, Default)]
pub struct InMemoryLockRegistry {
    keys: Mutex<HashMap<Locator, Holders>>,
}

impl InMemoryLockRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mode held by `owner` on `key`.
    pub fn mode_of(&self, key: &Locator, owner: &OwnerId) -> Option<LockMode> {
        self.keys.lock().get(key).and_then(|holders| holders.mode_of(owner))
    }

    /// Number of keys with at least one holder.
    pub fn held_keys(&self) -> usize {
        self.keys.lock().len()
    }
}

impl LockRegistry for InMemoryLockRegistry {
    fn acquire(&self, key: &Locator, owner: &OwnerId, mode: LockMode) -> Result<(), LockError> {
        let mut keys = self.keys.lock();
        let holders = keys.entry(key.clone()).or_default();
        let outcome = holders.acquire(key, owner, mode).map(|_| ());
        if holders.is_empty() {
            keys.remove(key);
        }
        outcome
    }

    fn release(&self, key: &Locator, owner: &OwnerId) -> Result<(), LockError> {
        let mut keys = self.keys.lock();
        if let Some(holders) = keys.get_mut(key) {
            holders.release(owner);
            if holders.is_empty() {
                keys.remove(key);
            }
        }
        Ok(())
    }

    fn change_owner(&self, key: &Locator, from: &OwnerId, to: &OwnerId) -> Result<(), LockError> {
        let mut keys = self.keys.lock();
        let holders = keys
            .get_mut(key)
            .ok_or_else(|| LockError::Incoherent(format!("{from} does not hold {key}")))?;
        holders.transfer(key, from, to)
    }

    fn reconcile(&self, key: &Locator) -> Result<LockCounts, LockError> {
        Ok(self.keys.lock().get(key).map(Holders::counts).unwrap_or_default())
    }
}
