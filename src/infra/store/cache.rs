//! Identity cache of live resources.
//!
//! Every live instance is tracked by a `Weak` reference so callers holding a
//! resource always get that same instance back. The most recently used
//! instances are also pinned by strong references, up to the capacity; an
//! instance leaving that set is reported to the eviction callback.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, MutexGuard};

use crate::core::ids::ResourceId;
use crate::core::resource::Resource;

/// Called with the id of each instance unpinned from the cache.
pub type EvictionCallback = Arc<dyn Fn(ResourceId) + Send + Sync>;

pub(crate) struct CacheState {
    live: HashMap<ResourceId, Weak<Resource>>,
    pinned: VecDeque<(ResourceId, Arc<Resource>)>,
    capacity: usize,
}

impl CacheState {
    /// Live instance of `id`, marked as most recently used.
    pub(crate) fn lookup(&mut self, id: ResourceId, evicted: &mut Vec<ResourceId>) -> Option<Arc<Resource>> {
        let resource = self.live.get(&id)?.upgrade();
        match resource {
            Some(resource) => {
                self.touch(id, &resource, evicted);
                Some(resource)
            }
            None => {
                self.live.remove(&id);
                None
            }
        }
    }

    /// Register `resource` as the instance of `id`, unless another live
    /// instance already exists, which is then returned instead.
    pub(crate) fn admit(
        &mut self,
        id: ResourceId,
        resource: Arc<Resource>,
        evicted: &mut Vec<ResourceId>,
    ) -> Arc<Resource> {
        if let Some(existing) = self.lookup(id, evicted) {
            return existing;
        }
        self.live.insert(id, Arc::downgrade(&resource));
        self.touch(id, &resource, evicted);
        if self.live.len() > self.capacity.saturating_mul(2) {
            self.live.retain(|_, weak| weak.strong_count() > 0);
        }
        resource
    }

    pub(crate) fn remove(&mut self, id: ResourceId) {
        self.live.remove(&id);
        self.pinned.retain(|(pinned, _)| *pinned != id);
    }

    fn touch(&mut self, id: ResourceId, resource: &Arc<Resource>, evicted: &mut Vec<ResourceId>) {
        if let Some(pos) = self.pinned.iter().position(|(pinned, _)| *pinned == id) {
            if let Some(entry) = self.pinned.remove(pos) {
                self.pinned.push_back(entry);
            }
            return;
        }
        self.pinned.push_back((id, Arc::clone(resource)));
        while self.pinned.len() > self.capacity {
            if let Some((old, _)) = self.pinned.pop_front() {
                evicted.push(old);
            }
        }
    }
}

pub(crate) struct IdentityCache {
    state: Mutex<CacheState>,
    on_evict: Option<EvictionCallback>,
}

impl IdentityCache {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(CacheState {
                live: HashMap::new(),
                pinned: VecDeque::with_capacity(capacity.min(4096)),
                capacity: capacity.max(1),
            }),
            on_evict: None,
        }
    }

    pub(crate) fn set_eviction_callback(&mut self, callback: EvictionCallback) {
        self.on_evict = Some(callback);
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock()
    }

    /// Fire the eviction callback; call with the cache unlocked.
    pub(crate) fn report(&self, evicted: Vec<ResourceId>) {
        if let Some(callback) = &self.on_evict {
            for id in evicted {
                callback(id);
            }
        }
    }

    pub(crate) fn pinned_len(&self) -> usize {
        self.state.lock().pinned.len()
    }
}
