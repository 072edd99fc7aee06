//! Shared helpers for integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use xpm_scheduler::builders::build_handle;
use xpm_scheduler::config::SchedulerConfig;
use xpm_scheduler::core::{
    Locator, PersistentStore, RecordFilter, Resource, ResourceId, ResourceRecord, SchedulerHandle, StoreError,
};
use xpm_scheduler::infra::{InMemoryLauncher, InMemoryStore};
use xpm_scheduler::runtime::CollectingListener;

/// In-memory handle plus the launcher and an event recorder.
pub struct Harness {
    pub handle: SchedulerHandle,
    pub launcher: Arc<InMemoryLauncher>,
    pub events: Arc<CollectingListener>,
}

pub fn test_config() -> SchedulerConfig {
    SchedulerConfig::new()
        .with_rescheduling_delay_ms(20)
        .with_job_check_interval_ms(20)
        .with_owner("test-scheduler")
}

pub fn harness() -> Harness {
    harness_with(test_config(), Arc::new(InMemoryLauncher::new()))
}

pub fn harness_with(cfg: SchedulerConfig, launcher: Arc<InMemoryLauncher>) -> Harness {
    let handle = build_handle(cfg, launcher.clone()).expect("handle");
    let events = Arc::new(CollectingListener::new());
    handle.add_listener(events.clone());
    Harness {
        handle,
        launcher,
        events,
    }
}

/// Run propagation, delivery and scheduling by hand until nothing moves.
pub fn settle(handle: &SchedulerHandle) {
    for _ in 0..64 {
        let propagated = handle.propagate_pending();
        let delivered = handle.deliver_due();
        let started = handle.run_ready_jobs();
        if propagated == 0 && delivered == 0 && started == 0 {
            return;
        }
    }
    panic!("scheduler did not settle");
}

/// End the simulated process of `job` and let the scheduler observe it.
pub fn finish_job(h: &Harness, job: ResourceId, code: i32) {
    let process = h.launcher.process_for(job).expect("job has a process");
    assert!(process.finish(code));
    assert!(h.handle.check_running_jobs() >= 1);
    settle(&h.handle);
}

/// Poll `condition` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

/// In-memory store counting update saves.
pub struct CountingStore {
    inner: InMemoryStore,
    updates: AtomicUsize,
}

impl CountingStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: InMemoryStore::new(capacity),
            updates: AtomicUsize::new(0),
        }
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }
}

impl PersistentStore for CountingStore {
    fn get(&self, id: ResourceId) -> Result<Option<Arc<Resource>>, StoreError> {
        self.inner.get(id)
    }

    fn find_by_locator(&self, locator: &Locator) -> Result<Option<ResourceId>, StoreError> {
        self.inner.find_by_locator(locator)
    }

    fn save(&self, resource: &Arc<Resource>, record: ResourceRecord, is_update: bool) -> Result<ResourceId, StoreError> {
        if is_update {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
        self.inner.save(resource, record, is_update)
    }

    fn replace(&self, id: ResourceId, resource: &Arc<Resource>, record: ResourceRecord) -> Result<(), StoreError> {
        self.inner.replace(id, resource, record)
    }

    fn delete(&self, id: ResourceId) -> Result<(), StoreError> {
        self.inner.delete(id)
    }

    fn find(&self, filter: RecordFilter<'_>) -> Result<Vec<ResourceId>, StoreError> {
        self.inner.find(filter)
    }

    fn record(&self, id: ResourceId) -> Result<Option<ResourceRecord>, StoreError> {
        self.inner.record(id)
    }

    fn outgoing(&self, producer: ResourceId) -> Result<Vec<ResourceId>, StoreError> {
        self.inner.outgoing(producer)
    }
}
