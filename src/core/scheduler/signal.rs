//! Wake-up primitives connecting resources to the background loops.

use std::collections::{HashSet, VecDeque};

use parking_lot::{Condvar, Mutex};

use crate::core::ids::ResourceId;

/// Shared state for the runner's Condvar-based wake notifications.
struct WakeState {
    /// Some job may have become runnable.
    ready: bool,
    /// Stop waiting for good.
    shutdown: bool,
}

/// Binary readiness signal: any number of notifications before the runner
/// wakes collapse into one scan.
pub(crate) struct ReadySignal {
    state: Mutex<WakeState>,
    condvar: Condvar,
}

impl ReadySignal {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(WakeState {
                ready: false,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        }
    }

    pub(crate) fn notify(&self) {
        let mut state = self.state.lock();
        state.ready = true;
        self.condvar.notify_one();
    }

    /// Block until notified; `false` once shut down.
    pub(crate) fn wait(&self) -> bool {
        let mut state = self.state.lock();
        while !state.ready && !state.shutdown {
            self.condvar.wait(&mut state);
        }
        if state.shutdown {
            return false;
        }
        state.ready = false;
        true
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.condvar.notify_all();
    }

    /// Consume a pending notification without blocking.
    #[cfg(test)]
    pub(crate) fn take(&self) -> bool {
        std::mem::take(&mut self.state.lock().ready)
    }
}

struct ChangedState {
    order: VecDeque<ResourceId>,
    members: HashSet<ResourceId>,
    shutdown: bool,
}

/// Deduplicating queue of resources whose state change has not been
/// propagated yet.
pub(crate) struct ChangedSet {
    state: Mutex<ChangedState>,
    condvar: Condvar,
}

impl ChangedSet {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(ChangedState {
                order: VecDeque::new(),
                members: HashSet::new(),
                shutdown: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Enqueue `id` unless it is already pending.
    pub(crate) fn push(&self, id: ResourceId) {
        let mut state = self.state.lock();
        if state.members.insert(id) {
            state.order.push_back(id);
            self.condvar.notify_one();
        }
    }

    /// Block until an id is pending; `None` once shut down.
    pub(crate) fn pop(&self) -> Option<ResourceId> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            if let Some(id) = state.order.pop_front() {
                state.members.remove(&id);
                return Some(id);
            }
            self.condvar.wait(&mut state);
        }
    }

    /// Take a pending id without blocking.
    pub(crate) fn try_pop(&self) -> Option<ResourceId> {
        let mut state = self.state.lock();
        let id = state.order.pop_front()?;
        state.members.remove(&id);
        Some(id)
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().order.len()
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_changed_set_deduplicates() {
        let set = ChangedSet::new();
        set.push(ResourceId(1));
        set.push(ResourceId(2));
        set.push(ResourceId(1));
        assert_eq!(set.len(), 2);
        assert_eq!(set.try_pop(), Some(ResourceId(1)));
        set.push(ResourceId(1));
        assert_eq!(set.try_pop(), Some(ResourceId(2)));
        assert_eq!(set.try_pop(), Some(ResourceId(1)));
        assert_eq!(set.try_pop(), None);
    }

    #[test]
    fn test_ready_signal_collapses_notifications() {
        let signal = ReadySignal::new();
        signal.notify();
        signal.notify();
        assert!(signal.wait());
        assert!(!signal.take());
        signal.notify();
        assert!(signal.take());
        signal.shutdown();
        assert!(!signal.wait());
    }

    #[test]
    fn test_shutdown_unblocks_waiter() {
        let set = Arc::new(ChangedSet::new());
        let waiter = {
            let set = Arc::clone(&set);
            thread::spawn(move || set.pop())
        };
        thread::sleep(Duration::from_millis(20));
        set.shutdown();
        assert_eq!(waiter.join().unwrap(), None);
    }
}
