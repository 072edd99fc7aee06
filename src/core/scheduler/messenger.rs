//! Delayed message delivery with retry.
//!
//! Packages wait in a min-heap keyed by delivery time. A failed delivery is
//! never dropped: it goes back into the heap `rescheduling_delay_ms` later.

use std::collections::BinaryHeap;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::SchedulerHandle;
use crate::core::error::SchedulerError;
use crate::core::ids::ResourceId;
use crate::core::message::{Message, MessagePackage};
use crate::util::now_ms;

struct QueueState {
    heap: BinaryHeap<MessagePackage>,
    sequence: u64,
    shutdown: bool,
}

/// Heap of pending packages plus the condition the messenger sleeps on.
pub(crate) struct MessageQueue {
    state: Mutex<QueueState>,
    condvar: Condvar,
}

impl MessageQueue {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                sequence: 0,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Schedule `message` for `destination` at `timestamp_ms`.
    pub(crate) fn push(&self, destination: ResourceId, message: Message, timestamp_ms: u64) {
        let mut state = self.state.lock();
        let sequence = state.sequence;
        state.sequence += 1;
        state.heap.push(MessagePackage {
            message,
            destination,
            timestamp_ms,
            sequence,
        });
        // The new entry may be earlier than the one the messenger sleeps on.
        self.condvar.notify_one();
    }

    /// Put a package back with a later delivery time.
    pub(crate) fn reschedule(&self, package: MessagePackage, timestamp_ms: u64) {
        self.push(package.destination, package.message, timestamp_ms);
    }

    /// Block until the earliest package is due; `None` once shut down.
    pub(crate) fn next_due(&self) -> Option<MessagePackage> {
        let mut state = self.state.lock();
        loop {
            if state.shutdown {
                return None;
            }
            let Some(earliest) = state.heap.peek().map(|p| p.timestamp_ms) else {
                self.condvar.wait(&mut state);
                continue;
            };
            let now = now_ms();
            if earliest <= now {
                return state.heap.pop();
            }
            self.condvar.wait_for(&mut state, Duration::from_millis(earliest - now));
        }
    }

    /// Pop the earliest package if it is due, without blocking.
    pub(crate) fn try_next_due(&self, now: u64) -> Option<MessagePackage> {
        let mut state = self.state.lock();
        if state.heap.peek().is_some_and(|p| p.timestamp_ms <= now) {
            return state.heap.pop();
        }
        None
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    pub(crate) fn shutdown(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.condvar.notify_all();
    }
}

/// Messenger thread body.
pub(crate) fn messenger_loop(handle: &SchedulerHandle) {
    info!("messenger started");
    while let Some(package) = handle.messages().next_due() {
        deliver(handle, package);
    }
    info!("messenger stopped");
}

impl SchedulerHandle {
    /// Deliver every package already due without the messenger thread.
    /// Returns how many were delivered; failures are rescheduled.
    pub fn deliver_due(&self) -> usize {
        let now = now_ms();
        let mut delivered = 0;
        while let Some(package) = self.messages().try_next_due(now) {
            if deliver(self, package) {
                delivered += 1;
            }
        }
        delivered
    }
}

/// Deliver one package, rescheduling it on failure. Returns whether it was delivered.
pub(crate) fn deliver(handle: &SchedulerHandle, package: MessagePackage) -> bool {
    let destination = package.destination;
    let outcome = match handle.resolve(destination) {
        Ok(Some(resource)) => resource.notify(handle, &package.message),
        Ok(None) => Err(SchedulerError::NotFound(destination)),
        Err(e) => Err(e),
    };
    match outcome {
        Ok(()) => {
            debug!(destination = %destination, kind = package.message.kind(), "message delivered");
            true
        }
        Err(e) => {
            let delay = handle.config().rescheduling_delay_ms;
            warn!(
                destination = %destination,
                kind = package.message.kind(),
                error = %e,
                delay_ms = delay,
                "message delivery failed; rescheduling"
            );
            handle.messages().reschedule(package, now_ms().saturating_add(delay));
            false
        }
    }
}
