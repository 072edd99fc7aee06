//! Notifier: propagates state changes to dependent jobs.

use tracing::{debug, error, info, warn};

use super::SchedulerHandle;
use crate::core::error::SchedulerError;
use crate::core::ids::ResourceId;

/// Notifier thread body.
pub(crate) fn notifier_loop(handle: &SchedulerHandle) {
    info!("notifier started");
    while let Some(id) = handle.changed().pop() {
        if let Err(e) = handle.propagate(id) {
            error!(resource = %id, error = %e, "state propagation failed");
        }
    }
    info!("notifier stopped");
}

impl SchedulerHandle {
    /// Push the current state of `id` into every consumer that depends on it.
    ///
    /// Consumers whose state changes as a result are queued in turn, so
    /// propagation is transitive. Returns the number of consumers updated.
    ///
    /// # Errors
    ///
    /// Store failures while loading the resource or its dependents.
    pub fn propagate(&self, id: ResourceId) -> Result<usize, SchedulerError> {
        let Some(resource) = self.resolve(id)? else {
            debug!(resource = %id, "changed resource no longer exists");
            return Ok(0);
        };
        let observed = resource.state();
        let mut updated = 0;
        for consumer_id in self.store().outgoing(id)? {
            let consumer = match self.resolve(consumer_id) {
                Ok(Some(consumer)) => consumer,
                Ok(None) => {
                    warn!(producer = %id, consumer = %consumer_id, "dependent resource is gone");
                    continue;
                }
                Err(e) => {
                    warn!(producer = %id, consumer = %consumer_id, error = %e, "cannot load dependent resource");
                    continue;
                }
            };
            match consumer.dependency_changed(self, id) {
                Ok(true) => updated += 1,
                Ok(false) => {}
                Err(e) => warn!(producer = %id, consumer = %consumer_id, error = %e, "dependency update failed"),
            }
        }
        resource.mark_notified(self, observed)?;
        debug!(resource = %id, state = %observed, updated, "state propagated");
        Ok(updated)
    }

    /// Propagate every pending change without the notifier thread.
    /// Returns the number of resources processed.
    pub fn propagate_pending(&self) -> usize {
        let mut processed = 0;
        while let Some(id) = self.changed().try_pop() {
            if let Err(e) = self.propagate(id) {
                error!(resource = %id, error = %e, "state propagation failed");
            }
            processed += 1;
        }
        processed
    }
}
