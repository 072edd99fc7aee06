//! Job runner: starts ready jobs whenever the readiness signal fires.

use std::cmp::Reverse;

use tracing::{debug, error, info, warn};

use super::SchedulerHandle;
use crate::core::error::SchedulerError;
use crate::core::ids::ResourceId;
use crate::core::job::RunOutcome;
use crate::core::state::ResourceState;

/// Runner thread body.
pub(crate) fn runner_loop(handle: &SchedulerHandle) {
    info!("job runner started");
    while handle.ready().wait() {
        let started = handle.run_ready_jobs();
        debug!(started, "runner pass complete");
    }
    info!("job runner stopped");
}

impl SchedulerHandle {
    /// Ready jobs, highest priority first, then oldest first.
    fn ready_jobs(&self) -> Result<Vec<ResourceId>, SchedulerError> {
        let store = self.store();
        let ids = store.find(&|record| record.state == ResourceState::Ready && record.is_job())?;
        let mut candidates = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = store.record(id)? {
                if let Some(job) = record.job() {
                    candidates.push((Reverse(job.priority), job.timestamp_ms, id));
                }
            }
        }
        candidates.sort_unstable();
        Ok(candidates.into_iter().map(|(_, _, id)| id).collect())
    }

    /// Try to start every ready job once. Returns how many started.
    ///
    /// A job whose locks are denied stays ready and is retried on the next
    /// wake; any other failure puts it in error.
    pub fn run_ready_jobs(&self) -> usize {
        let ids = match self.ready_jobs() {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "cannot list ready jobs");
                return 0;
            }
        };
        let mut started = 0;
        for id in ids {
            if self.is_stopping() {
                break;
            }
            let job = match self.resolve(id) {
                Ok(Some(job)) => job,
                Ok(None) => continue,
                Err(e) => {
                    error!(job = %id, error = %e, "cannot load ready job");
                    continue;
                }
            };
            match job.try_start(self) {
                Ok(RunOutcome::Started { pid }) => {
                    debug!(job = %id, pid, "runner started job");
                    started += 1;
                }
                Ok(outcome) => debug!(job = %id, outcome = ?outcome, "job not started"),
                Err(SchedulerError::Lock(e)) => {
                    warn!(job = %id, error = %e, "job locks unavailable; will retry");
                    if let Err(e) = job.update_status(self) {
                        error!(job = %id, error = %e, "cannot refresh job after lock failure");
                    }
                }
                Err(e) => {
                    error!(job = %id, error = %e, "job failed to start");
                    if let Err(e) = job.mark_error(self) {
                        error!(job = %id, error = %e, "cannot mark job as failed");
                    }
                }
            }
        }
        started
    }
}
