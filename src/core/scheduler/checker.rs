//! Periodic check that running jobs still have a live process.

use std::time::Duration;

use crossbeam_channel::{select, tick, Receiver};
use tracing::{debug, error, info};

use super::SchedulerHandle;
use crate::core::state::ResourceState;

/// Checker thread body; exits when `shutdown` is dropped.
pub(crate) fn checker_loop(handle: &SchedulerHandle, shutdown: &Receiver<()>) {
    let interval = Duration::from_millis(handle.config().job_check_interval_ms);
    info!(interval_ms = handle.config().job_check_interval_ms, "running job checker started");
    let ticker = tick(interval);
    loop {
        select! {
            recv(ticker) -> _ => {
                let requested = handle.check_running_jobs();
                debug!(requested, "running job check complete");
                // Locks held by other schedulers are released without waking us.
                handle.notify_runners();
            }
            recv(shutdown) -> _ => break,
        }
    }
    info!("running job checker stopped");
}

impl SchedulerHandle {
    /// Request an end-of-job delivery for every running job whose process
    /// has ended. Returns how many were requested.
    pub fn check_running_jobs(&self) -> usize {
        let ids = match self
            .store()
            .find(&|record| record.state == ResourceState::Running && record.is_job())
        {
            Ok(ids) => ids,
            Err(e) => {
                error!(error = %e, "cannot list running jobs");
                return 0;
            }
        };
        let mut requested = 0;
        for id in ids {
            let outcome = self
                .resolve(id)
                .and_then(|job| job.map_or(Ok(false), |job| job.poll_process(self)));
            match outcome {
                Ok(true) => requested += 1,
                Ok(false) => {}
                Err(e) => error!(job = %id, error = %e, "cannot check job process"),
            }
        }
        requested
    }
}
