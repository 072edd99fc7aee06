//! Crash recovery performed before the loops start.

use serde::{Deserialize, Serialize};
use tracing::{error, info};

use super::SchedulerHandle;
use crate::core::error::SchedulerError;
use crate::core::state::ResourceState;
use crate::core::token::is_token_record;

/// What [`SchedulerHandle::recover`] found and fixed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecoveryReport {
    /// Jobs found running.
    pub running: usize,
    /// Running jobs whose process was lost and that were ended.
    pub ended: usize,
    /// Token resources whose count was corrected.
    pub tokens_corrected: usize,
    /// Resources whose last change had not reached its dependents.
    pub requeued: usize,
}

impl SchedulerHandle {
    /// Reconcile persisted state with the world after a restart.
    ///
    /// Must run before the loops start: token counts are rebuilt from the
    /// locks recorded by jobs.
    ///
    /// # Errors
    ///
    /// Store failures while listing resources.
    pub fn recover(&self) -> Result<RecoveryReport, SchedulerError> {
        let mut report = RecoveryReport::default();

        let running = self
            .store()
            .find(&|record| record.state == ResourceState::Running && record.is_job())?;
        for id in running {
            report.running += 1;
            let Some(job) = self.resolve(id)? else {
                continue;
            };
            if let Err(e) = job.recover_process(self) {
                error!(job = %id, error = %e, "cannot recover running job");
            }
            if job.state() != ResourceState::Running {
                report.ended += 1;
            }
        }

        for id in self.store().find(&|record| is_token_record(&record.kind))? {
            if let Some(token) = self.resolve(id)? {
                if token.recount_tokens(self)? {
                    report.tokens_corrected += 1;
                }
            }
        }

        for id in self
            .store()
            .find(&|record| record.state != record.notified_state)?
        {
            self.mark_changed(id);
            report.requeued += 1;
        }

        info!(
            running = report.running,
            ended = report.ended,
            tokens_corrected = report.tokens_corrected,
            requeued = report.requeued,
            "recovery complete"
        );
        Ok(report)
    }
}
