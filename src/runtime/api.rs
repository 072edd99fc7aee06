//! API-facing query models.

use serde::{Deserialize, Serialize};

use crate::core::ids::{Locator, ResourceId};
use crate::core::scheduler::SchedulerHandle;
use crate::core::state::ResourceState;
use crate::core::store::{KindRecord, ResourceRecord};
use crate::core::SchedulerError;

/// Resource listing entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    /// Resource id.
    pub id: ResourceId,
    /// Locator.
    pub locator: Locator,
    /// `data`, `job` or `token`.
    pub kind: String,
    /// Current state.
    pub state: ResourceState,
    /// Job priority.
    pub priority: Option<i32>,
    /// Job `(unsatisfied, holding)` dependency counts.
    pub counts: Option<(u32, u32)>,
    /// Token `(used, limit)`.
    pub tokens: Option<(u32, u32)>,
}

impl ResourceSnapshot {
    fn from_record(id: ResourceId, record: &ResourceRecord) -> Self {
        let (kind, priority, counts, tokens) = match &record.kind {
            KindRecord::Data => ("data", None, None, None),
            KindRecord::Job(job) => (
                "job",
                Some(job.priority),
                Some((job.nb_unsatisfied, job.nb_holding)),
                None,
            ),
            KindRecord::Token { limit, used } => ("token", None, None, Some((*used, *limit))),
        };
        Self {
            id,
            locator: record.locator.clone(),
            kind: kind.to_string(),
            state: record.state,
            priority,
            counts,
            tokens,
        }
    }
}

/// Health response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Health {
    /// Scheduler accepting work.
    pub ok: bool,
    /// Running jobs.
    pub running: usize,
    /// Ready jobs.
    pub ready: usize,
    /// Waiting resources.
    pub waiting: usize,
    /// Resources whose change is not yet propagated.
    pub pending_changes: usize,
    /// Messages waiting for delivery.
    pub pending_messages: usize,
}

/// Snapshots of resources in `states`; every resource when `states` is empty.
///
/// # Errors
///
/// Store failures.
pub fn list_resources(handle: &SchedulerHandle, states: &[ResourceState]) -> Result<Vec<ResourceSnapshot>, SchedulerError> {
    let store = handle.store();
    let mut snapshots = Vec::new();
    for id in handle.resources(states)? {
        if let Some(record) = store.record(id)? {
            snapshots.push(ResourceSnapshot::from_record(id, &record));
        }
    }
    Ok(snapshots)
}

/// Return a health payload.
///
/// # Errors
///
/// Store failures.
pub fn health(handle: &SchedulerHandle) -> Result<Health, SchedulerError> {
    let count = |state: ResourceState| handle.resources(&[state]).map(|ids| ids.len());
    Ok(Health {
        ok: !handle.is_stopping(),
        running: count(ResourceState::Running)?,
        ready: count(ResourceState::Ready)?,
        waiting: count(ResourceState::Waiting)?,
        pending_changes: handle.pending_changes(),
        pending_messages: handle.pending_messages(),
    })
}
