//! Persistent records and the identity-mapped store collaborator.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::dependency::DependencyKind;
use super::error::StoreError;
use super::ids::{Locator, ResourceId};
use super::lock::Lock;
use super::resource::Resource;
use super::state::{DependencyStatus, ResourceState};

/// Durable snapshot of a resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    /// Id, absent until the first save.
    pub id: Option<ResourceId>,
    /// Unique locator.
    pub locator: Locator,
    /// Current state.
    pub state: ResourceState,
    /// Last state whose effects reached every dependent.
    pub notified_state: ResourceState,
    /// Variant data.
    pub kind: KindRecord,
}

impl ResourceRecord {
    /// Job part, if this is a job.
    #[must_use]
    pub const fn job(&self) -> Option<&JobRecord> {
        match &self.kind {
            KindRecord::Job(job) => Some(job),
            _ => None,
        }
    }

    /// Whether the resource is a job.
    #[must_use]
    pub const fn is_job(&self) -> bool {
        matches!(self.kind, KindRecord::Job(_))
    }

    /// Producers this resource depends on.
    pub fn producers(&self) -> impl Iterator<Item = ResourceId> + '_ {
        self.job()
            .into_iter()
            .flat_map(|job| job.dependencies.iter().map(|dep| dep.from))
    }
}

/// Variant data of a record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KindRecord {
    /// Plain data resource.
    Data,
    /// Runnable job.
    Job(JobRecord),
    /// Counting semaphore.
    Token {
        /// Capacity.
        limit: u32,
        /// Tokens currently taken.
        used: u32,
    },
}

/// Durable part of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Higher runs first.
    pub priority: i32,
    /// Submission time, tie-breaker between equal priorities.
    pub timestamp_ms: u64,
    /// Dependencies not yet satisfied.
    pub nb_unsatisfied: u32,
    /// Dependencies putting the job on hold.
    pub nb_holding: u32,
    /// Start of the last run.
    pub start_ms: Option<u64>,
    /// End of the last run.
    pub end_ms: Option<u64>,
    /// Explicitly held by `stop`.
    pub held: bool,
    /// Process of the current run.
    pub pid: Option<u32>,
    /// Locks the job holds on itself.
    pub locks: Vec<Lock>,
    /// Declared dependencies, in locking order.
    pub dependencies: Vec<DependencyRecord>,
}

/// Durable form of a dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyRecord {
    /// Producer.
    pub from: ResourceId,
    /// Protocol variant.
    pub kind: DependencyKind,
    /// Last computed status.
    pub status: DependencyStatus,
    /// Held lock.
    pub lock: Option<Lock>,
}

/// Record predicate used by [`PersistentStore::find`].
pub type RecordFilter<'a> = &'a dyn Fn(&ResourceRecord) -> bool;

/// Identity-mapped durable storage of resources.
///
/// While any caller holds a resource, `get` returns that same instance.
pub trait PersistentStore: Send + Sync {
    /// Live instance of a resource.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn get(&self, id: ResourceId) -> Result<Option<Arc<Resource>>, StoreError>;

    /// Id of the resource using `locator`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn find_by_locator(&self, locator: &Locator) -> Result<Option<ResourceId>, StoreError>;

    /// Persist a snapshot of `resource`.
    ///
    /// An insert (`is_update == false`) assigns the id, rejects a duplicate
    /// locator and makes `resource` the live instance for that id.
    ///
    /// # Errors
    ///
    /// `AlreadyExists` on a duplicate insert, `Unsaved` on an update without id.
    fn save(&self, resource: &Arc<Resource>, record: ResourceRecord, is_update: bool) -> Result<ResourceId, StoreError>;

    /// Store `record` under the existing `id` and make `resource` its live
    /// instance in place of the previous one. The locator must not change.
    ///
    /// # Errors
    ///
    /// `NotFound` when there is no such record, `AlreadyExists` when the
    /// locator differs.
    fn replace(&self, id: ResourceId, resource: &Arc<Resource>, record: ResourceRecord) -> Result<(), StoreError>;

    /// Remove a resource.
    ///
    /// # Errors
    ///
    /// `NotFound` when there is no such record.
    fn delete(&self, id: ResourceId) -> Result<(), StoreError>;

    /// Ids of the records matching `filter`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn find(&self, filter: RecordFilter<'_>) -> Result<Vec<ResourceId>, StoreError>;

    /// Latest saved snapshot.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn record(&self, id: ResourceId) -> Result<Option<ResourceRecord>, StoreError>;

    /// Consumers holding a dependency on `producer`.
    ///
    /// # Errors
    ///
    /// Backend failures.
    fn outgoing(&self, producer: ResourceId) -> Result<Vec<ResourceId>, StoreError>;
}
