//! Events emitted by resources and the delayed packages that carry them.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

use super::ids::{Locator, ResourceId};
use super::state::{DependencyStatus, ResourceState};

/// Event observed by the scheduler and forwarded to listeners.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum Message {
    /// A resource was registered.
    ResourceAdded {
        /// New id.
        id: ResourceId,
        /// Its locator.
        locator: Locator,
    },
    /// A resource was deleted.
    ResourceRemoved {
        /// Former id.
        id: ResourceId,
        /// Its locator.
        locator: Locator,
    },
    /// A resource changed state.
    StateChanged {
        /// Resource id, absent before the first save.
        id: Option<ResourceId>,
        /// Its locator.
        locator: Locator,
        /// Previous state.
        from: ResourceState,
        /// New state.
        to: ResourceState,
    },
    /// The process of a job ended.
    EndOfJob {
        /// Exit code.
        code: i32,
        /// End time in milliseconds since the epoch.
        timestamp_ms: u64,
    },
    /// The status of a dependency was recomputed.
    DependencyChanged {
        /// Producer.
        from: ResourceId,
        /// Consumer.
        to: ResourceId,
        /// Previous status.
        old: DependencyStatus,
        /// New status.
        new: DependencyStatus,
    },
    /// Progress reported by a running job.
    Progress {
        /// Job id.
        id: ResourceId,
        /// Fraction in `[0, 1]`.
        progress: f64,
    },
}

impl Message {
    /// Stable name of the event, as used in the serialized tag.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ResourceAdded { .. } => "resource_added",
            Self::ResourceRemoved { .. } => "resource_removed",
            Self::StateChanged { .. } => "state_changed",
            Self::EndOfJob { .. } => "end_of_job",
            Self::DependencyChanged { .. } => "dependency_changed",
            Self::Progress { .. } => "progress",
        }
    }
}

/// A message waiting in the messenger until its delivery time.
///
/// Ordering is reversed so a `BinaryHeap` pops the earliest delivery first;
/// the sequence number keeps insertion order among equal timestamps.
#[derive(Debug, Clone)]
pub struct MessagePackage {
    /// Payload.
    pub message: Message,
    /// Resource that receives it.
    pub destination: ResourceId,
    /// Earliest delivery time in milliseconds since the epoch.
    pub timestamp_ms: u64,
    /// Tie-breaker assigned by the queue.
    pub sequence: u64,
}

impl PartialEq for MessagePackage {
    fn eq(&self, other: &Self) -> bool {
        self.timestamp_ms == other.timestamp_ms && self.sequence == other.sequence
    }
}

impl Eq for MessagePackage {}

impl Ord for MessagePackage {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .timestamp_ms
            .cmp(&self.timestamp_ms)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}

impl PartialOrd for MessagePackage {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Receives every message emitted by the scheduler.
///
/// Called on the emitting thread after the emitting resource's critical
/// section is released; implementations must not block for long.
pub trait Listener: Send + Sync {
    /// Handle one message.
    fn notify(&self, message: &Message);
}
