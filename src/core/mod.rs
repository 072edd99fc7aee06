//! Core scheduling abstractions: resources, dependencies, locks and loops.

pub mod dependency;
pub mod error;
pub mod ids;
pub mod job;
pub mod lock;
pub mod message;
pub mod process;
pub mod resource;
pub mod scheduler;
pub mod state;
pub mod store;
pub mod token;

pub use dependency::{AccessMode, Dependency, DependencyKind};
pub use error::{AppResult, LockError, ProcessError, SchedulerError, StoreError};
pub use ids::{Locator, OwnerId, ResourceId};
pub use job::RunOutcome;
pub use lock::{Lock, LockCounts, LockMode, LockRegistry};
pub use message::{Listener, Message, MessagePackage};
pub use process::{JobMarkers, ProcessHandle, ProcessLauncher};
pub use resource::Resource;
pub use scheduler::{Collaborators, ListenerId, RecoveryReport, Scheduler, SchedulerHandle};
pub use state::{DependencyStatus, ResourceState};
pub use store::{DependencyRecord, JobRecord, KindRecord, PersistentStore, RecordFilter, ResourceRecord};
