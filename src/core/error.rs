//! Error types for scheduler operations.

use std::io;

use thiserror::Error;

use super::ids::{Locator, ResourceId};
use super::state::ResourceState;

/// Failures of the lock registry and of dependency locking.
#[derive(Debug, Error)]
pub enum LockError {
    /// The record guard is held by someone else; retry later.
    #[error("lock record busy")]
    WouldBlock,
    /// The lock cannot be granted in its current state.
    #[error("lock denied: {0}")]
    Denied(String),
    /// Registry content contradicts what the caller holds.
    #[error("incoherent lock state: {0}")]
    Incoherent(String),
    /// Backing record could not be read or written.
    #[error("lock record i/o: {0}")]
    Io(#[from] io::Error),
}

/// Failures of the persistent store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The resource has never been saved.
    #[error("resource has not been saved")]
    Unsaved,
    /// Another resource already uses this locator.
    #[error("locator already registered: {0}")]
    AlreadyExists(Locator),
    /// No record for this id.
    #[error("no record for {0}")]
    NotFound(ResourceId),
    /// Journal could not be read or written.
    #[error("store i/o: {0}")]
    Io(#[from] io::Error),
    /// Journal entry could not be encoded or decoded.
    #[error("store serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Failures reported by the process abstraction.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The process could not be started.
    #[error("failed to launch process: {0}")]
    Launch(String),
    /// The process could not be terminated.
    #[error("failed to stop process: {0}")]
    Stop(String),
}

/// Errors produced by scheduler components.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Lock acquisition or release failed.
    #[error(transparent)]
    Lock(#[from] LockError),
    /// Persistence failed.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Process start or stop failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// No resource with this id.
    #[error("resource not found: {0}")]
    NotFound(ResourceId),
    /// Operation requires another kind of resource.
    #[error("{locator} is not a {expected}")]
    WrongKind {
        /// Resource the operation targeted.
        locator: Locator,
        /// Kind the operation needs.
        expected: &'static str,
    },
    /// Dependency rejected at declaration time.
    #[error("invalid dependency: {0}")]
    InvalidDependency(String),
    /// Operation not allowed in the current state.
    #[error("{locator} is {state}")]
    InvalidState {
        /// Resource the operation targeted.
        locator: Locator,
        /// State that refused the operation.
        state: ResourceState,
    },
    /// Internal bookkeeping is inconsistent and cannot be repaired here.
    #[error("incoherent scheduler state: {0}")]
    Incoherent(String),
    /// Configuration rejected by validation.
    #[error("invalid configuration: {0}")]
    Config(String),
    /// Job marker files could not be read or written.
    #[error("job markers: {0}")]
    Markers(#[source] io::Error),
    /// A background thread could not be spawned.
    #[error("failed to spawn scheduler thread: {0}")]
    Spawn(#[source] io::Error),
    /// The scheduler is stopping.
    #[error("scheduler is shutting down")]
    Shutdown,
}

/// Application-facing result using anyhow for higher-level contexts.
pub type AppResult<T> = Result<T, anyhow::Error>;
