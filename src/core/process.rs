//! Process abstraction and completion markers consumed by jobs.
//!
//! Launching real processes is left to the embedding application; the core
//! only starts, polls and destroys them through these traits.

use std::fmt::Debug;
use std::io;
use std::sync::Arc;

use super::error::ProcessError;
use super::ids::{Locator, ResourceId};

/// A started process.
pub trait ProcessHandle: Send + Sync + Debug {
    /// OS (or launcher-specific) process id.
    fn pid(&self) -> u32;
    /// Whether the process is still alive.
    fn is_running(&self) -> bool;
    /// Exit code once the process ended.
    fn exit_value(&self) -> Option<i32>;
    /// Ask the process to terminate.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::Stop` when the process cannot be signalled.
    fn destroy(&self) -> Result<(), ProcessError>;
    /// Reported progress in `[0, 1]`.
    fn progress(&self) -> f64;
}

/// Starts job processes and reattaches to running ones after a restart.
pub trait ProcessLauncher: Send + Sync {
    /// Start the process of a job.
    ///
    /// # Errors
    ///
    /// Returns `ProcessError::Launch` when the process cannot be started.
    fn start(&self, id: ResourceId, locator: &Locator) -> Result<Arc<dyn ProcessHandle>, ProcessError>;

    /// Find a process started earlier, if it still exists.
    fn reattach(&self, pid: u32) -> Option<Arc<dyn ProcessHandle>>;
}

/// Durable done/error sentinels of jobs.
///
/// A recorded exit code means the job finished: `0` is done, anything else is
/// an error.
pub trait JobMarkers: Send + Sync {
    /// Recorded exit code, if any.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the marker cannot be read.
    fn exit_code(&self, locator: &Locator) -> io::Result<Option<i32>>;

    /// Record the exit code of a job.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the marker cannot be written.
    fn record_exit(&self, locator: &Locator, code: i32) -> io::Result<()>;

    /// Forget any recorded exit code.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error when the marker cannot be removed.
    fn clear(&self, locator: &Locator) -> io::Result<()>;
}
