//! Simulated processes for tests and embedding.
//!
//! The launcher hands out pids from a counter; a process runs until
//! [`InMemoryLauncher::finish`] or `destroy` gives it an exit code.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::core::error::ProcessError;
use crate::core::ids::{Locator, ResourceId};
use crate::core::process::{ProcessHandle, ProcessLauncher};

/// Exit code of a destroyed process.
pub const DESTROYED_EXIT: i32 = 143;

#[derive(Debug, Default)]
struct ProcessState {
    exit: Option<i32>,
    progress: f64,
}

/// A process that exists only in memory.
#[derive(Debug)]
pub struct SimulatedProcess {
    pid: u32,
    job: ResourceId,
    state: Mutex<ProcessState>,
}

impl SimulatedProcess {
    /// Job this process runs.
    #[must_use]
    pub const fn job(&self) -> ResourceId {
        self.job
    }

    /// End the process with `code`. An ended process keeps its first code.
    pub fn finish(&self, code: i32) -> bool {
        let mut state = self.state.lock();
        if state.exit.is_some() {
            return false;
        }
        state.exit = Some(code);
        true
    }

    /// Report progress.
    pub fn set_progress(&self, progress: f64) {
        self.state.lock().progress = progress.clamp(0.0, 1.0);
    }
}

impl ProcessHandle for SimulatedProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn is_running(&self) -> bool {
        self.state.lock().exit.is_none()
    }

    fn exit_value(&self) -> Option<i32> {
        self.state.lock().exit
    }

    fn destroy(&self) -> Result<(), ProcessError> {
        self.finish(DESTROYED_EXIT);
        Ok(())
    }

    fn progress(&self) -> f64 {
        self.state.lock().progress
    }
}

#[derive(Debug)]
struct LauncherState {
    next_pid: u32,
    processes: HashMap<u32, Arc<SimulatedProcess>>,
    by_job: HashMap<ResourceId, u32>,
    started: Vec<ResourceId>,
    fail_next: bool,
}

/// Launcher of [`SimulatedProcess`]es.
#[derive(Debug)]
pub struct InMemoryLauncher {
    state: Mutex<LauncherState>,
}

impl Default for InMemoryLauncher {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLauncher {
    /// Launcher whose first pid is 1000.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LauncherState {
                next_pid: 1000,
                processes: HashMap::new(),
                by_job: HashMap::new(),
                started: Vec::new(),
                fail_next: false,
            }),
        }
    }

    /// End process `pid` with `code`. Returns false for an unknown or ended process.
    pub fn finish(&self, pid: u32, code: i32) -> bool {
        let process = self.state.lock().processes.get(&pid).cloned();
        process.is_some_and(|process| process.finish(code))
    }

    /// Latest process started for `job`.
    pub fn process_for(&self, job: ResourceId) -> Option<Arc<SimulatedProcess>> {
        let state = self.state.lock();
        state.by_job.get(&job).and_then(|pid| state.processes.get(pid)).cloned()
    }

    /// Jobs started so far, in start order.
    pub fn started(&self) -> Vec<ResourceId> {
        self.state.lock().started.clone()
    }

    /// Processes still running.
    pub fn running(&self) -> usize {
        self.state
            .lock()
            .processes
            .values()
            .filter(|process| process.is_running())
            .count()
    }

    /// Make the next `start` fail.
    pub fn fail_next_start(&self) {
        self.state.lock().fail_next = true;
    }
}

impl ProcessLauncher for InMemoryLauncher {
    fn start(&self, id: ResourceId, locator: &Locator) -> Result<Arc<dyn ProcessHandle>, ProcessError> {
        let mut state = self.state.lock();
        if std::mem::take(&mut state.fail_next) {
            return Err(ProcessError::Launch(format!("simulated launch failure for {locator}")));
        }
        let pid = state.next_pid;
        state.next_pid += 1;
        let process = Arc::new(SimulatedProcess {
            pid,
            job: id,
            state: Mutex::new(ProcessState::default()),
        });
        state.processes.insert(pid, Arc::clone(&process));
        state.by_job.insert(id, pid);
        state.started.push(id);
        debug!(job = %id, locator = %locator, pid, "simulated process started");
        Ok(process)
    }

    fn reattach(&self, pid: u32) -> Option<Arc<dyn ProcessHandle>> {
        let process = self.state.lock().processes.get(&pid).cloned()?;
        Some(process)
    }
}
