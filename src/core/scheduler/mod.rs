//! Scheduler lifecycle and its background loops.
//!
//! Four dedicated threads share one [`SchedulerHandle`]:
//!
//! - **runner**: starts ready jobs when the readiness signal fires
//! - **notifier**: propagates state changes to dependent jobs
//! - **messenger**: delivers delayed messages, retrying failures
//! - **checker**: periodically looks for running jobs whose process ended
//!
//! Propagation and scheduling run on separate threads so a burst of upstream
//! completions never delays the scan for runnable jobs.

mod checker;
mod handle;
mod messenger;
mod notifier;
mod recovery;
mod runner;
mod signal;

use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Sender};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::core::error::SchedulerError;

pub use handle::{Collaborators, ListenerId, SchedulerHandle};
pub use recovery::RecoveryReport;

/// A started scheduler: the handle plus its background threads.
pub struct Scheduler {
    handle: SchedulerHandle,
    threads: Mutex<Vec<JoinHandle<()>>>,
    checker_stop: Mutex<Option<Sender<()>>>,
    recovery: RecoveryReport,
}

fn spawn_named(name: &str, body: impl FnOnce() + Send + 'static) -> Result<JoinHandle<()>, SchedulerError> {
    thread::Builder::new()
        .name(name.to_string())
        .spawn(body)
        .map_err(SchedulerError::Spawn)
}

impl Scheduler {
    /// Recover persisted state, then start the background loops.
    ///
    /// # Errors
    ///
    /// Recovery failures, or `Spawn` when a thread cannot be created (the
    /// threads already started are stopped again).
    pub fn start(handle: SchedulerHandle) -> Result<Self, SchedulerError> {
        let recovery = handle.recover()?;
        let (stop_tx, stop_rx) = bounded::<()>(0);
        let scheduler = Self {
            handle: handle.clone(),
            threads: Mutex::new(Vec::with_capacity(4)),
            checker_stop: Mutex::new(Some(stop_tx)),
            recovery,
        };

        let runner = handle.clone();
        let notifier = handle.clone();
        let messenger = handle.clone();
        let checker = handle;
        let bodies: Vec<(&str, Box<dyn FnOnce() + Send>)> = vec![
            ("xpm-runner", Box::new(move || runner::runner_loop(&runner))),
            ("xpm-notifier", Box::new(move || notifier::notifier_loop(&notifier))),
            ("xpm-messenger", Box::new(move || messenger::messenger_loop(&messenger))),
            ("xpm-checker", Box::new(move || checker::checker_loop(&checker, &stop_rx))),
        ];
        for (name, body) in bodies {
            match spawn_named(name, body) {
                Ok(thread) => scheduler.threads.lock().push(thread),
                Err(e) => {
                    scheduler.shutdown();
                    return Err(e);
                }
            }
        }

        // Recovery may have left ready jobs and queued changes behind.
        scheduler.handle.notify_runners();
        info!(owner = %scheduler.handle.owner(), "scheduler started");
        Ok(scheduler)
    }

    /// Handle shared with the loops.
    #[must_use]
    pub const fn handle(&self) -> &SchedulerHandle {
        &self.handle
    }

    /// What recovery found at start.
    #[must_use]
    pub const fn recovery(&self) -> RecoveryReport {
        self.recovery
    }

    /// Stop every loop and wait for the threads to exit.
    pub fn shutdown(&self) {
        if self.handle.begin_shutdown() {
            info!("shutting down scheduler");
        }
        self.checker_stop.lock().take();
        let threads: Vec<_> = self.threads.lock().drain(..).collect();
        for thread in threads {
            let name = thread.thread().name().unwrap_or("xpm").to_string();
            if thread.join().is_err() {
                warn!(thread = %name, "scheduler thread panicked");
            } else {
                debug!(thread = %name, "scheduler thread joined");
            }
        }
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        // Signal only; joining here could block a dropping caller.
        if self.handle.begin_shutdown() {
            debug!("scheduler dropped without explicit shutdown; threads detached");
        }
        self.checker_stop.lock().take();
    }
}
