//! Job state machine: readiness accounting, run, completion and stop.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use super::dependency::{Dependency, DependencyKind};
use super::error::{SchedulerError, StoreError};
use super::ids::{OwnerId, ResourceId};
use super::lock::{Lock, LockMode};
use super::message::Message;
use super::process::ProcessHandle;
use super::resource::{EntityGuard, Resource, ResourceKind};
use super::scheduler::SchedulerHandle;
use super::state::{DependencyStatus, ResourceState};
use super::store::JobRecord;
use crate::util::now_ms;

/// Result of an attempt to start a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    /// Locks acquired and process started.
    Started {
        /// Process id.
        pid: u32,
    },
    /// A completion marker already exists; the job was finished instead.
    AlreadyDone,
    /// The job is not ready any more.
    NotReady,
    /// A token dependency cannot be admitted right now.
    TokensUnavailable,
}

pub(crate) struct JobData {
    pub(crate) priority: i32,
    pub(crate) timestamp_ms: u64,
    pub(crate) nb_unsatisfied: u32,
    pub(crate) nb_holding: u32,
    pub(crate) start_ms: Option<u64>,
    pub(crate) end_ms: Option<u64>,
    pub(crate) held: bool,
    pub(crate) pid: Option<u32>,
    pub(crate) locks: Vec<Lock>,
    pub(crate) dependencies: Vec<Dependency>,
    pub(crate) process: Option<Arc<dyn ProcessHandle>>,
    pub(crate) end_requested: bool,
}

impl JobData {
    pub(crate) fn new(priority: i32) -> Self {
        Self {
            priority,
            timestamp_ms: now_ms(),
            nb_unsatisfied: 0,
            nb_holding: 0,
            start_ms: None,
            end_ms: None,
            held: false,
            pid: None,
            locks: Vec::new(),
            dependencies: Vec::new(),
            process: None,
            end_requested: false,
        }
    }

    pub(crate) fn from_record(record: JobRecord, id: Option<ResourceId>) -> Self {
        Self {
            priority: record.priority,
            timestamp_ms: record.timestamp_ms,
            nb_unsatisfied: record.nb_unsatisfied,
            nb_holding: record.nb_holding,
            start_ms: record.start_ms,
            end_ms: record.end_ms,
            held: record.held,
            pid: record.pid,
            locks: record.locks,
            dependencies: record
                .dependencies
                .into_iter()
                .map(|dep| Dependency::from_record(dep, id))
                .collect(),
            process: None,
            end_requested: false,
        }
    }

    pub(crate) fn to_record(&self) -> JobRecord {
        JobRecord {
            priority: self.priority,
            timestamp_ms: self.timestamp_ms,
            nb_unsatisfied: self.nb_unsatisfied,
            nb_holding: self.nb_holding,
            start_ms: self.start_ms,
            end_ms: self.end_ms,
            held: self.held,
            pid: self.pid,
            locks: self.locks.clone(),
            dependencies: self.dependencies.iter().map(Dependency::to_record).collect(),
        }
    }

    fn count(&self) -> (u32, u32) {
        let mut unsatisfied = 0;
        let mut holding = 0;
        for dependency in &self.dependencies {
            let status = dependency.status();
            if !status.is_ok() {
                unsatisfied += 1;
            }
            if status.is_blocking() {
                holding += 1;
            }
        }
        (unsatisfied, holding)
    }

    fn target_state(&self) -> ResourceState {
        if self.held || self.nb_holding > 0 {
            ResourceState::OnHold
        } else if self.nb_unsatisfied == 0 {
            ResourceState::Ready
        } else {
            ResourceState::Waiting
        }
    }
}

/// Undo a partial run: release acquired dependency locks, newest first,
/// then the ownership lock.
fn rollback(handle: &SchedulerHandle, dependencies: &mut [Dependency], acquired: &[usize], ownership: &Lock) {
    for &index in acquired.iter().rev() {
        let dependency = &mut dependencies[index];
        match dependency.undo_lock(handle) {
            // Another job may have seen the short-lived holder and gone back to waiting.
            Ok(()) if dependency.kind() == DependencyKind::Exclusive => handle.mark_changed(dependency.from()),
            Ok(()) => {}
            Err(e) => error!(producer = %dependency.from(), error = %e, "cannot release dependency lock during rollback"),
        }
    }
    if let Err(e) = ownership.release(handle) {
        error!(error = %e, "cannot release job ownership lock during rollback");
    }
}

/// Move a counter by one when a dependency enters or leaves the counted set.
const fn adjust(count: &mut u32, was_counted: bool, is_counted: bool) {
    match (was_counted, is_counted) {
        (false, true) => *count += 1,
        (true, false) => *count = count.saturating_sub(1),
        _ => {}
    }
}

impl EntityGuard<'_> {
    fn job_mut(&mut self) -> Result<&mut JobData, SchedulerError> {
        match &mut self.inner.kind {
            ResourceKind::Job(job) => Ok(job),
            _ => Err(SchedulerError::WrongKind {
                locator: self.resource.locator().clone(),
                expected: "job",
            }),
        }
    }

    fn expect_job(&mut self) -> Result<(), SchedulerError> {
        self.job_mut().map(|_| ())
    }

    /// Reattach the process of a run started before this instance was loaded.
    fn check_process(&mut self) -> Result<(), SchedulerError> {
        let handle = self.handle;
        let job = self.job_mut()?;
        if job.process.is_none() {
            if let Some(pid) = job.pid {
                job.process = handle.launcher().reattach(pid);
            }
        }
        Ok(())
    }

    fn process_running(&self) -> Option<bool> {
        self.inner.job().and_then(|job| job.process.as_ref()).map(|p| p.is_running())
    }

    fn request_end_of_job(&mut self, code: i32) -> Result<(), SchedulerError> {
        let job = self.job_mut()?;
        if job.end_requested {
            return Ok(());
        }
        job.end_requested = true;
        self.effects.deliveries.push(Message::EndOfJob {
            code,
            timestamp_ms: now_ms(),
        });
        Ok(())
    }

    pub(crate) fn job_update_status(&mut self) -> Result<(), SchedulerError> {
        let handle = self.handle;
        let locator = self.locator();
        self.check_process()?;
        let code = handle.markers().exit_code(&locator).map_err(SchedulerError::Markers)?;
        let owned = handle.registry().reconcile(&locator.ownership_key())?.exclusive > 0;
        let running = self.process_running();
        let state = self.inner.state;

        if running == Some(true) {
            if state != ResourceState::Running {
                error!(locator = %locator, state = %state, "process alive but job not running; forcing running");
                self.set_state(ResourceState::Running);
            }
            return Ok(());
        }

        if let Some(code) = code {
            let target = if code == 0 { ResourceState::Done } else { ResourceState::Error };
            let job = self.job_mut()?;
            let in_flight = job.process.is_some() || job.pid.is_some() || !job.locks.is_empty();
            if state == ResourceState::Running || in_flight {
                self.complete_run(code, now_ms())?;
            } else if state != target {
                self.set_state(target);
            }
            return Ok(());
        }

        if state == ResourceState::Running {
            let job = self.job_mut()?;
            let exit = match (&job.process, job.pid) {
                (Some(process), _) => Some(process.exit_value().unwrap_or(-1)),
                (None, Some(pid)) => {
                    warn!(locator = %locator, pid, "process of running job is gone");
                    Some(-1)
                }
                (None, None) => None,
            };
            match exit {
                Some(code) => self.request_end_of_job(code)?,
                None if owned => {}
                None => {
                    error!(locator = %locator, "running job has no process; putting it on hold");
                    self.set_state(ResourceState::OnHold);
                }
            }
            return Ok(());
        }

        if owned {
            warn!(locator = %locator, "job is locked by another owner; reporting it running");
            self.set_state(ResourceState::Running);
            return Ok(());
        }

        // Only `invalidate` brings a finished job back.
        if state.is_finished() {
            return Ok(());
        }
        if matches!(
            self.inner.state,
            ResourceState::Waiting | ResourceState::Ready | ResourceState::OnHold
        ) {
            self.recount()?;
        }
        Ok(())
    }

    /// Re-evaluate every dependency and derive counts and state from scratch.
    fn recount(&mut self) -> Result<(), SchedulerError> {
        let handle = self.handle;
        let job = self.job_mut()?;
        let mut changed = false;
        for dependency in &mut job.dependencies {
            changed |= dependency.update(handle);
        }
        let (unsatisfied, holding) = job.count();
        if (unsatisfied, holding) != (job.nb_unsatisfied, job.nb_holding) {
            job.nb_unsatisfied = unsatisfied;
            job.nb_holding = holding;
            changed = true;
        }
        if changed {
            self.dirty = true;
        }
        self.apply_counts();
        Ok(())
    }

    fn apply_counts(&mut self) {
        let state = self.inner.state;
        if !matches!(
            state,
            ResourceState::Waiting | ResourceState::Ready | ResourceState::OnHold
        ) {
            return;
        }
        if let Some(target) = self.inner.job().map(JobData::target_state) {
            self.set_state(target);
        }
    }

    pub(crate) fn job_dependency_changed(&mut self, from: ResourceId) -> Result<bool, SchedulerError> {
        let handle = self.handle;
        let locator = self.locator();
        let id = self.inner.id;
        let job = self.job_mut()?;
        let Some(dependency) = job.dependencies.iter_mut().find(|dep| dep.from() == from) else {
            return Err(SchedulerError::Incoherent(format!(
                "{locator} was notified by {from} but does not depend on it"
            )));
        };
        if dependency.status() == DependencyStatus::Unactive {
            return Ok(false);
        }
        let old = dependency.status();
        if !dependency.update(handle) {
            return Ok(false);
        }
        let new = dependency.status();
        adjust(&mut job.nb_unsatisfied, !old.is_ok(), !new.is_ok());
        adjust(&mut job.nb_holding, old.is_blocking(), new.is_blocking());
        if job.nb_holding > job.nb_unsatisfied || job.nb_unsatisfied as usize > job.dependencies.len() {
            warn!(
                locator = %locator,
                unsatisfied = job.nb_unsatisfied,
                holding = job.nb_holding,
                "dependency counts drifted; recounting"
            );
            let (unsatisfied, holding) = job.count();
            job.nb_unsatisfied = unsatisfied;
            job.nb_holding = holding;
        }
        self.dirty = true;
        if let Some(to) = id {
            self.effects.messages.push(Message::DependencyChanged { from, to, old, new });
        }
        debug!(locator = %locator, producer = %from, old = %old, new = %new, "dependency changed");
        self.apply_counts();
        Ok(true)
    }

    /// Acquire every lock and start the process, or change nothing.
    pub(crate) fn job_run(&mut self) -> Result<RunOutcome, SchedulerError> {
        let handle = self.handle;
        let locator = self.locator();
        let id = self.inner.id.ok_or(StoreError::Unsaved)?;
        self.expect_job()?;

        if let Some(code) = handle.markers().exit_code(&locator).map_err(SchedulerError::Markers)? {
            self.finish_from_marker(code)?;
            return Ok(RunOutcome::AlreadyDone);
        }

        let owner = handle.owner().for_job(id);
        let mut ownership = Lock::acquire(handle.registry(), locator.ownership_key(), owner.clone(), LockMode::Exclusive)?;
        let rechecked = match handle.markers().exit_code(&locator) {
            Ok(code) => code,
            Err(e) => {
                rollback(handle, &mut [], &[], &ownership);
                return Err(SchedulerError::Markers(e));
            }
        };
        if let Some(code) = rechecked {
            rollback(handle, &mut [], &[], &ownership);
            self.finish_from_marker(code)?;
            return Ok(RunOutcome::AlreadyDone);
        }

        let job = self.job_mut()?;
        let mut acquired = Vec::with_capacity(job.dependencies.len());
        for index in 0..job.dependencies.len() {
            if job.dependencies[index].has_lock() {
                continue;
            }
            if let Err(e) = job.dependencies[index].lock(handle, &owner) {
                warn!(
                    locator = %locator,
                    producer = %job.dependencies[index].from(),
                    error = %e,
                    "dependency lock failed; releasing partial locks"
                );
                rollback(handle, &mut job.dependencies, &acquired, &ownership);
                return Err(e);
            }
            acquired.push(index);
        }

        let process = match handle.launcher().start(id, &locator) {
            Ok(process) => process,
            Err(e) => {
                rollback(handle, &mut job.dependencies, &acquired, &ownership);
                return Err(e.into());
            }
        };
        let pid = process.pid();
        let process_owner = OwnerId::process(pid);
        for dependency in &mut job.dependencies {
            if let Err(e) = dependency.change_ownership(handle, &process_owner) {
                warn!(locator = %locator, producer = %dependency.from(), error = %e, "cannot hand dependency lock to process");
            }
        }
        if let Err(e) = ownership.change_ownership(handle, process_owner) {
            warn!(locator = %locator, error = %e, "cannot hand job lock to process");
        }
        job.locks.push(ownership);
        job.process = Some(process);
        job.pid = Some(pid);
        job.start_ms = Some(now_ms());
        job.end_ms = None;
        job.end_requested = false;
        self.dirty = true;
        self.set_state(ResourceState::Running);
        info!(locator = %locator, pid, "job started");
        Ok(RunOutcome::Started { pid })
    }

    fn finish_from_marker(&mut self, code: i32) -> Result<(), SchedulerError> {
        let target = if code == 0 { ResourceState::Done } else { ResourceState::Error };
        debug!(locator = %self.locator(), code, "completion marker found");
        self.expect_job()?;
        self.set_state(target);
        Ok(())
    }

    /// Release everything a run holds and settle the final state.
    fn complete_run(&mut self, code: i32, timestamp_ms: u64) -> Result<(), SchedulerError> {
        let handle = self.handle;
        let locator = self.locator();
        if let Err(e) = handle.markers().record_exit(&locator, code) {
            error!(locator = %locator, code, error = %e, "cannot record exit code");
        }
        let job = self.job_mut()?;
        let mut released = Vec::new();
        for dependency in &mut job.dependencies {
            // Jobs waiting on an exclusive holder are only woken through the producer.
            let exclusive = dependency.has_lock() && dependency.kind() == DependencyKind::Exclusive;
            match dependency.unlock(handle) {
                Ok(()) if exclusive => released.push(dependency.from()),
                Ok(()) => {}
                Err(e) => error!(locator = %locator, producer = %dependency.from(), error = %e, "cannot unlock dependency"),
            }
        }
        let mut kept = Vec::new();
        for lock in std::mem::take(&mut job.locks) {
            if let Err(e) = lock.release(handle) {
                error!(locator = %locator, error = %e, "cannot release job lock");
                kept.push(lock);
            }
        }
        job.locks = kept;
        job.process = None;
        job.pid = None;
        job.end_ms = Some(timestamp_ms);
        job.end_requested = false;
        self.dirty = true;
        self.effects.wake_runners = true;
        self.effects.released.extend(released);
        let target = if code == 0 { ResourceState::Done } else { ResourceState::Error };
        self.set_state(target);
        info!(locator = %locator, code, state = %target, "job ended");
        Ok(())
    }

    pub(crate) fn job_end(&mut self, code: i32, timestamp_ms: u64) -> Result<bool, SchedulerError> {
        let state = self.inner.state;
        let job = self.job_mut()?;
        if job.process.is_none() && job.pid.is_none() && state != ResourceState::Running {
            debug!(locator = %self.locator(), "end of job for a job that is not running; ignored");
            return Ok(false);
        }
        self.complete_run(code, timestamp_ms)?;
        Ok(true)
    }
}

impl Resource {
    /// Priority, for jobs.
    pub fn priority(&self) -> Option<i32> {
        self.lock_inner().job().map(|job| job.priority)
    }

    /// Submission timestamp, for jobs.
    pub fn timestamp_ms(&self) -> Option<u64> {
        self.lock_inner().job().map(|job| job.timestamp_ms)
    }

    /// `(nb_unsatisfied, nb_holding)`, for jobs.
    pub fn counts(&self) -> Option<(u32, u32)> {
        self.lock_inner().job().map(|job| (job.nb_unsatisfied, job.nb_holding))
    }

    /// Process id of the current run.
    pub fn pid(&self) -> Option<u32> {
        self.lock_inner().job().and_then(|job| job.pid)
    }

    /// Declared dependencies; empty for non-jobs.
    pub fn dependencies(&self) -> Vec<Dependency> {
        self.lock_inner()
            .job()
            .map(|job| job.dependencies.clone())
            .unwrap_or_default()
    }

    /// Declare a dependency before the job is submitted.
    ///
    /// # Errors
    ///
    /// `WrongKind` for non-jobs, `InvalidState` once the job is saved,
    /// `InvalidDependency` for duplicates.
    pub fn declare(&self, dependency: Dependency) -> Result<(), SchedulerError> {
        let mut inner = self.lock_inner();
        let state = inner.state;
        let saved = inner.id.is_some();
        let ResourceKind::Job(job) = &mut inner.kind else {
            return Err(SchedulerError::WrongKind {
                locator: self.locator().clone(),
                expected: "job",
            });
        };
        if saved {
            return Err(SchedulerError::InvalidState {
                locator: self.locator().clone(),
                state,
            });
        }
        if job.dependencies.iter().any(|dep| dep.from() == dependency.from()) {
            return Err(SchedulerError::InvalidDependency(format!(
                "{} already depends on {}",
                self.locator(),
                dependency.from()
            )));
        }
        job.dependencies.push(dependency);
        Ok(())
    }

    /// Attach a dependency to a saved job and re-evaluate it.
    pub(crate) fn add_dependency(&self, handle: &SchedulerHandle, mut dependency: Dependency) -> Result<(), SchedulerError> {
        self.with_entity(handle, |g| {
            let id = g.inner.id.ok_or(StoreError::Unsaved)?;
            let state = g.inner.state;
            if dependency.from() == id {
                return Err(SchedulerError::InvalidDependency(format!("{} cannot depend on itself", g.locator())));
            }
            if state == ResourceState::Running {
                return Err(SchedulerError::InvalidState {
                    locator: g.locator(),
                    state,
                });
            }
            let locator = g.locator();
            let job = g.job_mut()?;
            if job.dependencies.iter().any(|dep| dep.from() == dependency.from()) {
                return Err(SchedulerError::InvalidDependency(format!(
                    "{locator} already depends on {}",
                    dependency.from()
                )));
            }
            dependency.set_consumer(id);
            job.dependencies.push(dependency);
            g.dirty = true;
            g.recount()
        })
    }

    /// Propagate a producer change into this job's counts and state.
    ///
    /// # Errors
    ///
    /// `Incoherent` when this job does not depend on `from`.
    pub fn dependency_changed(&self, handle: &SchedulerHandle, from: ResourceId) -> Result<bool, SchedulerError> {
        self.with_entity(handle, |g| g.job_dependency_changed(from))
    }

    /// Acquire the job's locks and start its process, all or nothing.
    ///
    /// On a locking failure every lock taken so far is released and the
    /// state is left untouched.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Lock` when a lock is denied, `Process` when the
    /// launcher fails.
    pub fn run(&self, handle: &SchedulerHandle) -> Result<RunOutcome, SchedulerError> {
        self.with_entity(handle, |g| g.job_run())
    }

    /// Runner entry point: re-validate readiness and token admission, then run.
    pub(crate) fn try_start(&self, handle: &SchedulerHandle) -> Result<RunOutcome, SchedulerError> {
        self.with_entity(handle, |g| {
            g.job_update_status()?;
            if g.inner.state != ResourceState::Ready {
                return Ok(RunOutcome::NotReady);
            }
            let locator = g.locator();
            let job = g.job_mut()?;
            for dependency in &job.dependencies {
                if matches!(dependency.kind(), DependencyKind::Token { .. }) && !dependency.can_lock(handle)? {
                    debug!(locator = %locator, token = %dependency.from(), "tokens unavailable");
                    return Ok(RunOutcome::TokensUnavailable);
                }
            }
            g.job_run()
        })
    }

    /// Finish the current run with `code`.
    ///
    /// Returns `false` when the job was not running, so duplicate
    /// notifications are harmless.
    ///
    /// # Errors
    ///
    /// `WrongKind` for non-jobs, store failures.
    pub fn end_of_job(&self, handle: &SchedulerHandle, code: i32, timestamp_ms: u64) -> Result<bool, SchedulerError> {
        self.with_entity(handle, |g| g.job_end(code, timestamp_ms))
    }

    /// Kill a running job, or put a waiting one on hold.
    ///
    /// # Errors
    ///
    /// `Process` when the process cannot be destroyed.
    pub fn stop(&self, handle: &SchedulerHandle) -> Result<bool, SchedulerError> {
        self.with_entity(handle, |g| {
            g.check_process()?;
            match g.inner.state {
                ResourceState::Running => {
                    if let Some(process) = g.job_mut()?.process.clone() {
                        process.destroy()?;
                    }
                    g.complete_run(1, now_ms())?;
                    Ok(true)
                }
                ResourceState::Ready | ResourceState::Waiting => {
                    g.job_mut()?.held = true;
                    g.dirty = true;
                    g.set_state(ResourceState::OnHold);
                    Ok(true)
                }
                _ => Ok(false),
            }
        })
    }

    /// Mark the job failed after an unexpected runner error.
    pub(crate) fn mark_error(&self, handle: &SchedulerHandle) -> Result<(), SchedulerError> {
        self.with_entity(handle, |g| {
            g.expect_job()?;
            g.set_state(ResourceState::Error);
            Ok(())
        })
    }

    /// Check the process of a running job; requests an end-of-job delivery
    /// when it is gone. Returns whether one was requested.
    pub(crate) fn poll_process(&self, handle: &SchedulerHandle) -> Result<bool, SchedulerError> {
        self.with_entity(handle, |g| {
            if g.inner.state != ResourceState::Running {
                return Ok(false);
            }
            g.check_process()?;
            let locator = g.locator();
            let job = g.job_mut()?;
            if job.end_requested {
                return Ok(false);
            }
            let code = match &job.process {
                Some(process) if process.is_running() => return Ok(false),
                Some(process) => process.exit_value().unwrap_or(-1),
                None => handle
                    .markers()
                    .exit_code(&locator)
                    .map_err(SchedulerError::Markers)?
                    .unwrap_or(-1),
            };
            g.request_end_of_job(code)?;
            Ok(true)
        })
    }

    /// After a restart, reattach the process of a running job or end it.
    pub(crate) fn recover_process(&self, handle: &SchedulerHandle) -> Result<(), SchedulerError> {
        self.with_entity(handle, |g| {
            if g.inner.state != ResourceState::Running {
                return Ok(());
            }
            g.check_process()?;
            let locator = g.locator();
            let job = g.job_mut()?;
            if job.process.is_none() {
                error!(locator = %locator, pid = ?job.pid, "cannot reattach process of running job");
                g.complete_run(-1, now_ms())?;
            }
            Ok(())
        })
    }
}
