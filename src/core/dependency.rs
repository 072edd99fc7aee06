//! Dependency edges and their satisfaction protocol.
//!
//! A dependency is owned by its consumer and only mutated inside the
//! consumer's critical section. Evaluating it reads the producer's state,
//! so the lock order is always consumer then producer.

use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::error::{LockError, SchedulerError};
use super::ids::{OwnerId, ResourceId};
use super::lock::{Lock, LockMode};
use super::resource::Resource;
use super::scheduler::SchedulerHandle;
use super::state::{DependencyStatus, ResourceState};
use super::store::DependencyRecord;

/// Access requested by a read-write dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Shared access.
    Read,
    /// Single-writer access.
    Write,
}

impl From<AccessMode> for LockMode {
    fn from(mode: AccessMode) -> Self {
        match mode {
            AccessMode::Read => Self::Read,
            AccessMode::Write => Self::Write,
        }
    }
}

/// Protocol variant of a dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DependencyKind {
    /// One consumer at a time holds the producer.
    Exclusive,
    /// Readers share the producer, a writer holds it alone.
    ReadWrite {
        /// Requested access.
        mode: AccessMode,
    },
    /// Takes tokens from a token resource.
    Token {
        /// Number of tokens needed.
        tokens: u32,
    },
}

/// Directed edge from a producer to the job that consumes it.
#[derive(Debug, Clone)]
pub struct Dependency {
    from: ResourceId,
    to: Option<ResourceId>,
    kind: DependencyKind,
    status: DependencyStatus,
    lock: Option<Lock>,
}

impl PartialEq for Dependency {
    fn eq(&self, other: &Self) -> bool {
        self.from == other.from && self.to == other.to
    }
}

impl Eq for Dependency {}

impl Dependency {
    /// New dependency on `from`, not evaluated yet.
    #[must_use]
    pub const fn new(from: ResourceId, kind: DependencyKind) -> Self {
        Self {
            from,
            to: None,
            kind,
            status: DependencyStatus::Wait,
            lock: None,
        }
    }

    /// Exclusive dependency on `from`.
    #[must_use]
    pub const fn exclusive(from: ResourceId) -> Self {
        Self::new(from, DependencyKind::Exclusive)
    }

    /// Shared read dependency on `from`.
    #[must_use]
    pub const fn read(from: ResourceId) -> Self {
        Self::new(from, DependencyKind::ReadWrite { mode: AccessMode::Read })
    }

    /// Write dependency on `from`.
    #[must_use]
    pub const fn write(from: ResourceId) -> Self {
        Self::new(from, DependencyKind::ReadWrite { mode: AccessMode::Write })
    }

    /// Dependency taking `tokens` from the token resource `from`.
    #[must_use]
    pub const fn tokens(from: ResourceId, tokens: u32) -> Self {
        Self::new(from, DependencyKind::Token { tokens })
    }

    /// Producer.
    #[must_use]
    pub const fn from(&self) -> ResourceId {
        self.from
    }

    /// Consumer, once attached to a saved job.
    #[must_use]
    pub const fn to(&self) -> Option<ResourceId> {
        self.to
    }

    /// Protocol variant.
    #[must_use]
    pub const fn kind(&self) -> DependencyKind {
        self.kind
    }

    /// Last computed status.
    #[must_use]
    pub const fn status(&self) -> DependencyStatus {
        self.status
    }

    /// Whether a lock is held.
    #[must_use]
    pub const fn has_lock(&self) -> bool {
        self.lock.is_some()
    }

    /// Held lock.
    #[must_use]
    pub const fn lock_handle(&self) -> Option<&Lock> {
        self.lock.as_ref()
    }

    pub(crate) const fn set_consumer(&mut self, to: ResourceId) {
        self.to = Some(to);
    }

    /// Evaluate the dependency against the producer's current state.
    ///
    /// A producer that is not done never satisfies the dependency, whatever
    /// the variant.
    pub fn accept(&self, handle: &SchedulerHandle) -> DependencyStatus {
        let producer = match handle.resolve(self.from) {
            Ok(Some(producer)) => producer,
            Ok(None) => {
                error!(producer = %self.from, consumer = ?self.to, "dependency on a missing resource");
                return DependencyStatus::Error;
            }
            Err(e) => {
                error!(producer = %self.from, error = %e, "cannot load dependency producer");
                return DependencyStatus::Error;
            }
        };
        match producer.state() {
            ResourceState::Error | ResourceState::OnHold => DependencyStatus::Hold,
            ResourceState::Done => self.accept_done(handle, &producer),
            _ => DependencyStatus::Wait,
        }
    }

    fn accept_done(&self, handle: &SchedulerHandle, producer: &Resource) -> DependencyStatus {
        match self.kind {
            DependencyKind::Exclusive => match handle.registry().reconcile(producer.locator()) {
                Ok(counts) if counts.exclusive == 0 => DependencyStatus::OkLock,
                Ok(_) => DependencyStatus::Wait,
                Err(e) => {
                    warn!(producer = %self.from, error = %e, "cannot read exclusive lock state");
                    DependencyStatus::Wait
                }
            },
            // Conflicts between readers and writers surface at lock time.
            DependencyKind::ReadWrite { .. } | DependencyKind::Token { .. } => DependencyStatus::OkLock,
        }
    }

    /// Recompute the status; returns whether it changed.
    ///
    /// A dependency that holds its lock keeps its status until unlocked.
    pub fn update(&mut self, handle: &SchedulerHandle) -> bool {
        if self.lock.is_some() {
            return false;
        }
        let old = self.status;
        self.status = self.accept(handle);
        self.status != old
    }

    /// Token admission check, consulted before a job is started.
    ///
    /// # Errors
    ///
    /// Store failures while loading the token resource.
    pub fn can_lock(&self, handle: &SchedulerHandle) -> Result<bool, SchedulerError> {
        match self.kind {
            DependencyKind::Token { tokens } => {
                let token = handle.resolve(self.from)?.ok_or(SchedulerError::NotFound(self.from))?;
                token.can_take_tokens(tokens)
            }
            _ => Ok(true),
        }
    }

    /// Take the variant lock on the producer for `owner`.
    ///
    /// Holding the lock already is a success.
    ///
    /// # Errors
    ///
    /// `SchedulerError::Lock` when the lock cannot be granted right now.
    pub fn lock(&mut self, handle: &SchedulerHandle, owner: &OwnerId) -> Result<(), SchedulerError> {
        if self.lock.is_some() {
            return Ok(());
        }
        let producer = handle
            .resolve(self.from)?
            .ok_or_else(|| LockError::Incoherent(format!("producer {} is gone", self.from)))?;
        let lock = match self.kind {
            DependencyKind::Exclusive => Lock::acquire(
                handle.registry(),
                producer.locator().clone(),
                owner.clone(),
                LockMode::Exclusive,
            )?,
            DependencyKind::ReadWrite { mode } => {
                Lock::acquire(handle.registry(), producer.locator().clone(), owner.clone(), mode.into())?
            }
            DependencyKind::Token { tokens } => {
                producer.take_tokens(handle, tokens)?;
                Lock::Tokens {
                    token: self.from,
                    tokens,
                    owner: owner.clone(),
                }
            }
        };
        debug!(producer = %self.from, consumer = ?self.to, "dependency locked");
        self.lock = Some(lock);
        self.status = DependencyStatus::OkLock;
        Ok(())
    }

    /// Release the held lock and retire the dependency.
    ///
    /// # Errors
    ///
    /// The lock is kept when it cannot be released.
    pub fn unlock(&mut self, handle: &SchedulerHandle) -> Result<(), SchedulerError> {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.release(handle) {
                self.lock = Some(lock);
                return Err(e);
            }
        }
        self.status = DependencyStatus::Unactive;
        Ok(())
    }

    /// Give the held lock back without touching the status, undoing a
    /// partial acquisition.
    pub(crate) fn undo_lock(&mut self, handle: &SchedulerHandle) -> Result<(), SchedulerError> {
        if let Some(lock) = self.lock.take() {
            if let Err(e) = lock.undo(handle) {
                self.lock = Some(lock);
                return Err(e);
            }
        }
        Ok(())
    }

    pub(crate) fn change_ownership(&mut self, handle: &SchedulerHandle, owner: &OwnerId) -> Result<(), LockError> {
        match self.lock.as_mut() {
            Some(lock) => lock.change_ownership(handle, owner.clone()),
            None => Ok(()),
        }
    }

    pub(crate) fn to_record(&self) -> DependencyRecord {
        DependencyRecord {
            from: self.from,
            kind: self.kind,
            status: self.status,
            lock: self.lock.clone(),
        }
    }

    pub(crate) fn from_record(record: DependencyRecord, to: Option<ResourceId>) -> Self {
        Self {
            from: record.from,
            to,
            kind: record.kind,
            status: record.status,
            lock: record.lock,
        }
    }
}
