//! Lock modes, the registry collaborator and held lock handles.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::error::{LockError, SchedulerError};
use super::ids::{Locator, OwnerId, ResourceId};
use super::scheduler::SchedulerHandle;

/// How a registry lock is held.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    /// Shared with other readers.
    Read,
    /// Single writer, no readers.
    Write,
    /// Sole holder of any kind.
    Exclusive,
}

impl LockMode {
    /// One-letter code used in registry records.
    #[must_use]
    pub const fn code(self) -> char {
        match self {
            Self::Read => 'r',
            Self::Write => 'w',
            Self::Exclusive => 'x',
        }
    }

    /// Parse a registry record code.
    #[must_use]
    pub const fn from_code(code: char) -> Option<Self> {
        match code {
            'r' => Some(Self::Read),
            'w' => Some(Self::Write),
            'x' => Some(Self::Exclusive),
            _ => None,
        }
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Exclusive => "exclusive",
        };
        f.write_str(name)
    }
}

/// Holder counts of one registry key.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockCounts {
    /// Read holders.
    pub readers: u32,
    /// Write holders.
    pub writers: u32,
    /// Exclusive holders.
    pub exclusive: u32,
}

impl LockCounts {
    /// Count the modes of a holder list.
    pub fn from_modes<'a>(modes: impl IntoIterator<Item = &'a LockMode>) -> Self {
        let mut counts = Self::default();
        for mode in modes {
            counts.add(*mode);
        }
        counts
    }

    /// Record one more holder.
    pub const fn add(&mut self, mode: LockMode) {
        match mode {
            LockMode::Read => self.readers += 1,
            LockMode::Write => self.writers += 1,
            LockMode::Exclusive => self.exclusive += 1,
        }
    }

    /// No holder at all.
    #[must_use]
    pub const fn is_free(&self) -> bool {
        self.readers == 0 && self.writers == 0 && self.exclusive == 0
    }

    /// Whether a new holder in `mode` can be admitted.
    #[must_use]
    pub const fn admits(&self, mode: LockMode) -> bool {
        match mode {
            LockMode::Read => self.writers == 0 && self.exclusive == 0,
            LockMode::Write | LockMode::Exclusive => self.is_free(),
        }
    }
}

/// Durable key to (owner, mode) records backing dependency locks.
///
/// Every operation either succeeds or fails fast; none of them waits for a
/// holder to go away.
pub trait LockRegistry: Send + Sync {
    /// Register `owner` on `key`.
    ///
    /// # Errors
    ///
    /// `Denied` when the current holders do not admit `mode`, `WouldBlock`
    /// when the record is busy, `Io` when it cannot be rewritten.
    fn acquire(&self, key: &Locator, owner: &OwnerId, mode: LockMode) -> Result<(), LockError>;

    /// Remove `owner` from `key`. Releasing a lock that is not held succeeds.
    ///
    /// # Errors
    ///
    /// `WouldBlock` or `Io` when the record cannot be updated.
    fn release(&self, key: &Locator, owner: &OwnerId) -> Result<(), LockError>;

    /// Transfer the entry of `from` to `to`, keeping its mode.
    ///
    /// # Errors
    ///
    /// `Incoherent` when `from` holds nothing on `key`.
    fn change_owner(&self, key: &Locator, from: &OwnerId, to: &OwnerId) -> Result<(), LockError>;

    /// Current holder counts, re-reading the record if it changed elsewhere.
    ///
    /// # Errors
    ///
    /// `Io` when the record exists but cannot be read.
    fn reconcile(&self, key: &Locator) -> Result<LockCounts, LockError>;
}

/// A granted lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Lock {
    /// Entry in the lock registry.
    Registry {
        /// Registry key.
        key: Locator,
        /// Current owner.
        owner: OwnerId,
        /// Mode it was granted in.
        mode: LockMode,
    },
    /// Tokens taken from a token resource.
    Tokens {
        /// Token resource.
        token: ResourceId,
        /// Number of tokens held.
        tokens: u32,
        /// Current owner.
        owner: OwnerId,
    },
}

impl Lock {
    /// Acquire a registry lock.
    ///
    /// # Errors
    ///
    /// Propagates the registry failure; nothing is held on error.
    pub fn acquire(
        registry: &dyn LockRegistry,
        key: Locator,
        owner: OwnerId,
        mode: LockMode,
    ) -> Result<Self, LockError> {
        registry.acquire(&key, &owner, mode)?;
        debug!(key = %key, owner = %owner, mode = %mode, "lock acquired");
        Ok(Self::Registry { key, owner, mode })
    }

    /// Current owner.
    #[must_use]
    pub const fn owner(&self) -> &OwnerId {
        match self {
            Self::Registry { owner, .. } | Self::Tokens { owner, .. } => owner,
        }
    }

    /// Give the lock back.
    ///
    /// # Errors
    ///
    /// Fails when the registry cannot be updated or the token resource is gone;
    /// the caller still holds the lock in that case.
    pub fn release(&self, handle: &SchedulerHandle) -> Result<(), SchedulerError> {
        self.give_back(handle, true)
    }

    /// Give back a lock taken by a start attempt that did not go through.
    ///
    /// Freed tokens do not wake the runner: the same attempt would fail
    /// again. The checker tick still rescans ready jobs.
    pub(crate) fn undo(&self, handle: &SchedulerHandle) -> Result<(), SchedulerError> {
        self.give_back(handle, false)
    }

    fn give_back(&self, handle: &SchedulerHandle, wake: bool) -> Result<(), SchedulerError> {
        match self {
            Self::Registry { key, owner, .. } => {
                handle.registry().release(key, owner)?;
                debug!(key = %key, owner = %owner, "lock released");
                Ok(())
            }
            Self::Tokens { token, tokens, .. } => {
                let resource = handle.resolve(*token)?.ok_or_else(|| {
                    LockError::Incoherent(format!("token resource {token} disappeared"))
                })?;
                resource.release_tokens(handle, *tokens, wake)
            }
        }
    }

    /// Move the lock to another owner, typically the process that now runs the job.
    ///
    /// # Errors
    ///
    /// Propagates the registry failure; the owner is unchanged on error.
    pub fn change_ownership(&mut self, handle: &SchedulerHandle, new_owner: OwnerId) -> Result<(), LockError> {
        match self {
            Self::Registry { key, owner, .. } => {
                handle.registry().change_owner(key, owner, &new_owner)?;
                *owner = new_owner;
            }
            Self::Tokens { owner, .. } => *owner = new_owner,
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_admission() {
        let counts = LockCounts::from_modes(&[LockMode::Read, LockMode::Read]);
        assert!(counts.admits(LockMode::Read));
        assert!(!counts.admits(LockMode::Write));
        assert!(!counts.admits(LockMode::Exclusive));
    }

    #[test]
    fn test_writer_excludes_everyone() {
        let counts = LockCounts::from_modes(&[LockMode::Write]);
        assert!(!counts.admits(LockMode::Read));
        assert!(!counts.admits(LockMode::Write));
        assert!(LockCounts::default().admits(LockMode::Exclusive));
    }

    #[test]
    fn test_mode_codes() {
        for mode in [LockMode::Read, LockMode::Write, LockMode::Exclusive] {
            assert_eq!(LockMode::from_code(mode.code()), Some(mode));
        }
        assert_eq!(LockMode::from_code('?'), None);
    }
}
