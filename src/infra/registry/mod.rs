//! Lock registry backends.

pub mod file;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::core::error::LockError;
use crate::core::ids::{Locator, OwnerId};
use crate::core::lock::{LockCounts, LockMode};

pub use file::FileLockRegistry;
pub use memory::InMemoryLockRegistry;

/// Holders of one registry key.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Holders(BTreeMap<OwnerId, LockMode>);

impl Holders {
    /// Register `owner`. Returns whether the table changed.
    ///
    /// # Errors
    ///
    /// `Denied` when the current holders do not admit `mode`, or when
    /// `owner` already holds the key in another mode.
    pub fn acquire(&mut self, key: &Locator, owner: &OwnerId, mode: LockMode) -> Result<bool, LockError> {
        if let Some(held) = self.0.get(owner) {
            if *held == mode {
                return Ok(false);
            }
            return Err(LockError::Denied(format!("{owner} already holds {key} in {held} mode")));
        }
        let counts = self.counts();
        if !counts.admits(mode) {
            return Err(LockError::Denied(format!(
                "{key} has {} readers, {} writers, {} exclusive holders",
                counts.readers, counts.writers, counts.exclusive
            )));
        }
        self.0.insert(owner.clone(), mode);
        Ok(true)
    }

    /// Remove `owner`. Returns whether it was present.
    pub fn release(&mut self, owner: &OwnerId) -> bool {
        self.0.remove(owner).is_some()
    }

    /// Move the entry of `from` to `to`.
    ///
    /// # Errors
    ///
    /// `Incoherent` when `from` holds nothing or `to` already holds the key.
    pub fn transfer(&mut self, key: &Locator, from: &OwnerId, to: &OwnerId) -> Result<(), LockError> {
        if from == to {
            return if self.0.contains_key(from) {
                Ok(())
            } else {
                Err(LockError::Incoherent(format!("{from} does not hold {key}")))
            };
        }
        if self.0.contains_key(to) {
            return Err(LockError::Incoherent(format!("{to} already holds {key}")));
        }
        let mode = self
            .0
            .remove(from)
            .ok_or_else(|| LockError::Incoherent(format!("{from} does not hold {key}")))?;
        self.0.insert(to.clone(), mode);
        Ok(())
    }

    /// Holder counts.
    #[must_use]
    pub fn counts(&self) -> LockCounts {
        LockCounts::from_modes(self.0.values())
    }

    /// Whether nobody holds the key.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Mode held by `owner`.
    #[must_use]
    pub fn mode_of(&self, owner: &OwnerId) -> Option<LockMode> {
        self.0.get(owner).copied()
    }

    /// Parse `owner code` lines.
    ///
    /// # Errors
    ///
    /// `Incoherent` on a malformed line.
    pub fn parse(key: &Locator, text: &str) -> Result<Self, LockError> {
        let mut holders = BTreeMap::new();
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            let parsed = line.rsplit_once(' ').and_then(|(owner, code)| {
                let mut chars = code.chars();
                match (chars.next(), chars.next()) {
                    (Some(c), None) => LockMode::from_code(c).map(|mode| (owner.trim(), mode)),
                    _ => None,
                }
            });
            let (owner, mode) =
                parsed.ok_or_else(|| LockError::Incoherent(format!("bad lock record line for {key}: {line:?}")))?;
            holders.insert(OwnerId::new(owner), mode);
        }
        Ok(Self(holders))
    }

    /// Render as `owner code` lines.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (owner, mode) in &self.0 {
            let _ = writeln!(out, "{owner} {}", mode.code());
        }
        out
    }
}
