//! Token resources: bounded counting semaphores shared by token dependencies.

use tracing::{debug, info, warn};

use super::error::{LockError, SchedulerError};
use super::lock::Lock;
use super::resource::{Resource, ResourceKind};
use super::scheduler::SchedulerHandle;
use super::store::KindRecord;

pub(crate) struct TokenData {
    pub(crate) limit: u32,
    pub(crate) used: u32,
}

impl TokenData {
    pub(crate) const fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    const fn admits(&self, tokens: u32) -> bool {
        match self.used.checked_add(tokens) {
            Some(total) => total <= self.limit,
            None => false,
        }
    }
}

impl Resource {
    fn not_a_token(&self) -> SchedulerError {
        SchedulerError::WrongKind {
            locator: self.locator().clone(),
            expected: "token resource",
        }
    }

    /// `(used, limit)`, for token resources.
    pub fn token_usage(&self) -> Option<(u32, u32)> {
        match &self.lock_inner().kind {
            ResourceKind::Token(token) => Some((token.used, token.limit)),
            _ => None,
        }
    }

    /// Whether `tokens` more tokens fit under the limit right now.
    ///
    /// # Errors
    ///
    /// `WrongKind` for non-token resources.
    pub fn can_take_tokens(&self, tokens: u32) -> Result<bool, SchedulerError> {
        match &self.lock_inner().kind {
            ResourceKind::Token(token) => Ok(token.admits(tokens)),
            _ => Err(self.not_a_token()),
        }
    }

    /// Take `tokens` tokens, re-checking the limit under the token's own lock.
    pub(crate) fn take_tokens(&self, handle: &SchedulerHandle, tokens: u32) -> Result<(), SchedulerError> {
        self.with_entity(handle, |g| {
            let locator = g.locator();
            let ResourceKind::Token(token) = &mut g.inner.kind else {
                return Err(g.wrong_kind("token resource"));
            };
            if !token.admits(tokens) {
                return Err(LockError::Denied(format!(
                    "{locator}: {} + {tokens} tokens exceeds limit {}",
                    token.used, token.limit
                ))
                .into());
            }
            token.used += tokens;
            debug!(locator = %locator, used = token.used, limit = token.limit, "tokens taken");
            g.dirty = true;
            Ok(())
        })
    }

    /// Give back `tokens` tokens. With `wake` the runner rescans ready jobs.
    pub(crate) fn release_tokens(&self, handle: &SchedulerHandle, tokens: u32, wake: bool) -> Result<(), SchedulerError> {
        self.with_entity(handle, |g| {
            let locator = g.locator();
            let ResourceKind::Token(token) = &mut g.inner.kind else {
                return Err(g.wrong_kind("token resource"));
            };
            token.used = token.used.checked_sub(tokens).unwrap_or_else(|| {
                warn!(locator = %locator, used = token.used, released = tokens, "token count underflow; resetting to zero");
                0
            });
            debug!(locator = %locator, used = token.used, limit = token.limit, "tokens released");
            g.dirty = true;
            g.effects.wake_runners = wake;
            Ok(())
        })
    }

    /// Change the capacity. Raising it wakes the runner.
    ///
    /// # Errors
    ///
    /// `WrongKind` for non-token resources.
    pub fn set_limit(&self, handle: &SchedulerHandle, limit: u32) -> Result<(), SchedulerError> {
        self.with_entity(handle, |g| {
            let locator = g.locator();
            let ResourceKind::Token(token) = &mut g.inner.kind else {
                return Err(g.wrong_kind("token resource"));
            };
            if token.limit == limit {
                return Ok(());
            }
            info!(locator = %locator, old = token.limit, new = limit, "token limit changed");
            token.limit = limit;
            let available = token.used < token.limit;
            g.dirty = true;
            g.effects.wake_runners = available;
            Ok(())
        })
    }

    /// Rebuild the used count from the token locks held by jobs.
    ///
    /// Only meaningful while no job can take tokens, i.e. before the
    /// scheduler loops start.
    pub(crate) fn recount_tokens(&self, handle: &SchedulerHandle) -> Result<bool, SchedulerError> {
        let Some(id) = self.id() else {
            return Err(self.not_a_token());
        };
        let mut used = 0u32;
        for consumer in handle.store().outgoing(id)? {
            let Some(record) = handle.store().record(consumer)? else {
                continue;
            };
            let Some(job) = record.job() else {
                continue;
            };
            for dependency in &job.dependencies {
                if let Some(Lock::Tokens { token, tokens, .. }) = &dependency.lock {
                    if *token == id {
                        used = used.saturating_add(*tokens);
                    }
                }
            }
        }
        self.with_entity(handle, |g| {
            let locator = g.locator();
            let ResourceKind::Token(token) = &mut g.inner.kind else {
                return Err(g.wrong_kind("token resource"));
            };
            if token.used == used {
                return Ok(false);
            }
            warn!(locator = %locator, stored = token.used, counted = used, "token count corrected");
            token.used = used;
            g.dirty = true;
            g.effects.wake_runners = true;
            Ok(true)
        })
    }
}

/// Whether a record describes a token resource.
pub(crate) const fn is_token_record(kind: &KindRecord) -> bool {
    matches!(kind, KindRecord::Token { .. })
}
