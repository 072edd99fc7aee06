//! Resource states and dependency statuses.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Lifecycle state of a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceState {
    /// Some dependency is not satisfied yet.
    Waiting,
    /// Every dependency is satisfied; the runner may start it.
    Ready,
    /// Locks acquired and process started.
    Running,
    /// Completed successfully.
    Done,
    /// Failed or stopped.
    Error,
    /// Blocked by a failed dependency or an explicit hold.
    OnHold,
}

impl ResourceState {
    /// States a resource can still progress out of without operator action.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Waiting | Self::Ready | Self::Running)
    }

    /// Terminal states.
    #[must_use]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }

    /// States that wait on something outside the resource.
    #[must_use]
    pub const fn is_waiting(self) -> bool {
        matches!(self, Self::Waiting | Self::OnHold)
    }

    /// States that put dependents on hold.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::OnHold | Self::Error)
    }

    /// States in which a resubmitted resource may take over the stored one.
    #[must_use]
    pub const fn is_replaceable(self) -> bool {
        matches!(self, Self::Waiting | Self::Ready | Self::OnHold | Self::Error)
    }

    /// Stable lowercase name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Done => "done",
            Self::Error => "error",
            Self::OnHold => "on_hold",
        }
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Satisfiability of a dependency, as last computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyStatus {
    /// Satisfied, no lock needed.
    Ok,
    /// Satisfied once the lock is taken.
    OkLock,
    /// Producer not finished yet.
    Wait,
    /// Producer failed or is on hold.
    Hold,
    /// Dependency cannot be evaluated.
    Error,
    /// Consumed by a run; no longer tracked.
    Unactive,
}

impl DependencyStatus {
    /// Counts as satisfied.
    #[must_use]
    pub const fn is_ok(self) -> bool {
        matches!(self, Self::Ok | Self::OkLock)
    }

    /// Puts the consumer on hold.
    #[must_use]
    pub const fn is_blocking(self) -> bool {
        matches!(self, Self::Hold | Self::Error)
    }
}

impl fmt::Display for DependencyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "ok",
            Self::OkLock => "ok_lock",
            Self::Wait => "wait",
            Self::Hold => "hold",
            Self::Error => "error",
            Self::Unactive => "unactive",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_predicates() {
        assert!(ResourceState::Ready.is_active());
        assert!(!ResourceState::OnHold.is_active());
        assert!(ResourceState::Error.is_finished());
        assert!(ResourceState::OnHold.is_waiting());
        assert!(ResourceState::Error.is_blocking());
        assert!(!ResourceState::Done.is_blocking());
        assert!(ResourceState::Error.is_replaceable());
        assert!(!ResourceState::Running.is_replaceable());
        assert!(!ResourceState::Done.is_replaceable());
    }

    #[test]
    fn test_status_predicates() {
        assert!(DependencyStatus::OkLock.is_ok());
        assert!(!DependencyStatus::Wait.is_ok());
        assert!(DependencyStatus::Hold.is_blocking());
        assert!(!DependencyStatus::Unactive.is_blocking());
    }

    #[test]
    fn test_state_serializes_snake_case() {
        let json = serde_json::to_string(&ResourceState::OnHold).unwrap();
        assert_eq!(json, "\"on_hold\"");
    }
}
