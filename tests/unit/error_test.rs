//! Tests for error types

use std::io;

use xpm_scheduler::core::{LockError, Locator, ResourceId, ResourceState, SchedulerError, StoreError};

#[test]
fn test_lock_errors_are_transparent() {
    let err = SchedulerError::from(LockError::Denied("/a: writer present".to_string()));
    assert_eq!(format!("{err}"), "lock denied: /a: writer present");
    assert_eq!(format!("{}", SchedulerError::from(LockError::WouldBlock)), "lock record busy");
}

#[test]
fn test_store_error_messages() {
    let err = SchedulerError::from(StoreError::AlreadyExists(Locator::new("/exp/a")));
    assert_eq!(format!("{err}"), "locator already registered: /exp/a");
    assert_eq!(format!("{}", StoreError::NotFound(ResourceId(4))), format!("no record for {}", ResourceId(4)));
}

#[test]
fn test_invalid_state_names_resource_and_state() {
    let err = SchedulerError::InvalidState {
        locator: Locator::new("/job"),
        state: ResourceState::Running,
    };
    assert_eq!(format!("{err}"), format!("/job is {}", ResourceState::Running));
}

#[test]
fn test_io_sources_are_kept() {
    let err = SchedulerError::Markers(io::Error::new(io::ErrorKind::PermissionDenied, "read-only"));
    let source = std::error::Error::source(&err).expect("io source");
    assert_eq!(source.to_string(), "read-only");
}

#[test]
fn test_app_result_wraps_scheduler_errors() {
    let result: xpm_scheduler::core::AppResult<()> = Err(SchedulerError::Shutdown.into());
    let err = result.unwrap_err();
    assert_eq!(err.to_string(), "scheduler is shutting down");
    assert!(err.downcast_ref::<SchedulerError>().is_some());
}
