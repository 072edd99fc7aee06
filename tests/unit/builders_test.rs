//! Tests for builder modules

use std::sync::Arc;

use tempfile::TempDir;
use xpm_scheduler::builders::{build_collaborators, build_handle, build_scheduler};
use xpm_scheduler::config::SchedulerConfig;
use xpm_scheduler::core::{Resource, ResourceState};
use xpm_scheduler::infra::InMemoryLauncher;

#[test]
fn test_in_memory_handle_uses_configured_owner() {
    let handle = build_handle(SchedulerConfig::new().with_owner("builder"), Arc::new(InMemoryLauncher::new())).unwrap();
    assert_eq!(handle.owner().as_str(), "builder");
    assert!(handle.resources(&[]).unwrap().is_empty());
}

#[test]
fn test_generated_owner_when_unset() {
    let handle = build_handle(SchedulerConfig::new(), Arc::new(InMemoryLauncher::new())).unwrap();
    assert!(!handle.owner().as_str().is_empty());
}

#[test]
fn test_invalid_config_is_rejected() {
    let cfg = SchedulerConfig::new().with_rescheduling_delay_ms(0);
    assert!(build_collaborators(&cfg, Arc::new(InMemoryLauncher::new())).is_err());
}

#[test]
fn test_state_dir_layout_is_created() {
    let dir = TempDir::new().unwrap();
    let cfg = SchedulerConfig::new().with_state_dir(dir.path()).with_owner("files");
    let handle = build_handle(cfg, Arc::new(InMemoryLauncher::new())).unwrap();
    for sub in ["store", "locks", "jobs"] {
        assert!(dir.path().join(sub).is_dir(), "{sub} missing");
    }
    handle.submit(&Resource::data("/persisted", ResourceState::Done)).unwrap();
    assert!(dir.path().join("store").join("resources.jsonl").is_file());
}

#[test]
fn test_build_scheduler_starts_and_stops() {
    let scheduler = build_scheduler(
        SchedulerConfig::new().with_owner("started"),
        Arc::new(InMemoryLauncher::new()),
    )
    .unwrap();
    assert_eq!(scheduler.recovery().running, 0);
    scheduler.shutdown();
    assert!(scheduler.handle().is_stopping());
}
