//! Tests for configuration validation

use std::path::PathBuf;

use xpm_scheduler::config::SchedulerConfig;

#[test]
fn test_builder_overrides() {
    let cfg = SchedulerConfig::new()
        .with_rescheduling_delay_ms(10)
        .with_job_check_interval_ms(1_000)
        .with_cache_capacity(8)
        .with_lock_guard(3, 2)
        .with_state_dir("/tmp/xpm")
        .with_owner("host-1");
    assert_eq!(cfg.rescheduling_delay_ms, 10);
    assert_eq!(cfg.job_check_interval_ms, 1_000);
    assert_eq!(cfg.cache_capacity, 8);
    assert_eq!((cfg.lock_guard_retries, cfg.lock_guard_backoff_ms), (3, 2));
    assert_eq!(cfg.state_dir, Some(PathBuf::from("/tmp/xpm")));
    assert!(cfg.validate().is_ok());
}

#[test]
fn test_owner_must_be_a_single_word() {
    assert!(SchedulerConfig::new().with_owner("").validate().is_err());
    assert!(SchedulerConfig::new().with_owner("two words").validate().is_err());
    assert!(SchedulerConfig::new().with_owner("node-7").validate().is_ok());
}

#[test]
fn test_zero_lock_guard_retries_rejected() {
    assert!(SchedulerConfig::new().with_lock_guard(0, 5).validate().is_err());
    assert!(SchedulerConfig::new().with_cache_capacity(0).validate().is_err());
}

#[test]
fn test_json_round_trip_keeps_state_dir() {
    let cfg = SchedulerConfig::new().with_state_dir("/var/lib/xpm").with_owner("a");
    let json = serde_json::to_string(&cfg).unwrap();
    assert_eq!(SchedulerConfig::from_json_str(&json).unwrap(), cfg);
}

#[test]
fn test_invalid_json_is_reported() {
    let err = SchedulerConfig::from_json_str("{ not json").unwrap_err();
    assert!(err.starts_with("parse error"));
}
