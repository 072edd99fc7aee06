//! Tests for the query surface and listener adapters

use std::sync::Arc;

use xpm_scheduler::builders::build_handle;
use xpm_scheduler::config::SchedulerConfig;
use xpm_scheduler::core::{Dependency, Message, Resource, ResourceState};
use xpm_scheduler::infra::InMemoryLauncher;
use xpm_scheduler::runtime::{health, list_resources, ChannelListener};

fn handle() -> xpm_scheduler::core::SchedulerHandle {
    build_handle(SchedulerConfig::new().with_owner("runtime"), Arc::new(InMemoryLauncher::new())).unwrap()
}

#[test]
fn test_list_resources_describes_each_kind() {
    let handle = handle();
    let data_id = handle.submit(&Resource::data("/d", ResourceState::Waiting)).unwrap();
    let token_id = handle.submit(&Resource::token("/t", 3)).unwrap();
    let job = Resource::job("/j", 7);
    job.declare(Dependency::read(data_id)).unwrap();
    job.declare(Dependency::tokens(token_id, 1)).unwrap();
    handle.submit(&job).unwrap();

    let all = list_resources(&handle, &[]).unwrap();
    assert_eq!(all.len(), 3);
    let job_entry = all.iter().find(|s| s.kind == "job").unwrap();
    assert_eq!(job_entry.priority, Some(7));
    assert_eq!(job_entry.counts, Some((1, 0)));
    let token_entry = all.iter().find(|s| s.kind == "token").unwrap();
    assert_eq!(token_entry.tokens, Some((0, 3)));

    let waiting = list_resources(&handle, &[ResourceState::Waiting]).unwrap();
    assert_eq!(waiting.len(), 2);
}

#[test]
fn test_health_counts_states() {
    let handle = handle();
    handle.submit(&Resource::job("/ready", 0)).unwrap();
    handle.submit(&Resource::data("/waiting", ResourceState::Waiting)).unwrap();
    let report = health(&handle).unwrap();
    assert!(report.ok);
    assert_eq!((report.running, report.ready, report.waiting), (0, 1, 1));
    assert_eq!(report.pending_changes, 1);
    assert_eq!(report.pending_messages, 0);
}

#[test]
fn test_channel_listener_receives_events() {
    let handle = handle();
    let (listener, receiver) = ChannelListener::new();
    let id = handle.add_listener(Arc::new(listener));
    handle.submit(&Resource::data("/d", ResourceState::Done)).unwrap();
    assert!(matches!(receiver.try_recv().unwrap(), Message::ResourceAdded { .. }));

    assert!(handle.remove_listener(id));
    handle.submit(&Resource::data("/e", ResourceState::Done)).unwrap();
    assert!(receiver.try_recv().is_err());
}
