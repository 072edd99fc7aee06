//! End-to-end scheduling: propagation, runs, stop, invalidate and the loops.

mod common;

use std::time::Duration;

use common::{finish_job, harness, settle, wait_until};
use xpm_scheduler::core::{
    Dependency, Locator, Message, ProcessHandle, Resource, ResourceState, Scheduler, SchedulerError,
    StoreError,
};
use xpm_scheduler::infra::process::DESTROYED_EXIT;

#[test]
fn test_done_producer_makes_consumer_ready_then_running() {
    let h = harness();
    let b = Resource::data("/exp/b", ResourceState::Waiting);
    let b_id = h.handle.submit(&b).unwrap();
    let a = Resource::job("/exp/a", 0);
    a.declare(Dependency::read(b_id)).unwrap();
    let a_id = h.handle.submit(&a).unwrap();

    assert_eq!(a.state(), ResourceState::Waiting);
    assert_eq!(a.counts(), Some((1, 0)));

    h.handle.set_state(b_id, ResourceState::Done).unwrap();
    assert_eq!(h.handle.propagate_pending(), 2);
    assert_eq!(a.counts(), Some((0, 0)));
    assert_eq!(a.state(), ResourceState::Ready);

    assert_eq!(h.handle.run_ready_jobs(), 1);
    assert_eq!(a.state(), ResourceState::Running);
    let registry = h.handle.registry();
    assert_eq!(registry.reconcile(&Locator::new("/exp/b")).unwrap().readers, 1);
    assert_eq!(registry.reconcile(&a.locator().ownership_key()).unwrap().exclusive, 1);

    finish_job(&h, a_id, 0);
    assert_eq!(a.state(), ResourceState::Done);
    assert!(registry.reconcile(&Locator::new("/exp/b")).unwrap().is_free());
    assert!(registry.reconcile(&a.locator().ownership_key()).unwrap().is_free());
    assert_eq!(h.handle.markers().exit_code(a.locator()).unwrap(), Some(0));
}

#[test]
fn test_failed_producer_holds_consumer_until_fixed() {
    let h = harness();
    let p = Resource::data("/p", ResourceState::Waiting);
    let p_id = h.handle.submit(&p).unwrap();
    let c = Resource::job("/c", 0);
    c.declare(Dependency::read(p_id)).unwrap();
    h.handle.submit(&c).unwrap();

    h.handle.set_state(p_id, ResourceState::Error).unwrap();
    settle(&h.handle);
    assert_eq!(c.state(), ResourceState::OnHold);
    let (unsatisfied, holding) = c.counts().unwrap();
    assert_eq!((unsatisfied, holding), (1, 1));
    assert!(holding <= unsatisfied);

    h.handle.set_state(p_id, ResourceState::Done).unwrap();
    h.handle.propagate_pending();
    assert_eq!(c.counts(), Some((0, 0)));
    assert_eq!(c.state(), ResourceState::Ready);
}

#[test]
fn test_end_of_job_failure_propagates_hold() {
    let h = harness();
    let first = Resource::job("/first", 0);
    let first_id = h.handle.submit(&first).unwrap();
    let second = Resource::job("/second", 0);
    second.declare(Dependency::exclusive(first_id)).unwrap();
    h.handle.submit(&second).unwrap();

    settle(&h.handle);
    assert_eq!(first.state(), ResourceState::Running);
    assert_eq!(second.state(), ResourceState::Waiting);

    finish_job(&h, first_id, 2);
    assert_eq!(first.state(), ResourceState::Error);
    assert_eq!(second.state(), ResourceState::OnHold);
}

#[test]
fn test_stop_running_job_releases_everything() {
    let h = harness();
    let data = Resource::data("/in", ResourceState::Done);
    let data_id = h.handle.submit(&data).unwrap();
    let job = Resource::job("/job", 0);
    job.declare(Dependency::write(data_id)).unwrap();
    let job_id = h.handle.submit(&job).unwrap();
    settle(&h.handle);
    assert_eq!(job.state(), ResourceState::Running);

    assert!(h.handle.stop(job_id).unwrap());
    assert_eq!(job.state(), ResourceState::Error);
    assert_eq!(h.launcher.process_for(job_id).unwrap().exit_value(), Some(DESTROYED_EXIT));
    assert!(h.handle.registry().reconcile(data.locator()).unwrap().is_free());
    assert!(!h.handle.stop(job_id).unwrap());

    // Restart puts it back through the whole cycle.
    h.handle.invalidate(job_id, true).unwrap();
    assert_eq!(job.state(), ResourceState::Ready);
    settle(&h.handle);
    assert_eq!(job.state(), ResourceState::Running);
    assert_eq!(h.launcher.started(), vec![job_id, job_id]);
}

#[test]
fn test_stop_waiting_job_holds_it() {
    let h = harness();
    let data = Resource::data("/in", ResourceState::Waiting);
    let data_id = h.handle.submit(&data).unwrap();
    let job = Resource::job("/job", 0);
    job.declare(Dependency::read(data_id)).unwrap();
    let job_id = h.handle.submit(&job).unwrap();

    assert!(h.handle.stop(job_id).unwrap());
    assert_eq!(job.state(), ResourceState::OnHold);

    // The hold survives producer progress.
    h.handle.set_state(data_id, ResourceState::Done).unwrap();
    settle(&h.handle);
    assert_eq!(job.state(), ResourceState::OnHold);
    assert!(h.launcher.started().is_empty());

    h.handle.invalidate(job_id, true).unwrap();
    settle(&h.handle);
    assert_eq!(job.state(), ResourceState::Running);
}

#[test]
fn test_invalidate_refuses_active_and_forces_error() {
    let h = harness();
    let job = Resource::job("/job", 0);
    let job_id = h.handle.submit(&job).unwrap();
    assert!(matches!(
        h.handle.invalidate(job_id, false),
        Err(SchedulerError::InvalidState { .. })
    ));

    settle(&h.handle);
    finish_job(&h, job_id, 0);
    assert_eq!(job.state(), ResourceState::Done);

    h.handle.invalidate(job_id, false).unwrap();
    assert_eq!(job.state(), ResourceState::Error);
    assert_eq!(h.handle.markers().exit_code(job.locator()).unwrap(), Some(1));
}

#[test]
fn test_higher_priority_starts_first() {
    let h = harness();
    let low = Resource::job("/low", 1);
    let low_id = h.handle.submit(&low).unwrap();
    let high = Resource::job("/high", 5);
    let high_id = h.handle.submit(&high).unwrap();

    assert_eq!(h.handle.run_ready_jobs(), 2);
    assert_eq!(h.launcher.started(), vec![high_id, low_id]);
}

#[test]
fn test_dependency_validation() {
    let h = harness();
    let x = Resource::job("/x", 0);
    let x_id = h.handle.submit(&x).unwrap();
    let y = Resource::job("/y", 0);
    y.declare(Dependency::read(x_id)).unwrap();
    let y_id = h.handle.submit(&y).unwrap();

    let cycle = h.handle.add_dependency(x_id, Dependency::read(y_id));
    assert!(matches!(cycle, Err(SchedulerError::InvalidDependency(_))));
    let itself = h.handle.add_dependency(x_id, Dependency::read(x_id));
    assert!(matches!(itself, Err(SchedulerError::InvalidDependency(_))));
    let duplicate = h.handle.add_dependency(y_id, Dependency::write(x_id));
    assert!(matches!(duplicate, Err(SchedulerError::InvalidDependency(_))));

    // A running resource cannot be replaced.
    settle(&h.handle);
    assert_eq!(x.state(), ResourceState::Running);
    let dup = Resource::job("/x", 0);
    assert!(matches!(
        h.handle.submit(&dup),
        Err(SchedulerError::Store(StoreError::AlreadyExists(_)))
    ));
    assert!(h.handle.submit(&x).is_err());
}

#[test]
fn test_added_dependency_takes_effect() {
    let h = harness();
    let gate = Resource::data("/gate", ResourceState::Waiting);
    let gate_id = h.handle.submit(&gate).unwrap();
    let job = Resource::job("/job", 0);
    let job_id = h.handle.submit(&job).unwrap();
    assert_eq!(job.state(), ResourceState::Ready);

    h.handle.add_dependency(job_id, Dependency::read(gate_id)).unwrap();
    assert_eq!(job.state(), ResourceState::Waiting);
    assert_eq!(job.counts(), Some((1, 0)));
}

#[test]
fn test_delete_refuses_resources_with_dependents() {
    let h = harness();
    let data = Resource::data("/d", ResourceState::Done);
    let data_id = h.handle.submit(&data).unwrap();
    let job = Resource::job("/j", 0);
    job.declare(Dependency::read(data_id)).unwrap();
    let job_id = h.handle.submit(&job).unwrap();

    assert!(matches!(
        h.handle.delete(data_id, false),
        Err(SchedulerError::InvalidDependency(_))
    ));
    assert_eq!(h.handle.delete(job_id, false).unwrap(), 1);
    assert_eq!(h.handle.delete(data_id, false).unwrap(), 1);
    assert!(h.handle.resolve(data_id).unwrap().is_none());
    assert_eq!(h.events.count("resource_removed"), 2);
}

#[test]
fn test_recursive_delete_removes_dependents_first() {
    let h = harness();
    let data_id = h.handle.submit(&Resource::data("/d", ResourceState::Waiting)).unwrap();
    let a = Resource::job("/a", 0);
    a.declare(Dependency::read(data_id)).unwrap();
    let a_id = h.handle.submit(&a).unwrap();
    let b = Resource::job("/b", 0);
    b.declare(Dependency::read(a_id)).unwrap();
    b.declare(Dependency::read(data_id)).unwrap();
    let b_id = h.handle.submit(&b).unwrap();
    let other_id = h.handle.submit(&Resource::data("/other", ResourceState::Done)).unwrap();

    assert_eq!(h.handle.delete(data_id, true).unwrap(), 3);
    for id in [data_id, a_id, b_id] {
        assert!(h.handle.resolve(id).unwrap().is_none());
    }
    assert_eq!(a.id(), None);
    assert!(h.handle.resolve(other_id).unwrap().is_some());
    let removed: Vec<_> = h
        .events
        .messages()
        .into_iter()
        .filter_map(|m| match m {
            Message::ResourceRemoved { id, .. } => Some(id),
            _ => None,
        })
        .collect();
    assert_eq!(removed, vec![b_id, a_id, data_id]);
}

#[test]
fn test_recursive_delete_refuses_running_dependent() {
    let h = harness();
    let data_id = h.handle.submit(&Resource::data("/d", ResourceState::Done)).unwrap();
    let job = Resource::job("/job", 0);
    job.declare(Dependency::read(data_id)).unwrap();
    let job_id = h.handle.submit(&job).unwrap();
    settle(&h.handle);
    assert_eq!(job.state(), ResourceState::Running);

    assert!(matches!(
        h.handle.delete(data_id, true),
        Err(SchedulerError::InvalidState { .. })
    ));
    assert!(h.handle.resolve(data_id).unwrap().is_some());
    assert!(h.handle.resolve(job_id).unwrap().is_some());
    assert_eq!(h.events.count("resource_removed"), 0);
}

#[test]
fn test_resubmit_replaces_failed_job() {
    let h = harness();
    let gate_id = h.handle.submit(&Resource::data("/gate", ResourceState::Waiting)).unwrap();
    let first = Resource::job("/job", 0);
    let job_id = h.handle.submit(&first).unwrap();
    settle(&h.handle);
    finish_job(&h, job_id, 3);
    assert_eq!(first.state(), ResourceState::Error);
    let consumer = Resource::job("/consumer", 0);
    consumer.declare(Dependency::read(job_id)).unwrap();
    h.handle.submit(&consumer).unwrap();
    assert_eq!(consumer.state(), ResourceState::OnHold);

    let second = Resource::job("/job", 0);
    second.declare(Dependency::read(gate_id)).unwrap();
    assert_eq!(h.handle.submit(&second).unwrap(), job_id);
    assert_eq!(first.id(), None);
    let live = h.handle.resolve(job_id).unwrap().unwrap();
    assert!(std::sync::Arc::ptr_eq(&live, &second));
    assert_eq!(second.state(), ResourceState::Waiting);
    assert_eq!(h.handle.markers().exit_code(second.locator()).unwrap(), None);

    // Dependents see the new definition.
    settle(&h.handle);
    assert_eq!(consumer.state(), ResourceState::Waiting);
    h.handle.set_state(gate_id, ResourceState::Done).unwrap();
    settle(&h.handle);
    assert_eq!(second.state(), ResourceState::Running);
    assert_eq!(h.launcher.started(), vec![job_id, job_id]);
}

#[test]
fn test_error_job_stays_in_error_until_invalidated() {
    let h = harness();
    let job = Resource::job("/job", 0);
    let job_id = h.handle.submit(&job).unwrap();
    h.launcher.fail_next_start();
    assert_eq!(h.handle.run_ready_jobs(), 0);
    assert_eq!(job.state(), ResourceState::Error);
    assert_eq!(h.handle.markers().exit_code(job.locator()).unwrap(), None);

    assert!(!job.update_status(&h.handle).unwrap());
    assert_eq!(job.state(), ResourceState::Error);
    settle(&h.handle);
    assert_eq!(job.state(), ResourceState::Error);
    assert!(h.launcher.started().is_empty());

    h.handle.invalidate(job_id, true).unwrap();
    settle(&h.handle);
    assert_eq!(job.state(), ResourceState::Running);
    assert_eq!(h.launcher.started(), vec![job_id]);
}

#[test]
fn test_listener_sees_lifecycle() {
    let h = harness();
    let job = Resource::job("/j", 0);
    let job_id = h.handle.submit(&job).unwrap();
    settle(&h.handle);
    finish_job(&h, job_id, 0);

    let transitions: Vec<_> = h
        .events
        .messages()
        .into_iter()
        .filter_map(|m| match m {
            Message::StateChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect();
    assert_eq!(
        transitions,
        vec![ResourceState::Ready, ResourceState::Running, ResourceState::Done]
    );
    assert_eq!(h.events.count("resource_added"), 1);
}

#[test]
fn test_background_loops_run_pipeline() {
    let h = harness();
    let scheduler = Scheduler::start(h.handle.clone()).unwrap();
    let b = Resource::data("/exp/b", ResourceState::Waiting);
    let b_id = h.handle.submit(&b).unwrap();
    let a = Resource::job("/exp/a", 0);
    a.declare(Dependency::read(b_id)).unwrap();
    let a_id = h.handle.submit(&a).unwrap();

    h.handle.set_state(b_id, ResourceState::Done).unwrap();
    assert!(wait_until(Duration::from_secs(5), || a.state() == ResourceState::Running));

    let pid = a.pid().unwrap();
    assert!(h.launcher.finish(pid, 0));
    assert!(wait_until(Duration::from_secs(5), || a.state() == ResourceState::Done));
    assert_eq!(h.launcher.started(), vec![a_id]);

    scheduler.shutdown();
    assert!(h.handle.is_stopping());
    let late = Resource::data("/late", ResourceState::Done);
    assert!(matches!(h.handle.submit(&late), Err(SchedulerError::Shutdown)));
}
