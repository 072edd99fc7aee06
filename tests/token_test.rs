//! Token resources bound how many jobs run at once.

mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{harness, settle, test_config, wait_until, CountingStore};
use xpm_scheduler::core::{
    Collaborators, Dependency, LockError, LockMode, Locator, OwnerId, Resource, ResourceState, RunOutcome,
    Scheduler, SchedulerError, SchedulerHandle,
};
use xpm_scheduler::infra::{InMemoryLauncher, InMemoryLockRegistry, InMemoryMarkers};

#[test]
fn test_concurrent_runs_never_exceed_limit() {
    let h = harness();
    let token = Resource::token("/gpu", 2);
    let token_id = h.handle.submit(&token).unwrap();
    let jobs: Vec<_> = (0..3)
        .map(|i| {
            let job = Resource::job(format!("/job{i}"), 0);
            job.declare(Dependency::tokens(token_id, 1)).unwrap();
            h.handle.submit(&job).unwrap();
            assert_eq!(job.state(), ResourceState::Ready);
            job
        })
        .collect();

    let barrier = Arc::new(Barrier::new(jobs.len()));
    let results: Vec<_> = jobs
        .iter()
        .map(|job| {
            let job = Arc::clone(job);
            let handle = h.handle.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                job.run(&handle)
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|t| t.join().unwrap())
        .collect();

    let started = results
        .iter()
        .filter(|r| matches!(r, Ok(RunOutcome::Started { .. })))
        .count();
    let denied = results
        .iter()
        .filter(|r| matches!(r, Err(SchedulerError::Lock(LockError::Denied(_)))))
        .count();
    assert_eq!((started, denied), (2, 1));
    assert_eq!(token.token_usage(), Some((2, 2)));

    let waiting = jobs
        .iter()
        .find(|job| job.state() == ResourceState::Ready)
        .expect("one job was refused");
    assert!(h.handle.registry().reconcile(&waiting.locator().ownership_key()).unwrap().is_free());

    // End one run by hand so the freed token is observable before the runner uses it.
    let finished = jobs
        .iter()
        .find(|job| job.state() == ResourceState::Running)
        .unwrap();
    let finished_id = finished.id().unwrap();
    assert!(h.launcher.process_for(finished_id).unwrap().finish(0));
    assert_eq!(h.handle.check_running_jobs(), 1);
    assert_eq!(h.handle.deliver_due(), 1);
    assert_eq!(finished.state(), ResourceState::Done);
    assert_eq!(token.token_usage(), Some((1, 2)));

    assert_eq!(h.handle.run_ready_jobs(), 1);
    assert_eq!(waiting.state(), ResourceState::Running);
    assert_eq!(token.token_usage(), Some((2, 2)));
}

#[test]
fn test_runner_skips_jobs_without_tokens_until_limit_raised() {
    let h = harness();
    let token = Resource::token("/licence", 2);
    let token_id = h.handle.submit(&token).unwrap();
    let mut ids = Vec::new();
    for i in 0..3 {
        let job = Resource::job(format!("/job{i}"), 0);
        job.declare(Dependency::tokens(token_id, 1)).unwrap();
        ids.push(h.handle.submit(&job).unwrap());
    }

    assert_eq!(h.handle.run_ready_jobs(), 2);
    assert_eq!(h.launcher.running(), 2);
    let third = h.handle.resolve(ids[2]).unwrap().unwrap();
    assert_eq!(third.state(), ResourceState::Ready);
    assert!(third.run(&h.handle).is_err());

    h.handle.set_token_limit(token_id, 3).unwrap();
    assert_eq!(h.handle.run_ready_jobs(), 1);
    assert_eq!(token.token_usage(), Some((3, 3)));
    assert_eq!(third.state(), ResourceState::Running);
}

#[test]
fn test_job_needing_more_tokens_than_left_waits() {
    let h = harness();
    let token = Resource::token("/cores", 4);
    let token_id = h.handle.submit(&token).unwrap();
    let big = Resource::job("/big", 0);
    big.declare(Dependency::tokens(token_id, 3)).unwrap();
    let big_id = h.handle.submit(&big).unwrap();
    let small = Resource::job("/small", 0);
    small.declare(Dependency::tokens(token_id, 2)).unwrap();
    h.handle.submit(&small).unwrap();

    settle(&h.handle);
    assert_eq!(h.launcher.started(), vec![big_id]);
    assert_eq!(small.state(), ResourceState::Ready);
    assert!(!token.can_take_tokens(2).unwrap());
    assert!(token.can_take_tokens(1).unwrap());
}

#[test]
fn test_token_limit_rejects_other_kinds() {
    let h = harness();
    let data = Resource::data("/d", ResourceState::Done);
    let id = h.handle.submit(&data).unwrap();
    assert!(matches!(
        h.handle.set_token_limit(id, 1),
        Err(SchedulerError::WrongKind { .. })
    ));
    assert_eq!(data.token_usage(), None);
}

#[test]
fn test_denied_lock_after_tokens_leaves_runner_idle() {
    let store = Arc::new(CountingStore::new(64));
    let collaborators = Collaborators {
        store: store.clone(),
        registry: Arc::new(InMemoryLockRegistry::new()),
        markers: Arc::new(InMemoryMarkers::new()),
        launcher: Arc::new(InMemoryLauncher::new()),
    };
    // No checker tick during the test.
    let cfg = test_config().with_job_check_interval_ms(600_000);
    let handle = SchedulerHandle::new(cfg, collaborators).unwrap();

    let token = Resource::token("/gpu", 1);
    let token_id = handle.submit(&token).unwrap();
    let data_id = handle.submit(&Resource::data("/d", ResourceState::Done)).unwrap();
    handle
        .registry()
        .acquire(&Locator::new("/d"), &OwnerId::new("foreign"), LockMode::Read)
        .unwrap();
    let job = Resource::job("/job", 0);
    job.declare(Dependency::tokens(token_id, 1)).unwrap();
    job.declare(Dependency::write(data_id)).unwrap();
    handle.submit(&job).unwrap();
    assert_eq!(job.state(), ResourceState::Ready);

    let scheduler = Scheduler::start(handle.clone()).unwrap();
    thread::sleep(Duration::from_millis(200));
    let before = store.updates();
    thread::sleep(Duration::from_millis(300));
    let idle_saves = store.updates() - before;
    assert!(idle_saves < 5, "{idle_saves} saves while nothing changed");
    assert_eq!(job.state(), ResourceState::Ready);
    assert_eq!(token.token_usage(), Some((0, 1)));

    // Freeing the data and waking the runner still starts the job.
    handle.registry().release(&Locator::new("/d"), &OwnerId::new("foreign")).unwrap();
    handle.notify_runners();
    assert!(wait_until(Duration::from_secs(5), || job.state() == ResourceState::Running));
    assert_eq!(token.token_usage(), Some((1, 1)));
    scheduler.shutdown();
}
