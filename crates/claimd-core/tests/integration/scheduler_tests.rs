use std::time::Duration;

use chrono::TimeDelta;

use claimd_core::classifier::ErrorCategory;
use claimd_core::job::{JobKey, JobSpec, TaskResult};
use claimd_core::proxy_pool::ProxyPool;
use claimd_core::testutil::{MemoryStateStore, MockTaskRunner, claim_jobs, proxy_address, t0};
use claimd_core::traits::NullStore;

use crate::integration::common::{fast_config, harness, spawn, wait_until};

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn runs_due_jobs_and_requeues_on_interval() {
    let runner = MockTaskRunner::new();
    let store = MemoryStateStore::new();
    let mut h = harness(runner.clone(), store.clone(), fast_config());
    for spec in claim_jobs("site", &["alice", "bob"]) {
        h.scheduler.add_job(spec.with_interval_minutes(30)).unwrap();
    }

    let (cancel, task) = spawn(h.scheduler);
    assert!(wait_until(WAIT, || h.reporter.count("job_succeeded") == 2).await);

    // The clock has not moved: nothing is due again.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runner.call_count(), 2);

    cancel.cancel();
    task.await.unwrap().unwrap();

    let saved = store.saved().unwrap();
    assert_eq!(saved.jobs.len(), 2);
    for job in &saved.jobs {
        assert_eq!(job.next_eligible_run_at, t0() + TimeDelta::minutes(30));
        assert_eq!(job.last_success_at, Some(t0()));
    }
    assert_eq!(h.reporter.count("stopped"), 1);
}

#[tokio::test]
async fn in_flight_jobs_hold_the_concurrency_budget() {
    let runner = MockTaskRunner::new().with_delay(Duration::from_secs(30));
    let mut h = harness(
        runner.clone(),
        NullStore,
        fast_config().with_max_concurrency(2),
    );
    for spec in claim_jobs("site", &["u1", "u2", "u3", "u4"]) {
        h.scheduler.add_job(spec).unwrap();
    }

    let (cancel, task) = spawn(h.scheduler);
    assert!(wait_until(WAIT, || runner.call_count() == 2).await);

    // Many ticks later the slow jobs still hold both slots.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.call_count(), 2);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn open_circuit_blocks_target_then_resumes() {
    let runner = MockTaskRunner::new().with_target_result(
        "site",
        TaskResult::failure("503 Service Unavailable").with_status_code(503),
    );
    let mut h = harness(runner.clone(), NullStore, fast_config());
    for spec in claim_jobs("site", &["u1", "u2", "u3"]) {
        h.scheduler.add_job(spec).unwrap();
    }
    let handle = h.scheduler.handle();

    let (cancel, task) = spawn(h.scheduler);
    assert!(wait_until(WAIT, || h.reporter.count("job_failed") == 3).await);
    assert_eq!(h.reporter.count("circuit_opened"), 1);
    assert_eq!(handle.circuit_stats()[0].tripped_by, Some(ErrorCategory::FaucetDown));
    runner.clear_target_result("site");

    // Backoff (at most 78 minutes) has expired, the 2h circuit has not.
    h.clock.advance(TimeDelta::minutes(90));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.calls_for_target("site"), 3);

    h.clock.advance(TimeDelta::minutes(30));
    assert!(wait_until(WAIT, || h.reporter.count("job_succeeded") == 3).await);
    assert_eq!(runner.calls_for_target("site"), 6);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn challenge_cap_parks_account_until_reset() {
    let runner = MockTaskRunner::new().with_target_result(
        "site",
        TaskResult::failure("Checking your browser - security check"),
    );
    let mut h = harness(runner.clone(), NullStore, fast_config());
    h.scheduler
        .add_job(JobSpec::new("site", "alice", "claim"))
        .unwrap();
    let handle = h.scheduler.handle();

    let (cancel, task) = spawn(h.scheduler);
    for round in 1..=5 {
        assert!(wait_until(WAIT, || h.reporter.count("job_failed") == round).await);
        // Past both the backoff cap and the circuit cooldown.
        h.clock.advance(TimeDelta::hours(3));
    }
    assert!(wait_until(WAIT, || h.reporter.count("account_suspended") == 1).await);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(runner.calls_for_target("site"), 5);
    assert!(handle.challenge_status()[0].at_cap);

    runner.clear_target_result("site");
    assert_eq!(handle.reset_challenges(Some("site"), None), 1);
    assert!(wait_until(WAIT, || h.reporter.count("job_succeeded") == 1).await);

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn timeout_counts_as_transient() {
    let runner = MockTaskRunner::new().with_delay(Duration::from_secs(30));
    let config = fast_config().with_job_timeout(Duration::from_millis(50));
    let mut h = harness(runner, NullStore, config);
    let key = JobKey::new("site", "alice", "claim");
    h.scheduler
        .add_job(JobSpec::new("site", "alice", "claim"))
        .unwrap();
    let handle = h.scheduler.handle();

    let (cancel, task) = spawn(h.scheduler);
    assert!(wait_until(WAIT, || h.reporter.count("job_failed") == 1).await);

    let snapshot = handle.snapshot().await.unwrap();
    let job = snapshot.jobs.iter().find(|j| j.key == key).unwrap();
    assert_eq!(job.last_error, Some(ErrorCategory::Transient));
    assert_eq!(job.consecutive_failures, 1);
    assert!(handle.circuit_stats().iter().all(|s| s.tripped_by.is_none()));

    cancel.cancel();
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn shutdown_abandons_slow_jobs_and_frees_proxies() {
    let runner = MockTaskRunner::new().with_delay(Duration::from_secs(30));
    let pool = ProxyPool::default();
    pool.insert_validated(proxy_address(1));
    let store = MemoryStateStore::new();
    let config = fast_config().with_degraded_mode(5, 0);
    let mut h = harness(runner.clone(), store.clone(), config);
    h.scheduler = h.scheduler.with_pool(pool.clone());
    h.scheduler
        .add_job(JobSpec::new("site", "alice", "claim"))
        .unwrap();

    let (cancel, task) = spawn(h.scheduler);
    assert!(wait_until(WAIT, || runner.call_count() == 1).await);
    assert_eq!(runner.calls()[0].proxy.as_deref(), Some("http://10.0.0.1:8080"));

    cancel.cancel();
    task.await.unwrap().unwrap();

    assert_eq!(pool.health_summary(t0()).in_use, 0);
    assert_eq!(pool.endpoints()[0].consecutive_failures, 0);
    let saved = store.saved().unwrap();
    assert_eq!(saved.jobs[0].next_eligible_run_at, t0());
    assert_eq!(saved.jobs[0].consecutive_failures, 0);
}

#[tokio::test]
async fn handle_sets_priority_multiplier() {
    let runner = MockTaskRunner::new().with_delay(Duration::from_secs(30));
    let mut h = harness(runner, NullStore, fast_config().with_max_concurrency(1));
    h.scheduler.add_job(JobSpec::new("a", "u", "claim")).unwrap();
    h.scheduler.add_job(JobSpec::new("b", "u", "claim")).unwrap();
    let handle = h.scheduler.handle();

    handle.set_priority_multiplier("b", 0.5).unwrap();
    assert!(handle.set_priority_multiplier("b", -1.0).is_err());

    let (cancel, task) = spawn(h.scheduler);
    let snapshot = handle.snapshot().await.unwrap();
    let b = snapshot.jobs.iter().find(|j| j.key.target == "b").unwrap();
    assert_eq!(b.priority_multiplier, 0.5);

    cancel.cancel();
    task.await.unwrap().unwrap();
    assert!(handle.snapshot().await.is_err());
}
