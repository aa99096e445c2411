use std::time::Duration;

use chrono::TimeDelta;

use claimd_core::classifier::ErrorCategory;
use claimd_core::job::{JobKey, JobSpec, TaskResult};
use claimd_core::proxy_pool::{ProxyPool, ReleaseOutcome};
use claimd_core::scheduler::TaskOutcome;
use claimd_core::state::JsonFileStore;
use claimd_core::testutil::{MockTaskRunner, proxy_address, t0};
use claimd_core::traits::StateStore;

use crate::integration::common::{fast_config, harness};

fn configured_jobs() -> Vec<JobSpec> {
    vec![
        JobSpec::new("site", "alice", "claim"),
        JobSpec::new("site", "bob", "claim"),
        JobSpec::new("other", "alice", "claim"),
    ]
}

#[tokio::test]
async fn restart_reproduces_schedule_pool_and_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.json");

    let pool = ProxyPool::default();
    for n in 1..=3 {
        pool.insert_validated(proxy_address(n));
    }
    let mut first = harness(
        MockTaskRunner::new(),
        JsonFileStore::new(&path),
        fast_config().with_degraded_mode(5, 0),
    );
    first.scheduler = first.scheduler.with_pool(pool.clone());
    for spec in configured_jobs() {
        first.scheduler.add_job(spec).unwrap();
    }

    let alice = JobKey::new("site", "alice", "claim");
    let bob = JobKey::new("site", "bob", "claim");
    let other = JobKey::new("other", "alice", "claim");

    let mut tick = first.scheduler.tick(t0());
    assert_eq!(tick.dispatches.len(), 3);
    for dispatch in tick.dispatches.drain(..) {
        let outcome = match dispatch.job.key.target.as_str() {
            "other" => TaskOutcome::Finished(TaskResult::failure("Account banned")),
            _ if dispatch.job.key.account == "alice" => {
                TaskOutcome::Finished(TaskResult::failure("Attention required! | Cloudflare"))
            }
            _ => TaskOutcome::Finished(TaskResult::failure("Proxy detected")),
        };
        first.scheduler.on_complete(
            &dispatch.job.key,
            dispatch.lease,
            outcome,
            Duration::from_millis(300),
            t0(),
        );
    }
    first.scheduler.persist().await.unwrap();

    let before_alice = first.scheduler.job(&alice).unwrap().clone();
    let before_bob = first.scheduler.job(&bob).unwrap().clone();
    let before_proxies = pool.endpoints();
    assert!(before_proxies.iter().any(|e| e.burn_until.is_some()));

    // Fresh process: same configuration, state from disk.
    let mut second = harness(
        MockTaskRunner::new(),
        JsonFileStore::new(&path),
        fast_config(),
    );
    for spec in configured_jobs() {
        second.scheduler.add_job(spec).unwrap();
    }
    assert!(second.scheduler.load_state().await.unwrap());

    let after_alice = second.scheduler.job(&alice).unwrap();
    assert_eq!(after_alice.next_eligible_run_at, before_alice.next_eligible_run_at);
    assert_eq!(after_alice.consecutive_failures, 1);
    assert_eq!(after_alice.last_error, Some(ErrorCategory::RateLimit));
    assert!(!after_alice.running);

    let after_bob = second.scheduler.job(&bob).unwrap();
    assert_eq!(after_bob.next_eligible_run_at, before_bob.next_eligible_run_at);
    assert_eq!(after_bob.last_error, Some(ErrorCategory::ProxyIssue));

    // The banned job stays gone.
    assert!(second.scheduler.job(&other).is_none());
    assert_eq!(second.scheduler.disabled()[0].key, other);

    assert_eq!(second.scheduler.pool().endpoints(), before_proxies);
    assert_eq!(second.scheduler.ledger().entries()[0].retries, 1);
    assert_eq!(second.scheduler.ledger().entries()[0].account, "alice");
}

#[tokio::test]
async fn burned_proxy_stays_out_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path().join("state.json"));

    let pool = ProxyPool::default();
    pool.insert_validated(proxy_address(1));
    let lease = pool.acquire("alice", t0()).unwrap();
    pool.release(lease, ReleaseOutcome::ProxyIssue, t0());

    let mut first = harness(MockTaskRunner::new(), store.clone(), fast_config());
    first.scheduler = first.scheduler.with_pool(pool);
    first.scheduler.persist().await.unwrap();

    let restored = ProxyPool::default();
    restored.restore(store.load().await.unwrap().unwrap().proxies);
    assert!(restored.acquire("alice", t0() + TimeDelta::hours(11)).is_none());
    assert!(restored.acquire("alice", t0() + TimeDelta::hours(12)).is_some());
}

#[tokio::test]
async fn missing_state_file_starts_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(
        MockTaskRunner::new(),
        JsonFileStore::new(dir.path().join("absent.json")),
        fast_config(),
    );
    h.scheduler.add_job(JobSpec::new("site", "alice", "claim")).unwrap();
    assert!(!h.scheduler.load_state().await.unwrap());
    assert_eq!(h.scheduler.jobs().count(), 1);
}
