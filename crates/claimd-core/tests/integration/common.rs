use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use claimd_core::AppError;
use claimd_core::scheduler::{JobScheduler, SchedulerConfig};
use claimd_core::testutil::{ManualClock, MockReporter, MockTaskRunner, t0};
use claimd_core::throttle::DomainThrottleConfig;
use claimd_core::traits::StateStore;

/// Millisecond ticks, no domain spacing, short grace.
pub fn fast_config() -> SchedulerConfig {
    SchedulerConfig::default()
        .with_tick_interval(Duration::from_millis(10))
        .with_shutdown_grace(Duration::from_millis(200))
        .with_persist_interval(Duration::from_secs(3600))
        .with_throttle(DomainThrottleConfig::new(TimeDelta::zero()))
}

pub struct Harness<S: StateStore> {
    pub clock: ManualClock,
    pub reporter: MockReporter,
    pub scheduler: JobScheduler<MockTaskRunner, S>,
}

pub fn harness<S: StateStore>(
    runner: MockTaskRunner,
    store: S,
    config: SchedulerConfig,
) -> Harness<S> {
    let clock = ManualClock::new(t0());
    let reporter = MockReporter::new();
    let scheduler = JobScheduler::new(runner, store, config)
        .with_clock(Arc::new(clock.clone()))
        .with_reporter(Arc::new(reporter.clone()));
    Harness {
        clock,
        reporter,
        scheduler,
    }
}

pub fn spawn<S: StateStore>(
    scheduler: JobScheduler<MockTaskRunner, S>,
) -> (CancellationToken, JoinHandle<Result<(), AppError>>) {
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(scheduler.run(cancel.clone()));
    (cancel, handle)
}

/// Poll `condition` every 5ms until it holds or `timeout` passes.
pub async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
