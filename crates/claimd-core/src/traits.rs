use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::AppError;
use crate::job::{JobContext, TaskResult};
use crate::proxy_pool::ProxyAddress;
use crate::state::StateSnapshot;

/// Runs the per-target task logic for one job.
///
/// Implemented once per target kind; the scheduler only ever sees this trait.
/// An `Err` is treated as a failed result and classified from its message.
pub trait TaskRunner: Send + Sync + Clone + 'static {
    fn execute(
        &self,
        job: &JobContext,
        proxy: Option<&ProxyAddress>,
    ) -> impl Future<Output = Result<TaskResult, AppError>> + Send;
}

/// Yields proxy endpoints from one provider (file, URL, static list).
pub trait ProxySource: Send + Sync {
    fn name(&self) -> &str;

    fn fetch(&self) -> impl Future<Output = Result<Vec<ProxyAddress>, AppError>> + Send;
}

/// Connectivity + latency check for a proxy before it is marked usable.
pub trait ProxyProbe: Send + Sync {
    fn probe(&self, proxy: &ProxyAddress)
    -> impl Future<Output = Result<Duration, AppError>> + Send;
}

/// Persists scheduler, pool and ledger state across restarts.
pub trait StateStore: Send + Sync + Clone + 'static {
    fn load(&self) -> impl Future<Output = Result<Option<StateSnapshot>, AppError>> + Send;

    fn save(&self, snapshot: &StateSnapshot) -> impl Future<Output = Result<(), AppError>> + Send;
}

/// Source of "now" for every time-based decision.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A no-op StateStore for use when persistence is not needed.
#[derive(Debug, Clone)]
pub struct NullStore;

impl StateStore for NullStore {
    async fn load(&self) -> Result<Option<StateSnapshot>, AppError> {
        Ok(None)
    }

    async fn save(&self, _snapshot: &StateSnapshot) -> Result<(), AppError> {
        Ok(())
    }
}
