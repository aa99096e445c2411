//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit and integration tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use crate::error::AppError;
use crate::job::{JobContext, JobKey, JobSpec, TaskResult};
use crate::proxy_pool::ProxyAddress;
use crate::reporter::{SchedulerEvent, SchedulerReporter};
use crate::state::StateSnapshot;
use crate::traits::{Clock, ProxyProbe, ProxySource, StateStore, TaskRunner};

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Fixed reference instant used across tests.
pub fn t0() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_default()
}

/// `http://10.0.0.<n>:8080`
pub fn proxy_address(n: u8) -> ProxyAddress {
    ProxyAddress {
        scheme: "http".to_string(),
        host: format!("10.0.0.{n}"),
        port: 8080,
        username: None,
        password: None,
    }
}

/// One claim job per account on `target`.
pub fn claim_jobs(target: &str, accounts: &[&str]) -> Vec<JobSpec> {
    accounts
        .iter()
        .map(|account| JobSpec::new(target, *account, "claim"))
        .collect()
}

// ---------------------------------------------------------------------------
// ManualClock
// ---------------------------------------------------------------------------

/// Clock that only moves when told to.
#[derive(Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}

// ---------------------------------------------------------------------------
// MockTaskRunner
// ---------------------------------------------------------------------------

/// One recorded `execute` call.
#[derive(Debug, Clone, PartialEq)]
pub struct RunnerCall {
    pub key: JobKey,
    /// Proxy id, if the job ran through one.
    pub proxy: Option<String>,
}

/// Mock runner with scripted results.
///
/// Resolution order per call: the per-target result if set, then the
/// queued responses, then a plain success.
#[derive(Clone)]
pub struct MockTaskRunner {
    responses: Arc<Mutex<VecDeque<Result<TaskResult, AppError>>>>,
    by_target: Arc<Mutex<HashMap<String, TaskResult>>>,
    delay: Option<Duration>,
    calls: Arc<Mutex<Vec<RunnerCall>>>,
}

impl MockTaskRunner {
    pub fn new() -> Self {
        Self {
            responses: Arc::new(Mutex::new(VecDeque::new())),
            by_target: Arc::new(Mutex::new(HashMap::new())),
            delay: None,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_responses(responses: Vec<Result<TaskResult, AppError>>) -> Self {
        let runner = Self::new();
        *runner.responses.lock().unwrap() = responses.into();
        runner
    }

    /// Every call for `target` returns `result`.
    pub fn with_target_result(self, target: &str, result: TaskResult) -> Self {
        self.set_target_result(target, result);
        self
    }

    /// Sleep this long before answering (to exercise timeouts).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn set_target_result(&self, target: &str, result: TaskResult) {
        self.by_target
            .lock()
            .unwrap()
            .insert(target.to_string(), result);
    }

    pub fn clear_target_result(&self, target: &str) {
        self.by_target.lock().unwrap().remove(target);
    }

    pub fn calls(&self) -> Vec<RunnerCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn calls_for_target(&self, target: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.key.target == target)
            .count()
    }
}

impl Default for MockTaskRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskRunner for MockTaskRunner {
    async fn execute(
        &self,
        job: &JobContext,
        proxy: Option<&ProxyAddress>,
    ) -> Result<TaskResult, AppError> {
        self.calls.lock().unwrap().push(RunnerCall {
            key: job.key.clone(),
            proxy: proxy.map(ProxyAddress::id),
        });
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(result) = self.by_target.lock().unwrap().get(&job.key.target) {
            return Ok(result.clone());
        }
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(TaskResult::success("ok")))
    }
}

// ---------------------------------------------------------------------------
// MockProxySource
// ---------------------------------------------------------------------------

/// Mock proxy source returning a settable list.
#[derive(Clone)]
pub struct MockProxySource {
    name: String,
    addresses: Arc<Mutex<Vec<ProxyAddress>>>,
    fail: Arc<Mutex<bool>>,
}

impl MockProxySource {
    pub fn new(name: &str, addresses: Vec<ProxyAddress>) -> Self {
        Self {
            name: name.to_string(),
            addresses: Arc::new(Mutex::new(addresses)),
            fail: Arc::new(Mutex::new(false)),
        }
    }

    pub fn failing(name: &str) -> Self {
        let source = Self::new(name, Vec::new());
        source.set_failing(true);
        source
    }

    pub fn set_addresses(&self, addresses: Vec<ProxyAddress>) {
        *self.addresses.lock().unwrap() = addresses;
    }

    pub fn set_failing(&self, fail: bool) {
        *self.fail.lock().unwrap() = fail;
    }
}

impl ProxySource for MockProxySource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self) -> Result<Vec<ProxyAddress>, AppError> {
        if *self.fail.lock().unwrap() {
            return Err(AppError::ProxyError(format!("{} unavailable", self.name)));
        }
        Ok(self.addresses.lock().unwrap().clone())
    }
}

// ---------------------------------------------------------------------------
// MockProbe
// ---------------------------------------------------------------------------

/// Mock probe: fixed latency, with a set of ids that always fail.
#[derive(Clone)]
pub struct MockProbe {
    latency: Duration,
    failing: Arc<Mutex<HashSet<String>>>,
    probed: Arc<Mutex<Vec<String>>>,
}

impl MockProbe {
    pub fn new(latency: Duration) -> Self {
        Self {
            latency,
            failing: Arc::new(Mutex::new(HashSet::new())),
            probed: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Probes of the proxy with this id fail.
    pub fn failing_for(self, id: &str) -> Self {
        self.failing.lock().unwrap().insert(id.to_string());
        self
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }
}

impl ProxyProbe for MockProbe {
    async fn probe(&self, proxy: &ProxyAddress) -> Result<Duration, AppError> {
        let id = proxy.id();
        self.probed.lock().unwrap().push(id.clone());
        if self.failing.lock().unwrap().contains(&id) {
            return Err(AppError::ProxyError(format!("{id} unreachable")));
        }
        Ok(self.latency)
    }
}

// ---------------------------------------------------------------------------
// MemoryStateStore
// ---------------------------------------------------------------------------

/// In-memory state store that counts saves.
#[derive(Clone, Default)]
pub struct MemoryStateStore {
    snapshot: Arc<Mutex<Option<StateSnapshot>>>,
    saves: Arc<Mutex<usize>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_snapshot(snapshot: StateSnapshot) -> Self {
        let store = Self::new();
        *store.snapshot.lock().unwrap() = Some(snapshot);
        store
    }

    pub fn saved(&self) -> Option<StateSnapshot> {
        self.snapshot.lock().unwrap().clone()
    }

    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap()
    }
}

impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<StateSnapshot>, AppError> {
        Ok(self.snapshot.lock().unwrap().clone())
    }

    async fn save(&self, snapshot: &StateSnapshot) -> Result<(), AppError> {
        *self.snapshot.lock().unwrap() = Some(snapshot.clone());
        *self.saves.lock().unwrap() += 1;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Records the kind of every event, plus the job key when there is one.
#[derive(Clone, Default)]
pub struct MockReporter {
    events: Arc<Mutex<Vec<(String, Option<String>)>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, Option<String>)> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| k == kind)
            .count()
    }
}

impl SchedulerReporter for MockReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        let key = match &event {
            SchedulerEvent::JobDispatched { key, .. }
            | SchedulerEvent::JobSucceeded { key, .. }
            | SchedulerEvent::JobFailed { key, .. }
            | SchedulerEvent::JobDisabled { key, .. } => Some(key.to_string()),
            _ => None,
        };
        self.events
            .lock()
            .unwrap()
            .push((event.kind().to_string(), key));
    }
}
