//! The root of the orchestration core.
//!
//! [`JobScheduler`] owns the live job set, the execution budget and the
//! per-domain spacing map. Each tick it picks due jobs in priority order and
//! launches them; every completion goes through [`JobScheduler::on_complete`],
//! which consults the classifier, circuit breaker, challenge ledger, retry
//! policy and proxy pool in that fixed order.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::challenge::{ChallengeLedger, ChallengeOutcome, ChallengeStatus};
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerStats, CircuitTrip};
use crate::classifier::{ErrorCategory, FailureSignal, classify, classify_result};
use crate::error::AppError;
use crate::job::{DisabledJob, Job, JobContext, JobKey, JobSpec, TaskResult};
use crate::proxy_pool::{HealthSummary, ProxyLease, ProxyPool, ReleaseOutcome};
use crate::reporter::{SchedulerEvent, SchedulerReporter, TracingReporter};
use crate::retry::{RetryAction, RetryPolicy};
use crate::state::{SNAPSHOT_VERSION, StateSnapshot};
use crate::throttle::{DomainThrottle, DomainThrottleConfig};
use crate::traits::{Clock, StateStore, SystemClock, TaskRunner};

/// Configuration for the scheduler loop and its budget.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Concurrent jobs when the proxy pool is healthy.
    pub max_concurrency: usize,
    /// Concurrent jobs while the pool is degraded.
    pub degraded_concurrency: usize,
    /// Below this many healthy endpoints the pool counts as degraded.
    pub degraded_proxy_threshold: usize,
    pub tick_interval: Duration,
    /// Hard per-job deadline.
    pub job_timeout: Duration,
    /// How long shutdown waits for in-flight jobs.
    pub shutdown_grace: Duration,
    pub persist_interval: Duration,
    /// Refuse to run jobs without a proxy, even when the pool is empty.
    pub require_proxy: bool,
    pub throttle: DomainThrottleConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            degraded_concurrency: 2,
            degraded_proxy_threshold: 10,
            tick_interval: Duration::from_secs(5),
            job_timeout: Duration::from_secs(600),
            shutdown_grace: Duration::from_secs(30),
            persist_interval: Duration::from_secs(300),
            require_proxy: false,
            throttle: DomainThrottleConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_degraded_mode(mut self, concurrency: usize, proxy_threshold: usize) -> Self {
        self.degraded_concurrency = concurrency;
        self.degraded_proxy_threshold = proxy_threshold;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_persist_interval(mut self, interval: Duration) -> Self {
        self.persist_interval = interval;
        self
    }

    pub fn with_require_proxy(mut self, require: bool) -> Self {
        self.require_proxy = require;
        self
    }

    pub fn with_throttle(mut self, throttle: DomainThrottleConfig) -> Self {
        self.throttle = throttle;
        self
    }
}

/// One job launched by a tick.
#[derive(Debug, Clone)]
pub struct Dispatch {
    pub run_id: Uuid,
    pub job: JobContext,
    pub lease: Option<ProxyLease>,
}

/// What a tick did, and why it left due jobs alone.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub dispatches: Vec<Dispatch>,
    pub deferred_spacing: usize,
    pub skipped_circuit: usize,
    pub skipped_challenge: usize,
    pub deferred_no_proxy: usize,
    /// Effective concurrency limit for this tick.
    pub budget: usize,
    pub degraded: bool,
}

/// How a dispatched job ended.
#[derive(Debug)]
pub enum TaskOutcome {
    Finished(TaskResult),
    Errored(AppError),
    TimedOut,
}

/// Everything the completion funnel decided for one job.
#[derive(Debug, Clone)]
pub struct CompletionReport {
    pub key: JobKey,
    /// `None` on success.
    pub category: Option<ErrorCategory>,
    pub action: RetryAction,
    /// `None` once the job is disabled.
    pub next_run_at: Option<DateTime<Utc>>,
    pub circuit_trip: Option<CircuitTrip>,
    pub challenge: Option<ChallengeOutcome>,
    pub release: Option<ReleaseOutcome>,
}

/// Commands that must be applied by the scheduler loop itself.
#[derive(Debug)]
enum ControlCommand {
    SetPriorityMultiplier { target: String, multiplier: f64 },
    Snapshot(oneshot::Sender<StateSnapshot>),
}

struct InFlight {
    key: JobKey,
    lease: Option<ProxyLease>,
}

type JobRun = (TaskOutcome, Duration);

fn validate_multiplier(multiplier: f64) -> Result<(), AppError> {
    if multiplier.is_finite() && multiplier > 0.0 {
        Ok(())
    } else {
        Err(AppError::ConfigError(format!(
            "Priority multiplier must be a positive number, got {multiplier}"
        )))
    }
}

pub struct JobScheduler<R, S>
where
    R: TaskRunner,
    S: StateStore,
{
    config: SchedulerConfig,
    runner: R,
    store: S,
    jobs: BTreeMap<JobKey, Job>,
    disabled: Vec<DisabledJob>,
    pool: ProxyPool,
    circuit: CircuitBreaker,
    ledger: ChallengeLedger,
    retry: RetryPolicy,
    throttle: DomainThrottle,
    clock: Arc<dyn Clock>,
    reporter: Arc<dyn SchedulerReporter>,
    control_tx: mpsc::UnboundedSender<ControlCommand>,
    control_rx: Option<mpsc::UnboundedReceiver<ControlCommand>>,
}

impl<R, S> JobScheduler<R, S>
where
    R: TaskRunner,
    S: StateStore,
{
    pub fn new(runner: R, store: S, config: SchedulerConfig) -> Self {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        Self {
            throttle: DomainThrottle::new(config.throttle.clone()),
            config,
            runner,
            store,
            jobs: BTreeMap::new(),
            disabled: Vec::new(),
            pool: ProxyPool::default(),
            circuit: CircuitBreaker::default(),
            ledger: ChallengeLedger::default(),
            retry: RetryPolicy::default(),
            clock: Arc::new(SystemClock),
            reporter: Arc::new(TracingReporter),
            control_tx,
            control_rx: Some(control_rx),
        }
    }

    pub fn with_pool(mut self, pool: ProxyPool) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_circuit_breaker(mut self, circuit: CircuitBreaker) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_ledger(mut self, ledger: ChallengeLedger) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SchedulerReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn pool(&self) -> &ProxyPool {
        &self.pool
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.circuit
    }

    pub fn ledger(&self) -> &ChallengeLedger {
        &self.ledger
    }

    pub fn job(&self, key: &JobKey) -> Option<&Job> {
        self.jobs.get(key)
    }

    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    pub fn disabled(&self) -> &[DisabledJob] {
        &self.disabled
    }

    pub fn handle(&self) -> SchedulerHandle {
        SchedulerHandle {
            tx: self.control_tx.clone(),
            pool: self.pool.clone(),
            circuit: self.circuit.clone(),
            ledger: self.ledger.clone(),
            clock: self.clock.clone(),
        }
    }

    /// Register a job, eligible immediately.
    ///
    /// Returns `Ok(false)` for a key that was disabled by a permanent failure.
    pub fn add_job(&mut self, spec: JobSpec) -> Result<bool, AppError> {
        let key = spec.key();
        if self.jobs.contains_key(&key) {
            return Err(AppError::ConfigError(format!("Duplicate job {key}")));
        }
        if self.disabled.iter().any(|d| d.key == key) {
            tracing::info!(job = %key, "Skipping disabled job");
            return Ok(false);
        }
        let job = spec.into_job(self.clock.now());
        self.jobs.insert(key, job);
        Ok(true)
    }

    /// Set the multiplier for every job of `target`. Returns the number of jobs updated.
    pub fn set_priority_multiplier(
        &mut self,
        target: &str,
        multiplier: f64,
    ) -> Result<usize, AppError> {
        validate_multiplier(multiplier)?;
        let mut updated = 0;
        for job in self.jobs.values_mut().filter(|j| j.key.target == target) {
            job.priority_multiplier = multiplier;
            updated += 1;
        }
        tracing::info!(%target, %multiplier, %updated, "Priority multiplier set");
        Ok(updated)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    pub fn snapshot(&self, now: DateTime<Utc>) -> StateSnapshot {
        StateSnapshot {
            version: SNAPSHOT_VERSION,
            saved_at: now,
            jobs: self.jobs.values().cloned().collect(),
            disabled: self.disabled.clone(),
            proxies: self.pool.endpoints(),
            challenges: self.ledger.entries(),
        }
    }

    /// Apply persisted state on top of the configured jobs.
    ///
    /// Runtime fields of configured jobs are restored; persisted jobs no longer
    /// configured are dropped, and disabled keys are removed from the live set.
    pub fn restore(&mut self, snapshot: StateSnapshot) {
        for disabled in snapshot.disabled {
            if self.jobs.remove(&disabled.key).is_some() {
                tracing::info!(job = %disabled.key, reason = %disabled.reason, "Job stays disabled");
            }
            if !self.disabled.iter().any(|d| d.key == disabled.key) {
                self.disabled.push(disabled);
            }
        }

        let mut restored = 0;
        for saved in snapshot.jobs {
            let Some(job) = self.jobs.get_mut(&saved.key) else {
                tracing::debug!(job = %saved.key, "Dropping persisted job that is no longer configured");
                continue;
            };
            job.next_eligible_run_at = saved.next_eligible_run_at;
            job.consecutive_failures = saved.consecutive_failures;
            job.last_error = saved.last_error;
            job.last_status = saved.last_status;
            job.last_success_at = saved.last_success_at;
            job.total_amount = saved.total_amount;
            job.priority_multiplier = saved.priority_multiplier;
            restored += 1;
        }

        if !snapshot.proxies.is_empty() {
            self.pool.restore(snapshot.proxies);
        }
        self.ledger.restore(snapshot.challenges);

        tracing::info!(
            jobs = restored,
            disabled = self.disabled.len(),
            saved_at = %snapshot.saved_at,
            "State restored"
        );
    }

    /// Load and apply the store's snapshot, if there is one.
    pub async fn load_state(&mut self) -> Result<bool, AppError> {
        match self.store.load().await? {
            Some(snapshot) => {
                self.restore(snapshot);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub async fn persist(&self) -> Result<(), AppError> {
        let snapshot = self.snapshot(self.clock.now());
        self.store.save(&snapshot).await?;
        self.reporter.report(SchedulerEvent::StatePersisted {
            jobs: snapshot.jobs.len(),
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Pick due jobs and claim their resources.
    ///
    /// Dispatched jobs are marked running; the caller must feed each one back
    /// through [`on_complete`](Self::on_complete) or [`abandon`](Self::abandon).
    pub fn tick(&mut self, now: DateTime<Utc>) -> TickReport {
        let health = self.pool.health_summary(now);
        let pool_empty = health.total == 0;
        let degraded = !pool_empty && health.healthy < self.config.degraded_proxy_threshold;
        let limit = if degraded {
            self.config.degraded_concurrency.min(self.config.max_concurrency)
        } else {
            self.config.max_concurrency
        };
        // In-flight jobs hold their slot until completed or abandoned.
        let running = self.jobs.values().filter(|j| j.running).count();
        let mut remaining = limit.saturating_sub(running);

        let mut report = TickReport {
            budget: limit,
            degraded,
            ..Default::default()
        };

        let mut due: Vec<&Job> = self.jobs.values().filter(|j| j.is_due(now)).collect();
        due.sort_by(|a, b| {
            a.effective_priority()
                .total_cmp(&b.effective_priority())
                .then_with(|| a.next_eligible_run_at.cmp(&b.next_eligible_run_at))
                .then_with(|| a.key.cmp(&b.key))
        });
        let due: Vec<JobKey> = due.into_iter().map(|j| j.key.clone()).collect();

        for key in due {
            if remaining == 0 {
                break;
            }
            let Some(job) = self.jobs.get(&key) else {
                continue;
            };
            if self.circuit.is_open(&key.target, now) {
                report.skipped_circuit += 1;
                continue;
            }
            if self.ledger.is_suspended(&key.target, &key.account, now) {
                report.skipped_challenge += 1;
                continue;
            }
            if self.throttle.remaining(&job.domain, now).is_some() {
                report.deferred_spacing += 1;
                continue;
            }

            let lease = if pool_empty {
                if self.config.require_proxy {
                    report.deferred_no_proxy += 1;
                    continue;
                }
                None
            } else {
                match self.pool.acquire(&key.account, now) {
                    Some(lease) => Some(lease),
                    None => {
                        report.deferred_no_proxy += 1;
                        continue;
                    }
                }
            };

            let domain = job.domain.clone();
            self.throttle.record(&domain, now);
            let Some(job) = self.jobs.get_mut(&key) else {
                continue;
            };
            job.running = true;
            remaining -= 1;

            self.reporter.report(SchedulerEvent::JobDispatched {
                key: &key,
                proxy: lease.as_ref().map(|l| l.endpoint_id.as_str()),
            });
            report.dispatches.push(Dispatch {
                run_id: Uuid::new_v4(),
                job: job.context(),
                lease,
            });
        }

        self.reporter.report(SchedulerEvent::TickCompleted {
            dispatched: report.dispatches.len(),
            budget: report.budget,
            degraded: report.degraded,
        });
        report
    }

    // -----------------------------------------------------------------------
    // Completion funnel
    // -----------------------------------------------------------------------

    /// Apply a job's outcome: classify, circuit breaker, challenge ledger,
    /// retry decision, proxy release, job update.
    ///
    /// Returns `None` if the job is no longer known (its lease is still released).
    pub fn on_complete(
        &mut self,
        key: &JobKey,
        lease: Option<ProxyLease>,
        outcome: TaskOutcome,
        elapsed: Duration,
        now: DateTime<Utc>,
    ) -> Option<CompletionReport> {
        let Some(job) = self.jobs.get(key) else {
            tracing::warn!(job = %key, "Completion for unknown job");
            if let Some(lease) = lease {
                self.pool.release(lease, ReleaseOutcome::Neutral, now);
            }
            return None;
        };
        let prior_failures = job.consecutive_failures;
        let interval = job.interval();

        // 1. Classify.
        let Classified {
            category,
            status,
            status_code,
            source,
            page_excerpt,
        } = classify_outcome(&outcome, self.config.job_timeout);
        tracing::info!(
            job = %key,
            category = category.map_or("success", |c| c.as_str()),
            source,
            status_code = ?status_code,
            %status,
            page = page_excerpt.as_deref().unwrap_or(""),
            prior_failures,
            "Outcome classified"
        );

        // 2. Circuit breaker.
        let circuit_trip = self.circuit.record(&key.target, category, now);
        if let Some(trip) = &circuit_trip {
            self.reporter.report(SchedulerEvent::CircuitOpened { trip });
        }

        // 3. Challenge ledger.
        let challenge = match category {
            None => {
                self.ledger.record_success(&key.target, &key.account);
                None
            }
            Some(ErrorCategory::RateLimit) => {
                let outcome = self.ledger.record_challenge(&key.target, &key.account, now);
                if outcome.at_cap {
                    self.reporter.report(SchedulerEvent::AccountSuspended {
                        target: &key.target,
                        account: &key.account,
                        retries: outcome.retries,
                    });
                }
                Some(outcome)
            }
            Some(_) => None,
        };

        // 4. Retry decision.
        let suggested = match &outcome {
            TaskOutcome::Finished(result) => result
                .next_run_minutes
                .map(|m| TimeDelta::minutes(i64::from(m))),
            _ => None,
        };
        let action = match category {
            None => requeue_after(suggested.unwrap_or(interval)),
            Some(ErrorCategory::Unknown) if suggested.is_some() => {
                requeue_after(suggested.unwrap_or(interval))
            }
            Some(category) => self.retry.decide(category, prior_failures),
        };

        // 5. Proxy release.
        let release = lease.map(|lease| {
            let latency = match &outcome {
                TaskOutcome::Finished(result) => result
                    .latency_ms
                    .map(Duration::from_millis)
                    .or(Some(elapsed)),
                _ => Some(elapsed),
            };
            let release = ReleaseOutcome::from_category(category, latency);
            self.pool.release(lease, release, now);
            release
        });

        // 6. Job update.
        let next_run_at = match action.delay() {
            Some(delay) => Some(now + delay),
            None => {
                let reason = format!(
                    "{}: {}",
                    category.unwrap_or(ErrorCategory::Permanent),
                    status
                );
                self.jobs.remove(key);
                self.disabled.push(DisabledJob {
                    key: key.clone(),
                    reason: reason.clone(),
                    disabled_at: now,
                });
                self.reporter.report(SchedulerEvent::JobDisabled {
                    key,
                    reason: &reason,
                });
                None
            }
        };

        if let (Some(next_run_at), Some(job)) = (next_run_at, self.jobs.get_mut(key)) {
            job.running = false;
            job.next_eligible_run_at = next_run_at;
            job.last_status = Some(status.clone());
            match category {
                None => {
                    job.consecutive_failures = 0;
                    job.last_error = None;
                    job.last_success_at = Some(now);
                    let amount = match &outcome {
                        TaskOutcome::Finished(result) => result.amount,
                        _ => None,
                    };
                    if let Some(amount) = amount {
                        job.total_amount += amount;
                    }
                    self.reporter.report(SchedulerEvent::JobSucceeded {
                        key,
                        status: &status,
                        amount,
                        next_run_at,
                    });
                }
                Some(category) => {
                    job.consecutive_failures = job.consecutive_failures.saturating_add(1);
                    job.last_error = Some(category);
                    self.reporter.report(SchedulerEvent::JobFailed {
                        key,
                        category,
                        status: &status,
                        next_run_at,
                    });
                }
            }
        }

        Some(CompletionReport {
            key: key.clone(),
            category,
            action,
            next_run_at,
            circuit_trip,
            challenge,
            release,
        })
    }

    /// Undo a dispatch that never produced an outcome (shutdown abort).
    ///
    /// The job keeps its schedule and the proxy is released without a health change.
    pub fn abandon(&mut self, key: &JobKey, lease: Option<ProxyLease>, now: DateTime<Utc>) {
        if let Some(job) = self.jobs.get_mut(key) {
            job.running = false;
        }
        if let Some(lease) = lease {
            self.pool.release(lease, ReleaseOutcome::Neutral, now);
        }
        tracing::debug!(job = %key, "Dispatch abandoned");
    }

    // -----------------------------------------------------------------------
    // Loop
    // -----------------------------------------------------------------------

    fn spawn_dispatch(
        &self,
        dispatch: Dispatch,
        tasks: &mut JoinSet<JobRun>,
        in_flight: &mut HashMap<tokio::task::Id, InFlight>,
    ) {
        let runner = self.runner.clone();
        let timeout = self.config.job_timeout;
        let context = dispatch.job;
        let proxy = dispatch.lease.as_ref().map(|l| l.address.clone());
        let key = context.key.clone();
        let run_id = dispatch.run_id;

        let handle = tasks.spawn(async move {
            let started = Instant::now();
            let outcome =
                match tokio::time::timeout(timeout, runner.execute(&context, proxy.as_ref())).await
                {
                    Ok(Ok(result)) => TaskOutcome::Finished(result),
                    Ok(Err(e)) => TaskOutcome::Errored(e),
                    Err(_) => TaskOutcome::TimedOut,
                };
            tracing::debug!(%run_id, job = %context.key, elapsed_ms = started.elapsed().as_millis() as u64, "Job run finished");
            (outcome, started.elapsed())
        });
        in_flight.insert(
            handle.id(),
            InFlight {
                key,
                lease: dispatch.lease,
            },
        );
    }

    fn handle_joined(
        &mut self,
        joined: Result<(tokio::task::Id, JobRun), JoinError>,
        in_flight: &mut HashMap<tokio::task::Id, InFlight>,
    ) {
        let now = self.clock.now();
        match joined {
            Ok((id, (outcome, elapsed))) => {
                if let Some(run) = in_flight.remove(&id) {
                    self.on_complete(&run.key, run.lease, outcome, elapsed, now);
                }
            }
            Err(e) => {
                let Some(run) = in_flight.remove(&e.id()) else {
                    return;
                };
                if e.is_cancelled() {
                    self.abandon(&run.key, run.lease, now);
                } else {
                    tracing::error!(job = %run.key, error = %e, "Job task panicked");
                    let outcome = TaskOutcome::Errored(AppError::TaskError(format!(
                        "task panicked: {e}"
                    )));
                    self.on_complete(&run.key, run.lease, outcome, Duration::ZERO, now);
                }
            }
        }
    }

    fn apply_control(&mut self, command: ControlCommand) {
        match command {
            ControlCommand::SetPriorityMultiplier { target, multiplier } => {
                if let Err(e) = self.set_priority_multiplier(&target, multiplier) {
                    tracing::warn!(%target, error = %e, "Rejected priority multiplier");
                }
            }
            ControlCommand::Snapshot(reply) => {
                let _ = reply.send(self.snapshot(self.clock.now()));
            }
        }
    }

    /// Run the scheduler until cancellation, then drain and persist.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<(), AppError> {
        let Some(mut control_rx) = self.control_rx.take() else {
            return Err(AppError::Generic("Scheduler control channel already taken".into()));
        };
        self.reporter.report(SchedulerEvent::Started {
            jobs: self.jobs.len(),
            disabled: self.disabled.len(),
        });

        let mut tasks: JoinSet<JobRun> = JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, InFlight> = HashMap::new();

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut persist_timer = tokio::time::interval_at(
            tokio::time::Instant::now() + self.config.persist_interval,
            self.config.persist_interval,
        );

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick(self.clock.now());
                    for dispatch in report.dispatches {
                        self.spawn_dispatch(dispatch, &mut tasks, &mut in_flight);
                    }
                }
                Some(joined) = tasks.join_next_with_id() => {
                    self.handle_joined(joined, &mut in_flight);
                }
                _ = persist_timer.tick() => {
                    if let Err(e) = self.persist().await {
                        tracing::error!(error = %e, "Failed to persist state");
                    }
                }
                Some(command) = control_rx.recv() => {
                    self.apply_control(command);
                }
            }
        }

        // Graceful shutdown: no new launches, wait out the grace period.
        self.reporter.report(SchedulerEvent::ShuttingDown {
            in_flight: tasks.len(),
        });
        let grace = tokio::time::sleep(self.config.shutdown_grace);
        tokio::pin!(grace);
        while !tasks.is_empty() {
            tokio::select! {
                () = &mut grace => break,
                Some(joined) = tasks.join_next_with_id() => {
                    self.handle_joined(joined, &mut in_flight);
                }
            }
        }

        tasks.abort_all();
        while let Some(joined) = tasks.join_next_with_id().await {
            self.handle_joined(joined, &mut in_flight);
        }

        let persisted = self.persist().await;
        self.reporter.report(SchedulerEvent::Stopped);
        persisted
    }
}

/// Longest page excerpt written to the classification log.
const PAGE_EXCERPT_CHARS: usize = 160;

/// A classified outcome together with the inputs it was derived from.
#[derive(Debug, Clone, PartialEq)]
struct Classified {
    category: Option<ErrorCategory>,
    status: String,
    status_code: Option<u16>,
    /// `success`, `explicit` (task override), `rules`, or `timeout`.
    source: &'static str,
    page_excerpt: Option<String>,
}

fn classify_outcome(outcome: &TaskOutcome, job_timeout: Duration) -> Classified {
    match outcome {
        TaskOutcome::Finished(result) => Classified {
            category: classify_result(result),
            status: result.status.clone(),
            status_code: result.status_code,
            source: if result.success {
                "success"
            } else if result.error_category.is_some() {
                "explicit"
            } else {
                "rules"
            },
            page_excerpt: result.page_content.as_deref().map(excerpt),
        },
        TaskOutcome::Errored(e) => Classified {
            category: Some(classify(&FailureSignal::from_error(e))),
            status: e.to_string(),
            status_code: e.status_code(),
            source: "rules",
            page_excerpt: None,
        },
        TaskOutcome::TimedOut => Classified {
            category: Some(ErrorCategory::Transient),
            status: format!("timed out after {}s", job_timeout.as_secs()),
            status_code: None,
            source: "timeout",
            page_excerpt: None,
        },
    }
}

/// Whitespace-collapsed prefix of `text`.
fn excerpt(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    match flat.char_indices().nth(PAGE_EXCERPT_CHARS) {
        Some((idx, _)) => format!("{}...", &flat[..idx]),
        None => flat,
    }
}

fn requeue_after(delay: TimeDelta) -> RetryAction {
    if delay <= TimeDelta::zero() {
        RetryAction::Immediate
    } else {
        RetryAction::Requeue { delay }
    }
}

/// Cheap-clone control surface for a scheduler.
///
/// Ledger, circuit and pool operations act on the shared handles directly;
/// job-level changes are queued to the running loop.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<ControlCommand>,
    pool: ProxyPool,
    circuit: CircuitBreaker,
    ledger: ChallengeLedger,
    clock: Arc<dyn Clock>,
}

impl SchedulerHandle {
    pub fn set_priority_multiplier(
        &self,
        target: impl Into<String>,
        multiplier: f64,
    ) -> Result<(), AppError> {
        validate_multiplier(multiplier)?;
        self.tx
            .send(ControlCommand::SetPriorityMultiplier {
                target: target.into(),
                multiplier,
            })
            .map_err(|_| AppError::Generic("Scheduler is not running".into()))
    }

    /// Scoped challenge reset; `None` matches everything. Returns entries cleared.
    pub fn reset_challenges(&self, target: Option<&str>, account: Option<&str>) -> usize {
        self.ledger.reset(target, account)
    }

    pub fn reset_circuit(&self, target: &str) {
        self.circuit.reset(target);
    }

    pub fn circuit_stats(&self) -> Vec<CircuitBreakerStats> {
        self.circuit.stats(self.clock.now())
    }

    pub fn challenge_status(&self) -> Vec<ChallengeStatus> {
        self.ledger.status(self.clock.now())
    }

    pub fn proxy_health(&self) -> HealthSummary {
        self.pool.health_summary(self.clock.now())
    }

    /// Ask the running loop for a consistent snapshot.
    pub async fn snapshot(&self) -> Result<StateSnapshot, AppError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(ControlCommand::Snapshot(reply_tx))
            .map_err(|_| AppError::Generic("Scheduler is not running".into()))?;
        reply_rx
            .await
            .map_err(|_| AppError::Generic("Scheduler stopped before replying".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::CircuitState;
    use crate::retry::RetryPolicyConfig;
    use crate::testutil::{ManualClock, MockReporter, MockTaskRunner, proxy_address, t0};
    use crate::traits::NullStore;

    fn quiet_config() -> SchedulerConfig {
        SchedulerConfig::default().with_throttle(DomainThrottleConfig::new(TimeDelta::zero()))
    }

    fn scheduler(config: SchedulerConfig) -> (JobScheduler<MockTaskRunner, NullStore>, ManualClock) {
        let clock = ManualClock::new(t0());
        let scheduler = JobScheduler::new(MockTaskRunner::new(), NullStore, config)
            .with_clock(Arc::new(clock.clone()));
        (scheduler, clock)
    }

    fn finished(result: TaskResult) -> TaskOutcome {
        TaskOutcome::Finished(result)
    }

    fn fail_with(category: ErrorCategory) -> TaskOutcome {
        finished(TaskResult::failure("failed").with_category(category))
    }

    fn complete(
        s: &mut JobScheduler<MockTaskRunner, NullStore>,
        key: &JobKey,
        outcome: TaskOutcome,
        now: DateTime<Utc>,
    ) -> CompletionReport {
        s.on_complete(key, None, outcome, Duration::from_millis(50), now)
            .unwrap()
    }

    #[test]
    fn test_classification_records_its_inputs() {
        let page = format!("<h1>Attention   required</h1>\n{}", "x".repeat(500));
        let detected = finished(
            TaskResult::failure("blocked")
                .with_status_code(403)
                .with_page_content(page),
        );
        let classified = classify_outcome(&detected, Duration::from_secs(600));
        assert_eq!(classified.category, Some(ErrorCategory::RateLimit));
        assert_eq!(classified.source, "rules");
        assert_eq!(classified.status_code, Some(403));
        let page = classified.page_excerpt.unwrap();
        assert!(page.starts_with("<h1>Attention required</h1> xxx"));
        assert!(page.ends_with("..."));
        assert_eq!(page.chars().count(), PAGE_EXCERPT_CHARS + 3);

        let explicit = classify_outcome(&fail_with(ErrorCategory::ConfigError), Duration::ZERO);
        assert_eq!(explicit.category, Some(ErrorCategory::ConfigError));
        assert_eq!(explicit.source, "explicit");
        assert_eq!(explicit.page_excerpt, None);

        let ok = classify_outcome(&finished(TaskResult::success("claimed")), Duration::ZERO);
        assert_eq!((ok.category, ok.source), (None, "success"));

        let timed_out = classify_outcome(&TaskOutcome::TimedOut, Duration::from_secs(90));
        assert_eq!(timed_out.category, Some(ErrorCategory::Transient));
        assert_eq!(timed_out.source, "timeout");
        assert_eq!(timed_out.status, "timed out after 90s");
    }

    #[test]
    fn test_tick_orders_by_effective_priority_within_budget() {
        let (mut s, _) = scheduler(quiet_config().with_max_concurrency(2));
        s.add_job(JobSpec::new("a", "u", "claim").with_priority(5)).unwrap();
        s.add_job(JobSpec::new("b", "u", "claim").with_priority(1)).unwrap();
        s.add_job(JobSpec::new("c", "u", "claim").with_priority(3)).unwrap();

        let report = s.tick(t0());
        let targets: Vec<_> = report
            .dispatches
            .iter()
            .map(|d| d.job.key.target.as_str())
            .collect();
        assert_eq!(targets, vec!["b", "c"]);
        assert_eq!(report.budget, 2);
        assert!(!report.degraded);
    }

    #[test]
    fn test_priority_multiplier_reorders() {
        let (mut s, _) = scheduler(quiet_config().with_max_concurrency(1));
        s.add_job(JobSpec::new("a", "u", "claim").with_priority(10)).unwrap();
        s.add_job(JobSpec::new("b", "u", "claim").with_priority(4)).unwrap();
        assert_eq!(s.set_priority_multiplier("a", 0.2).unwrap(), 1);

        let report = s.tick(t0());
        assert_eq!(report.dispatches[0].job.key.target, "a");
        assert!(s.set_priority_multiplier("a", f64::NAN).is_err());
        assert!(s.set_priority_multiplier("a", 0.0).is_err());
    }

    #[test]
    fn test_running_job_is_never_dispatched_twice() {
        let (mut s, _) = scheduler(quiet_config());
        s.add_job(JobSpec::new("a", "u", "claim")).unwrap();
        assert_eq!(s.tick(t0()).dispatches.len(), 1);
        assert!(s.tick(t0()).dispatches.is_empty());
    }

    #[test]
    fn test_duplicate_job_rejected() {
        let (mut s, _) = scheduler(quiet_config());
        s.add_job(JobSpec::new("a", "u", "claim")).unwrap();
        assert!(matches!(
            s.add_job(JobSpec::new("a", "u", "claim")),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn test_domain_spacing_defers_second_account() {
        let config = SchedulerConfig::default()
            .with_throttle(DomainThrottleConfig::new(TimeDelta::seconds(30)));
        let (mut s, _) = scheduler(config);
        s.add_job(JobSpec::new("site", "alice", "claim")).unwrap();
        s.add_job(JobSpec::new("site", "bob", "claim")).unwrap();

        let report = s.tick(t0());
        assert_eq!(report.dispatches.len(), 1);
        assert_eq!(report.deferred_spacing, 1);

        let report = s.tick(t0() + TimeDelta::seconds(30));
        assert_eq!(report.dispatches.len(), 1);
        assert_eq!(report.dispatches[0].job.key.account, "bob");
    }

    #[test]
    fn test_degraded_budget_when_few_healthy_proxies() {
        let pool = ProxyPool::default();
        for n in 1..=3 {
            pool.insert_validated(proxy_address(n));
        }
        let (s, _) = scheduler(quiet_config());
        let mut s = s.with_pool(pool);
        for account in ["a", "b", "c", "d"] {
            s.add_job(JobSpec::new(format!("site-{account}"), account, "claim")).unwrap();
        }

        let report = s.tick(t0());
        assert!(report.degraded);
        assert_eq!(report.budget, 2);
        assert_eq!(report.dispatches.len(), 2);
        assert!(report.dispatches.iter().all(|d| d.lease.is_some()));
    }

    #[test]
    fn test_busy_pool_defers_and_empty_pool_runs_direct() {
        let pool = ProxyPool::default();
        pool.insert_validated(proxy_address(1));
        let (s, _) = scheduler(quiet_config().with_degraded_mode(5, 0));
        let mut s = s.with_pool(pool);
        s.add_job(JobSpec::new("a", "alice", "claim")).unwrap();
        s.add_job(JobSpec::new("b", "bob", "claim")).unwrap();

        let report = s.tick(t0());
        assert_eq!(report.dispatches.len(), 1);
        assert_eq!(report.deferred_no_proxy, 1);

        let (mut direct, _) = scheduler(quiet_config());
        direct.add_job(JobSpec::new("a", "alice", "claim")).unwrap();
        let report = direct.tick(t0());
        assert!(report.dispatches[0].lease.is_none());
    }

    #[test]
    fn test_require_proxy_with_empty_pool_defers() {
        let (mut s, _) = scheduler(quiet_config().with_require_proxy(true));
        s.add_job(JobSpec::new("a", "alice", "claim")).unwrap();
        let report = s.tick(t0());
        assert!(report.dispatches.is_empty());
        assert_eq!(report.deferred_no_proxy, 1);
    }

    #[test]
    fn test_success_uses_suggestion_and_resets_failures() {
        let (mut s, _) = scheduler(quiet_config());
        let key = JobKey::new("a", "alice", "claim");
        s.add_job(JobSpec::new("a", "alice", "claim").with_interval_minutes(60)).unwrap();

        complete(&mut s, &key, fail_with(ErrorCategory::Transient), t0());
        assert_eq!(s.job(&key).unwrap().consecutive_failures, 1);

        let report = complete(
            &mut s,
            &key,
            finished(TaskResult::success("claimed").with_amount(0.5).with_next_run_minutes(15)),
            t0(),
        );
        assert_eq!(report.category, None);
        assert_eq!(report.next_run_at, Some(t0() + TimeDelta::minutes(15)));

        let job = s.job(&key).unwrap();
        assert_eq!(job.consecutive_failures, 0);
        assert_eq!(job.last_error, None);
        assert_eq!(job.last_success_at, Some(t0()));
        assert_eq!(job.total_amount, 0.5);
        assert!(!job.running);

        let report = complete(&mut s, &key, finished(TaskResult::success("ok")), t0());
        assert_eq!(report.next_run_at, Some(t0() + TimeDelta::minutes(60)));
    }

    #[test]
    fn test_failure_requeues_with_backoff() {
        let retry = RetryPolicy::new(RetryPolicyConfig::default().with_jitter_fraction(0.0));
        let (s, _) = scheduler(quiet_config());
        let mut s = s.with_retry_policy(retry);
        let key = JobKey::new("a", "alice", "claim");
        s.add_job(JobSpec::new("a", "alice", "claim")).unwrap();

        let first = complete(&mut s, &key, fail_with(ErrorCategory::Transient), t0());
        assert_eq!(first.next_run_at, Some(t0() + TimeDelta::seconds(60)));
        let second = complete(&mut s, &key, fail_with(ErrorCategory::Transient), t0());
        assert_eq!(second.next_run_at, Some(t0() + TimeDelta::seconds(120)));
        assert_eq!(s.job(&key).unwrap().last_error, Some(ErrorCategory::Transient));
    }

    #[test]
    fn test_unknown_with_suggestion_uses_suggestion() {
        let (mut s, _) = scheduler(quiet_config());
        let key = JobKey::new("a", "alice", "claim");
        s.add_job(JobSpec::new("a", "alice", "claim")).unwrap();

        let report = complete(
            &mut s,
            &key,
            finished(TaskResult::failure("timer still running").with_next_run_minutes(7)),
            t0(),
        );
        assert_eq!(report.category, Some(ErrorCategory::Unknown));
        assert_eq!(report.next_run_at, Some(t0() + TimeDelta::minutes(7)));
    }

    #[test]
    fn test_permanent_failure_disables_job() {
        let reporter = MockReporter::new();
        let (s, _) = scheduler(quiet_config());
        let mut s = s.with_reporter(Arc::new(reporter.clone()));
        let key = JobKey::new("a", "alice", "claim");
        s.add_job(JobSpec::new("a", "alice", "claim")).unwrap();

        let report = complete(
            &mut s,
            &key,
            finished(TaskResult::failure("Your account has been banned")),
            t0(),
        );
        assert_eq!(report.category, Some(ErrorCategory::Permanent));
        assert_eq!(report.action, RetryAction::Stop);
        assert!(s.job(&key).is_none());
        assert_eq!(s.disabled().len(), 1);
        assert_eq!(reporter.count("job_disabled"), 1);
        assert_eq!(
            s.circuit_breaker().state("a", t0()),
            CircuitState::Open
        );

        // A restart must not bring it back.
        assert!(!s.add_job(JobSpec::new("a", "alice", "claim")).unwrap());
    }

    #[test]
    fn test_circuit_blocks_target_until_cooldown() {
        let (mut s, _) = scheduler(quiet_config());
        for account in ["u1", "u2", "u3", "u4"] {
            s.add_job(JobSpec::new("site", account, "claim")).unwrap();
        }
        s.add_job(JobSpec::new("other", "u1", "claim")).unwrap();

        for account in ["u1", "u2", "u3"] {
            let key = JobKey::new("site", account, "claim");
            complete(&mut s, &key, fail_with(ErrorCategory::FaucetDown), t0());
        }
        assert!(s.circuit_breaker().is_open("site", t0()));

        let report = s.tick(t0() + TimeDelta::minutes(1));
        assert_eq!(report.skipped_circuit, 1);
        assert!(report.dispatches.iter().all(|d| d.job.key.target != "site"));

        // Backoff for faucet_down is at most 1h + 30%; the circuit closes after 2h.
        let report = s.tick(t0() + TimeDelta::hours(2));
        assert_eq!(report.skipped_circuit, 0);
        assert!(report.dispatches.iter().any(|d| d.job.key.target == "site"));
    }

    #[test]
    fn test_challenge_cap_suspends_account() {
        let reporter = MockReporter::new();
        let (s, _) = scheduler(quiet_config());
        let mut s = s.with_reporter(Arc::new(reporter.clone()));
        let key = JobKey::new("site", "alice", "claim");
        s.add_job(JobSpec::new("site", "alice", "claim")).unwrap();
        s.add_job(JobSpec::new("site", "bob", "claim")).unwrap();

        let mut last = None;
        for _ in 0..5 {
            last = complete(
                &mut s,
                &key,
                finished(TaskResult::failure("Just a moment... Cloudflare")),
                t0(),
            )
            .challenge;
        }
        assert!(last.unwrap().at_cap);
        assert_eq!(reporter.count("account_suspended"), 1);

        // Circuit (1h) and backoff (2h cap) have both expired here.
        let report = s.tick(t0() + TimeDelta::hours(3));
        assert_eq!(report.skipped_challenge, 1);
        assert!(report.dispatches.iter().all(|d| d.job.key.account == "bob"));

        s.handle().reset_challenges(Some("site"), Some("alice"));
        let report = s.tick(t0() + TimeDelta::hours(4));
        assert!(report.dispatches.iter().any(|d| d.job.key.account == "alice"));
    }

    #[test]
    fn test_transient_never_opens_circuit_or_touches_ledger() {
        let (mut s, _) = scheduler(quiet_config());
        let key = JobKey::new("site", "alice", "claim");
        s.add_job(JobSpec::new("site", "alice", "claim")).unwrap();

        for _ in 0..10 {
            complete(
                &mut s,
                &key,
                TaskOutcome::Errored(AppError::NetworkError("connection reset".into())),
                t0(),
            );
        }
        assert!(!s.circuit_breaker().is_open("site", t0()));
        assert!(s.ledger().entries().is_empty());
        assert_eq!(s.job(&key).unwrap().last_error, Some(ErrorCategory::Transient));
    }

    #[test]
    fn test_timeout_is_transient_and_releases_proxy() {
        let pool = ProxyPool::default();
        pool.insert_validated(proxy_address(1));
        let (s, _) = scheduler(quiet_config().with_degraded_mode(5, 0));
        let mut s = s.with_pool(pool.clone());
        s.add_job(JobSpec::new("site", "alice", "claim")).unwrap();

        let mut report = s.tick(t0());
        let dispatch = report.dispatches.remove(0);
        assert_eq!(pool.health_summary(t0()).in_use, 1);

        let done = s
            .on_complete(
                &dispatch.job.key,
                dispatch.lease,
                TaskOutcome::TimedOut,
                Duration::from_secs(600),
                t0(),
            )
            .unwrap();
        assert_eq!(done.category, Some(ErrorCategory::Transient));
        assert_eq!(done.release, Some(ReleaseOutcome::Failure));
        let endpoint = &pool.endpoints()[0];
        assert_eq!(endpoint.consecutive_failures, 1);
        assert_eq!(pool.health_summary(t0()).in_use, 0);
    }

    #[test]
    fn test_proxy_issue_burns_leased_proxy() {
        let pool = ProxyPool::default();
        pool.insert_validated(proxy_address(1));
        let (s, _) = scheduler(quiet_config().with_degraded_mode(5, 0));
        let mut s = s.with_pool(pool.clone());
        s.add_job(JobSpec::new("site", "alice", "claim")).unwrap();

        let mut report = s.tick(t0());
        let dispatch = report.dispatches.remove(0);
        s.on_complete(
            &dispatch.job.key,
            dispatch.lease,
            finished(TaskResult::failure("VPN detected, access denied")),
            Duration::from_secs(1),
            t0(),
        );
        assert!(pool.endpoints()[0].is_burned(t0() + TimeDelta::hours(11)));
    }

    #[test]
    fn test_faucet_down_releases_proxy_neutral() {
        let pool = ProxyPool::default();
        pool.insert_validated(proxy_address(1));
        let (s, _) = scheduler(quiet_config().with_degraded_mode(5, 0));
        let mut s = s.with_pool(pool.clone());
        s.add_job(JobSpec::new("site", "alice", "claim")).unwrap();

        let mut report = s.tick(t0());
        let dispatch = report.dispatches.remove(0);
        let done = s
            .on_complete(
                &dispatch.job.key,
                dispatch.lease,
                fail_with(ErrorCategory::FaucetDown),
                Duration::from_secs(1),
                t0(),
            )
            .unwrap();
        assert_eq!(done.release, Some(ReleaseOutcome::Neutral));
        assert_eq!(pool.endpoints()[0].consecutive_failures, 0);
    }

    #[test]
    fn test_abandon_keeps_schedule() {
        let (mut s, _) = scheduler(quiet_config());
        let key = JobKey::new("a", "alice", "claim");
        s.add_job(JobSpec::new("a", "alice", "claim")).unwrap();
        s.tick(t0());
        s.abandon(&key, None, t0());
        let job = s.job(&key).unwrap();
        assert!(!job.running);
        assert_eq!(job.next_eligible_run_at, t0());
        assert_eq!(job.consecutive_failures, 0);
    }

    #[test]
    fn test_snapshot_restore_keeps_runtime_state() {
        let (mut s, _) = scheduler(quiet_config());
        let key = JobKey::new("site", "alice", "claim");
        s.add_job(JobSpec::new("site", "alice", "claim")).unwrap();
        s.add_job(JobSpec::new("gone", "alice", "claim")).unwrap();
        complete(&mut s, &key, fail_with(ErrorCategory::RateLimit), t0());
        complete(
            &mut s,
            &JobKey::new("gone", "alice", "claim"),
            fail_with(ErrorCategory::Permanent),
            t0(),
        );
        let snapshot = s.snapshot(t0());
        let saved_next = s.job(&key).unwrap().next_eligible_run_at;

        let (mut fresh, _) = scheduler(quiet_config());
        fresh.add_job(JobSpec::new("site", "alice", "claim")).unwrap();
        fresh.add_job(JobSpec::new("gone", "alice", "claim")).unwrap();
        fresh.restore(snapshot);

        let job = fresh.job(&key).unwrap();
        assert_eq!(job.next_eligible_run_at, saved_next);
        assert_eq!(job.consecutive_failures, 1);
        assert_eq!(job.last_error, Some(ErrorCategory::RateLimit));
        assert!(fresh.job(&JobKey::new("gone", "alice", "claim")).is_none());
        assert_eq!(fresh.ledger().entries()[0].retries, 1);
    }
}
