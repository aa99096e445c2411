use chrono::{DateTime, Utc};

use crate::circuit_breaker::CircuitTrip;
use crate::classifier::ErrorCategory;
use crate::job::JobKey;

/// Events emitted by the scheduler for monitoring/logging.
#[derive(Debug, Clone)]
pub enum SchedulerEvent<'a> {
    Started {
        jobs: usize,
        disabled: usize,
    },
    TickCompleted {
        dispatched: usize,
        budget: usize,
        degraded: bool,
    },
    JobDispatched {
        key: &'a JobKey,
        proxy: Option<&'a str>,
    },
    JobSucceeded {
        key: &'a JobKey,
        status: &'a str,
        amount: Option<f64>,
        next_run_at: DateTime<Utc>,
    },
    JobFailed {
        key: &'a JobKey,
        category: ErrorCategory,
        status: &'a str,
        next_run_at: DateTime<Utc>,
    },
    /// A permanent failure removed the job.
    JobDisabled {
        key: &'a JobKey,
        reason: &'a str,
    },
    CircuitOpened {
        trip: &'a CircuitTrip,
    },
    AccountSuspended {
        target: &'a str,
        account: &'a str,
        retries: u32,
    },
    StatePersisted {
        jobs: usize,
    },
    ShuttingDown {
        in_flight: usize,
    },
    Stopped,
}

impl SchedulerEvent<'_> {
    /// Stable short name, used by test reporters.
    pub fn kind(&self) -> &'static str {
        match self {
            SchedulerEvent::Started { .. } => "started",
            SchedulerEvent::TickCompleted { .. } => "tick_completed",
            SchedulerEvent::JobDispatched { .. } => "job_dispatched",
            SchedulerEvent::JobSucceeded { .. } => "job_succeeded",
            SchedulerEvent::JobFailed { .. } => "job_failed",
            SchedulerEvent::JobDisabled { .. } => "job_disabled",
            SchedulerEvent::CircuitOpened { .. } => "circuit_opened",
            SchedulerEvent::AccountSuspended { .. } => "account_suspended",
            SchedulerEvent::StatePersisted { .. } => "state_persisted",
            SchedulerEvent::ShuttingDown { .. } => "shutting_down",
            SchedulerEvent::Stopped => "stopped",
        }
    }
}

/// Trait for receiving scheduler events (decoupled logging).
pub trait SchedulerReporter: Send + Sync {
    fn report(&self, event: SchedulerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl SchedulerReporter for TracingReporter {
    fn report(&self, event: SchedulerEvent<'_>) {
        match event {
            SchedulerEvent::Started { jobs, disabled } => {
                tracing::info!(%jobs, %disabled, "Scheduler started");
            }
            SchedulerEvent::TickCompleted {
                dispatched,
                budget,
                degraded,
            } => {
                tracing::debug!(%dispatched, %budget, %degraded, "Tick completed");
            }
            SchedulerEvent::JobDispatched { key, proxy } => {
                tracing::info!(job = %key, proxy = proxy.unwrap_or("direct"), "Job dispatched");
            }
            SchedulerEvent::JobSucceeded {
                key,
                status,
                amount,
                next_run_at,
            } => {
                tracing::info!(job = %key, %status, ?amount, %next_run_at, "Job succeeded");
            }
            SchedulerEvent::JobFailed {
                key,
                category,
                status,
                next_run_at,
            } => {
                tracing::warn!(job = %key, %category, %status, %next_run_at, "Job failed");
            }
            SchedulerEvent::JobDisabled { key, reason } => {
                tracing::error!(job = %key, %reason, "Job disabled after permanent failure");
            }
            SchedulerEvent::CircuitOpened { trip } => {
                tracing::warn!(
                    target = %trip.target,
                    category = %trip.category,
                    closes_at = %trip.closes_at,
                    "Circuit opened"
                );
            }
            SchedulerEvent::AccountSuspended {
                target,
                account,
                retries,
            } => {
                tracing::warn!(%target, %account, %retries, "Account suspended for target");
            }
            SchedulerEvent::StatePersisted { jobs } => {
                tracing::debug!(%jobs, "State persisted");
            }
            SchedulerEvent::ShuttingDown { in_flight } => {
                tracing::info!(%in_flight, "Scheduler shutting down");
            }
            SchedulerEvent::Stopped => {
                tracing::info!("Scheduler stopped");
            }
        }
    }
}
