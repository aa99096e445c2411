use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::classifier::ErrorCategory;

/// Identity of a recurring job: one (target, account, kind) triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobKey {
    pub target: String,
    pub account: String,
    pub kind: String,
}

impl JobKey {
    pub fn new(
        target: impl Into<String>,
        account: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            account: account.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.target, self.account, self.kind)
    }
}

impl FromStr for JobKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.splitn(3, '/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(t), Some(a), Some(k)) if !t.is_empty() && !a.is_empty() && !k.is_empty() => {
                Ok(JobKey::new(t, a, k))
            }
            _ => Err(format!("Invalid job key '{}': expected target/account/kind", s)),
        }
    }
}

/// Derive the rate-limit domain for a target.
///
/// URLs collapse to their host (`https://www.site.io/claim` → `www.site.io`);
/// anything else is used verbatim, lowercased.
pub fn domain_for_target(target: &str) -> String {
    Url::parse(target)
        .ok()
        .and_then(|url| url.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| target.to_lowercase())
}

/// Static description of a job, as configured by the operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub target: String,
    pub account: String,
    pub kind: String,
    /// Lower runs sooner.
    #[serde(default = "default_priority")]
    pub priority: u32,
    /// Recurrence interval used after a success without a suggestion.
    #[serde(default = "default_interval_minutes")]
    pub interval_minutes: u32,
    /// Rate-limit domain. Derived from `target` when absent.
    #[serde(default)]
    pub domain: Option<String>,
}

fn default_priority() -> u32 {
    10
}

fn default_interval_minutes() -> u32 {
    60
}

impl JobSpec {
    pub fn new(
        target: impl Into<String>,
        account: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            target: target.into(),
            account: account.into(),
            kind: kind.into(),
            priority: default_priority(),
            interval_minutes: default_interval_minutes(),
            domain: None,
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_interval_minutes(mut self, minutes: u32) -> Self {
        self.interval_minutes = minutes;
        self
    }

    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn key(&self) -> JobKey {
        JobKey::new(&self.target, &self.account, &self.kind)
    }

    /// Materialise a fresh job, eligible immediately.
    pub fn into_job(self, now: DateTime<Utc>) -> Job {
        let domain = self
            .domain
            .clone()
            .unwrap_or_else(|| domain_for_target(&self.target));
        Job {
            key: self.key(),
            domain,
            priority: self.priority,
            priority_multiplier: 1.0,
            interval_minutes: self.interval_minutes,
            next_eligible_run_at: now,
            consecutive_failures: 0,
            last_error: None,
            last_status: None,
            last_success_at: None,
            total_amount: 0.0,
            running: false,
        }
    }
}

/// A live recurring job owned by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub key: JobKey,
    pub domain: String,
    pub priority: u32,
    pub priority_multiplier: f64,
    pub interval_minutes: u32,
    pub next_eligible_run_at: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub last_error: Option<ErrorCategory>,
    pub last_status: Option<String>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub total_amount: f64,
    /// Never persisted as `true`: a restart cannot have anything in flight.
    #[serde(skip)]
    pub running: bool,
}

impl Job {
    pub fn effective_priority(&self) -> f64 {
        f64::from(self.priority) * self.priority_multiplier
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.running && self.next_eligible_run_at <= now
    }

    pub fn interval(&self) -> TimeDelta {
        TimeDelta::minutes(i64::from(self.interval_minutes))
    }

    pub fn context(&self) -> JobContext {
        JobContext {
            key: self.key.clone(),
            domain: self.domain.clone(),
            consecutive_failures: self.consecutive_failures,
            last_error: self.last_error,
        }
    }
}

/// Read-only view of a job handed to task logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobContext {
    pub key: JobKey,
    pub domain: String,
    pub consecutive_failures: u32,
    pub last_error: Option<ErrorCategory>,
}

/// Typed result contract produced by external task logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub success: bool,
    /// Human-readable status line.
    #[serde(default)]
    pub status: String,
    /// Explicit category, overriding the classifier.
    #[serde(default)]
    pub error_category: Option<ErrorCategory>,
    /// Numeric outcome, e.g. the amount claimed.
    #[serde(default)]
    pub amount: Option<f64>,
    /// Suggested minutes until the job is eligible again.
    #[serde(default)]
    pub next_run_minutes: Option<u32>,
    #[serde(default)]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub page_content: Option<String>,
    /// Measured round-trip through the proxy, if the task tracked it.
    #[serde(default)]
    pub latency_ms: Option<u64>,
}

impl TaskResult {
    pub fn success(status: impl Into<String>) -> Self {
        Self {
            success: true,
            status: status.into(),
            error_category: None,
            amount: None,
            next_run_minutes: None,
            status_code: None,
            page_content: None,
            latency_ms: None,
        }
    }

    pub fn failure(status: impl Into<String>) -> Self {
        Self {
            success: false,
            ..Self::success(status)
        }
    }

    pub fn with_category(mut self, category: ErrorCategory) -> Self {
        self.error_category = Some(category);
        self
    }

    pub fn with_amount(mut self, amount: f64) -> Self {
        self.amount = Some(amount);
        self
    }

    pub fn with_next_run_minutes(mut self, minutes: u32) -> Self {
        self.next_run_minutes = Some(minutes);
        self
    }

    pub fn with_status_code(mut self, code: u16) -> Self {
        self.status_code = Some(code);
        self
    }

    pub fn with_page_content(mut self, content: impl Into<String>) -> Self {
        self.page_content = Some(content.into());
        self
    }

    pub fn with_latency_ms(mut self, latency_ms: u64) -> Self {
        self.latency_ms = Some(latency_ms);
        self
    }
}

/// Record of a job removed after a permanent failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DisabledJob {
    pub key: JobKey,
    pub reason: String,
    pub disabled_at: DateTime<Utc>,
}
