//! Retry policy: exponential backoff with jitter, per failure category.
//!
//! ```text
//! delay = min(base[category] * 2^min(failures, 5) + jitter(0..30% of base), max_delay)
//! ```
//!
//! `failures` counts the consecutive failures *before* the current one, so
//! the first failure waits exactly one base period plus jitter.

use chrono::TimeDelta;
use rand::Rng;

use crate::classifier::ErrorCategory;

/// What the scheduler should do with a failed job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Eligible again right away.
    Immediate,
    /// Eligible again after `delay`.
    Requeue { delay: TimeDelta },
    /// Never retry: remove the job.
    Stop,
}

impl RetryAction {
    /// Delay until the job is eligible again, `None` when stopped.
    pub fn delay(&self) -> Option<TimeDelta> {
        match self {
            RetryAction::Immediate => Some(TimeDelta::zero()),
            RetryAction::Requeue { delay } => Some(*delay),
            RetryAction::Stop => None,
        }
    }
}

/// Base backoff per retryable category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BaseDelays {
    pub transient: TimeDelta,
    pub rate_limit: TimeDelta,
    pub proxy_issue: TimeDelta,
    pub captcha_failed: TimeDelta,
    pub config_error: TimeDelta,
    pub faucet_down: TimeDelta,
    pub unknown: TimeDelta,
}

impl Default for BaseDelays {
    fn default() -> Self {
        Self {
            transient: TimeDelta::seconds(60),
            rate_limit: TimeDelta::seconds(600),
            proxy_issue: TimeDelta::seconds(300),
            captcha_failed: TimeDelta::seconds(900),
            config_error: TimeDelta::seconds(1800),
            faucet_down: TimeDelta::seconds(3600),
            unknown: TimeDelta::seconds(300),
        }
    }
}

impl BaseDelays {
    /// `None` for `permanent`, which has no retry.
    pub fn for_category(&self, category: ErrorCategory) -> Option<TimeDelta> {
        match category {
            ErrorCategory::Permanent => None,
            ErrorCategory::RateLimit => Some(self.rate_limit),
            ErrorCategory::ProxyIssue => Some(self.proxy_issue),
            ErrorCategory::CaptchaFailed => Some(self.captcha_failed),
            ErrorCategory::ConfigError => Some(self.config_error),
            ErrorCategory::FaucetDown => Some(self.faucet_down),
            ErrorCategory::Transient => Some(self.transient),
            ErrorCategory::Unknown => Some(self.unknown),
        }
    }

    pub fn set(&mut self, category: ErrorCategory, delay: TimeDelta) {
        match category {
            ErrorCategory::Permanent => {}
            ErrorCategory::RateLimit => self.rate_limit = delay,
            ErrorCategory::ProxyIssue => self.proxy_issue = delay,
            ErrorCategory::CaptchaFailed => self.captcha_failed = delay,
            ErrorCategory::ConfigError => self.config_error = delay,
            ErrorCategory::FaucetDown => self.faucet_down = delay,
            ErrorCategory::Transient => self.transient = delay,
            ErrorCategory::Unknown => self.unknown = delay,
        }
    }
}

/// Configuration for retry/backoff behaviour.
#[derive(Debug, Clone)]
pub struct RetryPolicyConfig {
    pub base_delays: BaseDelays,
    /// Upper bound on any computed delay.
    pub max_delay: TimeDelta,
    /// Jitter is drawn uniformly from `[0, jitter_fraction * base)`.
    pub jitter_fraction: f64,
    /// Failure counts above this stop doubling the delay.
    pub max_backoff_exponent: u32,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            base_delays: BaseDelays::default(),
            max_delay: TimeDelta::seconds(7200),
            jitter_fraction: 0.3,
            max_backoff_exponent: 5,
        }
    }
}

impl RetryPolicyConfig {
    pub fn with_base_delay(mut self, category: ErrorCategory, delay: TimeDelta) -> Self {
        self.base_delays.set(category, delay);
        self
    }

    pub fn with_max_delay(mut self, max_delay: TimeDelta) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction.clamp(0.0, 1.0);
        self
    }
}

#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryPolicyConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryPolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryPolicyConfig {
        &self.config
    }

    /// Decide the next action for a failure of `category`, given the number
    /// of consecutive failures that preceded it.
    pub fn decide(&self, category: ErrorCategory, prior_failures: u32) -> RetryAction {
        let roll = rand::rng().random_range(0.0..1.0);
        self.decide_with_roll(category, prior_failures, roll)
    }

    /// Deterministic form of [`decide`](Self::decide); `roll` in `[0, 1)`
    /// picks the jitter within its range.
    pub fn decide_with_roll(
        &self,
        category: ErrorCategory,
        prior_failures: u32,
        roll: f64,
    ) -> RetryAction {
        let Some(base) = self.config.base_delays.for_category(category) else {
            return RetryAction::Stop;
        };
        let delay = self.backoff(base, prior_failures, roll);
        if delay <= TimeDelta::zero() {
            RetryAction::Immediate
        } else {
            RetryAction::Requeue { delay }
        }
    }

    fn backoff(&self, base: TimeDelta, prior_failures: u32, roll: f64) -> TimeDelta {
        let base_ms = base.num_milliseconds().max(0);
        let exponent = prior_failures.min(self.config.max_backoff_exponent).min(30);
        let scaled = base_ms.saturating_mul(1_i64 << exponent);
        let jitter_span = base_ms as f64 * self.config.jitter_fraction;
        let jitter = (jitter_span * roll.clamp(0.0, 1.0)) as i64;
        let total = scaled.saturating_add(jitter);
        std::cmp::min(TimeDelta::milliseconds(total), self.config.max_delay)
    }
}
