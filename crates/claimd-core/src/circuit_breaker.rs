//! Per-target circuit breaker.
//!
//! Withdraws a whole target from scheduling when its recent outcomes say it
//! is unhealthy, and returns it automatically once the cooldown has passed.
//!
//! # Circuit States
//!
//! ```text
//! CLOSED --[permanent | 3x proxy_issue in a row | same category 3x in last 10]--> OPEN
//! OPEN   --[now >= opened_at + cooldown]-----------------------------------------> CLOSED
//! ```
//!
//! `transient`, `config_error` and `unknown` outcomes are recorded in the
//! window but never count toward opening.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};

use crate::classifier::ErrorCategory;

/// Current state of a target's circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Jobs for the target are scheduled normally.
    Closed,
    /// Jobs for the target are skipped until the cooldown expires.
    Open,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
        }
    }
}

/// Configuration for circuit breaker behavior.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of most recent outcomes kept per target.
    pub window_size: usize,

    /// Occurrences of one counting category within the window that open the circuit.
    pub category_threshold: usize,

    /// Consecutive `proxy_issue` outcomes that open the circuit.
    pub proxy_issue_threshold: u32,

    /// Cooldown used when no per-category override exists.
    pub default_cooldown: TimeDelta,

    /// Per-category cooldown overrides.
    pub cooldowns: HashMap<ErrorCategory, TimeDelta>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 10,
            category_threshold: 3,
            proxy_issue_threshold: 3,
            default_cooldown: TimeDelta::hours(1),
            cooldowns: HashMap::from([(ErrorCategory::FaucetDown, TimeDelta::hours(2))]),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_cooldown(mut self, category: ErrorCategory, cooldown: TimeDelta) -> Self {
        self.cooldowns.insert(category, cooldown);
        self
    }

    pub fn with_default_cooldown(mut self, cooldown: TimeDelta) -> Self {
        self.default_cooldown = cooldown;
        self
    }

    pub fn cooldown_for(&self, category: ErrorCategory) -> TimeDelta {
        self.cooldowns
            .get(&category)
            .copied()
            .unwrap_or(self.default_cooldown)
    }
}

/// Whether an outcome can contribute to the sliding-window rule.
fn counts_in_window(category: ErrorCategory) -> bool {
    matches!(
        category,
        ErrorCategory::RateLimit | ErrorCategory::CaptchaFailed | ErrorCategory::FaucetDown
    )
}

/// State tracked for one target.
#[derive(Debug)]
struct TargetCircuit {
    state: CircuitState,
    opened_at: Option<DateTime<Utc>>,
    cooldown: TimeDelta,
    tripped_by: Option<ErrorCategory>,
    /// `None` entries are successes.
    recent: VecDeque<Option<ErrorCategory>>,
    consecutive_proxy_issues: u32,
}

impl TargetCircuit {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            opened_at: None,
            cooldown: TimeDelta::zero(),
            tripped_by: None,
            recent: VecDeque::new(),
            consecutive_proxy_issues: 0,
        }
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.opened_at = None;
        self.cooldown = TimeDelta::zero();
        self.tripped_by = None;
        self.recent.clear();
        self.consecutive_proxy_issues = 0;
    }

    fn reopens_at(&self) -> Option<DateTime<Utc>> {
        self.opened_at.map(|t| t + self.cooldown)
    }
}

/// Emitted when a record call opens a circuit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTrip {
    pub target: String,
    pub category: ErrorCategory,
    pub closes_at: DateTime<Utc>,
}

/// Statistics about one target's circuit for monitoring.
#[derive(Debug, Clone)]
pub struct CircuitBreakerStats {
    pub target: String,
    pub state: CircuitState,
    pub tripped_by: Option<ErrorCategory>,
    pub recent: Vec<Option<ErrorCategory>>,
    pub time_until_close: Option<TimeDelta>,
}

/// Thread-safe registry of per-target circuits.
#[derive(Clone)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Arc<Mutex<HashMap<String, TargetCircuit>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Acquires the inner mutex lock, recovering from poison if necessary.
    fn lock_inner(&self) -> std::sync::MutexGuard<'_, HashMap<String, TargetCircuit>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned circuit breaker mutex");
            poisoned.into_inner()
        })
    }

    /// Current state for `target`, closing it first if its cooldown expired.
    pub fn state(&self, target: &str, now: DateTime<Utc>) -> CircuitState {
        let mut circuits = self.lock_inner();
        match circuits.get_mut(target) {
            Some(circuit) => {
                Self::maybe_close(target, circuit, now);
                circuit.state
            }
            None => CircuitState::Closed,
        }
    }

    pub fn is_open(&self, target: &str, now: DateTime<Utc>) -> bool {
        self.state(target, now) == CircuitState::Open
    }

    /// Record one outcome for `target`; `None` is a success.
    ///
    /// Returns the trip if this outcome opened the circuit. Outcomes arriving
    /// while the circuit is already open are ignored.
    pub fn record(
        &self,
        target: &str,
        outcome: Option<ErrorCategory>,
        now: DateTime<Utc>,
    ) -> Option<CircuitTrip> {
        let mut circuits = self.lock_inner();
        let circuit = circuits
            .entry(target.to_string())
            .or_insert_with(TargetCircuit::new);
        Self::maybe_close(target, circuit, now);

        if circuit.state == CircuitState::Open {
            return None;
        }

        circuit.recent.push_back(outcome);
        while circuit.recent.len() > self.config.window_size {
            circuit.recent.pop_front();
        }

        if outcome == Some(ErrorCategory::ProxyIssue) {
            circuit.consecutive_proxy_issues += 1;
        } else {
            circuit.consecutive_proxy_issues = 0;
        }

        let trip = match outcome {
            Some(ErrorCategory::Permanent) => Some(ErrorCategory::Permanent),
            Some(ErrorCategory::ProxyIssue)
                if circuit.consecutive_proxy_issues >= self.config.proxy_issue_threshold =>
            {
                Some(ErrorCategory::ProxyIssue)
            }
            Some(category) if counts_in_window(category) => {
                let occurrences = circuit
                    .recent
                    .iter()
                    .filter(|o| **o == Some(category))
                    .count();
                (occurrences >= self.config.category_threshold).then_some(category)
            }
            _ => None,
        }?;

        let cooldown = self.config.cooldown_for(trip);
        circuit.state = CircuitState::Open;
        circuit.opened_at = Some(now);
        circuit.cooldown = cooldown;
        circuit.tripped_by = Some(trip);

        let closes_at = now + cooldown;
        tracing::warn!(
            %target,
            category = %trip,
            cooldown_secs = cooldown.num_seconds(),
            "Circuit opened"
        );

        Some(CircuitTrip {
            target: target.to_string(),
            category: trip,
            closes_at,
        })
    }

    /// Manually close a target's circuit.
    pub fn reset(&self, target: &str) {
        let mut circuits = self.lock_inner();
        if let Some(circuit) = circuits.get_mut(target) {
            tracing::info!(%target, "Circuit manually reset");
            circuit.close();
        }
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Vec<CircuitBreakerStats> {
        let mut circuits = self.lock_inner();
        let mut stats: Vec<_> = circuits
            .iter_mut()
            .map(|(target, circuit)| {
                Self::maybe_close(target, circuit, now);
                CircuitBreakerStats {
                    target: target.clone(),
                    state: circuit.state,
                    tripped_by: circuit.tripped_by,
                    recent: circuit.recent.iter().copied().collect(),
                    time_until_close: circuit.reopens_at().map(|t| t - now),
                }
            })
            .collect();
        stats.sort_by(|a, b| a.target.cmp(&b.target));
        stats
    }

    fn maybe_close(target: &str, circuit: &mut TargetCircuit, now: DateTime<Utc>) {
        if circuit.state == CircuitState::Open
            && let Some(reopens_at) = circuit.reopens_at()
            && now >= reopens_at
        {
            tracing::info!(%target, "Circuit closed after cooldown");
            circuit.close();
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
