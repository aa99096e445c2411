//! Per (target, account) ledger of anti-bot challenges.
//!
//! Challenges are retryable, but an account that keeps hitting them on one
//! target is parked once it reaches the cap. The entry clears on the next
//! success, after `reset_window` without a new challenge, or by operator reset.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Configuration for the challenge ledger.
#[derive(Debug, Clone)]
pub struct ChallengeLedgerConfig {
    /// Consecutive challenges after which the account is suspended for the target.
    pub max_retries: u32,
    /// Quiet period after which an entry resets on its own.
    pub reset_window: TimeDelta,
}

impl Default for ChallengeLedgerConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            reset_window: TimeDelta::hours(24),
        }
    }
}

impl ChallengeLedgerConfig {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_reset_window(mut self, window: TimeDelta) -> Self {
        self.reset_window = window;
        self
    }
}

/// Persisted form of one ledger entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeEntry {
    pub target: String,
    pub account: String,
    pub retries: u32,
    pub last_retry_at: DateTime<Utc>,
}

/// Result of recording a challenge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChallengeOutcome {
    pub retries: u32,
    pub at_cap: bool,
}

/// Observability row returned by [`ChallengeLedger::status`].
#[derive(Debug, Clone, PartialEq)]
pub struct ChallengeStatus {
    pub target: String,
    pub account: String,
    pub retries: u32,
    pub max_retries: u32,
    pub at_cap: bool,
    pub hours_since_last_retry: f64,
    pub hours_until_reset: f64,
}

#[derive(Debug, Clone, Copy)]
struct ChallengeState {
    retries: u32,
    last_retry_at: DateTime<Utc>,
}

type LedgerKey = (String, String);

#[derive(Clone)]
pub struct ChallengeLedger {
    config: ChallengeLedgerConfig,
    inner: Arc<Mutex<HashMap<LedgerKey, ChallengeState>>>,
}

impl ChallengeLedger {
    pub fn new(config: ChallengeLedgerConfig) -> Self {
        Self {
            config,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn config(&self) -> &ChallengeLedgerConfig {
        &self.config
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, HashMap<LedgerKey, ChallengeState>> {
        self.inner.lock().unwrap_or_else(|poisoned| {
            tracing::warn!("Recovered from poisoned challenge ledger mutex");
            poisoned.into_inner()
        })
    }

    fn key(target: &str, account: &str) -> LedgerKey {
        (target.to_string(), account.to_string())
    }

    /// Zero an entry whose last challenge is older than the reset window.
    fn autoreset(&self, key: &LedgerKey, state: &mut ChallengeState, now: DateTime<Utc>) {
        if state.retries > 0 && now - state.last_retry_at > self.config.reset_window {
            tracing::info!(
                target = %key.0,
                account = %key.1,
                retries = state.retries,
                "Challenge counter auto-reset"
            );
            state.retries = 0;
        }
    }

    /// Record a challenge; the counter saturates at `max_retries`.
    pub fn record_challenge(
        &self,
        target: &str,
        account: &str,
        now: DateTime<Utc>,
    ) -> ChallengeOutcome {
        let key = Self::key(target, account);
        let mut entries = self.lock_inner();
        let state = entries.entry(key.clone()).or_insert(ChallengeState {
            retries: 0,
            last_retry_at: now,
        });
        self.autoreset(&key, state, now);

        state.retries = (state.retries + 1).min(self.config.max_retries);
        state.last_retry_at = now;

        let at_cap = state.retries >= self.config.max_retries;
        if at_cap {
            tracing::warn!(
                %target,
                %account,
                retries = state.retries,
                "Challenge cap reached, account suspended for target"
            );
        }
        ChallengeOutcome {
            retries: state.retries,
            at_cap,
        }
    }

    /// A success clears the entry.
    pub fn record_success(&self, target: &str, account: &str) {
        self.lock_inner().remove(&Self::key(target, account));
    }

    /// Current counter after applying the auto-reset.
    pub fn maybe_autoreset(&self, target: &str, account: &str, now: DateTime<Utc>) -> u32 {
        let key = Self::key(target, account);
        let mut entries = self.lock_inner();
        match entries.get_mut(&key) {
            Some(state) => {
                self.autoreset(&key, state, now);
                state.retries
            }
            None => 0,
        }
    }

    pub fn is_suspended(&self, target: &str, account: &str, now: DateTime<Utc>) -> bool {
        self.config.max_retries > 0
            && self.maybe_autoreset(target, account, now) >= self.config.max_retries
    }

    /// Operator reset. `None` scopes match everything.
    ///
    /// Returns the number of entries cleared.
    pub fn reset(&self, target: Option<&str>, account: Option<&str>) -> usize {
        let mut entries = self.lock_inner();
        let before = entries.len();
        entries.retain(|(t, a), _| {
            let matches = target.is_none_or(|want| want == t) && account.is_none_or(|want| want == a);
            !matches
        });
        let cleared = before - entries.len();
        tracing::info!(
            target = target.unwrap_or("*"),
            account = account.unwrap_or("*"),
            cleared,
            "Challenge ledger reset"
        );
        cleared
    }

    pub fn status(&self, now: DateTime<Utc>) -> Vec<ChallengeStatus> {
        let mut entries = self.lock_inner();
        let max = self.config.max_retries;
        let window = self.config.reset_window;
        let mut rows: Vec<_> = entries
            .iter_mut()
            .map(|(key, state)| {
                self.autoreset(key, state, now);
                let since = now - state.last_retry_at;
                let until = (window - since).max(TimeDelta::zero());
                ChallengeStatus {
                    target: key.0.clone(),
                    account: key.1.clone(),
                    retries: state.retries,
                    max_retries: max,
                    at_cap: max > 0 && state.retries >= max,
                    hours_since_last_retry: hours(since),
                    hours_until_reset: if state.retries == 0 { 0.0 } else { hours(until) },
                }
            })
            .collect();
        rows.sort_by(|a, b| (&a.target, &a.account).cmp(&(&b.target, &b.account)));
        rows
    }

    pub fn entries(&self) -> Vec<ChallengeEntry> {
        let entries = self.lock_inner();
        let mut out: Vec<_> = entries
            .iter()
            .map(|((target, account), state)| ChallengeEntry {
                target: target.clone(),
                account: account.clone(),
                retries: state.retries,
                last_retry_at: state.last_retry_at,
            })
            .collect();
        out.sort_by(|a, b| (&a.target, &a.account).cmp(&(&b.target, &b.account)));
        out
    }

    /// Replace the ledger contents with persisted entries.
    pub fn restore(&self, restored: Vec<ChallengeEntry>) {
        let mut entries = self.lock_inner();
        entries.clear();
        for entry in restored {
            entries.insert(
                (entry.target, entry.account),
                ChallengeState {
                    retries: entry.retries.min(self.config.max_retries),
                    last_retry_at: entry.last_retry_at,
                },
            );
        }
    }
}

impl Default for ChallengeLedger {
    fn default() -> Self {
        Self::new(ChallengeLedgerConfig::default())
    }
}

fn hours(delta: TimeDelta) -> f64 {
    delta.num_seconds() as f64 / 3600.0
}
