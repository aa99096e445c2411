//! Per-domain dispatch spacing.
//!
//! Keeps a map of domain → last dispatch time. A job whose domain was hit
//! less than `spacing` (+ jitter) ago is deferred rather than launched, so
//! many accounts becoming ready at once never burst against one site.
//!
//! # Example
//!
//! ```rust
//! use chrono::{TimeDelta, Utc};
//! use claimd_core::throttle::{DomainThrottle, DomainThrottleConfig};
//!
//! let mut throttle = DomainThrottle::new(DomainThrottleConfig::new(TimeDelta::seconds(30)));
//! let now = Utc::now();
//! assert!(throttle.try_dispatch("faucet.example", now).is_ok());
//! assert!(throttle.try_dispatch("faucet.example", now).is_err());
//! assert!(throttle.try_dispatch("other.example", now).is_ok());
//! ```

use std::collections::HashMap;

use chrono::{DateTime, TimeDelta, Utc};
use rand::Rng;

/// Configuration for per-domain spacing.
#[derive(Debug, Clone)]
pub struct DomainThrottleConfig {
    /// Minimum time between two dispatches to the same domain.
    pub spacing: TimeDelta,

    /// Maximum random jitter added on top of `spacing` (uniform [0, jitter]).
    ///
    /// Drawn once per dispatch so the gaps between hits vary.
    pub jitter: TimeDelta,

    /// Per-domain spacing overrides.
    pub overrides: HashMap<String, TimeDelta>,
}

impl DomainThrottleConfig {
    /// Create a new config with the given spacing and no jitter.
    pub fn new(spacing: TimeDelta) -> Self {
        Self {
            spacing,
            jitter: TimeDelta::zero(),
            overrides: HashMap::new(),
        }
    }

    pub fn with_jitter(mut self, jitter: TimeDelta) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_override(mut self, domain: impl Into<String>, spacing: TimeDelta) -> Self {
        self.overrides.insert(domain.into(), spacing);
        self
    }

    fn spacing_for(&self, domain: &str) -> TimeDelta {
        self.overrides.get(domain).copied().unwrap_or(self.spacing)
    }

    /// Spacing plus a fresh jitter draw.
    fn effective_spacing(&self, domain: &str) -> TimeDelta {
        let base = self.spacing_for(domain);
        let jitter_ms = self.jitter.num_milliseconds();
        if jitter_ms <= 0 {
            return base;
        }
        base + TimeDelta::milliseconds(rand::rng().random_range(0..=jitter_ms))
    }
}

impl Default for DomainThrottleConfig {
    /// 20 seconds between hits on one domain, up to 10 seconds of jitter.
    fn default() -> Self {
        Self {
            spacing: TimeDelta::seconds(20),
            jitter: TimeDelta::seconds(10),
            overrides: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct DomainSlot {
    /// Earliest time the next dispatch is allowed.
    next_allowed_at: DateTime<Utc>,
}

/// Domain → next-allowed-dispatch map. Owned by the scheduler.
#[derive(Debug, Clone)]
pub struct DomainThrottle {
    config: DomainThrottleConfig,
    slots: HashMap<String, DomainSlot>,
}

impl DomainThrottle {
    pub fn new(config: DomainThrottleConfig) -> Self {
        Self {
            config,
            slots: HashMap::new(),
        }
    }

    /// Time left before `domain` may be hit again, or `None` if it may be hit now.
    pub fn remaining(&self, domain: &str, now: DateTime<Utc>) -> Option<TimeDelta> {
        let slot = self.slots.get(domain)?;
        (now < slot.next_allowed_at).then(|| slot.next_allowed_at - now)
    }

    /// Record a dispatch to `domain` at `now`.
    pub fn record(&mut self, domain: &str, now: DateTime<Utc>) {
        let next_allowed_at = now + self.config.effective_spacing(domain);
        self.slots
            .insert(domain.to_string(), DomainSlot { next_allowed_at });
    }

    /// Record a dispatch if the domain is free; otherwise return the wait.
    pub fn try_dispatch(&mut self, domain: &str, now: DateTime<Utc>) -> Result<(), TimeDelta> {
        if let Some(wait) = self.remaining(domain, now) {
            tracing::debug!(%domain, wait_ms = wait.num_milliseconds(), "Dispatch deferred by domain spacing");
            return Err(wait);
        }
        self.record(domain, now);
        Ok(())
    }
}

impl Default for DomainThrottle {
    fn default() -> Self {
        Self::new(DomainThrottleConfig::default())
    }
}
