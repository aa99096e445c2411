use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;
use claimd_client::{
    CommandTaskRunner, FileProxySource, HttpProxyProbe, HttpProxySource, ProxySourceKind,
    StaticProxySource,
};
use claimd_core::challenge::ChallengeLedgerConfig;
use claimd_core::circuit_breaker::CircuitBreakerConfig;
use claimd_core::classifier::ErrorCategory;
use claimd_core::error::AppError;
use claimd_core::job::JobSpec;
use claimd_core::proxy_pool::ProxyPoolConfig;
use claimd_core::retry::RetryPolicyConfig;
use claimd_core::scheduler::SchedulerConfig;
use claimd_core::throttle::DomainThrottleConfig;
use serde::Deserialize;

/// The farm file: jobs, proxy sources, the task command and tunables.
///
/// Durations are plain integers in the unit their name carries
/// (`*_secs`, `*_minutes`, `*_hours`). Every section except `jobs` and
/// `runner` may be omitted.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FarmConfig {
    pub jobs: Vec<JobSpec>,
    pub runner: RunnerSettings,
    #[serde(default)]
    pub proxies: ProxySettings,
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub circuit: CircuitSettings,
    #[serde(default)]
    pub challenges: ChallengeSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerSettings {
    pub program: PathBuf,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ProxySettings {
    /// Local list files, re-read on every refresh.
    pub files: Vec<PathBuf>,
    /// Provider endpoints returning plain-text lists.
    pub urls: Vec<String>,
    /// Proxies listed directly in the farm file.
    pub inline: Vec<String>,
    pub refresh_secs: u64,
    pub probe_url: String,
    pub probe_timeout_secs: u64,
    pub failure_threshold: u32,
    pub cooldown_secs: i64,
    pub burn_hours: i64,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            files: Vec::new(),
            urls: Vec::new(),
            inline: Vec::new(),
            refresh_secs: 1800,
            probe_url: "https://httpbin.org/ip".to_string(),
            probe_timeout_secs: 10,
            failure_threshold: 3,
            cooldown_secs: 300,
            burn_hours: 12,
        }
    }
}

impl ProxySettings {
    pub fn has_sources(&self) -> bool {
        !(self.files.is_empty() && self.urls.is_empty() && self.inline.is_empty())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SchedulerSettings {
    pub max_concurrency: usize,
    pub degraded_concurrency: usize,
    pub degraded_proxy_threshold: usize,
    pub require_proxy: bool,
    pub tick_secs: u64,
    pub job_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub persist_secs: u64,
    pub domain_spacing_secs: i64,
    pub domain_jitter_secs: i64,
    /// Per-domain spacing overrides, in seconds.
    pub domain_spacing_overrides: BTreeMap<String, i64>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 5,
            degraded_concurrency: 2,
            degraded_proxy_threshold: 10,
            require_proxy: false,
            tick_secs: 5,
            job_timeout_secs: 600,
            shutdown_grace_secs: 30,
            persist_secs: 300,
            domain_spacing_secs: 20,
            domain_jitter_secs: 10,
            domain_spacing_overrides: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_delay_secs: i64,
    pub jitter_fraction: f64,
    /// Base delay overrides keyed by category name, e.g. `"rate_limit": 900`.
    pub base_delay_secs: BTreeMap<ErrorCategory, i64>,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_delay_secs: 7200,
            jitter_fraction: 0.3,
            base_delay_secs: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CircuitSettings {
    pub cooldown_minutes: i64,
    /// Cooldown overrides keyed by category name.
    pub cooldown_minutes_by_category: BTreeMap<ErrorCategory, i64>,
}

impl Default for CircuitSettings {
    fn default() -> Self {
        Self {
            cooldown_minutes: 60,
            cooldown_minutes_by_category: BTreeMap::from([(ErrorCategory::FaucetDown, 120)]),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ChallengeSettings {
    pub max_retries: u32,
    pub reset_hours: i64,
}

impl Default for ChallengeSettings {
    fn default() -> Self {
        Self {
            max_retries: 5,
            reset_hours: 24,
        }
    }
}

impl FarmConfig {
    /// Read and validate a farm file.
    pub fn load(path: &Path) -> Result<Self, AppError> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            AppError::ConfigError(format!("Cannot read farm file {}: {e}", path.display()))
        })?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> Result<Self, AppError> {
        let config: FarmConfig = serde_json::from_str(raw)
            .map_err(|e| AppError::ConfigError(format!("Invalid farm file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.jobs.is_empty() {
            return Err(AppError::ConfigError("Farm file lists no jobs".into()));
        }
        let mut seen = HashSet::new();
        for spec in &self.jobs {
            let key = spec.key();
            if spec.target.is_empty() || spec.account.is_empty() || spec.kind.is_empty() {
                return Err(AppError::ConfigError(format!(
                    "Job '{key}' needs a target, account and kind"
                )));
            }
            if spec.interval_minutes == 0 {
                return Err(AppError::ConfigError(format!(
                    "Job '{key}' has a zero interval"
                )));
            }
            if !seen.insert(key.clone()) {
                return Err(AppError::ConfigError(format!("Duplicate job '{key}'")));
            }
        }
        if self.runner.program.as_os_str().is_empty() {
            return Err(AppError::ConfigError("runner.program is empty".into()));
        }
        let s = &self.scheduler;
        if s.max_concurrency == 0 || s.degraded_concurrency == 0 {
            return Err(AppError::ConfigError(
                "Concurrency limits must be at least 1".into(),
            ));
        }
        if s.tick_secs == 0 || s.persist_secs == 0 || s.job_timeout_secs == 0 {
            return Err(AppError::ConfigError(
                "tick_secs, persist_secs and job_timeout_secs must be positive".into(),
            ));
        }
        if self.proxies.refresh_secs == 0 {
            return Err(AppError::ConfigError(
                "proxies.refresh_secs must be positive".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_fraction) {
            return Err(AppError::ConfigError(format!(
                "retry.jitter_fraction {} is outside [0, 1]",
                self.retry.jitter_fraction
            )));
        }
        if self.retry.max_delay_secs == 0 {
            return Err(AppError::ConfigError(
                "retry.max_delay_secs must be positive".into(),
            ));
        }

        // Every duration goes through the range checks in the builders.
        self.scheduler_config()?;
        self.retry_config()?;
        self.circuit_config()?;
        self.ledger_config()?;
        self.pool_config()?;
        self.refresh_interval()?;
        self.probe_timeout()?;
        Ok(())
    }

    pub fn scheduler_config(&self) -> Result<SchedulerConfig, AppError> {
        let s = &self.scheduler;
        let mut throttle = DomainThrottleConfig::new(delta(
            "scheduler.domain_spacing_secs",
            s.domain_spacing_secs,
            TimeDelta::try_seconds,
        )?)
        .with_jitter(delta(
            "scheduler.domain_jitter_secs",
            s.domain_jitter_secs,
            TimeDelta::try_seconds,
        )?);
        for (domain, secs) in &s.domain_spacing_overrides {
            let field = format!("scheduler.domain_spacing_overrides.{domain}");
            throttle =
                throttle.with_override(domain.as_str(), delta(&field, *secs, TimeDelta::try_seconds)?);
        }
        Ok(SchedulerConfig::default()
            .with_max_concurrency(s.max_concurrency)
            .with_degraded_mode(s.degraded_concurrency, s.degraded_proxy_threshold)
            .with_require_proxy(s.require_proxy)
            .with_tick_interval(secs("scheduler.tick_secs", s.tick_secs)?)
            .with_job_timeout(secs("scheduler.job_timeout_secs", s.job_timeout_secs)?)
            .with_shutdown_grace(secs("scheduler.shutdown_grace_secs", s.shutdown_grace_secs)?)
            .with_persist_interval(secs("scheduler.persist_secs", s.persist_secs)?)
            .with_throttle(throttle))
    }

    pub fn retry_config(&self) -> Result<RetryPolicyConfig, AppError> {
        let mut config = RetryPolicyConfig::default()
            .with_max_delay(delta(
                "retry.max_delay_secs",
                self.retry.max_delay_secs,
                TimeDelta::try_seconds,
            )?)
            .with_jitter_fraction(self.retry.jitter_fraction);
        for (category, secs) in &self.retry.base_delay_secs {
            let field = format!("retry.base_delay_secs.{category}");
            config = config.with_base_delay(*category, delta(&field, *secs, TimeDelta::try_seconds)?);
        }
        Ok(config)
    }

    pub fn circuit_config(&self) -> Result<CircuitBreakerConfig, AppError> {
        let mut config = CircuitBreakerConfig::default().with_default_cooldown(delta(
            "circuit.cooldown_minutes",
            self.circuit.cooldown_minutes,
            TimeDelta::try_minutes,
        )?);
        for (category, minutes) in &self.circuit.cooldown_minutes_by_category {
            let field = format!("circuit.cooldown_minutes_by_category.{category}");
            config = config.with_cooldown(*category, delta(&field, *minutes, TimeDelta::try_minutes)?);
        }
        Ok(config)
    }

    pub fn ledger_config(&self) -> Result<ChallengeLedgerConfig, AppError> {
        Ok(ChallengeLedgerConfig::default()
            .with_max_retries(self.challenges.max_retries)
            .with_reset_window(delta(
                "challenges.reset_hours",
                self.challenges.reset_hours,
                TimeDelta::try_hours,
            )?))
    }

    pub fn pool_config(&self) -> Result<ProxyPoolConfig, AppError> {
        Ok(ProxyPoolConfig::default()
            .with_failure_threshold(self.proxies.failure_threshold)
            .with_cooldown(delta(
                "proxies.cooldown_secs",
                self.proxies.cooldown_secs,
                TimeDelta::try_seconds,
            )?)
            .with_burn(delta(
                "proxies.burn_hours",
                self.proxies.burn_hours,
                TimeDelta::try_hours,
            )?))
    }

    pub fn refresh_interval(&self) -> Result<Duration, AppError> {
        secs("proxies.refresh_secs", self.proxies.refresh_secs)
    }

    fn probe_timeout(&self) -> Result<Duration, AppError> {
        secs("proxies.probe_timeout_secs", self.proxies.probe_timeout_secs)
    }

    /// Build every configured proxy source. Inline entries must all parse.
    pub fn proxy_sources(&self) -> Result<Vec<ProxySourceKind>, AppError> {
        let mut sources = Vec::new();
        if !self.proxies.inline.is_empty() {
            sources.push(StaticProxySource::from_lines("inline", &self.proxies.inline)?.into());
        }
        for path in &self.proxies.files {
            sources.push(FileProxySource::new(path).into());
        }
        for url in &self.proxies.urls {
            sources.push(HttpProxySource::new(url)?.into());
        }
        Ok(sources)
    }

    pub fn probe(&self) -> Result<HttpProxyProbe, AppError> {
        Ok(HttpProxyProbe::new(&self.proxies.probe_url)?.with_timeout(self.probe_timeout()?))
    }

    pub fn runner(&self) -> CommandTaskRunner {
        let mut runner =
            CommandTaskRunner::new(&self.runner.program).with_args(self.runner.args.clone());
        for (key, value) in &self.runner.env {
            runner = runner.with_env(key.as_str(), value.as_str());
        }
        if let Some(dir) = &self.runner.working_dir {
            runner = runner.with_working_dir(dir);
        }
        runner
    }
}

/// Longest value any duration tunable may take.
const MAX_DURATION_SECS: i64 = 366 * 24 * 3600;

/// Convert a signed farm-file duration, rejecting negative or oversized values.
fn delta(
    field: &str,
    value: i64,
    unit: fn(i64) -> Option<TimeDelta>,
) -> Result<TimeDelta, AppError> {
    if value < 0 {
        return Err(AppError::ConfigError(format!(
            "{field} must not be negative, got {value}"
        )));
    }
    match unit(value) {
        Some(delta) if delta.num_seconds() <= MAX_DURATION_SECS => Ok(delta),
        _ => Err(AppError::ConfigError(format!(
            "{field} is too large, got {value} (at most one year)"
        ))),
    }
}

fn secs(field: &str, value: u64) -> Result<Duration, AppError> {
    if value > MAX_DURATION_SECS.unsigned_abs() {
        return Err(AppError::ConfigError(format!(
            "{field} is too large, got {value} (at most one year)"
        )));
    }
    Ok(Duration::from_secs(value))
}
