mod config;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use claimd_core::challenge::{ChallengeLedger, ChallengeLedgerConfig};
use claimd_core::circuit_breaker::CircuitBreaker;
use claimd_core::proxy_pool::{ProxyAddress, ProxyPool, run_refresh_loop};
use claimd_core::retry::RetryPolicy;
use claimd_core::scheduler::JobScheduler;
use claimd_core::state::JsonFileStore;
use claimd_core::traits::{ProxyProbe, ProxySource, StateStore};

use crate::config::FarmConfig;

/// Concurrent probes for `check-proxies`.
const CHECK_CONCURRENCY: usize = 16;

#[derive(Parser)]
#[command(name = "claimd", version, about = "Scheduler for recurring claim jobs")]
struct Cli {
    /// Farm file describing jobs, proxy sources and the task command
    #[arg(short, long, env = "CLAIMD_CONFIG", default_value = "claimd.json", global = true)]
    config: PathBuf,

    /// State file written on shutdown and periodically while running
    #[arg(short, long, env = "CLAIMD_STATE", default_value = "claimd-state.json", global = true)]
    state: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler until Ctrl-C
    Run,

    /// Show jobs, proxy health and the challenge ledger from the state file
    Status {
        /// Print the raw state as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Clear challenge counters in the state file
    ResetChallenges {
        /// Only entries for this target
        #[arg(short, long)]
        target: Option<String>,

        /// Only entries for this account (requires --target)
        #[arg(short, long, requires = "target")]
        account: Option<String>,
    },

    /// Probe every proxy from the configured sources
    CheckProxies,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("claimd=info".parse()?))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run => {
            let config = load_config(&cli.config)?;
            cmd_run(config, &cli.state).await?;
        }
        Commands::Status { json } => {
            cmd_status(&cli.config, &cli.state, json).await?;
        }
        Commands::ResetChallenges { target, account } => {
            cmd_reset_challenges(&cli.state, target.as_deref(), account.as_deref()).await?;
        }
        Commands::CheckProxies => {
            let config = load_config(&cli.config)?;
            cmd_check_proxies(&config).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<FarmConfig> {
    FarmConfig::load(path)
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to load farm file {}", path.display()))
}

async fn cmd_run(config: FarmConfig, state_path: &Path) -> Result<()> {
    let pool = ProxyPool::new(config.pool_config().map_err(|e| anyhow::anyhow!(e))?);
    let store = JsonFileStore::new(state_path);
    let scheduler_config = config.scheduler_config().map_err(|e| anyhow::anyhow!(e))?;
    let circuit_config = config.circuit_config().map_err(|e| anyhow::anyhow!(e))?;
    let ledger_config = config.ledger_config().map_err(|e| anyhow::anyhow!(e))?;
    let retry_config = config.retry_config().map_err(|e| anyhow::anyhow!(e))?;

    let mut scheduler = JobScheduler::new(config.runner(), store, scheduler_config)
        .with_pool(pool.clone())
        .with_circuit_breaker(CircuitBreaker::new(circuit_config))
        .with_ledger(ChallengeLedger::new(ledger_config))
        .with_retry_policy(RetryPolicy::new(retry_config));

    for spec in config.jobs.iter().cloned() {
        scheduler.add_job(spec).map_err(|e| anyhow::anyhow!(e))?;
    }
    let restored = scheduler
        .load_state()
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to load state from {}", state_path.display()))?;
    if !restored {
        tracing::info!(path = %state_path.display(), "No saved state, starting fresh");
    }

    let cancel = CancellationToken::new();

    if config.proxies.has_sources() {
        let sources = config.proxy_sources().map_err(|e| anyhow::anyhow!(e))?;
        let probe = config.probe().map_err(|e| anyhow::anyhow!(e))?;
        let refresh_interval = config.refresh_interval().map_err(|e| anyhow::anyhow!(e))?;
        match pool.refresh(&sources, &probe).await {
            Ok(report) => tracing::info!(
                proxies = pool.len(),
                validated = report.validated,
                "Initial proxy refresh done"
            ),
            Err(e) => tracing::warn!(error = %e, "Initial proxy refresh failed"),
        }
        tokio::spawn(run_refresh_loop(
            pool.clone(),
            sources,
            probe,
            refresh_interval,
            cancel.child_token(),
        ));
    } else if config.scheduler.require_proxy {
        anyhow::bail!("require_proxy is set but no proxy sources are configured");
    } else {
        tracing::info!("No proxy sources configured, jobs run direct");
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => tracing::info!("Ctrl-C received, shutting down"),
            Err(e) => tracing::error!(error = %e, "Cannot listen for Ctrl-C, shutting down"),
        }
        shutdown.cancel();
    });

    scheduler
        .run(cancel)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .context("Scheduler stopped with an error")
}

async fn cmd_status(config_path: &Path, state_path: &Path, json: bool) -> Result<()> {
    let store = JsonFileStore::new(state_path);
    let Some(snapshot) = store.load().await.map_err(|e| anyhow::anyhow!(e))? else {
        println!("No state at {}", state_path.display());
        return Ok(());
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
        return Ok(());
    }

    // Cap and reset window come from the farm file when there is one.
    let ledger_config = match FarmConfig::load(config_path).and_then(|c| c.ledger_config()) {
        Ok(config) => config,
        Err(e) => {
            tracing::debug!(error = %e, "Using default challenge settings");
            ChallengeLedgerConfig::default()
        }
    };

    let now = Utc::now();
    println!("State saved {}\n", format_time(snapshot.saved_at));

    let mut jobs = snapshot.jobs.clone();
    jobs.sort_by(|a, b| a.next_eligible_run_at.cmp(&b.next_eligible_run_at));
    println!("Jobs ({}):", jobs.len());
    for job in &jobs {
        let due = if job.next_eligible_run_at <= now {
            "due now".to_string()
        } else {
            format!("next {}", format_time(job.next_eligible_run_at))
        };
        println!(
            "  {:<40} {:<28} failures={} last_error={} total={:.8}",
            job.key.to_string(),
            due,
            job.consecutive_failures,
            job.last_error.map(|c| c.as_str()).unwrap_or("-"),
            job.total_amount,
        );
    }

    if !snapshot.disabled.is_empty() {
        println!("\nDisabled ({}):", snapshot.disabled.len());
        for disabled in &snapshot.disabled {
            println!(
                "  {:<40} {} ({})",
                disabled.key.to_string(),
                disabled.reason,
                format_time(disabled.disabled_at),
            );
        }
    }

    let pool = ProxyPool::default();
    pool.restore(snapshot.proxies.clone());
    let health = pool.health_summary(now);
    println!(
        "\nProxies: {} total, {} healthy, {} degraded, {} unavailable{}",
        health.total,
        health.healthy,
        health.degraded,
        health.unavailable,
        health
            .average_latency_ms
            .map(|ms| format!(", avg {ms:.0} ms"))
            .unwrap_or_default(),
    );
    for endpoint in snapshot.proxies.iter().filter(|e| !e.is_usable(now)) {
        let reason = if endpoint.is_burned(now) {
            "burned"
        } else if endpoint.is_cooling(now) {
            "cooling"
        } else {
            "unvalidated"
        };
        println!("  {:<12} {}", reason, endpoint.address);
    }

    let ledger = ChallengeLedger::new(ledger_config);
    ledger.restore(snapshot.challenges);
    let status = ledger.status(now);
    if !status.is_empty() {
        println!("\nChallenges:");
        for row in status {
            println!(
                "  {}/{} {}/{}{} (resets in {:.1}h)",
                row.target,
                row.account,
                row.retries,
                row.max_retries,
                if row.at_cap { " SUSPENDED" } else { "" },
                row.hours_until_reset,
            );
        }
    }

    Ok(())
}

/// Apply a ledger reset to the state file.
///
/// A running scheduler overwrites the file on its next persist; use the
/// control handle for live resets.
async fn cmd_reset_challenges(
    state_path: &Path,
    target: Option<&str>,
    account: Option<&str>,
) -> Result<()> {
    let store = JsonFileStore::new(state_path);
    let Some(mut snapshot) = store.load().await.map_err(|e| anyhow::anyhow!(e))? else {
        println!("No state at {}", state_path.display());
        return Ok(());
    };

    let ledger = ChallengeLedger::default();
    ledger.restore(std::mem::take(&mut snapshot.challenges));
    let cleared = ledger.reset(target, account);
    snapshot.challenges = ledger.entries();
    store
        .save(&snapshot)
        .await
        .map_err(|e| anyhow::anyhow!(e))
        .with_context(|| format!("Failed to write {}", state_path.display()))?;

    println!("Cleared {cleared} challenge entr{}", if cleared == 1 { "y" } else { "ies" });
    Ok(())
}

async fn cmd_check_proxies(config: &FarmConfig) -> Result<()> {
    let sources = config.proxy_sources().map_err(|e| anyhow::anyhow!(e))?;
    if sources.is_empty() {
        println!("No proxy sources configured");
        return Ok(());
    }
    let probe = config.probe().map_err(|e| anyhow::anyhow!(e))?;

    let mut addresses: Vec<ProxyAddress> = Vec::new();
    for source in &sources {
        match source.fetch().await {
            Ok(fetched) => {
                println!("{}: {} proxies", source.name(), fetched.len());
                for address in fetched {
                    if !addresses.iter().any(|a| a.id() == address.id()) {
                        addresses.push(address);
                    }
                }
            }
            Err(e) => println!("{}: FAILED ({e})", source.name()),
        }
    }

    tracing::info!(count = addresses.len(), probe_url = %probe.probe_url(), "Probing proxies");

    let semaphore = Arc::new(Semaphore::new(CHECK_CONCURRENCY));
    let mut probes = JoinSet::new();
    for address in addresses {
        let probe = probe.clone();
        let semaphore = semaphore.clone();
        probes.spawn(async move {
            let _permit = semaphore.acquire_owned().await;
            let result = probe.probe(&address).await;
            (address, result)
        });
    }

    let mut results: Vec<(ProxyAddress, Result<Duration, String>)> = Vec::new();
    while let Some(joined) = probes.join_next().await {
        match joined {
            Ok((address, result)) => results.push((address, result.map_err(|e| e.to_string()))),
            Err(e) => tracing::warn!(error = %e, "Probe task failed"),
        }
    }
    results.sort_by_key(|(_, result)| match result {
        Ok(latency) => (0, *latency),
        Err(_) => (1, Duration::ZERO),
    });

    let ok = results.iter().filter(|(_, r)| r.is_ok()).count();
    println!();
    for (address, result) in &results {
        match result {
            Ok(latency) => println!("  ok    {:>6} ms  {}", latency.as_millis(), address),
            Err(e) => println!("  FAIL            {}  {}", address, e),
        }
    }
    println!("\n{ok}/{} proxies reachable", results.len());

    Ok(())
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}
