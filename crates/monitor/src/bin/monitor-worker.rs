//! monitor-worker: runs the compliance monitor against the in-memory store.
//!
//! Scans on a fixed period, appends incidents for every rule that fires and
//! logs status transitions and newly observed incidents until Ctrl-C (or
//! `--max-ticks`).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use civicwatch_core::config::{load_dotenv, OverlapPolicy};
use civicwatch_core::Config;
use civicwatch_monitor::{ComplianceMonitor, FeedView};
use civicwatch_rules::RuleCatalog;
use civicwatch_store::{LocalIdentity, MemoryIncidentStore};

// ── CLI ─────────────────────────────────────────────────────────────

/// Compliance monitor worker.
#[derive(Parser, Debug)]
#[command(name = "monitor-worker", version, about)]
struct Cli {
    /// TOML config file. Without it, config comes from the environment.
    #[arg(long, env = "CIVICWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Rule catalog YAML. Without it, the built-in reference rules are used.
    #[arg(long, env = "CIVICWATCH_RULES")]
    rules: Option<PathBuf>,

    /// Override the scan period (milliseconds).
    #[arg(long)]
    period_ms: Option<u64>,

    /// Override the overlap policy (skip | queue).
    #[arg(long)]
    overlap: Option<OverlapPolicy>,

    /// Seed the simulator for a reproducible run.
    #[arg(long)]
    seed: Option<u64>,

    /// Exit after this many completed ticks.
    #[arg(long)]
    max_ticks: Option<u64>,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => {
            let config = Config::from_file(path)?;
            info!(path = %path.display(), "loaded config file");
            config
        }
        None => Config::from_env(),
    };
    if let Some(ms) = cli.period_ms {
        config.monitor.scan_period_ms = ms;
    }
    if let Some(policy) = cli.overlap {
        config.monitor.overlap_policy = policy;
    }
    if cli.seed.is_some() {
        config.monitor.seed = cli.seed;
    }
    Ok(config)
}

fn load_catalog(cli: &Cli) -> anyhow::Result<RuleCatalog> {
    match &cli.rules {
        Some(path) => Ok(RuleCatalog::load(path)?),
        None => {
            info!("using built-in reference rules");
            Ok(RuleCatalog::reference())
        }
    }
}

async fn log_feed(mut feed: watch::Receiver<FeedView>) {
    while feed.changed().await.is_ok() {
        let view = feed.borrow_and_update().clone();
        if let Some(latest) = view.feed.latest() {
            info!(
                incidents = view.feed.len(),
                latest = %latest.record.draft.description,
                "incident feed updated"
            );
        }
    }
}

async fn wait_for_ticks(monitor: &ComplianceMonitor, max_ticks: u64) {
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    loop {
        poll.tick().await;
        let done = monitor
            .scan_metrics()
            .map(|m| m.ticks_run >= max_ticks)
            .unwrap_or(false);
        if done {
            info!(max_ticks, "tick limit reached");
            return;
        }
    }
}

// ── main ────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    load_dotenv();
    let cli = Cli::parse();

    let config = load_config(&cli)?;
    config.log_summary();
    debug!(config = %config.redacted_summary(), "effective config");
    let catalog = Arc::new(load_catalog(&cli)?);
    info!(rules = catalog.len(), "rule catalog ready");

    let monitor = ComplianceMonitor::new(
        config,
        catalog,
        Arc::new(MemoryIncidentStore::new()),
        Arc::new(LocalIdentity::new()),
    );

    let principal = monitor.start().await?;
    info!(principal = %principal, status = %monitor.status(), "monitor-worker running");

    if let Some(feed) = monitor.subscribe_feed() {
        tokio::spawn(log_feed(feed));
    }

    match cli.max_ticks {
        Some(max_ticks) => {
            tokio::select! {
                _ = wait_for_ticks(&monitor, max_ticks) => {}
                _ = tokio::signal::ctrl_c() => info!("interrupted"),
            }
        }
        None => {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for ctrl-c, shutting down");
            }
        }
    }

    monitor.stop().await;
    if let Some(metrics) = monitor.scan_metrics() {
        info!(
            ticks = metrics.ticks_run,
            skipped = metrics.ticks_skipped,
            recorded = metrics.records_appended,
            failures = metrics.append_failures,
            status = %monitor.status(),
            "monitor-worker exited cleanly"
        );
    }
    Ok(())
}
