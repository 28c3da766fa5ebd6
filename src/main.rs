mod ambient;
mod cache;
mod config;
mod cycle;
mod discovery;
mod error;
mod preferred;
mod runner;
mod sinks;
mod speedtest;
mod store;
mod traits;
mod types;
mod utils;

use ambient::AmbientProbe;
use anyhow::{bail, Result};
use cache::EndpointCache;
use clap::{Parser, Subcommand};
use config::Config;
use cycle::{CycleSettings, Orchestrator};
use discovery::Discovery;
use preferred::PreferredStore;
use runner::Runner;
use sinks::daily::DailyLog;
use speedtest::{SpeedtestClient, TransferPlan};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use types::{Pool, Provider};

#[derive(Parser)]
#[command(name = "netlogger")]
#[command(about = "Scheduled ISP speed tests with local logs and optional remote push", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    #[command(flatten)]
    config: Config,
}

#[derive(Subcommand)]
enum Commands {
    /// Measure every provider on an interval until stopped (default)
    Run,
    /// Run a single cycle and exit
    Once,
    /// Show the discovered server pool (e.g., netlogger discover)
    Discover,
    /// Run one speed test for a provider (e.g., netlogger measure du)
    Measure {
        /// Provider name (etisalat, du)
        provider: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => handle_run(&cli.config).await?,
        Commands::Once => handle_once(&cli.config).await?,
        Commands::Discover => handle_discover(&cli.config).await?,
        Commands::Measure { provider } => handle_measure(&cli.config, &provider).await?,
    }

    Ok(())
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "netlogger=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

// --- Wiring ---

fn build_runner(config: &Config) -> Result<Runner> {
    let client = Arc::new(SpeedtestClient::new(
        &config.server_list_url,
        Duration::from_secs(config.session_timeout_seconds),
        TransferPlan::default(),
    )?);
    let discovery = Discovery::new(EndpointCache::new(config.server_cache_path()), client.clone());

    Ok(Runner::new(
        discovery,
        PreferredStore::new(config.last_good_path()),
        client,
        config.runner_settings(),
    ))
}

fn build_orchestrator(config: &Config, cancel: CancellationToken) -> Result<Orchestrator> {
    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown_host".to_string());

    let log_dir = config.log_dir();
    info!(log_dir = ?log_dir, device = %config.device_id, "Recording results");

    Ok(Orchestrator::new(
        build_runner(config)?,
        AmbientProbe::new(config.ambient_settings())?,
        Box::new(DailyLog::new(log_dir)),
        sinks::build_forwarders(config)?,
        CycleSettings {
            device_id: config.device_id.clone(),
            hostname,
            retries: config.retries,
            interval: Duration::from_secs(config.interval_seconds),
            interval_jitter: Duration::from_secs(config.interval_jitter_seconds),
            provider_pause: Duration::from_secs(config.provider_pause_seconds),
        },
        cancel,
    ))
}

/// Wait for CTRL+C or SIGTERM.
async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received CTRL+C"),
                    _ = sigterm.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                warn!(error = %e, "SIGTERM handler unavailable, listening for CTRL+C only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
        info!("Received CTRL+C");
    }
}

// --- Handlers ---

async fn handle_run(config: &Config) -> Result<()> {
    let cancel = CancellationToken::new();
    let mut orchestrator = build_orchestrator(config, cancel.clone())?;

    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        cancel.cancel();
    });

    orchestrator.run().await;
    Ok(())
}

async fn handle_once(config: &Config) -> Result<()> {
    let mut orchestrator = build_orchestrator(config, CancellationToken::new())?;
    let succeeded = orchestrator.run_cycle().await?;
    println!("{} of {} providers measured.", succeeded, Provider::ALL.len());
    Ok(())
}

async fn handle_discover(config: &Config) -> Result<()> {
    let runner = build_runner(config)?;
    let pool = runner.discovery().discover().await;

    if pool == Pool::empty() {
        bail!("Server discovery failed. Please check your network connection.");
    }

    println!("{}", "-".repeat(70));
    println!("{:<10} {:<8} {:<24} Name", "Provider", "ID", "Sponsor");
    println!("{}", "-".repeat(70));
    for provider in Provider::ALL {
        for endpoint in pool.get(provider) {
            println!(
                "{:<10} {:<8} {:<24} {}",
                provider.key(),
                endpoint.id,
                endpoint.sponsor,
                endpoint.name
            );
        }
    }
    println!("{}", "-".repeat(70));
    println!("Cached at {:?}", runner.discovery().cache().path());

    Ok(())
}

async fn handle_measure(config: &Config, provider: &str) -> Result<()> {
    let provider: Provider = provider.parse()?;
    let runner = build_runner(config)?;

    let Some(result) = runner.measure(provider, config.retries).await else {
        bail!("All {} servers failed. See the log above for details.", provider);
    };

    println!(
        "{} via {} ({}) [id={}]",
        result.provider.label(),
        result.speedtest_server,
        result.speedtest_sponsor,
        result.server_id
    );
    let latency = result
        .latency_ms
        .map(|l| format!("{} ms", l))
        .unwrap_or_else(|| "n/a".to_string());
    println!(
        "Download {} Mbps, Upload {} Mbps, Latency {}, {} s with {} threads",
        result.download_mbps, result.upload_mbps, latency, result.duration_s, result.concurrency_used
    );
    Ok(())
}
