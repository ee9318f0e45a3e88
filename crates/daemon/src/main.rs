//! updraftd — the autoscaling control-plane daemon.
//!
//! Loads configuration and the upstream service catalog, wires the
//! store, worker, and scheduler together, and runs the scheduler loop
//! until interrupted.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use updraft_domain::{Config, SystemClock};
use updraft_engine::SchedulerService;
use updraft_store::{MemBackend, ScalingStore};
use updraft_worker::{
    public_endpoint_url, CatalogService, HttpComputeClient, HttpLoadBalancerClient, PollSettings,
    Supervisor,
};

#[derive(Parser)]
#[command(name = "updraftd", about = "Autoscaling control-plane daemon")]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "updraft.toml")]
    config: PathBuf,

    /// Path to the service-catalog JSON used to resolve upstream
    /// endpoints.
    #[arg(long, default_value = "catalog.json")]
    catalog: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;
    let catalog = load_catalog(&cli.catalog)?;
    let auth_token =
        std::env::var("UPDRAFT_AUTH_TOKEN").context("UPDRAFT_AUTH_TOKEN must be set")?;

    let compute_url = public_endpoint_url(
        &catalog,
        &config.catalog.compute_service,
        &config.catalog.region,
    )?;
    let lb_region = config
        .catalog
        .lb_region_override
        .as_deref()
        .unwrap_or(&config.catalog.region);
    let lb_url = public_endpoint_url(&catalog, &config.catalog.load_balancer_service, lb_region)?;
    tracing::info!(compute_url = %compute_url, lb_url = %lb_url, "resolved upstream endpoints");

    let http = reqwest::Client::new();
    let clock = Arc::new(SystemClock);
    // Single-node reference wiring; a wide-column driver implements the
    // same StorageBackend trait for clustered deployments.
    let backend = Arc::new(MemBackend::new());
    let store = ScalingStore::new(backend, clock.clone(), config.lock.clone());

    let supervisor = Arc::new(Supervisor::new(
        Arc::new(HttpComputeClient::new(
            http.clone(),
            compute_url,
            auth_token.clone(),
        )),
        Arc::new(HttpLoadBalancerClient::new(http, lb_url, auth_token)),
        PollSettings::from(&config.worker),
        clock.clone(),
    ));

    let scheduler = SchedulerService::new(&config.scheduler, store, supervisor, clock);
    tracing::info!(
        interval_secs = config.scheduler.interval_secs,
        batch_size = config.scheduler.batch_size,
        "scheduler starting"
    );

    tokio::select! {
        _ = scheduler.run() => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received; shutting down");
        }
    }
    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<Config> {
    if !path.exists() {
        tracing::info!(path = %path.display(), "no config file found; using defaults");
        return Ok(Config::default());
    }
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))
}

fn load_catalog(path: &Path) -> anyhow::Result<Vec<CatalogService>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading service catalog {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing service catalog {}", path.display()))
}
