//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the gridguard daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gridguard_common::{init_tracing, AppConfig, ConsumerKind, SystemClock};
use gridguard_core::Scheduler;
use gridguard_sim::SimulatedSite;
use gridguardd::{open_store, Daemon};
use tokio::signal;
use tracing::info;

const DEFAULT_CONFIG: &str = "configs/gridguard.toml";

#[derive(Debug, Parser)]
#[command(author, version, about = "gridguard load scheduler daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the guard loop against the simulated site")]
    Run,
    #[command(about = "Validate the configuration and print the consumer table")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG));

    let loaded = AppConfig::load_with_source(&candidates)?;
    let config = loaded.config;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            init_tracing("gridguardd", &config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(config).await?
        }
        Commands::CheckConfig => check_config(&config, &loaded.source)?,
    }
    Ok(())
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let store = open_store(&config.persistence)?;
    let daemon = Daemon::start(&config, store, Arc::new(SystemClock))?;

    info!("daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    daemon.shutdown().await
}

fn check_config(config: &AppConfig, source: &std::path::Path) -> Result<()> {
    let (_, bindings) = SimulatedSite::build(config)?;
    Scheduler::new(config, &bindings).context("consumer configuration rejected")?;

    println!("Configuration: {}", source.display());
    println!(
        "Peak floor: {} W, demand interval: {} min, battery: {}",
        config.grid.minimum_peak_load,
        config.grid.demand_interval_minutes,
        if config.battery.is_some() { "yes" } else { "no" }
    );
    println!(
        "{:<16} {:<8} {:>10} {:>10} {:>10}  groups",
        "consumer", "kind", "on (W)", "off (W)", "peak (W)"
    );
    for (name, consumer) in &config.consumers {
        let kind = match consumer.kind {
            ConsumerKind::Fixed => "fixed",
            ConsumerKind::Dynamic => "dynamic",
        };
        println!(
            "{:<16} {:<8} {:>10.0} {:>10.0} {:>10.0}  {}",
            name,
            kind,
            consumer.switch_on_load,
            consumer.switch_off_load,
            consumer.peak_load,
            consumer.groups.join(",")
        );
    }
    Ok(())
}
