//! oob-manager daemon entry point.
//!
//! Loads the TOML configuration, registers every configured node, runs a
//! discovery pass over the fleet and then keeps the sessions alive until
//! Ctrl-C.
//!
//! # Usage
//!
//! ```text
//! oob-manager [OPTIONS]
//!
//! Options:
//!   --config <PATH>  Configuration file [default: oob-manager.toml]
//!   --once           Exit after the discovery pass
//!   --json           Print the discovery reports as JSON
//!   --dry-run        Serve every node from an in-memory plugin, no network
//! ```
//!
//! The log level comes from `RUST_LOG` when set, otherwise from
//! `[manager] log_level` in the configuration.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use oob_manager::application::discovery::DiscoveryReport;
use oob_manager::infrastructure::boards::scripted::ScriptedBoardService;
use oob_manager::infrastructure::service::ManagementService;
use oob_manager::infrastructure::storage::config::AppConfig;

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Out-of-band fleet manager.
#[derive(Debug, Parser)]
#[command(
    name = "oob-manager",
    about = "Discovers and keeps sessions with server management controllers",
    version
)]
struct Cli {
    /// Path of the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "oob-manager.toml", env = "OOB_MANAGER_CONFIG")]
    config: PathBuf,

    /// Exit after the discovery pass instead of running keepalive.
    #[arg(long)]
    once: bool,

    /// Print discovery reports as JSON on stdout.
    #[arg(long)]
    json: bool,

    /// Replace every node's plugin with an in-memory one that always succeeds.
    #[arg(long)]
    dry_run: bool,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading configuration from {}", cli.config.display()))?;

    // `RUST_LOG` wins over the configured level.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(&config.manager.log_level)),
        )
        .init();

    info!(config = %cli.config.display(), nodes = config.nodes.len(), "oob-manager starting");

    let service = ManagementService::from_config(&config).context("registering configured nodes")?;

    if cli.dry_run {
        for node in service.nodes().all() {
            let plugin = Arc::new(ScriptedBoardService::new(node.board().clone()));
            service.registry().override_for_node(node.id().clone(), plugin);
        }
        warn!("dry run: no controller will be contacted");
    }

    // ── Discovery pass ────────────────────────────────────────────────────────
    let reports = service.discover_all().await;
    if cli.json {
        println!("{}", serde_json::to_string_pretty(&reports).context("serializing reports")?);
    } else {
        print_table(&reports);
    }

    if cli.once {
        service.shutdown().await;
        return Ok(());
    }

    // ── Keepalive until Ctrl-C ────────────────────────────────────────────────
    service.start_keepalive();
    info!("oob-manager ready.  Press Ctrl-C to exit.");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!(error = %e, "failed to listen for Ctrl-C, shutting down"),
    }

    service.shutdown().await;
    info!("oob-manager stopped");
    Ok(())
}

fn print_table(reports: &[DiscoveryReport]) {
    println!("{:<20} {:<8} {:>8} {:>8}", "NODE", "STATUS", "FAILED", "POWERED");
    for report in reports {
        println!(
            "{:<20} {:<8} {:>8} {:>8}",
            report.node_id.to_string(),
            format!("{:?}", report.status),
            report.failed_attempts,
            if report.powered { "on" } else { "off" }
        );
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
