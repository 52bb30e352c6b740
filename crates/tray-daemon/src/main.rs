//! tray-daemon: Headless sync runner for a tray hierarchy.
//!
//! Uses the same tray-core engine as an embedding application, but persists
//! the tree, baselines and backups as JSON under a data directory and talks
//! to "servers" that are plain directories under a remote root.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use tray_core::now_ms;
use tray_daemon::{Daemon, DaemonOptions};

#[derive(Parser, Debug)]
#[command(name = "tray-daemon")]
#[command(about = "Tray hierarchy sync daemon")]
struct Args {
    /// Directory holding tree.json, baselines, backups and credentials
    #[arg(short, long)]
    data_dir: PathBuf,

    /// Directory standing in for the remote servers
    #[arg(short, long)]
    remote_root: PathBuf,

    /// Seconds between sync ticks
    #[arg(long, default_value_t = 60)]
    interval_secs: u64,

    /// Maximum concurrent syncs
    #[arg(long, default_value_t = 3)]
    max_concurrent: usize,

    /// Seconds between saves of the local tree
    #[arg(long, default_value_t = 30)]
    save_secs: u64,

    /// Run one tick and exit
    #[arg(long)]
    once: bool,

    /// Start with auto-sync disabled
    #[arg(long)]
    no_auto_sync: bool,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,tray_daemon=debug,tray_core=debug"
    } else {
        "info,tray_daemon=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Starting tray-daemon");
    info!("Data directory: {:?}", args.data_dir);
    info!("Remote root: {:?}", args.remote_root);

    let mut options = DaemonOptions::new(args.data_dir, args.remote_root);
    options.sync.tick_interval = Duration::from_secs(args.interval_secs.max(1));
    options.sync.max_concurrent = args.max_concurrent.max(1);
    options.auto_sync = !args.no_auto_sync;

    let daemon = Daemon::open(options)?;

    match daemon.cleanup_backups(now_ms()).await {
        Ok(report) if report.deleted() > 0 => {
            info!("Pruned {} backups, {} remain", report.deleted(), report.remaining);
        }
        Ok(_) => {}
        Err(e) => warn!("Backup cleanup failed: {:#}", e),
    }

    if args.once {
        for (node_id, result) in daemon.run_once(now_ms()).await {
            match result {
                Ok(outcome) => info!("{}: {:?}", node_id, outcome),
                Err(e) => error!("{}: {}", node_id, e),
            }
        }
        daemon.report();
        daemon.save()?;
        return Ok(());
    }

    let driver = daemon.spawn_driver();
    let mut save_ticker = tokio::time::interval(Duration::from_secs(args.save_secs.max(1)));

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            _ = save_ticker.tick() => {
                daemon.report();
                if let Err(e) = daemon.save() {
                    error!("Failed to save tree: {:#}", e);
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    info!("Shutting down");
    driver.stop();
    daemon.report();
    daemon.save()?;
    Ok(())
}
