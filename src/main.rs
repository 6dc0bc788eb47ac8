//! fleetwatch: fleet health monitoring and remediation
//!
//! Subcommands: create, checkout, status, fast_register, monit.

use std::sync::Arc;

use clap::Parser;
use tracing::{info, warn};

use fleetwatch::batch::cancel_pair;
use fleetwatch::commands::{self, Commands};
use fleetwatch::{Config, Fleet};

#[derive(Parser)]
#[command(name = "fleetwatch")]
#[command(about = "Fleet health monitoring and remediation for ledger-registered nodes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let common = cli.command.common().clone();

    let directive = if common.debug {
        "fleetwatch=debug"
    } else {
        "fleetwatch=info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    info!("Config file: {}", common.config.display());
    let config = Config::load(&common.config, &common.overrides())?;
    info!(
        cluster = %config.cluster,
        machines = config.machines.len(),
        "Config loaded"
    );

    let fleet = Arc::new(Fleet::connect(config, common.names.clone())?);

    let (cancel_handle, cancel) = cancel_pair();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing in-flight work (Ctrl-C again to abort)");
            cancel_handle.cancel();
        }
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted again, aborting");
            std::process::exit(130);
        }
    });

    match commands::execute(fleet, &cli.command, &cancel).await {
        Ok(output) => {
            println!("{}", output);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}
