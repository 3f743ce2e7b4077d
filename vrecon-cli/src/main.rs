//! # vrecon
//!
//! Keeps libvirt domains and networks in line with their XML descriptors.
//! Each invocation runs one reconcile step and prints the resulting state as
//! JSON, which the caller stores and hands back on the next run.
//!
//! ## Usage
//! ```bash
//! vrecon create domain vm1.xml
//! vrecon update domain 4dea22b3-1d52-d8f3-2516-782e98ab3fa0 vm1.xml --last vm1.applied.xml
//! vrecon delete domain 4dea22b3-1d52-d8f3-2516-782e98ab3fa0
//! ```

use anyhow::Result;
use clap::Parser;
use std::path::Path;
use tracing::{error, info};

mod cli;
mod commands;
mod config;

use cli::Args;
use config::{Config, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Logging is configured from the file, so it has to be read first
    let config = load_config(&args)?.with_cli_overrides(&args);
    config.validate()?;

    if config.logging.json {
        vrecon_common::init_logging_json(&config.logging.level)?;
    } else {
        vrecon_common::init_logging(&config.logging.level)?;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        command = args.command.name(),
        hypervisor = ?config.hypervisor.backend,
        uri = %config.hypervisor.uri,
        "Starting vrecon"
    );
    info!(
        timeout_secs = config.shutdown.timeout_secs,
        start = config.domain.start,
        autostart = config.domain.autostart,
        "Reconciler configured"
    );

    let state = match commands::execute(args.command, &config).await {
        Ok(state) => state,
        Err(e) => {
            error!(error = %e, "Command failed");
            return Err(e);
        }
    };

    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

fn load_config(args: &Args) -> Result<Config> {
    match &args.config {
        // Explicit config file must load
        Some(path) => Config::load(path),
        None => {
            let default_path = Path::new(DEFAULT_CONFIG_PATH);
            if default_path.exists() {
                Config::load(default_path)
            } else {
                Ok(Config::default())
            }
        }
    }
}
