//! # limiquantix libvirt agent
//!
//! Runs on each hypervisor host and manages guests through libvirt. Callers
//! drive it over JSON-RPC (`Libvirt.Create`, `Libvirt.Run`, `Libvirt.Status`,
//! ...); every request borrows one connection from a bounded pool.
//!
//! ## Usage
//! ```bash
//! limiquantix-libvirtd --config /etc/limiquantix/libvirtd.yaml
//! limiquantix-libvirtd --dev -p 19999
//! ```

use std::path::Path;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info, warn};

mod cli;
mod config;
mod http_server;
mod server;
mod service;

use cli::Args;
use config::{Config, ConfigSource, DEFAULT_CONFIG_PATH};

#[tokio::main]
async fn main() -> Result<()> {
    // Parse CLI arguments
    let args = Args::parse();

    // Load configuration before logging so its level and format apply
    let (config, source) = Config::resolve(&args, Path::new(DEFAULT_CONFIG_PATH))?;

    limiquantix_common::init_logging_with_format(&config.logging.level, config.logging.format)?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        "Starting limiquantix libvirt agent"
    );

    match source {
        ConfigSource::File(path) => info!(config_path = %path.display(), "Configuration loaded"),
        ConfigSource::Defaults(None) => info!("No config file found, using CLI arguments and defaults"),
        ConfigSource::Defaults(Some(e)) => warn!(
            config_path = DEFAULT_CONFIG_PATH,
            error = %e,
            "Ignoring unreadable config file, using CLI arguments and defaults"
        ),
    }

    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(e);
    }

    info!(
        listen = %config.server.listen_address,
        hypervisor = ?config.hypervisor.backend,
        uri = %config.hypervisor.uri,
        "Agent configured"
    );

    if let Err(e) = server::run(config).await {
        error!(error = %e, "Server failed");
        return Err(e);
    }

    Ok(())
}
