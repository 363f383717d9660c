//! swarmd - switchyard swarm daemon
//!
//! Listens on the configured addresses, dials bootstrap peers and keeps
//! muxed connections open until interrupted.

use clap::Parser;
use std::process::ExitCode;
use swarmd::config::Config;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn init_logging(config: &Config) {
    let level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("swarmd={level},switchyard_net={level}")));
    let json = config.log_format == "json";

    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> ExitCode {
    // Parse configuration
    let config = Config::parse();
    init_logging(&config);

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {}", e);
        return ExitCode::FAILURE;
    }

    info!(
        "swarmd v{} - switchyard swarm daemon",
        env!("CARGO_PKG_VERSION")
    );

    if let Err(e) = swarmd::node::run(config).await {
        error!("Node error: {}", e);
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
