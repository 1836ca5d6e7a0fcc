// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
mod cli;

use std::net::SocketAddr;

use clap::Parser;
use cli::{Cli, Commands};
use tiller_config::{init_logging, LoggingConfig, ServerConfig};
use tiller_server::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&LoggingConfig::from_env())?;

    match cli.command {
        Commands::Serve { host, port, config } => {
            let config = load_config(config.as_deref())?;
            let state = AppState::new(config);
            let addr = SocketAddr::new(host, port);
            tracing::info!(%addr, "starting tiller agent server");
            tiller_server::serve(state, addr).await
        }
        Commands::ShowConfig { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<ServerConfig> {
    match path {
        Some(path) => ServerConfig::from_file(path),
        None => ServerConfig::from_env(),
    }
}
