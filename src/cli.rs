// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(
    name = "tiller",
    version,
    about = "LLM agent runtime: durable conversations, sandboxed tools, remote projection"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the agent server (HTTP + WebSocket).
    Serve {
        /// Address to bind.
        #[arg(long, default_value = "127.0.0.1")]
        host: IpAddr,

        /// Port to bind.
        #[arg(long, default_value_t = 8010)]
        port: u16,

        /// Server config file (JSON). Falls back to the
        /// TILLER_SERVER_CONFIG_PATH environment variable, then defaults.
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },

    /// Print the resolved server configuration and exit.
    ShowConfig {
        #[arg(long, short = 'c')]
        config: Option<PathBuf>,
    },
}
