//! Command-line interface definition for streamgate
//!
//! Defined with clap's derive API. The gateway is a single long-running
//! service, so the surface is one `serve` subcommand plus the usual config
//! and verbosity switches.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// streamgate - HTTP range-streaming gateway for archived chat media
#[derive(Parser, Debug, Clone)]
#[command(name = "streamgate")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to an optional YAML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start the HTTP gateway
    Serve {
        /// Override the configured listener address (host:port)
        #[arg(short, long)]
        bind: Option<String>,
    },
}

impl Cli {
    /// Parse command line arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
