//! Clap CLI definitions for kgr.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub const AFTER_HELP: &str = "\
Examples:
  kgr serve                                  Serve /echo on the configured address
  kgr serve --listen 0.0.0.0:4750            Override the listen address
  kgr call --service /echo --message '{\"n\":1}'
  kgr call --service /echo --message hi --account alice --password secret";

/// kgr: named services and pipes across processes.
#[derive(Parser)]
#[command(name = "kgr", version, about, after_help = AFTER_HELP)]
pub struct Cli {
    /// Path to config file (default: ~/.kgr/config.toml).
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a master exposing an echo service at /echo.
    Serve {
        /// Address to listen on, overriding the config.
        #[arg(long)]
        listen: Option<String>,
    },
    /// Connect to a master, send one message to a service and print the reply.
    Call {
        /// Master address (default: the configured listen address).
        #[arg(long)]
        addr: Option<String>,
        /// Service path, e.g. /echo.
        #[arg(long)]
        service: String,
        /// Message to send. Parsed as JSON when possible, else sent as a string.
        #[arg(long)]
        message: String,
        /// Log in as this account before connecting.
        #[arg(long, requires = "password")]
        account: Option<String>,
        /// Password for --account.
        #[arg(long)]
        password: Option<String>,
    },
}
