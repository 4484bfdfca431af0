//! CLI command definitions and subcommands

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::ipc::messages::DEFAULT_RESOURCE_KIND;

/// nb - shared neural model broker
#[derive(Debug, Parser)]
#[command(
    name = "nb",
    about = "Broker that runs each named model in one context and shares its results",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Broker socket path (overrides config)
    #[arg(long, global = true, help = "Broker socket path")]
    pub socket: Option<PathBuf>,

    /// Log to stderr instead of the log file
    #[arg(long, global = true)]
    pub stderr: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the broker until interrupted
    Serve,

    /// Submit one evaluation as a consumer and print the output
    Evaluate {
        /// Resource name to evaluate against
        #[arg(short, long)]
        resource: String,

        /// Resource kind (feed-forward, convolutional)
        #[arg(short, long, default_value = DEFAULT_RESOURCE_KIND)]
        kind: String,

        /// Give up after this many milliseconds
        #[arg(short, long)]
        timeout_ms: Option<u64>,

        /// Input as JSON
        input: String,
    },

    /// Register as a server that echoes its input, until interrupted
    Echo {
        /// Resource name to serve
        #[arg(short, long)]
        resource: String,

        /// Resource kind (feed-forward, convolutional)
        #[arg(short, long, default_value = DEFAULT_RESOURCE_KIND)]
        kind: String,
    },
}
