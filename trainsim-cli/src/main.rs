//! trainsim CLI: serve the REST gateway or drive a single simulated run.

mod commands;

use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// trainsim: simulated training runs with live metrics
#[derive(Parser, Debug)]
#[command(name = "trainsim", version, about, long_about = None)]
pub(crate) struct Cli {
    /// Workspace directory (looked up for `.trainsim/config.toml`)
    #[arg(short, long, default_value = ".")]
    workspace: PathBuf,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-essential output
    #[arg(short, long)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug, PartialEq)]
pub(crate) enum Commands {
    /// Run the REST gateway until interrupted
    Serve {
        /// Bind host (overrides gateway.host)
        #[arg(long)]
        host: Option<String>,
        /// Bind port (overrides gateway.port)
        #[arg(long)]
        port: Option<u16>,
    },
    /// Drive one in-memory run to completion and print its snapshot
    Simulate {
        /// Number of epochs
        #[arg(short, long, default_value_t = 10)]
        epochs: u32,
        /// Milliseconds between epochs
        #[arg(long, default_value_t = 100)]
        tick_ms: u64,
        /// Noise seed (overrides progression.seed)
        #[arg(long)]
        seed: Option<u64>,
        /// Pause after this epoch and resume right away
        #[arg(long)]
        pause_at: Option<u32>,
        /// Batch size of the simulated run
        #[arg(long, default_value_t = 32)]
        batch_size: u32,
    },
    /// Inspect configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(clap::Subcommand, Debug, PartialEq)]
pub(crate) enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    // Set up tracing: human-readable stderr + JSON file logging
    let filter = match cli.verbose {
        0 if cli.quiet => "error",
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(EnvFilter::new(filter));

    let log_dir = directories::ProjectDirs::from("dev", "trainsim", "trainsim")
        .map(|d| d.data_dir().join("logs"))
        .unwrap_or_else(|| PathBuf::from("."));
    let _ = std::fs::create_dir_all(&log_dir);
    let file_appender = tracing_appender::rolling::daily(&log_dir, "trainsim.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);
    let json_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::new("debug"));

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(json_layer)
        .init();

    let workspace = cli
        .workspace
        .canonicalize()
        .unwrap_or_else(|_| cli.workspace.clone());

    commands::handle_command(cli.command, &workspace).await
}
