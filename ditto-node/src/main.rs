//! # ditto-node
//!
//! Runs an in-process enforcement node that reads one JSON signal per line
//! from stdin and writes replies and live publications to stdout.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ditto-node")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file; defaults apply without one
    #[arg(long, global = true, env = "DITTO_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process NDJSON signals from stdin until EOF
    Run {
        /// Print live commands and messages readable by these subjects
        #[arg(long = "subscribe", value_delimiter = ',')]
        subjects: Vec<String>,
    },

    /// Validate the configuration and print the effective values
    CheckConfig,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Logs go to stderr, stdout carries the protocol
    let subscriber = tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(if cli.verbose {
                tracing::Level::DEBUG.into()
            } else {
                tracing::Level::INFO.into()
            }),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = commands::load_config(cli.config.as_deref())?;
    match cli.command {
        Commands::Run { subjects } => commands::run(config, subjects).await,
        Commands::CheckConfig => commands::check_config(&config),
    }
}
