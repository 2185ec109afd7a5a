//! Rivulet - consumer groups over append-only streams
//!
//! The binary runs the broker against in-memory pools:
//! - `demo` publishes a burst of events and drains it with competing consumers
//! - `config` prints the default configuration

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;

use rivulet_common::Config;

mod demo;

#[derive(Parser)]
#[command(name = "rivulet")]
#[command(author, version, about = "Rivulet - consumer groups over append-only streams", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "RIVULET_LOG_JSON")]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Publish events and drain them with competing consumers
    Demo {
        /// Number of events to publish
        #[arg(short, long, default_value_t = 10_000)]
        events: usize,

        /// Number of competing consumers
        #[arg(short, long, default_value_t = 4)]
        consumers: usize,

        /// Maximum events per handler call
        #[arg(short, long, default_value_t = 100)]
        batch: usize,

        /// Configuration file path (TOML or JSON)
        #[arg(long, env = "RIVULET_CONFIG")]
        config: Option<PathBuf>,
    },

    /// Print the default configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    rivulet_common::logging::init(cli.json)?;

    match cli.command {
        Commands::Demo {
            events,
            consumers,
            batch,
            config,
        } => {
            let config = match config {
                Some(path) => {
                    info!("Loading configuration from {}", path.display());
                    Config::load(&path).await?
                }
                None => Config::default(),
            };

            let report = demo::run(&config, events, consumers, batch).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }

        Commands::Config => {
            print!("{}", toml::to_string_pretty(&Config::default())?);
        }
    }

    Ok(())
}
