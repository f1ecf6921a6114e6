//! Tribunal agent runner
//!
//! # Usage
//!
//! ```bash
//! # Whole roster in one process, founder messages read from stdin
//! tribunal-agent --config tribunal.toml simulate
//!
//! # Same, without a completion endpoint or tool program
//! tribunal-agent simulate --offline --dry-run
//!
//! # Check the completion endpoint, print the effective config
//! tribunal-agent check
//! tribunal-agent config
//! ```

mod simulate;

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use coordination::{HttpCompletionClient, TribunalConfig};
use tracing::info;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML config file. `TRIBUNAL_*` environment variables override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run every roster member against an in-process channel
    Simulate {
        /// Answer with a canned reply instead of calling the completion API
        #[arg(long, default_value_t = false)]
        offline: bool,

        /// Record tool calls instead of invoking the tool program
        #[arg(long, default_value_t = false)]
        dry_run: bool,

        /// Channel that stdin lines are posted to
        #[arg(long, default_value = "general")]
        channel: String,
    },
    /// Check that the completion endpoint answers
    Check,
    /// Print the effective configuration as TOML
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config = TribunalConfig::load(args.config.as_deref()).context("loading config")?;

    match args.command {
        Command::Simulate {
            offline,
            dry_run,
            channel,
        } => {
            simulate::run(
                config,
                simulate::SimulateOptions {
                    offline,
                    dry_run,
                    channel,
                },
            )
            .await
        }
        Command::Check => {
            let client = HttpCompletionClient::new(config.completion.clone())
                .context("building completion client")?;
            if !client.probe().await {
                bail!("completion endpoint {} is not answering", config.completion.base_url);
            }
            info!(
                url = %config.completion.base_url,
                model = %config.completion.model,
                "Completion endpoint is up"
            );
            Ok(())
        }
        Command::Config => {
            let rendered = toml::to_string_pretty(&config).context("rendering config")?;
            println!("{rendered}");
            Ok(())
        }
    }
}
