mod commands;

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use strata_core::{init_logging, LogFormat, LoggingConfig};

use commands::migrate;

#[derive(Parser)]
#[command(name = "strata")]
#[command(version)]
#[command(about = "Grouped, dependency-ordered database migrations")]
struct Cli {
    /// Settings file
    #[arg(short, long, global = true, default_value = "strata.yaml")]
    config: PathBuf,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Log output format: text, pretty or json
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run pending migrations
    Continue,

    /// Drop everything in the database and run all migrations from scratch
    Reset {
        /// Confirm that the database may be emptied
        #[arg(long)]
        force: bool,
    },

    /// Show the state of every migration
    Status,

    /// Create a new migration file in a group
    Create {
        /// Group name, e.g. structures
        group: String,

        /// Migration label, e.g. create_users
        label: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_logging(LoggingConfig::for_verbosity(cli.verbose).with_format(cli.log_format))
        .map_err(|e| anyhow::anyhow!(e))
        .context("Failed to initialize logging")?;

    match cli.command {
        Commands::Continue => {
            migrate::run(&cli.config).await?;
        }
        Commands::Reset { force } => {
            migrate::reset(&cli.config, force).await?;
        }
        Commands::Status => {
            migrate::status(&cli.config).await?;
        }
        Commands::Create { group, label } => {
            migrate::create(&cli.config, &group, &label).await?;
        }
    }

    Ok(())
}
