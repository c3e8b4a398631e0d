mod commands;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// conduit -- run goals through AI providers with retries, fallbacks and
/// circuit breakers.
#[derive(Parser)]
#[command(name = "conduit", version, about)]
struct Cli {
    /// TOML config file. Without one, two scripted providers are used.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run each goal as its own task and stream the logs.
    Run {
        /// Override `[queue] concurrency`.
        #[arg(long)]
        concurrency: Option<usize>,
        /// Task mode recorded on every run.
        #[arg(long, default_value = "chat")]
        mode: String,
        /// One run is created per goal.
        #[arg(required = true)]
        goals: Vec<String>,
    },

    /// Print the effective configuration as TOML.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = commands::load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Run {
            concurrency,
            mode,
            goals,
        } => {
            commands::run::run(config, concurrency, &mode, &goals).await?;
        }
        Commands::Config => {
            commands::config::run(&config)?;
        }
    }

    Ok(())
}
