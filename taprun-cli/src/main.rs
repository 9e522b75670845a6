mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing_subscriber::EnvFilter;

/// Run batch jobs through a taprun execution context
#[derive(Parser, Debug)]
#[command(name = "taprun", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Copy newline-delimited JSON records through a job
    Run(commands::run::RunArgs),
    /// Print the resolved context options
    Options(commands::options::OptionsArgs),
    /// Inspect or populate the distributed cache directory
    Cache(commands::cache::CacheArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Options(args) => commands::options::execute(args),
        Command::Cache(args) => commands::cache::execute(args).await,
    }
}
