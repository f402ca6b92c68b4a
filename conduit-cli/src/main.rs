use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conduit", about = "Consume and produce events on configured brokers")]
#[command(version, propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Broker configuration file (defaults to the user config directory)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// List configured brokers and the provider handling each
    Brokers,
    /// List configured topics
    Topics,
    /// Print events of a topic
    Consume(commands::consume::ConsumeArgs),
    /// Send events to a topic
    Produce(commands::produce::ProduceArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let service = commands::load_service(cli.config.as_deref())?;
    match cli.command {
        Commands::Brokers => commands::catalog::brokers(&service),
        Commands::Topics => commands::catalog::topics(&service),
        Commands::Consume(args) => commands::consume::run(&service, args).await,
        Commands::Produce(args) => commands::produce::run(&service, args).await,
    }
}
