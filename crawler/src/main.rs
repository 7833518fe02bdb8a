use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use pipeline_crawler::{config, enqueue, feeder, fetcher, migrate, parser, reaper};

#[derive(Parser, Debug)]
#[command(name = "crawler")]
#[command(about = "Distributed blog crawling and ingestion pipeline", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run catalogue migrations.
    Migrate,

    /// Expand re-crawl candidates into offset tasks on the import queue.
    Feeder,

    /// Lease import tasks and stage raw posts for the parser.
    Fetcher,

    /// Requeue tasks whose lease expired.
    Reaper,

    /// Drain the staging queues into the catalogue.
    Parser,

    /// Push a blog name onto the manual re-crawl queue.
    Enqueue {
        #[arg(long)]
        blog: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let default_level = if std::env::var_os("DEBUG").is_some() {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::Config::from_env().context("load crawler config")?;

    match cli.command {
        Command::Migrate => migrate::run(&cfg).await,
        Command::Feeder => feeder::run(&cfg).await,
        Command::Fetcher => fetcher::run(&cfg).await,
        Command::Reaper => reaper::run(&cfg).await,
        Command::Parser => parser::run(&cfg).await,
        Command::Enqueue { blog } => enqueue::run(&cfg, &blog).await,
    }
}
