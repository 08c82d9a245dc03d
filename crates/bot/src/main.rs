//! Perch - chat automation bot core.
//!
//! Without a transport attached the binary runs in one of two modes: replay a
//! recorded session of transport events and report what the store projected
//! from it, or idle until interrupted so the durable layers can be inspected.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use perch_core::config::{self, Config};
use perch_ingest::StaticGroupFetcher;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod runtime;

use runtime::Bot;

/// Perch - chat automation bot core
#[derive(Parser)]
#[command(name = "perch")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// SQLite database path, overriding the configured one
    #[arg(short, long)]
    database: Option<PathBuf>,

    /// Replay transport events from a JSON Lines file, then exit
    #[arg(short, long)]
    replay: Option<PathBuf>,

    /// Group metadata served to enrichment, as a JSON array
    #[arg(short, long)]
    groups: Option<PathBuf>,

    /// Write the entity store snapshot here after replay
    #[arg(short, long)]
    snapshot: Option<PathBuf>,

    /// Emit logs as JSON
    #[arg(long)]
    json: bool,
}

fn init_tracing(config: &Config, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json || config.logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn load_groups(path: Option<&PathBuf>) -> Result<StaticGroupFetcher> {
    let Some(path) = path else {
        return Ok(StaticGroupFetcher::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read groups from {}", path.display()))?;
    let groups: Vec<perch_core::model::GroupMetadata> = serde_json::from_str(&json)
        .with_context(|| format!("{} is not a group metadata list", path.display()))?;
    Ok(StaticGroupFetcher::new(groups))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => config::load_config_from(path.clone()),
        None => config::load_config(),
    }
    .context("failed to load configuration")?;

    init_tracing(&config, cli.json);
    info!(version = env!("CARGO_PKG_VERSION"), "perch starting");

    let database = cli
        .database
        .clone()
        .or_else(|| config.storage.path.as_ref().map(PathBuf::from))
        .unwrap_or_else(config::default_storage_path);
    let fetcher = Arc::new(load_groups(cli.groups.as_ref())?);

    let bot = Bot::start(&config, &database, fetcher).await?;

    match &cli.replay {
        Some(path) => {
            let events = runtime::read_events(path)?;
            let summary = bot.replay(events).await?;
            info!(
                applied = summary.applied,
                chats = summary.chats,
                muted = summary.muted,
                "replay complete"
            );
            if let Some(snapshot) = &cli.snapshot {
                bot.write_snapshot(snapshot)?;
                info!(path = %snapshot.display(), "snapshot written");
            }
        }
        None => {
            info!("no transport attached, waiting for ctrl-c");
            tokio::signal::ctrl_c()
                .await
                .context("failed to listen for ctrl-c")?;
        }
    }

    bot.shutdown("process exiting").await;
    Ok(())
}
