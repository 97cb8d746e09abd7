#![allow(clippy::expect_used, clippy::unwrap_used)]

//! `graphkit` — CLI surface over the code-knowledge graph engine
//! (spec §6 "CLI surface (minimum)").
//!
//! Each invocation is a fresh process wired against an in-memory graph
//! store, loaded from (and re-dumped to) a flat JSON state file so
//! sequential commands against the same `--state` path compose the way
//! they would against a persistent graph driver.

mod app;
mod commands;
mod output;

use anyhow::Result;
use app::App;
use clap::{Parser, Subcommand};
use commands::{backup, checkpoint, history, impact, ingest, search};
use graphkit::config::GraphKitConfig;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "graphkit")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Code-knowledge graph engine CLI")]
struct Cli {
    /// JSON state file the graph is loaded from and saved back to.
    #[arg(long, global = true)]
    state: Option<PathBuf>,

    /// Root directory backup artifacts are written under.
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Engine config file (see [`graphkit::config::GraphKitConfig`]).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Walk a directory tree into `File`/`Directory` entities.
    Ingest(ingest::IngestArgs),
    /// Structural/fuzzy entity search.
    Search(search::SearchArgs),
    /// Blast-radius report for one entity.
    Impact(impact::ImpactArgs),
    /// Subgraph checkpoints for time-travel traversal.
    Checkpoint(checkpoint::CheckpointArgs),
    /// Retention-based history pruning.
    History(history::HistoryArgs),
    /// Snapshot/restore orchestration.
    Backup(backup::BackupArgs),
}

async fn load_config(path: Option<PathBuf>) -> Result<GraphKitConfig> {
    let Some(path) = path else { return Ok(GraphKitConfig::default()) };
    let bytes = tokio::fs::read(&path).await?;
    let config: GraphKitConfig = serde_json::from_slice(&bytes)?;
    config.validate().map_err(anyhow::Error::msg)?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config).await?;
    let state_path = cli.state.unwrap_or_else(app::default_state_path);
    let data_dir = cli.data_dir.unwrap_or_else(app::default_data_dir);
    let app = App::bootstrap(state_path, data_dir, config).await?;

    match cli.command {
        Commands::Ingest(args) => ingest::run(&app, args).await,
        Commands::Search(args) => search::run(&app, args).await,
        Commands::Impact(args) => impact::run(&app, args).await,
        Commands::Checkpoint(args) => checkpoint::run(&app, args).await,
        Commands::History(args) => history::run(&app, args).await,
        Commands::Backup(args) => backup::run(&app, args).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clap_parses_known_subcommands() {
        let cli = Cli::try_parse_from(["graphkit", "search", "foo"]).expect("parse search");
        assert!(matches!(cli.command, Commands::Search(_)));

        let cli = Cli::try_parse_from(["graphkit", "impact", "entity-1", "--max-depth", "2"]).expect("parse impact");
        assert!(matches!(cli.command, Commands::Impact(_)));
    }

    #[test]
    fn clap_enforces_required_args() {
        assert!(Cli::try_parse_from(["graphkit", "impact"]).is_err());
        assert!(Cli::try_parse_from(["graphkit", "ingest"]).is_err());
    }
}
