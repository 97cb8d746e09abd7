//! `graphkit history prune` — retention-based version/checkpoint pruning
//! (spec §4.5).

use crate::app::App;
use crate::output::print_json;
use anyhow::Result;
use clap::{Args, Subcommand};
use graphkit::history::PruneOpts;

#[derive(Debug, Args)]
pub struct HistoryArgs {
    #[command(subcommand)]
    pub command: HistoryCommand,
}

#[derive(Debug, Subcommand)]
pub enum HistoryCommand {
    /// Prune versions/edges older than `retention_days`.
    Prune {
        retention_days: i64,
        #[arg(long)]
        dry_run: bool,
    },
}

pub async fn run(app: &App, args: HistoryArgs) -> Result<()> {
    match args.command {
        HistoryCommand::Prune { retention_days, dry_run } => {
            let result = app.history.prune_history(retention_days, PruneOpts { dry_run }).await?;
            if !dry_run {
                app.save_snapshot().await?;
            }
            print_json(&result);
        }
    }
    Ok(())
}
