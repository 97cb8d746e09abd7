//! `graphkit checkpoint create|list|export|import` — subgraph snapshots
//! for time-travel traversal (spec §4.5).

use crate::app::App;
use crate::output::{print_json, print_success};
use anyhow::{Context, Result};
use clap::{Args, Subcommand};
use graphkit::entity_store::ListParams;
use graphkit::model::EntityType;
use std::path::PathBuf;

#[derive(Debug, Args)]
pub struct CheckpointArgs {
    #[command(subcommand)]
    pub command: CheckpointCommand,
}

#[derive(Debug, Subcommand)]
pub enum CheckpointCommand {
    /// Create a checkpoint rooted at the given seed entity ids.
    Create {
        seed_ids: Vec<String>,
        #[arg(long, default_value = "manual checkpoint")]
        reason: String,
        #[arg(long, default_value_t = 2)]
        hops: u32,
    },
    /// List every checkpoint entity currently in the graph.
    List,
    /// Export a checkpoint's member ids and summary as JSON to a file.
    Export { checkpoint_id: String, out: PathBuf },
    /// Import a checkpoint previously written by `export`.
    Import { file: PathBuf },
}

pub async fn run(app: &App, args: CheckpointArgs) -> Result<()> {
    match args.command {
        CheckpointCommand::Create { seed_ids, reason, hops } => {
            let summary = app
                .history
                .create_checkpoint(seed_ids, graphkit::history::CheckpointOpts { reason, hops, window: None, description: None })
                .await?;
            app.save_snapshot().await?;
            print_json(&summary);
        }
        CheckpointCommand::List => {
            let result = app
                .entities
                .list(ListParams { entity_type: Some(EntityType::Checkpoint), limit: 0, ..Default::default() })
                .await?;
            print_json(&result.items);
        }
        CheckpointCommand::Export { checkpoint_id, out } => {
            let payload = app.history.export_checkpoint(&checkpoint_id).await?;
            let json = serde_json::to_vec_pretty(&payload)?;
            tokio::fs::write(&out, json).await.with_context(|| format!("writing {}", out.display()))?;
            print_success(&format!("exported checkpoint {checkpoint_id} to {}", out.display()));
        }
        CheckpointCommand::Import { file } => {
            let bytes = tokio::fs::read(&file).await.with_context(|| format!("reading {}", file.display()))?;
            let payload: serde_json::Value = serde_json::from_slice(&bytes)?;
            let summary = app.history.import_checkpoint(payload).await?;
            app.save_snapshot().await?;
            print_json(&summary);
        }
    }
    Ok(())
}
