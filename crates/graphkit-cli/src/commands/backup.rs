//! `graphkit backup create|list|verify|restore-preview|restore-approve|restore-apply`
//! (spec §4.9).

use crate::app::App;
use crate::output::{print_json, print_success};
use anyhow::Result;
use clap::{Args, Subcommand};
use graphkit::backup::{CreateBackupOpts, BackupType};
use std::collections::HashMap;

#[derive(Debug, Args)]
pub struct BackupArgs {
    #[command(subcommand)]
    pub command: BackupCommand,
}

#[derive(Debug, Subcommand)]
pub enum BackupCommand {
    /// Snapshot the current graph to the local storage provider.
    Create {
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, String)>,
        #[arg(long)]
        skip_data: bool,
        #[arg(long)]
        include_config: bool,
    },
    /// List every backup recorded in this process's metadata table.
    List,
    /// Re-validate a backup's artifacts without issuing a restore token
    /// the caller intends to act on.
    Verify { backup_id: String },
    /// Validate a backup and issue a single-use restore token.
    RestorePreview {
        backup_id: String,
        #[arg(long)]
        requested_by: Option<String>,
    },
    /// Approve a previously issued restore token.
    RestoreApprove {
        token: String,
        approved_by: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Apply a validated, (if required) approved restore token.
    RestoreApply { token: String },
}

fn parse_label(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw}"))
}

pub async fn run(app: &App, args: BackupArgs) -> Result<()> {
    match args.command {
        BackupCommand::Create { labels, skip_data, include_config } => {
            let opts = CreateBackupOpts {
                backup_type: BackupType::Full,
                include_data: !skip_data,
                include_config,
                storage_provider_id: None,
                labels: labels.into_iter().collect::<HashMap<_, _>>(),
            };
            let metadata = app.backup.create_backup(opts).await?;
            print_success(&format!("created backup {}", metadata.backup_id));
            print_json(&metadata);
        }
        BackupCommand::List => {
            let backups = app.backup.list_backups().await;
            print_json(&backups);
        }
        BackupCommand::Verify { backup_id } => {
            let preview = app.backup.preview_restore(&backup_id, None).await?;
            print_json(&(preview.status, preview.changes, preview.integrity_check));
        }
        BackupCommand::RestorePreview { backup_id, requested_by } => {
            let preview = app.backup.preview_restore(&backup_id, requested_by).await?;
            print_json(&preview);
        }
        BackupCommand::RestoreApprove { token, approved_by, reason } => {
            app.backup.approve_restore(&token, &approved_by, reason).await?;
            print_success(&format!("approved restore token {token}"));
        }
        BackupCommand::RestoreApply { token } => {
            let outcome = app.backup.apply_restore(&token).await?;
            app.save_snapshot().await?;
            print_json(&outcome);
        }
    }
    Ok(())
}
