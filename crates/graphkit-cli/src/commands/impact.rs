//! `graphkit impact <entity-id>` — blast-radius report via dependent-edge BFS.

use crate::app::App;
use crate::output::print_json;
use anyhow::Result;
use clap::Args;

#[derive(Debug, Args)]
pub struct ImpactArgs {
    pub entity_id: String,

    #[arg(long, default_value_t = 3)]
    pub max_depth: u32,
}

pub async fn run(app: &App, args: ImpactArgs) -> Result<()> {
    let report = app.analysis.analyze_impact(&args.entity_id, args.max_depth, None).await?;
    print_json(&report);
    Ok(())
}
