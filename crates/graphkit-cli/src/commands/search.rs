//! `graphkit search <query>` — structural/fuzzy lookup over ingested entities.

use crate::app::App;
use crate::output::print_json;
use anyhow::Result;
use clap::Args;
use graphkit::search::{SearchRequest, Strategy};

#[derive(Debug, Args)]
pub struct SearchArgs {
    pub query: String,

    #[arg(long, default_value_t = 20)]
    pub limit: usize,

    /// Allow near-matches via Levenshtein distance instead of exact/prefix match.
    #[arg(long)]
    pub fuzzy: bool,

    #[arg(long, value_enum)]
    pub strategy: Option<CliStrategy>,
}

#[derive(Debug, Clone, Copy, clap::ValueEnum)]
pub enum CliStrategy {
    Structural,
    Semantic,
    Hybrid,
}

impl From<CliStrategy> for Strategy {
    fn from(value: CliStrategy) -> Self {
        match value {
            CliStrategy::Structural => Strategy::Structural,
            CliStrategy::Semantic => Strategy::Semantic,
            CliStrategy::Hybrid => Strategy::Hybrid,
        }
    }
}

pub async fn run(app: &App, args: SearchArgs) -> Result<()> {
    let request = SearchRequest {
        query: args.query,
        strategy: args.strategy.map(Into::into),
        fuzzy: args.fuzzy,
        filter_arity: 0,
        limit: args.limit,
    };
    let hits = app.search.search(request).await?;
    print_json(&hits);
    Ok(())
}
