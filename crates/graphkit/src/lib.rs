//! Code-knowledge graph engine: a typed property graph over source code,
//! with temporal versioning, hybrid search, streaming ingestion, and
//! token-gated backup/restore.
//!
//! Layout mirrors the component breakdown this crate is organized around:
//! a low-level [`store`] driver wrapper, [`entity_store`] and
//! [`relationship_store`] on top of it, [`history`] for time travel and
//! checkpoints, [`search`] and [`analysis`] for querying, [`ingestion`] for
//! the streaming write path, and [`backup`] for snapshot/restore.

pub mod analysis;
pub mod backup;
pub mod config;
pub mod entity_store;
pub mod error;
pub mod events;
pub mod history;
pub mod ingestion;
pub mod model;
pub mod namespace;
pub mod relationship_store;
pub mod search;
pub mod store;
pub mod telemetry;

pub use analysis::AnalysisEngine;
pub use entity_store::EntityStore;
pub use error::{Error, Result};
pub use history::HistoryEngine;
pub use ingestion::IngestionPipeline;
pub use namespace::NamespaceScope;
pub use relationship_store::RelationshipStore;
pub use search::SearchEngine;
pub use telemetry::Telemetry;
