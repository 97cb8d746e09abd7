//! Process-local wiring: one [`MemoryGraphStore`] plus the component set
//! every command dispatches into, loaded from (and saved back to) a flat
//! JSON snapshot so sequential invocations see each other's writes the way
//! a persistent graph driver would.

use anyhow::{Context, Result};
use graphkit::backup::{BackupCoordinator, ProviderRegistry};
use graphkit::config::GraphKitConfig;
use graphkit::model::{Entity, Relationship};
use graphkit::relationship_store::RelationshipObservation;
use graphkit::store::MemoryGraphStore;
use graphkit::{AnalysisEngine, EntityStore, HistoryEngine, NamespaceScope, RelationshipStore, SearchEngine, Telemetry};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// On-disk snapshot of the whole graph, read at startup and rewritten after
/// any command that mutates entities or relationships.
#[derive(Debug, Default, serde::Serialize, serde::Deserialize)]
struct Snapshot {
    entities: Vec<Entity>,
    relationships: Vec<Relationship>,
}

pub struct App {
    pub entities: EntityStore,
    pub relationships: RelationshipStore,
    pub search: SearchEngine,
    pub analysis: AnalysisEngine,
    pub history: HistoryEngine,
    pub backup: BackupCoordinator,
    state_path: PathBuf,
}

impl App {
    pub async fn bootstrap(state_path: PathBuf, data_dir: PathBuf, config: GraphKitConfig) -> Result<Self> {
        let store: Arc<dyn graphkit::store::GraphStore> = Arc::new(MemoryGraphStore::new());
        let scope = NamespaceScope::new(&config.namespace);
        let telemetry = Telemetry::new();

        let entities = EntityStore::new(Arc::clone(&store), scope.clone(), telemetry.clone());
        let relationships = RelationshipStore::new(Arc::clone(&store), scope.clone(), telemetry.clone());
        let search = SearchEngine::new(entities.clone(), None);
        let analysis = AnalysisEngine::new(Arc::clone(&store), relationships.clone(), scope.clone());
        let history = HistoryEngine::new(Arc::clone(&store), entities.clone(), relationships.clone(), scope, true);

        let providers = ProviderRegistry::new(&data_dir);
        let backup = BackupCoordinator::new(
            providers,
            entities.clone(),
            relationships.clone(),
            telemetry,
            config.backup.require_second_approval,
            config.backup.retention_policy(),
        );

        let app = Self { entities, relationships, search, analysis, history, backup, state_path };
        app.load_snapshot().await?;
        Ok(app)
    }

    async fn load_snapshot(&self) -> Result<()> {
        if !self.state_path.exists() {
            return Ok(());
        }
        let bytes = tokio::fs::read(&self.state_path)
            .await
            .with_context(|| format!("reading state file {}", self.state_path.display()))?;
        let snapshot: Snapshot = serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing state file {}", self.state_path.display()))?;
        for entity in snapshot.entities {
            let _ = self.entities.create(entity).await;
        }
        for relationship in snapshot.relationships {
            let observation = RelationshipObservation {
                relationship_type: relationship.relationship_type,
                from_entity_id: relationship.from_entity_id,
                to_entity_id: relationship.to_entity_id,
                target_ref: relationship.target_ref,
                evidence: relationship.evidence,
                locations: relationship.locations,
                confidence: relationship.confidence,
                change_set_id: relationship.change_set_id,
            };
            let _ = self.relationships.upsert(observation).await;
        }
        Ok(())
    }

    /// Re-dump the full graph to [`Self::state_path`]. Call after any
    /// command that creates entities or relationships.
    pub async fn save_snapshot(&self) -> Result<()> {
        let entities = self
            .entities
            .list(graphkit::entity_store::ListParams { limit: 0, ..Default::default() })
            .await?
            .items;
        let relationships = self
            .relationships
            .list(graphkit::relationship_store::RelationshipListParams { limit: 0, ..Default::default() })
            .await?;
        let snapshot = Snapshot { entities, relationships };
        let json = serde_json::to_vec_pretty(&snapshot)?;
        if let Some(parent) = self.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(&self.state_path, json)
            .await
            .with_context(|| format!("writing state file {}", self.state_path.display()))?;
        Ok(())
    }
}

pub fn default_state_path() -> PathBuf {
    Path::new(".graphkit").join("state.json")
}

pub fn default_data_dir() -> PathBuf {
    Path::new(".graphkit").join("backups")
}
