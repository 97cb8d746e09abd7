//! Temporal versioning, validity-interval edges, subgraph checkpoints,
//! time-travel traversal, and retention pruning (C5, spec §4.5).

use crate::entity_store::EntityStore;
use crate::error::{Error, Result};
use crate::model::{Entity, EntityType, Relationship, RelationshipType};
use crate::namespace::NamespaceScope;
use crate::relationship_store::{RelationshipObservation, RelationshipListParams, RelationshipStore};
use crate::store::{to_value_map, GraphOp, GraphRecord, GraphStore, QueryOpts};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::instrument;

/// Maximum neighborhood radius a checkpoint may materialize (spec §4.5).
pub const MAX_CHECKPOINT_HOPS: u32 = 5;

/// Sentinel version/checkpoint id returned when history is disabled.
pub const HISTORY_DISABLED_SENTINEL: &str = "history-disabled";

/// Parameters for [`HistoryEngine::create_checkpoint`].
#[derive(Debug, Clone)]
pub struct CheckpointOpts {
    pub reason: String,
    pub hops: u32,
    pub window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub description: Option<String>,
}

/// Result of [`HistoryEngine::create_checkpoint`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointSummary {
    pub checkpoint_id: String,
    pub member_count: usize,
}

/// Parameters for [`HistoryEngine::time_travel_traversal`].
#[derive(Debug, Clone)]
pub struct TimeTravelParams {
    pub start_id: String,
    pub relationship_types: Option<Vec<RelationshipType>>,
    pub max_depth: u32,
    pub until: DateTime<Utc>,
}

impl Default for TimeTravelParams {
    fn default() -> Self {
        Self {
            start_id: String::new(),
            relationship_types: None,
            max_depth: 3,
            until: Utc::now(),
        }
    }
}

/// Outcome of [`HistoryEngine::prune_history`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PruneResult {
    pub versions_deleted: usize,
    pub edges_closed: usize,
    pub edges_deleted: usize,
    pub checkpoints_deleted: usize,
}

/// Options for [`HistoryEngine::prune_history`].
#[derive(Debug, Clone, Copy, Default)]
pub struct PruneOpts {
    pub dry_run: bool,
}

/// Versions, validity-interval edges, checkpoints, time-travel, pruning (C5).
///
/// Gated by a process-wide `historyEnabled` switch (spec §4.5): when
/// disabled every mutating method is a no-op returning
/// [`HISTORY_DISABLED_SENTINEL`], matching the teacher's pattern of a
/// feature-flagged facade rather than a second code path per call site.
pub struct HistoryEngine {
    store: Arc<dyn GraphStore>,
    entities: EntityStore,
    relationships: RelationshipStore,
    scope: NamespaceScope,
    enabled: bool,
}

impl HistoryEngine {
    pub fn new(
        store: Arc<dyn GraphStore>,
        entities: EntityStore,
        relationships: RelationshipStore,
        scope: NamespaceScope,
        enabled: bool,
    ) -> Self {
        Self {
            store,
            entities,
            relationships,
            scope,
            enabled,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Appends a `Version` node, links `VERSION_OF` to the entity and
    /// `PREVIOUS_VERSION` to that entity's immediately-earlier version, if
    /// one exists.
    #[instrument(skip(self))]
    pub async fn append_version(
        &self,
        entity_id: &str,
        hash: &str,
        change_set_id: Option<String>,
        timestamp: Option<DateTime<Utc>>,
    ) -> Result<String> {
        if !self.enabled {
            return Ok(HISTORY_DISABLED_SENTINEL.to_string());
        }
        let entity_id = self.scope.require_entity_id(entity_id);
        let now = timestamp.unwrap_or_else(Utc::now);

        let version_id = format!("version_{}", uuid::Uuid::new_v4());
        let mut version = Entity::new(version_id.clone(), EntityType::Version, now);
        version.hash = Some(hash.to_string());
        let version = self.entities.create(version).await?;

        self.relationships
            .upsert(RelationshipObservation {
                relationship_type: RelationshipType::VersionOf,
                from_entity_id: version.id.clone(),
                to_entity_id: Some(entity_id.clone()),
                target_ref: None,
                evidence: vec![],
                locations: vec![],
                confidence: 1.0,
                change_set_id: change_set_id.clone(),
            })
            .await?;

        if let Some(previous) = self.latest_version_before(&entity_id, now).await? {
            self.relationships
                .upsert(RelationshipObservation {
                    relationship_type: RelationshipType::PreviousVersion,
                    from_entity_id: version.id.clone(),
                    to_entity_id: Some(previous),
                    target_ref: None,
                    evidence: vec![],
                    locations: vec![],
                    confidence: 1.0,
                    change_set_id,
                })
                .await?;
        }

        Ok(version.id)
    }

    async fn latest_version_before(&self, entity_id: &str, before: DateTime<Utc>) -> Result<Option<String>> {
        let edges = self
            .relationships
            .list(RelationshipListParams {
                to: Some(entity_id.to_string()),
                types: vec![RelationshipType::VersionOf],
                ..Default::default()
            })
            .await?;
        let mut candidates = Vec::new();
        for edge in edges {
            if let Some(version) = self.entities.get(&edge.from_entity_id).await? {
                if version.created < before {
                    candidates.push(version);
                }
            }
        }
        candidates.sort_by_key(|v| v.created);
        Ok(candidates.last().map(|v| v.id.clone()))
    }

    /// Opens a canonical edge's validity interval (spec §4.5).
    pub async fn open_edge(
        &self,
        from: &str,
        to: &str,
        relationship_type: RelationshipType,
        ts: Option<DateTime<Utc>>,
        change_set_id: Option<String>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let now = ts.unwrap_or_else(Utc::now);
        let mut edge = self.resolve_or_create_edge(from, to, relationship_type, change_set_id).await?;
        edge.active = true;
        edge.valid_from = Some(now);
        edge.valid_to = None;
        self.write_back(edge).await
    }

    /// Closes a canonical edge's validity interval (spec §4.5).
    pub async fn close_edge(
        &self,
        from: &str,
        to: &str,
        relationship_type: RelationshipType,
        ts: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let now = ts.unwrap_or_else(Utc::now);
        let from = self.scope.require_entity_id(from);
        let to = self.scope.require_entity_id(to);
        let canonical_id = crate::model::canonical_relationship_id(&from, relationship_type, Some(&to), None);
        let Some(mut edge) = self.relationships.get_by_canonical_id(&canonical_id).await? else {
            return Err(Error::NotFound(canonical_id));
        };
        edge.active = false;
        edge.valid_to = Some(edge.valid_to.unwrap_or(now));
        self.write_back(edge).await
    }

    async fn resolve_or_create_edge(
        &self,
        from: &str,
        to: &str,
        relationship_type: RelationshipType,
        change_set_id: Option<String>,
    ) -> Result<Relationship> {
        self.relationships
            .upsert(RelationshipObservation {
                relationship_type,
                from_entity_id: from.to_string(),
                to_entity_id: Some(to.to_string()),
                target_ref: None,
                evidence: vec![],
                locations: vec![],
                confidence: 1.0,
                change_set_id,
            })
            .await
    }

    async fn write_back(&self, edge: Relationship) -> Result<()> {
        let properties = to_value_map(&edge)?;
        self.store
            .run(
                GraphOp::MergeEdge {
                    id: edge.id,
                    edge_type: format!("{:?}", edge.relationship_type),
                    from: edge.from_entity_id,
                    to: edge.to_entity_id,
                    properties,
                },
                QueryOpts::default(),
            )
            .await?;
        Ok(())
    }

    /// Expands `hops`-bounded neighborhoods from every seed and links the
    /// union of distinct members via `CHECKPOINT_INCLUDES` (spec §4.5).
    #[instrument(skip(self, seed_ids))]
    pub async fn create_checkpoint(&self, seed_ids: Vec<String>, opts: CheckpointOpts) -> Result<CheckpointSummary> {
        if !self.enabled {
            return Ok(CheckpointSummary {
                checkpoint_id: HISTORY_DISABLED_SENTINEL.to_string(),
                member_count: 0,
            });
        }
        let hops = opts.hops.min(MAX_CHECKPOINT_HOPS);
        let seeds: Vec<String> = seed_ids.iter().map(|id| self.scope.require_entity_id(id)).collect();

        let rows = self
            .store
            .run(
                GraphOp::Expand {
                    seeds: seeds.clone(),
                    edge_types: None,
                    max_depth: hops,
                    until: opts.window.map(|(_, end)| end),
                },
                QueryOpts::default(),
            )
            .await?;

        let mut members: BTreeSet<String> = seeds.into_iter().collect();
        for row in &rows {
            if let Some(GraphRecord::Node { id, .. }) = row.get("n") {
                members.insert(id.clone());
            }
        }

        let now = Utc::now();
        let checkpoint_id = format!("checkpoint_{}", uuid::Uuid::new_v4());
        let mut checkpoint = Entity::new(checkpoint_id, EntityType::Checkpoint, now);
        checkpoint.docstring = opts.description.clone();
        checkpoint.name = Some(opts.reason.clone());
        let checkpoint = self.entities.create(checkpoint).await?;

        for member in &members {
            self.relationships
                .upsert(RelationshipObservation {
                    relationship_type: RelationshipType::CheckpointIncludes,
                    from_entity_id: checkpoint.id.clone(),
                    to_entity_id: Some(member.clone()),
                    target_ref: None,
                    evidence: vec![],
                    locations: vec![],
                    confidence: 1.0,
                    change_set_id: None,
                })
                .await?;
        }

        Ok(CheckpointSummary {
            checkpoint_id: checkpoint.id,
            member_count: members.len(),
        })
    }

    pub async fn get_checkpoint(&self, id: &str) -> Result<Option<Entity>> {
        self.entities.get(id).await
    }

    pub async fn get_checkpoint_members(&self, id: &str) -> Result<Vec<String>> {
        let id = self.scope.require_entity_id(id);
        let edges = self
            .relationships
            .list(RelationshipListParams {
                from: Some(id),
                types: vec![RelationshipType::CheckpointIncludes],
                ..Default::default()
            })
            .await?;
        Ok(edges.into_iter().filter_map(|e| e.to_entity_id).collect())
    }

    pub async fn get_checkpoint_summary(&self, id: &str) -> Result<CheckpointSummary> {
        let members = self.get_checkpoint_members(id).await?;
        Ok(CheckpointSummary {
            checkpoint_id: id.to_string(),
            member_count: members.len(),
        })
    }

    /// Deletes the checkpoint and its inclusion edges, never the members.
    pub async fn delete_checkpoint(&self, id: &str) -> Result<()> {
        self.entities.delete(id).await
    }

    pub async fn export_checkpoint(&self, id: &str) -> Result<serde_json::Value> {
        let checkpoint = self
            .entities
            .get(id)
            .await?
            .ok_or_else(|| Error::NotFound(id.to_string()))?;
        let members = self.get_checkpoint_members(id).await?;
        Ok(serde_json::json!({ "checkpoint": checkpoint, "members": members }))
    }

    pub async fn import_checkpoint(&self, payload: serde_json::Value) -> Result<CheckpointSummary> {
        let checkpoint: Entity = serde_json::from_value(
            payload
                .get("checkpoint")
                .cloned()
                .ok_or_else(|| Error::Malformed("missing checkpoint field".to_string()))?,
        )
        .map_err(|e| Error::Malformed(e.to_string()))?;
        let members: Vec<String> = serde_json::from_value(
            payload
                .get("members")
                .cloned()
                .ok_or_else(|| Error::Malformed("missing members field".to_string()))?,
        )
        .map_err(|e| Error::Malformed(e.to_string()))?;

        let checkpoint = self.entities.create(checkpoint).await?;
        for member in &members {
            self.relationships
                .upsert(RelationshipObservation {
                    relationship_type: RelationshipType::CheckpointIncludes,
                    from_entity_id: checkpoint.id.clone(),
                    to_entity_id: Some(member.clone()),
                    target_ref: None,
                    evidence: vec![],
                    locations: vec![],
                    confidence: 1.0,
                    change_set_id: None,
                })
                .await?;
        }
        Ok(CheckpointSummary {
            checkpoint_id: checkpoint.id,
            member_count: members.len(),
        })
    }

    /// Walks outward from `start_id`, admitting an edge only if it was
    /// valid at `until` (spec §4.5).
    pub async fn time_travel_traversal(&self, params: TimeTravelParams) -> Result<Vec<Entity>> {
        let seed = self.scope.require_entity_id(&params.start_id);
        let edge_types = params
            .relationship_types
            .map(|types| types.iter().map(|t| format!("{t:?}")).collect());
        let rows = self
            .store
            .run(
                GraphOp::Expand {
                    seeds: vec![seed],
                    edge_types,
                    max_depth: params.max_depth,
                    until: Some(params.until),
                },
                QueryOpts::default(),
            )
            .await?;
        let mut entities = Vec::new();
        for row in &rows {
            if let Some(GraphRecord::Node { properties, .. }) = row.get("n") {
                entities.push(crate::store::from_value_map(properties)?);
            }
        }
        Ok(entities)
    }

    /// Deletes checkpoints older than the cutoff, closes stale active
    /// edges, hard-deletes edges already closed before the cutoff, then
    /// deletes versions older than the cutoff that no surviving checkpoint
    /// references (spec §4.5 invariant: pruning never removes a version a
    /// surviving checkpoint still points to).
    ///
    /// `retention_days` must be positive: `0` or negative would prune
    /// everything up to (or past) the present instant instead of being a
    /// no-op, so both are rejected (spec.md: `pruneHistory(0 days)` is a
    /// no-op; `retentionDays <= 0` is a `ValidationError`).
    #[instrument(skip(self))]
    pub async fn prune_history(&self, retention_days: i64, opts: PruneOpts) -> Result<PruneResult> {
        if !self.enabled {
            return Ok(PruneResult::default());
        }
        if retention_days <= 0 {
            return Err(Error::Validation(format!(
                "retention_days must be positive, got {retention_days}"
            )));
        }
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let mut result = PruneResult::default();

        let checkpoints = self
            .entities
            .list(crate::entity_store::ListParams {
                entity_type: Some(EntityType::Checkpoint),
                limit: 0,
                ..Default::default()
            })
            .await?;
        let mut surviving_checkpoints = Vec::new();
        for checkpoint in checkpoints.items {
            if checkpoint.created < cutoff {
                result.checkpoints_deleted += 1;
                if !opts.dry_run {
                    self.entities.delete(&checkpoint.id).await?;
                }
            } else {
                surviving_checkpoints.push(checkpoint.id);
            }
        }

        let mut protected_versions: BTreeSet<String> = BTreeSet::new();
        for checkpoint_id in &surviving_checkpoints {
            protected_versions.extend(self.get_checkpoint_members(checkpoint_id).await?);
        }

        // Edges not re-observed since the cutoff are closed here, not
        // deleted: `active=false, validTo` set (spec §4.5 "closes ... edges
        // with validTo < cutoff"), reusing the same rule as the inactive
        // sweep.
        // Edges whose closed end (`valid_to`) already precedes the cutoff
        // are hard-deleted; edges merely stale-but-still-active are only
        // closed above, preserving time-travel to their last valid state.
        if opts.dry_run {
            let stale = self
                .relationships
                .list(RelationshipListParams {
                    active: Some(true),
                    ..Default::default()
                })
                .await?;
            result.edges_closed = stale.into_iter().filter(|e| e.last_seen_at < cutoff).count();

            let closed = self
                .relationships
                .list(RelationshipListParams {
                    active: Some(false),
                    ..Default::default()
                })
                .await?;
            result.edges_deleted = closed.into_iter().filter(|e| e.valid_to.is_some_and(|v| v < cutoff)).count();
        } else {
            result.edges_closed = self.relationships.mark_inactive_not_seen_since(cutoff).await?;
            result.edges_deleted = self.relationships.delete_closed_before(cutoff).await?;
        }

        let versions = self
            .entities
            .list(crate::entity_store::ListParams {
                entity_type: Some(EntityType::Version),
                limit: 0,
                ..Default::default()
            })
            .await?;
        for version in versions.items {
            if version.created < cutoff && !protected_versions.contains(&version.id) {
                result.versions_deleted += 1;
                if !opts.dry_run {
                    self.entities.delete(&version.id).await?;
                }
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;
    use crate::telemetry::Telemetry;

    fn setup() -> HistoryEngine {
        let backing: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
        let scope = NamespaceScope::new("test");
        let telemetry = Telemetry::new();
        let entities = EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
        let relationships = RelationshipStore::new(backing.clone(), scope.clone(), telemetry);
        HistoryEngine::new(backing, entities, relationships, scope, true)
    }

    #[tokio::test]
    async fn disabled_engine_is_a_no_op() {
        let backing: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
        let scope = NamespaceScope::new("test");
        let telemetry = Telemetry::new();
        let entities = EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
        let relationships = RelationshipStore::new(backing.clone(), scope.clone(), telemetry);
        let engine = HistoryEngine::new(backing, entities, relationships, scope, false);

        let id = engine.append_version("foo", "hash1", None, None).await.unwrap();
        assert_eq!(id, HISTORY_DISABLED_SENTINEL);
    }

    #[tokio::test]
    async fn version_chain_links_previous_version() {
        let engine = setup();
        engine
            .entities
            .create(Entity::new("foo", EntityType::File, Utc::now()))
            .await
            .unwrap();

        let v1 = engine.append_version("foo", "hash1", None, None).await.unwrap();
        let v2 = engine.append_version("foo", "hash2", None, None).await.unwrap();

        let edges = engine
            .relationships
            .list(RelationshipListParams {
                from: Some(v2.clone()),
                types: vec![RelationshipType::PreviousVersion],
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].to_entity_id.as_deref(), Some(v1.as_str()));
    }

    #[tokio::test]
    async fn create_checkpoint_caps_hops_and_links_members() {
        let engine = setup();
        for id in ["a", "b", "c"] {
            engine
                .entities
                .create(Entity::new(id, EntityType::File, Utc::now()))
                .await
                .unwrap();
        }
        engine
            .relationships
            .upsert(RelationshipObservation {
                relationship_type: RelationshipType::Contains,
                from_entity_id: "a".to_string(),
                to_entity_id: Some("b".to_string()),
                target_ref: None,
                evidence: vec![],
                locations: vec![],
                confidence: 1.0,
                change_set_id: None,
            })
            .await
            .unwrap();

        let summary = engine
            .create_checkpoint(
                vec!["a".to_string()],
                CheckpointOpts {
                    reason: "release cut".to_string(),
                    hops: 1,
                    window: None,
                    description: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(summary.member_count, 2);

        let members = engine.get_checkpoint_members(&summary.checkpoint_id).await.unwrap();
        assert_eq!(members.len(), 2);
    }

    #[tokio::test]
    async fn prune_keeps_versions_referenced_by_surviving_checkpoint() {
        let engine = setup();
        engine
            .entities
            .create(Entity::new("foo", EntityType::File, Utc::now()))
            .await
            .unwrap();
        let old_ts = Utc::now() - chrono::Duration::days(400);
        let version_id = engine
            .append_version("foo", "hash1", None, Some(old_ts))
            .await
            .unwrap();

        engine
            .create_checkpoint(
                vec![version_id.clone()],
                CheckpointOpts {
                    reason: "pin".to_string(),
                    hops: 0,
                    window: None,
                    description: None,
                },
            )
            .await
            .unwrap();

        let result = engine.prune_history(90, PruneOpts { dry_run: false }).await.unwrap();
        assert_eq!(result.versions_deleted, 0);
        assert!(engine.entities.get(&version_id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prune_history_rejects_non_positive_retention() {
        let engine = setup();
        let zero = engine.prune_history(0, PruneOpts::default()).await;
        assert!(matches!(zero, Err(Error::Validation(_))));
        let negative = engine.prune_history(-1, PruneOpts::default()).await;
        assert!(matches!(negative, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn prune_history_hard_deletes_edges_closed_before_cutoff() {
        let engine = setup();
        engine.entities.create(Entity::new("a", EntityType::File, Utc::now())).await.unwrap();
        engine.entities.create(Entity::new("b", EntityType::File, Utc::now())).await.unwrap();

        let old_ts = Utc::now() - chrono::Duration::days(400);
        engine.open_edge("a", "b", RelationshipType::DependsOn, Some(old_ts), None).await.unwrap();
        engine.close_edge("a", "b", RelationshipType::DependsOn, Some(old_ts)).await.unwrap();

        let result = engine.prune_history(90, PruneOpts { dry_run: false }).await.unwrap();
        assert_eq!(result.edges_deleted, 1);

        let remaining = engine
            .relationships
            .list(RelationshipListParams::default())
            .await
            .unwrap();
        assert!(remaining.is_empty(), "an edge closed well before the cutoff must be hard-deleted");
    }

    #[tokio::test]
    async fn prune_history_dry_run_reports_but_does_not_delete_closed_edges() {
        let engine = setup();
        engine.entities.create(Entity::new("a", EntityType::File, Utc::now())).await.unwrap();
        engine.entities.create(Entity::new("b", EntityType::File, Utc::now())).await.unwrap();

        let old_ts = Utc::now() - chrono::Duration::days(400);
        engine.open_edge("a", "b", RelationshipType::DependsOn, Some(old_ts), None).await.unwrap();
        engine.close_edge("a", "b", RelationshipType::DependsOn, Some(old_ts)).await.unwrap();

        let dry_run = engine.prune_history(90, PruneOpts { dry_run: true }).await.unwrap();
        assert_eq!(dry_run.edges_deleted, 1);

        let remaining = engine
            .relationships
            .list(RelationshipListParams::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1, "dry run must not actually delete anything");
    }
}
