//! Canonical relationship identity, evidence merge, bulk upsert, and
//! maintenance sweeps (C4, spec §4.4).

use crate::error::{Error, Result};
use crate::events::{kind, Event, Level};
use crate::model::{
    canonical_relationship_id, Evidence, Location, Relationship, RelationshipType, TargetRef,
    EVIDENCE_CAP,
};
use crate::namespace::NamespaceScope;
use crate::store::{from_value_map, to_value_map, GraphOp, GraphRecord, GraphStore, QueryOpts};
use crate::telemetry::Telemetry;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

/// One relationship observation submitted for upsert.
#[derive(Debug, Clone)]
pub struct RelationshipObservation {
    pub relationship_type: RelationshipType,
    pub from_entity_id: String,
    pub to_entity_id: Option<String>,
    pub target_ref: Option<TargetRef>,
    pub evidence: Vec<Evidence>,
    pub locations: Vec<Location>,
    pub confidence: f64,
    pub change_set_id: Option<String>,
}

/// Filter/paging parameters for [`RelationshipStore::list`].
#[derive(Debug, Clone, Default)]
pub struct RelationshipListParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub types: Vec<RelationshipType>,
    pub active: Option<bool>,
    pub min_confidence: Option<f64>,
    pub limit: usize,
    pub offset: usize,
}

/// Canonical-id computation, evidence/location merge, bulk upsert, inactive
/// sweep, duplicate coalescing (C4).
#[derive(Clone)]
pub struct RelationshipStore {
    store: Arc<dyn GraphStore>,
    scope: NamespaceScope,
    telemetry: Telemetry,
}

impl RelationshipStore {
    pub fn new(store: Arc<dyn GraphStore>, scope: NamespaceScope, telemetry: Telemetry) -> Self {
        Self { store, scope, telemetry }
    }

    /// Create or merge a relationship (spec §4.4 "Create").
    #[instrument(skip(self, observation))]
    pub async fn upsert(&self, observation: RelationshipObservation) -> Result<Relationship> {
        self.upsert_checked(observation, true).await
    }

    async fn upsert_checked(
        &self,
        observation: RelationshipObservation,
        check_endpoints: bool,
    ) -> Result<Relationship> {
        let from = self.scope.require_entity_id(observation.from_entity_id);
        let to = observation.to_entity_id.map(|id| self.scope.require_entity_id(id));

        if check_endpoints {
            self.require_entity_exists(&from).await?;
            if let Some(to) = &to {
                self.require_entity_exists(to).await?;
            }
        }

        let canonical_id = canonical_relationship_id(
            &from,
            observation.relationship_type,
            to.as_deref(),
            observation.target_ref.as_ref(),
        );

        let now = Utc::now();
        let existing = self.get_by_canonical_id(&canonical_id).await?;

        if let Some(existing) = &existing {
            if existing.relationship_type != observation.relationship_type {
                return Err(Error::TypeConflict {
                    canonical_id,
                    existing: format!("{:?}", existing.relationship_type),
                    incoming: format!("{:?}", observation.relationship_type),
                });
            }
        }

        let merged = merge_relationship(
            existing,
            canonical_id.clone(),
            observation.relationship_type,
            from.clone(),
            to.clone(),
            observation.target_ref.clone(),
            observation.evidence,
            observation.locations,
            observation.confidence,
            observation.change_set_id,
            now,
        );

        let properties = to_value_map(&merged)?;
        self.store
            .run(
                GraphOp::MergeEdge {
                    id: canonical_id,
                    edge_type: format!("{:?}", merged.relationship_type),
                    from,
                    to,
                    properties,
                },
                QueryOpts::default(),
            )
            .await?;

        self.telemetry
            .events()
            .publish(Event::new(kind::RELATIONSHIP_MERGED, Level::Info, merged.id.clone()));
        Ok(merged)
    }

    /// Apply the same merge rules to a batch, in one transaction per batch
    /// (spec §4.4 `upsertEdgeEvidenceBulk`).
    pub async fn upsert_edge_evidence_bulk(
        &self,
        observations: Vec<RelationshipObservation>,
    ) -> Result<Vec<Relationship>> {
        let mut results = Vec::with_capacity(observations.len());
        for observation in observations {
            results.push(self.upsert_checked(observation, true).await?);
        }
        Ok(results)
    }

    async fn require_entity_exists(&self, id: &str) -> Result<()> {
        let rows = self
            .store
            .run(GraphOp::GetNode { id: id.to_string() }, QueryOpts::default())
            .await?;
        if rows.is_empty() {
            Err(Error::ForeignKeyMissing(id.to_string()))
        } else {
            Ok(())
        }
    }

    pub(crate) async fn get_by_canonical_id(&self, id: &str) -> Result<Option<Relationship>> {
        let rows = self
            .store
            .run(GraphOp::GetEdge { id: id.to_string() }, QueryOpts::default())
            .await?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(relationship_from_row(&rows)?))
        }
    }

    pub async fn list(&self, params: RelationshipListParams) -> Result<Vec<Relationship>> {
        let limit = if params.limit == 0 { usize::MAX } else { params.limit };
        let rows = self
            .store
            .run(
                GraphOp::ListEdges {
                    from: params.from.map(|f| self.scope.require_entity_id(f)),
                    to: params.to.map(|t| self.scope.require_entity_id(t)),
                    edge_types: params.types.iter().map(|t| format!("{t:?}")).collect(),
                    active_only: params.active,
                    min_confidence: params.min_confidence,
                    limit,
                    offset: params.offset,
                },
                QueryOpts::default(),
            )
            .await?;
        rows.iter()
            .map(|row| relationship_from_row(std::slice::from_ref(row)))
            .collect()
    }

    pub async fn delete(&self, from: &str, to: &str, relationship_type: RelationshipType) -> Result<()> {
        let from = self.scope.require_entity_id(from);
        let to = self.scope.require_entity_id(to);
        let id = canonical_relationship_id(&from, relationship_type, Some(&to), None);
        self.store.run(GraphOp::DeleteEdge { id }, QueryOpts::default()).await?;
        Ok(())
    }

    /// Close every active edge not observed since `cutoff` (spec §4.4).
    pub async fn mark_inactive_not_seen_since(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let all = self
            .list(RelationshipListParams {
                active: Some(true),
                ..Default::default()
            })
            .await?;
        let mut closed = 0;
        for mut edge in all {
            if edge.last_seen_at < cutoff {
                edge.active = false;
                edge.valid_to = Some(edge.valid_to.unwrap_or(cutoff));
                let properties = to_value_map(&edge)?;
                self.store
                    .run(
                        GraphOp::MergeEdge {
                            id: edge.id.clone(),
                            edge_type: format!("{:?}", edge.relationship_type),
                            from: edge.from_entity_id.clone(),
                            to: edge.to_entity_id.clone(),
                            properties,
                        },
                        QueryOpts::default(),
                    )
                    .await?;
                closed += 1;
            }
        }
        Ok(closed)
    }

    /// Hard-delete every closed (`active = false`) edge whose `valid_to`
    /// already precedes `cutoff` (spec §4.5 pruning). Edges still active,
    /// or closed more recently than `cutoff`, are left alone.
    pub async fn delete_closed_before(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let all = self
            .list(RelationshipListParams {
                active: Some(false),
                ..Default::default()
            })
            .await?;
        let mut deleted = 0;
        for edge in all {
            if edge.valid_to.is_some_and(|valid_to| valid_to < cutoff) {
                self.store.run(GraphOp::DeleteEdge { id: edge.id }, QueryOpts::default()).await?;
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    /// Fold parallel edges sharing endpoints/type/target reference into one
    /// (spec §4.4 `mergeNormalizedDuplicates`). Returns the count merged.
    pub async fn merge_normalized_duplicates(&self) -> Result<usize> {
        let all = self.list(RelationshipListParams::default()).await?;
        let mut by_canonical: BTreeMap<String, Vec<Relationship>> = BTreeMap::new();
        for edge in all {
            let canonical = canonical_relationship_id(
                &edge.from_entity_id,
                edge.relationship_type,
                edge.to_entity_id.as_deref(),
                edge.target_ref.as_ref(),
            );
            by_canonical.entry(canonical).or_default().push(edge);
        }

        let mut merged_count = 0;
        for (canonical_id, mut group) in by_canonical {
            if group.len() <= 1 {
                continue;
            }
            group.sort_by_key(|e| e.created);
            let mut iter = group.into_iter();
            let mut base = iter.next().expect("group non-empty checked above");
            for newer in iter {
                base = merge_relationship(
                    Some(base),
                    canonical_id.clone(),
                    newer.relationship_type,
                    newer.from_entity_id.clone(),
                    newer.to_entity_id.clone(),
                    newer.target_ref.clone(),
                    newer.evidence,
                    newer.locations,
                    newer.confidence,
                    newer.change_set_id,
                    newer.last_modified,
                );
                merged_count += 1;
            }
            let properties = to_value_map(&base)?;
            self.store
                .run(
                    GraphOp::MergeEdge {
                        id: canonical_id,
                        edge_type: format!("{:?}", base.relationship_type),
                        from: base.from_entity_id.clone(),
                        to: base.to_entity_id.clone(),
                        properties,
                    },
                    QueryOpts::default(),
                )
                .await?;
        }
        Ok(merged_count)
    }
}

#[allow(clippy::too_many_arguments)]
fn merge_relationship(
    existing: Option<Relationship>,
    id: String,
    relationship_type: RelationshipType,
    from: String,
    to: Option<String>,
    target_ref: Option<TargetRef>,
    new_evidence: Vec<Evidence>,
    new_locations: Vec<Location>,
    confidence: f64,
    change_set_id: Option<String>,
    now: DateTime<Utc>,
) -> Relationship {
    match existing {
        None => {
            let mut evidence = new_evidence;
            dedup_evidence(&mut evidence);
            let mut locations = new_locations;
            dedup_locations(&mut locations);
            Relationship {
                id,
                relationship_type,
                from_entity_id: from,
                to_entity_id: to,
                target_ref,
                created: now,
                last_modified: now,
                version: 1,
                valid_from: Some(now),
                valid_to: None,
                evidence,
                locations,
                confidence,
                occurrences_total: 1,
                last_seen_at: now,
                active: true,
                change_set_id,
            }
        }
        Some(mut existing) => {
            existing.to_entity_id = to.or(existing.to_entity_id);
            existing.target_ref = target_ref.or(existing.target_ref);
            existing.evidence.extend(new_evidence);
            dedup_evidence(&mut existing.evidence);
            existing.locations.extend(new_locations);
            dedup_locations(&mut existing.locations);
            existing.confidence = existing.confidence.max(confidence);
            existing.occurrences_total += 1;
            existing.last_seen_at = now;
            existing.last_modified = now;
            existing.version += 1;
            // Re-open temporal validity if the prior edge was closed
            // (spec §4.4).
            if !existing.active {
                existing.active = true;
                existing.valid_to = None;
                existing.valid_from = Some(now);
            }
            existing.change_set_id = change_set_id.or(existing.change_set_id);
            existing
        }
    }
}

fn dedup_evidence(evidence: &mut Vec<Evidence>) {
    let mut seen = std::collections::HashSet::new();
    evidence.retain(|e| seen.insert(e.fingerprint.clone()));
    evidence.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
    evidence.truncate(EVIDENCE_CAP);
}

fn dedup_locations(locations: &mut Vec<Location>) {
    let mut seen = std::collections::HashSet::new();
    locations.retain(|l| seen.insert(l.fingerprint.clone()));
    locations.sort_by(|a, b| b.observed_at.cmp(&a.observed_at));
    locations.truncate(EVIDENCE_CAP);
}

fn relationship_from_row(rows: &[crate::store::Row]) -> Result<Relationship> {
    let row = rows
        .first()
        .ok_or_else(|| Error::NotFound("no row returned".to_string()))?;
    match row.get("r") {
        Some(GraphRecord::Edge { properties, .. }) => from_value_map(properties),
        _ => Err(Error::Malformed("expected an edge row".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_store::EntityStore;
    use crate::model::{Entity, EntityType};
    use crate::store::MemoryGraphStore;

    async fn setup() -> (EntityStore, RelationshipStore) {
        let backing = Arc::new(MemoryGraphStore::new());
        let scope = NamespaceScope::new("test");
        let telemetry = Telemetry::new();
        let entities = EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
        let relationships = RelationshipStore::new(backing, scope, telemetry);
        (entities, relationships)
    }

    fn observation(from: &str, to: &str, fingerprint: &str) -> RelationshipObservation {
        RelationshipObservation {
            relationship_type: RelationshipType::Calls,
            from_entity_id: from.to_string(),
            to_entity_id: Some(to.to_string()),
            target_ref: None,
            evidence: vec![Evidence {
                fingerprint: fingerprint.to_string(),
                note: None,
                observed_at: Utc::now(),
            }],
            locations: vec![],
            confidence: 0.9,
            change_set_id: None,
        }
    }

    #[tokio::test]
    async fn foreign_key_missing_when_endpoint_absent() {
        let (_entities, relationships) = setup().await;
        let err = relationships.upsert(observation("foo", "bar", "a")).await;
        assert!(matches!(err, Err(Error::ForeignKeyMissing(_))));
    }

    #[tokio::test]
    async fn repeated_upsert_merges_evidence_and_bumps_version() {
        let (entities, relationships) = setup().await;
        entities.create(Entity::new("foo", EntityType::Function, Utc::now())).await.unwrap();
        entities.create(Entity::new("bar", EntityType::Function, Utc::now())).await.unwrap();

        relationships.upsert(observation("foo", "bar", "A")).await.unwrap();
        let merged = relationships.upsert(observation("foo", "bar", "B")).await.unwrap();

        assert_eq!(merged.occurrences_total, 2);
        assert!(merged.version >= 2);
        assert!(merged.active);
        let fingerprints: std::collections::BTreeSet<_> =
            merged.evidence.iter().map(|e| e.fingerprint.clone()).collect();
        assert_eq!(fingerprints, ["A".to_string(), "B".to_string()].into_iter().collect());
    }

    #[tokio::test]
    async fn evidence_list_is_capped_at_20() {
        let (entities, relationships) = setup().await;
        entities.create(Entity::new("foo", EntityType::Function, Utc::now())).await.unwrap();
        entities.create(Entity::new("bar", EntityType::Function, Utc::now())).await.unwrap();
        for i in 0..30 {
            relationships
                .upsert(observation("foo", "bar", &format!("fp{i}")))
                .await
                .unwrap();
        }
        let latest = relationships
            .list(RelationshipListParams::default())
            .await
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert!(latest[0].evidence.len() <= EVIDENCE_CAP);
        assert_eq!(latest[0].occurrences_total, 30);
    }

    #[tokio::test]
    async fn location_list_is_capped_at_20_most_recent() {
        let (entities, relationships) = setup().await;
        entities.create(Entity::new("foo", EntityType::Function, Utc::now())).await.unwrap();
        entities.create(Entity::new("bar", EntityType::Function, Utc::now())).await.unwrap();

        let base = Utc::now();
        for i in 0..30 {
            let mut obs = observation("foo", "bar", &format!("ev{i}"));
            obs.locations = vec![Location {
                fingerprint: format!("loc{i}"),
                file: "src/lib.rs".to_string(),
                line: i as u32,
                column: None,
                observed_at: base + chrono::Duration::seconds(i as i64),
            }];
            relationships.upsert(obs).await.unwrap();
        }

        let all = relationships.list(RelationshipListParams::default()).await.unwrap();
        let edge = &all[0];
        assert_eq!(edge.locations.len(), EVIDENCE_CAP);
        // The 20 retained must be the most recently observed (loc10..loc29),
        // not the first 20 inserted (loc0..loc19).
        let kept: std::collections::BTreeSet<_> = edge.locations.iter().map(|l| l.fingerprint.clone()).collect();
        assert!(kept.contains("loc29"));
        assert!(!kept.contains("loc0"));
    }

    #[tokio::test]
    async fn mark_inactive_not_seen_since_closes_stale_edges() {
        let (entities, relationships) = setup().await;
        entities.create(Entity::new("foo", EntityType::Function, Utc::now())).await.unwrap();
        entities.create(Entity::new("bar", EntityType::Function, Utc::now())).await.unwrap();
        relationships.upsert(observation("foo", "bar", "A")).await.unwrap();

        let future_cutoff = Utc::now() + chrono::Duration::seconds(5);
        let closed = relationships.mark_inactive_not_seen_since(future_cutoff).await.unwrap();
        assert_eq!(closed, 1);

        let edges = relationships
            .list(RelationshipListParams::default())
            .await
            .unwrap();
        assert!(!edges[0].active);
        assert!(edges[0].valid_to.is_some());
    }
}
