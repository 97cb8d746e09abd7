//! Impact analysis, dependency graphs, k-hop path finding, edge statistics
//! (C7, spec §4.7).

use crate::error::Result;
use crate::model::RelationshipType;
use crate::namespace::NamespaceScope;
use crate::relationship_store::{RelationshipListParams, RelationshipStore};
use crate::store::{GraphOp, GraphRecord, GraphStore, QueryOpts};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

/// Edge types considered "dependent" for impact analysis (spec §4.7).
pub const DEPENDENT_EDGE_TYPES: &[RelationshipType] = &[
    RelationshipType::Calls,
    RelationshipType::References,
    RelationshipType::Uses,
    RelationshipType::Implements,
    RelationshipType::Extends,
    RelationshipType::DependsOn,
];

/// Coarse severity bucket derived from the type distribution of affected
/// edges (spec §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

/// Result of [`AnalysisEngine::analyze_impact`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ImpactReport {
    /// Affected entity ids, grouped by hop distance from the root.
    pub by_distance: BTreeMap<u32, Vec<String>>,
    pub severity: Option<Severity>,
}

/// Direction filter for [`AnalysisEngine::get_entity_dependencies`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Inbound,
    Outbound,
    Both,
}

/// Result of [`AnalysisEngine::get_entity_dependencies`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DependencySets {
    pub inbound: Vec<String>,
    pub outbound: Vec<String>,
    pub inbound_count: usize,
    pub outbound_count: usize,
}

/// One path found by [`AnalysisEngine::find_paths`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Path {
    pub entity_ids: Vec<String>,
}

/// Cached fan-in/fan-out statistics for an entity (spec §4.7).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdgeStats {
    pub fan_in: usize,
    pub fan_out: usize,
    pub top_neighbors: Vec<String>,
}

/// Impact analysis, dependency graphs, path finding, edge statistics (C7).
pub struct AnalysisEngine {
    store: Arc<dyn GraphStore>,
    relationships: RelationshipStore,
    scope: NamespaceScope,
}

impl AnalysisEngine {
    pub fn new(store: Arc<dyn GraphStore>, relationships: RelationshipStore, scope: NamespaceScope) -> Self {
        Self {
            store,
            relationships,
            scope,
        }
    }

    /// BFS over dependent edge types, grouping affected entities by
    /// distance, capped at `max_depth` (spec: "maxDepth≤5").
    pub async fn analyze_impact(
        &self,
        entity_id: &str,
        max_depth: u32,
        types: Option<Vec<RelationshipType>>,
    ) -> Result<ImpactReport> {
        let root = self.scope.require_entity_id(entity_id);
        let max_depth = max_depth.min(5);
        let edge_types = types.unwrap_or_else(|| DEPENDENT_EDGE_TYPES.to_vec());
        let edge_type_strings: Vec<String> = edge_types.iter().map(|t| format!("{t:?}")).collect();

        let rows = self
            .store
            .run(
                GraphOp::Expand {
                    seeds: vec![root.clone()],
                    edge_types: Some(edge_type_strings),
                    max_depth,
                    until: None,
                },
                QueryOpts::default(),
            )
            .await?;

        let mut by_distance: BTreeMap<u32, Vec<String>> = BTreeMap::new();
        let distances = self.bfs_distances(&root, &rows, max_depth);
        for (id, depth) in distances {
            // At `max_depth == 0` the caller asked for just the seed (spec:
            // "return only the seed entity, impact-level 0"); beyond that,
            // the root itself isn't an "impacted" entity.
            if id == root && max_depth > 0 {
                continue;
            }
            by_distance.entry(depth).or_default().push(id);
        }

        let severity = severity_from_distribution(&by_distance);
        Ok(ImpactReport { by_distance, severity })
    }

    /// Recomputes hop distance from the expand result by re-walking the
    /// edge rows locally; `Expand` returns the frontier unordered, so this
    /// makes distance grouping deterministic without a second store call.
    fn bfs_distances(&self, root: &str, rows: &[crate::store::Row], max_depth: u32) -> BTreeMap<String, u32> {
        let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in rows {
            if let Some(GraphRecord::Edge { properties, .. }) = row.get("r") {
                let from = properties.get("fromEntityId").and_then(value_as_str);
                let to = properties.get("toEntityId").and_then(value_as_str);
                if let (Some(from), Some(to)) = (from, to) {
                    adjacency.entry(from.to_string()).or_default().push(to.to_string());
                }
            }
        }

        let mut distances: BTreeMap<String, u32> = BTreeMap::new();
        distances.insert(root.to_string(), 0);
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((root.to_string(), 0));
        while let Some((node, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            if let Some(neighbors) = adjacency.get(&node) {
                for neighbor in neighbors.clone() {
                    distances.entry(neighbor.clone()).or_insert_with(|| {
                        queue.push_back((neighbor.clone(), depth + 1));
                        depth + 1
                    });
                }
            }
        }
        distances
    }

    pub async fn get_entity_dependencies(
        &self,
        entity_id: &str,
        direction: Direction,
        depth: u32,
    ) -> Result<DependencySets> {
        let id = self.scope.require_entity_id(entity_id);
        let mut inbound = BTreeSet::new();
        let mut outbound = BTreeSet::new();

        if matches!(direction, Direction::Outbound | Direction::Both) {
            let rows = self
                .store
                .run(
                    GraphOp::Expand {
                        seeds: vec![id.clone()],
                        edge_types: None,
                        max_depth: depth,
                        until: None,
                    },
                    QueryOpts::default(),
                )
                .await?;
            for row in &rows {
                if let Some(GraphRecord::Node { id: node_id, .. }) = row.get("n") {
                    if node_id != &id {
                        outbound.insert(node_id.clone());
                    }
                }
            }
        }

        if matches!(direction, Direction::Inbound | Direction::Both) {
            let edges = self
                .relationships
                .list(RelationshipListParams {
                    to: Some(id.clone()),
                    ..Default::default()
                })
                .await?;
            for edge in edges {
                inbound.insert(edge.from_entity_id);
            }
        }

        Ok(DependencySets {
            inbound_count: inbound.len(),
            outbound_count: outbound.len(),
            inbound: inbound.into_iter().collect(),
            outbound: outbound.into_iter().collect(),
        })
    }

    /// Shortest paths first, up to `limit` distinct paths (spec §4.7).
    pub async fn find_paths(
        &self,
        from: &str,
        to: &str,
        max_depth: u32,
        limit: usize,
    ) -> Result<Vec<Path>> {
        let from = self.scope.require_entity_id(from);
        let to = self.scope.require_entity_id(to);
        let rows = self
            .store
            .run(
                GraphOp::Expand {
                    seeds: vec![from.clone()],
                    edge_types: None,
                    max_depth,
                    until: None,
                },
                QueryOpts::default(),
            )
            .await?;

        let mut adjacency: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for row in &rows {
            if let Some(GraphRecord::Edge { properties, .. }) = row.get("r") {
                let edge_from = properties.get("fromEntityId").and_then(value_as_str);
                let edge_to = properties.get("toEntityId").and_then(value_as_str);
                if let (Some(f), Some(t)) = (edge_from, edge_to) {
                    adjacency.entry(f.to_string()).or_default().push(t.to_string());
                }
            }
        }

        let mut paths = Vec::new();
        let mut queue: VecDeque<Vec<String>> = VecDeque::new();
        queue.push_back(vec![from]);
        while let Some(path) = queue.pop_front() {
            if paths.len() >= limit {
                break;
            }
            let last = path.last().expect("path always has at least one node").clone();
            if last == to {
                paths.push(Path { entity_ids: path });
                continue;
            }
            if path.len() as u32 > max_depth {
                continue;
            }
            if let Some(neighbors) = adjacency.get(&last) {
                for neighbor in neighbors {
                    if path.contains(neighbor) {
                        continue;
                    }
                    let mut next = path.clone();
                    next.push(neighbor.clone());
                    queue.push_back(next);
                }
            }
        }
        Ok(paths)
    }

    /// Caches fan-in/fan-out and top-K neighbors on the entity for fast
    /// retrieval (spec §4.7). Returns the computed stats; persisting them
    /// back onto the entity is left to the caller via `EntityStore::update`.
    pub async fn compute_and_store_edge_stats(&self, entity_id: &str) -> Result<EdgeStats> {
        let id = self.scope.require_entity_id(entity_id);
        let outbound = self
            .relationships
            .list(RelationshipListParams {
                from: Some(id.clone()),
                ..Default::default()
            })
            .await?;
        let inbound = self
            .relationships
            .list(RelationshipListParams {
                to: Some(id.clone()),
                ..Default::default()
            })
            .await?;

        let mut neighbor_counts: BTreeMap<String, usize> = BTreeMap::new();
        for edge in outbound.iter().chain(inbound.iter()) {
            let other = if edge.from_entity_id == id {
                edge.to_entity_id.clone()
            } else {
                Some(edge.from_entity_id.clone())
            };
            if let Some(other) = other {
                *neighbor_counts.entry(other).or_default() += 1;
            }
        }
        let mut top_neighbors: Vec<(String, usize)> = neighbor_counts.into_iter().collect();
        top_neighbors.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top_neighbors.truncate(10);

        Ok(EdgeStats {
            fan_out: outbound.len(),
            fan_in: inbound.len(),
            top_neighbors: top_neighbors.into_iter().map(|(id, _)| id).collect(),
        })
    }
}

fn severity_from_distribution(by_distance: &BTreeMap<u32, Vec<String>>) -> Option<Severity> {
    let total: usize = by_distance.values().map(|v| v.len()).sum();
    if total == 0 {
        return None;
    }
    let direct = by_distance.get(&1).map(|v| v.len()).unwrap_or(0);
    Some(if direct >= 10 || total >= 25 {
        Severity::High
    } else if direct >= 3 || total >= 8 {
        Severity::Medium
    } else {
        Severity::Low
    })
}

fn value_as_str(v: &crate::store::Value) -> Option<&str> {
    match v {
        crate::store::Value::Str(s) => Some(s.as_str()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, EntityType};
    use crate::relationship_store::RelationshipObservation;
    use crate::store::MemoryGraphStore;
    use crate::telemetry::Telemetry;
    use chrono::Utc;

    async fn setup_chain() -> (AnalysisEngine, crate::entity_store::EntityStore) {
        let backing: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
        let scope = NamespaceScope::new("test");
        let telemetry = Telemetry::new();
        let entities = crate::entity_store::EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
        let relationships = RelationshipStore::new(backing.clone(), scope.clone(), telemetry);

        for id in ["a", "b", "c", "d"] {
            entities.create(Entity::new(id, EntityType::Function, Utc::now())).await.unwrap();
        }
        for (from, to) in [("a", "b"), ("b", "c"), ("c", "d")] {
            relationships
                .upsert(RelationshipObservation {
                    relationship_type: RelationshipType::Calls,
                    from_entity_id: from.to_string(),
                    to_entity_id: Some(to.to_string()),
                    target_ref: None,
                    evidence: vec![],
                    locations: vec![],
                    confidence: 1.0,
                    change_set_id: None,
                })
                .await
                .unwrap();
        }

        (AnalysisEngine::new(backing, relationships, scope), entities)
    }

    #[tokio::test]
    async fn impact_groups_by_hop_distance() {
        let (engine, _entities) = setup_chain().await;
        let report = engine.analyze_impact("a", 5, None).await.unwrap();
        assert_eq!(report.by_distance.get(&1), Some(&vec!["test:b".to_string()]));
        assert_eq!(report.by_distance.get(&2), Some(&vec!["test:c".to_string()]));
    }

    #[tokio::test]
    async fn impact_at_depth_zero_returns_only_the_seed() {
        let (engine, _entities) = setup_chain().await;
        let report = engine.analyze_impact("a", 0, None).await.unwrap();
        assert_eq!(report.by_distance.get(&0), Some(&vec!["test:a".to_string()]));
        assert_eq!(report.by_distance.len(), 1, "depth 0 must not expand beyond the seed");
    }

    #[tokio::test]
    async fn find_paths_returns_shortest_first() {
        let (engine, _entities) = setup_chain().await;
        let paths = engine.find_paths("a", "d", 5, 3).await.unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].entity_ids.len(), 4);
    }

    #[tokio::test]
    async fn edge_stats_counts_fan_in_and_out() {
        let (engine, _entities) = setup_chain().await;
        let stats = engine.compute_and_store_edge_stats("b").await.unwrap();
        assert_eq!(stats.fan_in, 1);
        assert_eq!(stats.fan_out, 1);
    }

    #[tokio::test]
    async fn dependencies_respect_direction_filter() {
        let (engine, _entities) = setup_chain().await;
        let deps = engine.get_entity_dependencies("b", Direction::Inbound, 3).await.unwrap();
        assert_eq!(deps.inbound, vec!["test:a".to_string()]);
        assert!(deps.outbound.is_empty());
    }
}
