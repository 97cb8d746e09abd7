//! Reference in-memory [`GraphStore`] implementation.
//!
//! Backs unit/integration tests and stands in as the default backend when
//! no external graph database is configured. Adjacency is kept in
//! `dashmap`s for lock-free concurrent reads, following the sharded-map
//! idiom the teacher uses throughout `dashflow/src` for in-memory state
//! (`dashmap` is in the teacher's workspace dependency table).

use super::{
    query_error, GraphOp, GraphRecord, GraphStats, GraphStore, QueryOpts, Row, Similarity, Value,
    VectorItem,
};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Debug, Clone)]
struct NodeRow {
    labels: Vec<String>,
    properties: BTreeMap<String, Value>,
}

#[derive(Debug, Clone)]
struct EdgeRow {
    edge_type: String,
    from: String,
    to: Option<String>,
    properties: BTreeMap<String, Value>,
}

/// In-memory reference implementation of [`GraphStore`].
#[derive(Default)]
pub struct MemoryGraphStore {
    nodes: DashMap<String, NodeRow>,
    edges: DashMap<String, EdgeRow>,
    /// from-node -> outgoing edge ids, maintained alongside `edges` to make
    /// `Expand` O(frontier) instead of O(all edges) per hop.
    out_adjacency: DashMap<String, BTreeSet<String>>,
    vector_indexes: DashMap<String, VectorIndexState>,
}

#[derive(Default)]
struct VectorIndexState {
    label: String,
    vectors: std::collections::HashMap<String, Vec<f32>>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn row_from_node(id: &str, node: &NodeRow) -> Row {
        let mut row = Row::new();
        row.insert(
            "n".to_string(),
            GraphRecord::Node {
                id: id.to_string(),
                labels: node.labels.clone(),
                properties: node.properties.clone(),
            },
        );
        row
    }

    fn node_matches(node: &NodeRow, label: &Option<String>, path_prefix: &Option<String>, name_contains: &Option<String>) -> bool {
        if let Some(label) = label {
            if !node.labels.iter().any(|l| l == label) {
                return false;
            }
        }
        if let Some(prefix) = path_prefix {
            let matches_path = node
                .properties
                .get("path")
                .and_then(value_as_str)
                .map(|p| p.starts_with(prefix.as_str()))
                .unwrap_or(false);
            if !matches_path {
                return false;
            }
        }
        if let Some(needle) = name_contains {
            let matches_name = node
                .properties
                .get("name")
                .and_then(value_as_str)
                .map(|n| n.contains(needle.as_str()))
                .unwrap_or(false);
            if !matches_name {
                return false;
            }
        }
        true
    }

    fn row_from_edge(id: &str, edge: &EdgeRow) -> Row {
        let mut props = edge.properties.clone();
        props.insert("fromEntityId".to_string(), Value::Str(edge.from.clone()));
        if let Some(to) = &edge.to {
            props.insert("toEntityId".to_string(), Value::Str(to.clone()));
        }
        let mut row = Row::new();
        row.insert(
            "r".to_string(),
            GraphRecord::Edge {
                id: id.to_string(),
                edge_type: edge.edge_type.clone(),
                properties: props,
            },
        );
        row
    }

    fn apply(&self, op: GraphOp) -> Result<Vec<Row>> {
        match op {
            GraphOp::CreateNode {
                id,
                labels,
                properties,
            }
            | GraphOp::MergeNode {
                id,
                labels,
                properties,
            } => {
                self.nodes.insert(id.clone(), NodeRow { labels, properties });
                Ok(vec![Self::row_from_node(&id, &self.nodes.get(&id).unwrap())])
            }
            GraphOp::GetNode { id } => match self.nodes.get(&id) {
                Some(node) => Ok(vec![Self::row_from_node(&id, &node)]),
                None => Ok(vec![]),
            },
            GraphOp::UpdateNode { id, patch } => {
                let mut node = self
                    .nodes
                    .get_mut(&id)
                    .ok_or_else(|| query_error("NOT_FOUND", format!("node {id} missing")))?;
                for (k, v) in patch {
                    node.properties.insert(k, v);
                }
                Ok(vec![Self::row_from_node(&id, &node)])
            }
            GraphOp::DeleteNode { id } => {
                self.nodes.remove(&id);
                let incident: Vec<String> = self
                    .edges
                    .iter()
                    .filter(|e| e.from == id || e.to.as_deref() == Some(id.as_str()))
                    .map(|e| e.key().clone())
                    .collect();
                for edge_id in incident {
                    self.remove_edge(&edge_id);
                }
                Ok(vec![])
            }
            GraphOp::ListNodes {
                label,
                path_prefix,
                name_contains,
                limit,
                offset,
                order_by,
                order_desc,
            } => {
                let mut matches: Vec<(String, NodeRow)> = self
                    .nodes
                    .iter()
                    .filter(|entry| Self::node_matches(entry.value(), &label, &path_prefix, &name_contains))
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect();

                if let Some(field) = &order_by {
                    matches.sort_by(|a, b| {
                        let av = a.1.properties.get(field).and_then(value_as_str).unwrap_or_default();
                        let bv = b.1.properties.get(field).and_then(value_as_str).unwrap_or_default();
                        if order_desc { bv.cmp(&av) } else { av.cmp(&bv) }
                    });
                } else {
                    matches.sort_by(|a, b| a.0.cmp(&b.0));
                }

                Ok(matches
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .map(|(id, node)| Self::row_from_node(&id, &node))
                    .collect())
            }
            GraphOp::CountNodes { label, path_prefix, name_contains } => {
                let count = self
                    .nodes
                    .iter()
                    .filter(|entry| Self::node_matches(entry.value(), &label, &path_prefix, &name_contains))
                    .count();
                let mut row = Row::new();
                row.insert("count".to_string(), GraphRecord::Scalar(Value::Int(count as i64)));
                Ok(vec![row])
            }
            GraphOp::MergeEdge {
                id,
                edge_type,
                from,
                to,
                properties,
            } => {
                self.out_adjacency.entry(from.clone()).or_default().insert(id.clone());
                self.edges.insert(
                    id.clone(),
                    EdgeRow {
                        edge_type,
                        from,
                        to,
                        properties,
                    },
                );
                Ok(vec![Self::row_from_edge(&id, &self.edges.get(&id).unwrap())])
            }
            GraphOp::GetEdge { id } => match self.edges.get(&id) {
                Some(edge) => Ok(vec![Self::row_from_edge(&id, &edge)]),
                None => Ok(vec![]),
            },
            GraphOp::ListEdges {
                from,
                to,
                edge_types,
                active_only,
                min_confidence,
                limit,
                offset,
            } => {
                let mut matches: Vec<(String, EdgeRow)> = self
                    .edges
                    .iter()
                    .filter(|entry| {
                        let edge = entry.value();
                        if let Some(from) = &from {
                            if &edge.from != from {
                                return false;
                            }
                        }
                        if let Some(to) = &to {
                            if edge.to.as_deref() != Some(to.as_str()) {
                                return false;
                            }
                        }
                        if !edge_types.is_empty() && !edge_types.contains(&edge.edge_type) {
                            return false;
                        }
                        if let Some(active_only) = active_only {
                            let active = edge
                                .properties
                                .get("active")
                                .map(|v| matches!(v, Value::Bool(true)))
                                .unwrap_or(false);
                            if active != active_only {
                                return false;
                            }
                        }
                        if let Some(min_conf) = min_confidence {
                            let conf = edge
                                .properties
                                .get("confidence")
                                .and_then(value_as_f64)
                                .unwrap_or(0.0);
                            if conf < min_conf {
                                return false;
                            }
                        }
                        true
                    })
                    .map(|entry| (entry.key().clone(), entry.value().clone()))
                    .collect();
                matches.sort_by(|a, b| a.0.cmp(&b.0));
                Ok(matches
                    .into_iter()
                    .skip(offset)
                    .take(limit)
                    .map(|(id, edge)| Self::row_from_edge(&id, &edge))
                    .collect())
            }
            GraphOp::DeleteEdge { id } => {
                self.remove_edge(&id);
                Ok(vec![])
            }
            GraphOp::Expand {
                seeds,
                edge_types,
                max_depth,
                until,
            } => Ok(self.expand(&seeds, edge_types.as_deref(), max_depth, until)),
        }
    }

    fn remove_edge(&self, id: &str) {
        if let Some((_, edge)) = self.edges.remove(id) {
            if let Some(mut set) = self.out_adjacency.get_mut(&edge.from) {
                set.remove(id);
            }
        }
    }

    fn expand(
        &self,
        seeds: &[String],
        edge_types: Option<&[String]>,
        max_depth: u32,
        until: Option<chrono::DateTime<chrono::Utc>>,
    ) -> Vec<Row> {
        use std::collections::VecDeque;
        let mut visited: BTreeSet<String> = seeds.iter().cloned().collect();
        let mut frontier: VecDeque<(String, u32)> = seeds.iter().map(|s| (s.clone(), 0)).collect();
        let mut result_nodes: BTreeSet<String> = seeds.iter().cloned().collect();
        let mut result_edges: Vec<String> = Vec::new();

        while let Some((node_id, depth)) = frontier.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(out_edges) = self.out_adjacency.get(&node_id) else {
                continue;
            };
            for edge_id in out_edges.iter() {
                let Some(edge) = self.edges.get(edge_id) else {
                    continue;
                };
                if let Some(types) = edge_types {
                    if !types.contains(&edge.edge_type) {
                        continue;
                    }
                }
                if let Some(until) = until {
                    if !edge_is_valid_at(&edge, until) {
                        continue;
                    }
                }
                let Some(to) = edge.to.clone() else {
                    continue;
                };
                result_edges.push(edge_id.clone());
                if visited.insert(to.clone()) {
                    result_nodes.insert(to.clone());
                    frontier.push_back((to, depth + 1));
                }
            }
        }

        let mut rows: Vec<Row> = result_nodes
            .into_iter()
            .filter_map(|id| self.nodes.get(&id).map(|n| Self::row_from_node(&id, &n)))
            .collect();
        rows.extend(
            result_edges
                .into_iter()
                .filter_map(|id| self.edges.get(&id).map(|e| Self::row_from_edge(&id, &e))),
        );
        rows
    }
}

fn edge_is_valid_at(edge: &EdgeRow, until: chrono::DateTime<chrono::Utc>) -> bool {
    let valid_from = edge
        .properties
        .get("validFrom")
        .and_then(value_as_timestamp);
    let valid_to = edge.properties.get("validTo").and_then(value_as_timestamp);
    match valid_from {
        Some(from) if from > until => false,
        _ => valid_to.map(|to| to >= until).unwrap_or(true),
    }
}

fn value_as_str(v: &Value) -> Option<&str> {
    match v {
        Value::Str(s) => Some(s.as_str()),
        _ => None,
    }
}

fn value_as_f64(v: &Value) -> Option<f64> {
    match v {
        Value::Float(f) => Some(*f),
        Value::Int(i) => Some(*i as f64),
        _ => None,
    }
}

fn value_as_timestamp(v: &Value) -> Option<chrono::DateTime<chrono::Utc>> {
    match v {
        Value::Timestamp(t) => Some(*t),
        Value::Str(s) => chrono::DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|d| d.with_timezone(&chrono::Utc)),
        _ => None,
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn run(&self, op: GraphOp, _opts: QueryOpts) -> Result<Vec<Row>> {
        self.apply(op)
    }

    async fn run_tx(&self, ops: Vec<GraphOp>, opts: QueryOpts) -> Result<Vec<Vec<Row>>> {
        let mut results = Vec::with_capacity(ops.len());
        for op in ops {
            results.push(self.run(op, opts.clone()).await?);
        }
        Ok(results)
    }

    async fn create_vector_index(
        &self,
        name: &str,
        label: &str,
        _prop: &str,
        _dim: usize,
        _sim: Similarity,
    ) -> Result<()> {
        self.vector_indexes.insert(
            name.to_string(),
            VectorIndexState {
                label: label.to_string(),
                vectors: Default::default(),
            },
        );
        Ok(())
    }

    async fn upsert_vectors(&self, label: &str, items: Vec<VectorItem>) -> Result<()> {
        let index_name = self
            .vector_indexes
            .iter()
            .find(|entry| entry.value().label == label)
            .map(|entry| entry.key().clone())
            .ok_or_else(|| query_error("INDEX_MISSING", format!("no vector index for {label}")))?;
        let mut index = self.vector_indexes.get_mut(&index_name).unwrap();
        for item in items {
            index.vectors.insert(item.node_id, item.vector);
        }
        Ok(())
    }

    async fn search_vectors(
        &self,
        index: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f32)>> {
        let index = self
            .vector_indexes
            .get(index)
            .ok_or_else(|| query_error("INDEX_MISSING", format!("no such index {index}")))?;
        let mut scored: Vec<(String, f32)> = index
            .vectors
            .iter()
            .map(|(id, v)| (id.clone(), cosine(vector, v)))
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(limit);
        Ok(scored)
    }

    async fn stats(&self) -> Result<GraphStats> {
        let mut labels: BTreeMap<String, u64> = BTreeMap::new();
        for entry in self.nodes.iter() {
            for label in &entry.value().labels {
                *labels.entry(label.clone()).or_default() += 1;
            }
        }
        Ok(GraphStats {
            node_count: self.nodes.len() as u64,
            relationship_count: self.edges.len() as u64,
            labels,
        })
    }

    async fn ensure_indexes(&self) -> Result<()> {
        // The in-memory backend has no secondary indexes to build; a real
        // backend would issue `CREATE INDEX` statements here for the
        // baseline set named in spec §4.1.
        Ok(())
    }
}

pub(crate) fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GraphOp;

    #[tokio::test]
    async fn create_get_delete_node_roundtrip() {
        let store = MemoryGraphStore::new();
        let mut props = BTreeMap::new();
        props.insert("name".to_string(), Value::Str("foo".to_string()));
        store
            .run(
                GraphOp::CreateNode {
                    id: "n1".into(),
                    labels: vec!["Symbol".into()],
                    properties: props,
                },
                QueryOpts::default(),
            )
            .await
            .unwrap();

        let rows = store
            .run(GraphOp::GetNode { id: "n1".into() }, QueryOpts::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);

        store
            .run(GraphOp::DeleteNode { id: "n1".into() }, QueryOpts::default())
            .await
            .unwrap();
        let rows = store
            .run(GraphOp::GetNode { id: "n1".into() }, QueryOpts::default())
            .await
            .unwrap();
        assert!(rows.is_empty());
    }

    #[tokio::test]
    async fn expand_respects_max_depth() {
        let store = MemoryGraphStore::new();
        for id in ["a", "b", "c"] {
            store
                .run(
                    GraphOp::CreateNode {
                        id: id.into(),
                        labels: vec!["Symbol".into()],
                        properties: BTreeMap::new(),
                    },
                    QueryOpts::default(),
                )
                .await
                .unwrap();
        }
        store
            .run(
                GraphOp::MergeEdge {
                    id: "e1".into(),
                    edge_type: "CALLS".into(),
                    from: "a".into(),
                    to: Some("b".into()),
                    properties: BTreeMap::new(),
                },
                QueryOpts::default(),
            )
            .await
            .unwrap();
        store
            .run(
                GraphOp::MergeEdge {
                    id: "e2".into(),
                    edge_type: "CALLS".into(),
                    from: "b".into(),
                    to: Some("c".into()),
                    properties: BTreeMap::new(),
                },
                QueryOpts::default(),
            )
            .await
            .unwrap();

        let rows = store
            .run(
                GraphOp::Expand {
                    seeds: vec!["a".into()],
                    edge_types: None,
                    max_depth: 1,
                    until: None,
                },
                QueryOpts::default(),
            )
            .await
            .unwrap();
        let node_ids: BTreeSet<String> = rows
            .iter()
            .filter_map(|r| match r.get("n") {
                Some(GraphRecord::Node { id, .. }) => Some(id.clone()),
                _ => None,
            })
            .collect();
        assert!(node_ids.contains("a"));
        assert!(node_ids.contains("b"));
        assert!(!node_ids.contains("c"));
    }

    #[tokio::test]
    async fn count_nodes_ignores_limit_and_offset() {
        let store = MemoryGraphStore::new();
        for id in ["a", "b", "c"] {
            store
                .run(
                    GraphOp::CreateNode {
                        id: id.into(),
                        labels: vec!["Symbol".into()],
                        properties: BTreeMap::new(),
                    },
                    QueryOpts::default(),
                )
                .await
                .unwrap();
        }

        let page = store
            .run(
                GraphOp::ListNodes {
                    label: None,
                    path_prefix: None,
                    name_contains: None,
                    limit: 1,
                    offset: 0,
                    order_by: None,
                    order_desc: false,
                },
                QueryOpts::default(),
            )
            .await
            .unwrap();
        assert_eq!(page.len(), 1);

        let count_rows = store
            .run(
                GraphOp::CountNodes { label: None, path_prefix: None, name_contains: None },
                QueryOpts::default(),
            )
            .await
            .unwrap();
        match count_rows[0].get("count") {
            Some(GraphRecord::Scalar(Value::Int(n))) => assert_eq!(*n, 3),
            other => panic!("expected a scalar count row, got {other:?}"),
        }
    }
}
