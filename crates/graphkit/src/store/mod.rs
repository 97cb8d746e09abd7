//! The low-level property-graph driver wrapper (C1) and vector persistence
//! (C2).
//!
//! Rather than a string query language, `GraphStore` exposes a small typed
//! vocabulary of operations (`GraphOp`) that every higher layer composes —
//! this is the "parameterized queries only; raw concatenation is
//! forbidden" rule from spec §4.1 taken to its logical conclusion for a
//! statically typed client: there is no string at all to concatenate into.
//! A real backend (Neo4j, age, ...) would translate each `GraphOp` variant
//! into its native query language internally.

mod memory;
pub mod vector;

pub use memory::MemoryGraphStore;
pub use vector::{GraphVectorStore, InMemoryVectorIndex, VectorStore};

use crate::error::{Error, Result};
use crate::model::{Entity, Relationship};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// A marshalled scalar value (spec §4.1: "integers ... widened to 64-bit;
/// temporal values ... converted to wall-clock UTC timestamps").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Timestamp(DateTime<Utc>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

/// A node or relationship unwrapped into a plain record (spec §4.1).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum GraphRecord {
    Node {
        id: String,
        labels: Vec<String>,
        properties: BTreeMap<String, Value>,
    },
    Edge {
        id: String,
        edge_type: String,
        properties: BTreeMap<String, Value>,
    },
    Scalar(Value),
}

/// One row of a query result: an ordered set of named fields.
pub type Row = BTreeMap<String, GraphRecord>;

/// Options accepted by [`GraphStore::run`].
#[derive(Debug, Clone, Default)]
pub struct QueryOpts {
    /// Per-query timeout; defaults to the store's configured default (30s).
    pub timeout: Option<Duration>,
}

/// Aggregate store statistics (used by `EntityStore::stats`/health checks).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphStats {
    pub node_count: u64,
    pub relationship_count: u64,
    pub labels: BTreeMap<String, u64>,
}

/// Similarity function for a vector index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Similarity {
    Cosine,
    Euclidean,
    DotProduct,
}

/// One item submitted to `upsert_vectors`.
#[derive(Debug, Clone)]
pub struct VectorItem {
    pub node_id: String,
    pub vector: Vec<f32>,
}

/// Typed operation vocabulary executed by [`GraphStore::run`] /
/// [`GraphStore::run_tx`]. Every field is a concrete parameter, never an
/// interpolated string.
#[derive(Debug, Clone)]
pub enum GraphOp {
    CreateNode {
        id: String,
        labels: Vec<String>,
        properties: BTreeMap<String, Value>,
    },
    MergeNode {
        id: String,
        labels: Vec<String>,
        properties: BTreeMap<String, Value>,
    },
    GetNode {
        id: String,
    },
    UpdateNode {
        id: String,
        patch: BTreeMap<String, Value>,
    },
    DeleteNode {
        id: String,
    },
    ListNodes {
        label: Option<String>,
        path_prefix: Option<String>,
        name_contains: Option<String>,
        limit: usize,
        offset: usize,
        order_by: Option<String>,
        order_desc: bool,
    },
    /// Count of nodes matching the same filters as [`GraphOp::ListNodes`],
    /// unpaginated (spec §4.3: `total` reflects the full matching count).
    CountNodes {
        label: Option<String>,
        path_prefix: Option<String>,
        name_contains: Option<String>,
    },
    MergeEdge {
        id: String,
        edge_type: String,
        from: String,
        to: Option<String>,
        properties: BTreeMap<String, Value>,
    },
    GetEdge {
        id: String,
    },
    ListEdges {
        from: Option<String>,
        to: Option<String>,
        edge_types: Vec<String>,
        active_only: Option<bool>,
        min_confidence: Option<f64>,
        limit: usize,
        offset: usize,
    },
    DeleteEdge {
        id: String,
    },
    /// Bounded outward expansion from a set of seeds, used by checkpoints,
    /// impact analysis, and time-travel traversal.
    Expand {
        seeds: Vec<String>,
        edge_types: Option<Vec<String>>,
        max_depth: u32,
        until: Option<DateTime<Utc>>,
    },
}

/// Low-level property-graph driver wrapper (C1).
#[async_trait]
pub trait GraphStore: Send + Sync {
    /// Execute a single operation.
    async fn run(&self, op: GraphOp, opts: QueryOpts) -> Result<Vec<Row>>;

    /// Execute a sequence of operations in one transaction.
    async fn run_tx(&self, ops: Vec<GraphOp>, opts: QueryOpts) -> Result<Vec<Vec<Row>>>;

    /// Create a named ANN index over `label.prop` at dimension `dim`.
    async fn create_vector_index(
        &self,
        name: &str,
        label: &str,
        prop: &str,
        dim: usize,
        sim: Similarity,
    ) -> Result<()>;

    /// Upsert a batch of vectors into `label`'s embedding property.
    async fn upsert_vectors(&self, label: &str, items: Vec<VectorItem>) -> Result<()>;

    /// ANN search against a named index.
    async fn search_vectors(
        &self,
        index: &str,
        vector: &[f32],
        limit: usize,
    ) -> Result<Vec<(String, f32)>>;

    /// Aggregate counts.
    async fn stats(&self) -> Result<GraphStats>;

    /// Create the baseline index set (spec §4.1).
    async fn ensure_indexes(&self) -> Result<()>;
}

pub(crate) fn query_error(code: &str, cause: impl ToString) -> Error {
    Error::Query {
        code: code.to_string(),
        cause: cause.to_string(),
    }
}

/// Convert any `Serialize` value into the marshalled [`Value`] tree, via a
/// `serde_json` round trip. This is the single bridge between typed domain
/// structs (`Entity`, `Relationship`) and the storage boundary (spec §4.3:
/// "Complex values are serialized as JSON strings for storage; scalars kept
/// as native types").
pub fn to_value_map<T: Serialize>(value: &T) -> Result<BTreeMap<String, Value>> {
    let json = serde_json::to_value(value)
        .map_err(|e| Error::Malformed(format!("serialize failed: {e}")))?;
    match json_to_value(&json) {
        Value::Map(map) => Ok(map),
        _ => Err(Error::Malformed("expected object at top level".to_string())),
    }
}

/// Inverse of [`to_value_map`].
pub fn from_value_map<T: for<'de> Deserialize<'de>>(map: &BTreeMap<String, Value>) -> Result<T> {
    let json = value_to_json(&Value::Map(map.clone()));
    serde_json::from_value(json).map_err(|e| Error::Malformed(format!("deserialize failed: {e}")))
}

fn json_to_value(json: &serde_json::Value) -> Value {
    match json {
        serde_json::Value::Null => Value::Null,
        serde_json::Value::Bool(b) => Value::Bool(*b),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Int(i)
            } else {
                Value::Float(n.as_f64().unwrap_or_default())
            }
        }
        serde_json::Value::String(s) => Value::Str(s.clone()),
        serde_json::Value::Array(items) => Value::List(items.iter().map(json_to_value).collect()),
        serde_json::Value::Object(map) => Value::Map(
            map.iter()
                .map(|(k, v)| (k.clone(), json_to_value(v)))
                .collect(),
        ),
    }
}

fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Null => serde_json::Value::Null,
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::Int(i) => serde_json::Value::from(*i),
        Value::Float(f) => serde_json::json!(f),
        Value::Str(s) => serde_json::Value::String(s.clone()),
        Value::Timestamp(t) => serde_json::Value::String(t.to_rfc3339()),
        Value::List(items) => serde_json::Value::Array(items.iter().map(value_to_json).collect()),
        Value::Map(map) => serde_json::Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), value_to_json(v)))
                .collect(),
        ),
    }
}
