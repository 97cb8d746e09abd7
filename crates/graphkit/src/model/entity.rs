//! Entity node type (spec §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Closed set of entity type tags. Labels attached for indexed lookup are
/// derived one-to-one from this variant (spec §3, "Labels derived from
/// `type` are attached for indexed lookup").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EntityType {
    File,
    Directory,
    Module,
    Symbol,
    Function,
    Class,
    Interface,
    TypeAlias,
    Test,
    Spec,
    Documentation,
    BusinessDomain,
    SemanticCluster,
    Session,
    Change,
    Version,
    Checkpoint,
}

impl EntityType {
    /// The graph label this type maps to, used by `GraphStore` when
    /// attaching labels on create (spec §3/§4.3).
    pub fn label(self) -> &'static str {
        match self {
            EntityType::File => "File",
            EntityType::Directory => "Directory",
            EntityType::Module => "Module",
            EntityType::Symbol => "Symbol",
            EntityType::Function => "Function",
            EntityType::Class => "Class",
            EntityType::Interface => "Interface",
            EntityType::TypeAlias => "TypeAlias",
            EntityType::Test => "Test",
            EntityType::Spec => "Spec",
            EntityType::Documentation => "Documentation",
            EntityType::BusinessDomain => "BusinessDomain",
            EntityType::SemanticCluster => "SemanticCluster",
            EntityType::Session => "Session",
            EntityType::Change => "Change",
            EntityType::Version => "Version",
            EntityType::Checkpoint => "Checkpoint",
        }
    }
}

/// Tagged-sum property value (spec §9 "Dynamic property objects"): scalars
/// stay native, everything else serializes through `Nested` at the storage
/// boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Property {
    /// UTF-8 scalar.
    Str(String),
    /// 64-bit integer scalar; driver integers are widened to this (spec §4.1).
    Int(i64),
    /// Floating-point scalar.
    Float(f64),
    /// Boolean scalar.
    Bool(bool),
    /// Wall-clock timestamp, always normalized to UTC (spec §4.1).
    Timestamp(DateTime<Utc>),
    /// Opaque binary payload.
    Blob(Vec<u8>),
    /// Arbitrary nested JSON, serialized as a string at the storage
    /// boundary and kept as native `serde_json::Value` in memory.
    Nested(serde_json::Value),
}

/// A polymorphic graph node (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    /// Globally unique id, namespace-prefixed on the way in.
    pub id: String,
    /// Closed-set type tag.
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    /// Creation timestamp.
    pub created: DateTime<Utc>,
    /// Last-modified timestamp, bumped on every mutation.
    pub last_modified: DateTime<Utc>,
    /// Repository-relative path, for file/directory/symbol-like entities.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Source language, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    /// Content hash, used by the history engine to detect real changes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Display name (symbol/function/class name, file basename, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Type/function signature, when applicable.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Extracted documentation comment.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docstring: Option<String>,
    /// Raw or truncated content, when the entity owns textual content.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Per-type overflow properties, stored as JSON at the storage
    /// boundary (spec §4.3 "Complex values are serialized as JSON strings").
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, Property>,
}

impl Entity {
    /// Construct a new entity with `created`/`lastModified` set to `now`.
    pub fn new(id: impl Into<String>, entity_type: EntityType, now: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            entity_type,
            created: now,
            last_modified: now,
            path: None,
            language: None,
            hash: None,
            name: None,
            signature: None,
            docstring: None,
            content: None,
            properties: BTreeMap::new(),
        }
    }
}
