//! Relationship edge type, evidence, and locations (spec §3/§4.4).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed enumeration of relationship types (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RelationshipType {
    Contains,
    Defines,
    Exports,
    Imports,
    Calls,
    References,
    Implements,
    Extends,
    DependsOn,
    Uses,
    Tests,
    Validates,
    Requires,
    Impacts,
    PreviousVersion,
    VersionOf,
    ModifiedIn,
    IntroducedIn,
    RemovedIn,
    SessionModified,
    SessionImpacted,
    SessionCheckpoint,
    BrokeIn,
    FixedIn,
    DependsOnChange,
    CheckpointIncludes,
    DescribesDomain,
    BelongsToDomain,
    DocumentedBy,
    ClusterMember,
    DocumentsSection,
}

impl RelationshipType {
    /// "Code edges" are identified pre-resolution by `(symbol, file, kind)`
    /// rather than by the target entity id (spec §4.4), because the
    /// resolver may not have created the target entity yet.
    pub fn is_code_edge(self) -> bool {
        matches!(
            self,
            RelationshipType::Calls
                | RelationshipType::Uses
                | RelationshipType::References
                | RelationshipType::Implements
                | RelationshipType::Extends
                | RelationshipType::DependsOn
        )
    }

    /// Edge types considered "dependent" edges for impact analysis (spec §4.7).
    pub fn is_dependent_edge(self) -> bool {
        matches!(
            self,
            RelationshipType::Calls
                | RelationshipType::References
                | RelationshipType::Uses
                | RelationshipType::Implements
                | RelationshipType::Extends
                | RelationshipType::DependsOn
        )
    }
}

/// Pre-resolution target reference used to compute a stable canonical id
/// for code edges before their target entity exists (spec §4.4).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TargetRef {
    /// Symbol name being referenced.
    pub symbol: String,
    /// File the symbol is expected to resolve in.
    pub file: String,
    /// Coarse symbol kind (e.g. "function", "class"), used to disambiguate
    /// overloaded names.
    pub kind: String,
}

/// A single observation supporting a relationship (spec GLOSSARY).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    /// Deduplication fingerprint, e.g. `file:line:column:kind`.
    pub fingerprint: String,
    /// Free-form note (snippet, call-site description, ...).
    #[serde(default)]
    pub note: Option<String>,
    /// When this evidence was observed.
    pub observed_at: DateTime<Utc>,
}

/// A source location supporting a relationship.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Deduplication fingerprint, e.g. `file:line:column:kind`.
    pub fingerprint: String,
    pub file: String,
    pub line: u32,
    #[serde(default)]
    pub column: Option<u32>,
    /// When this location was observed; used to keep the most recent
    /// entries when the list is capped at [`EVIDENCE_CAP`].
    pub observed_at: DateTime<Utc>,
}

/// A directed typed edge between two entities (spec §3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    /// Canonical id (spec §4.4); writes with the same id merge.
    pub id: String,
    #[serde(rename = "type")]
    pub relationship_type: RelationshipType,
    pub from_entity_id: String,
    /// Resolved target id, once known. `None` for a code edge that has not
    /// resolved yet; in that case `target_ref` carries identity instead.
    pub to_entity_id: Option<String>,
    /// Pre-resolution target reference for code edges (spec §4.4).
    #[serde(default)]
    pub target_ref: Option<TargetRef>,
    pub created: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
    /// Monotonically increasing on every merge.
    pub version: u64,

    /// Set when the edge becomes active.
    pub valid_from: Option<DateTime<Utc>>,
    /// `None` while active; set when the edge is swept or closed.
    pub valid_to: Option<DateTime<Utc>>,

    /// Bounded, deduplicated-by-fingerprint, capped at [`EVIDENCE_CAP`].
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    /// Same capping policy as `evidence`.
    #[serde(default)]
    pub locations: Vec<Location>,
    pub confidence: f64,
    pub occurrences_total: u64,
    pub last_seen_at: DateTime<Utc>,
    pub active: bool,
    #[serde(default)]
    pub change_set_id: Option<String>,
}

/// Uniform cap on evidence/location list length (spec §9 Open Questions:
/// the spec chooses 20 uniformly).
pub const EVIDENCE_CAP: usize = 20;

impl Relationship {
    /// `validTo IS NULL` iff `active = true` (spec §3 invariant). Returns
    /// `true` when the invariant holds for this instance.
    pub fn validity_invariant_holds(&self) -> bool {
        self.valid_to.is_none() == self.active
    }
}
