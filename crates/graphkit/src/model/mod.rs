//! The property-graph data model (spec §3).

mod canonical;
mod entity;
mod relationship;

pub use canonical::canonical_relationship_id;
pub use entity::{Entity, EntityType, Property};
pub use relationship::{Evidence, Location, Relationship, RelationshipType, TargetRef, EVIDENCE_CAP};
