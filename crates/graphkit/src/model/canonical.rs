//! Canonical relationship identity (spec §4.4).
//!
//! A deterministic hash of `(fromEntityId, type, normalized target
//! reference)`. For code edges the normalized target reference is
//! `(symbol, file, kind)` rather than the resolved `toEntityId`, so that
//! pre-resolution and post-resolution writes of the same logical edge
//! collapse onto the same id.

use super::relationship::{RelationshipType, TargetRef};
use sha2::{Digest, Sha256};

/// Compute the canonical id for an edge about to be written.
///
/// `to_entity_id` is used verbatim for non-code edges; for code edges
/// `target_ref` takes priority when present (pre-resolution), falling back
/// to `to_entity_id` once resolution has happened and no explicit
/// `target_ref` was supplied by the caller.
pub fn canonical_relationship_id(
    from_entity_id: &str,
    relationship_type: RelationshipType,
    to_entity_id: Option<&str>,
    target_ref: Option<&TargetRef>,
) -> String {
    let type_tag = format!("{relationship_type:?}");
    let target_tag = if relationship_type.is_code_edge() {
        match target_ref {
            Some(t) => format!("ref:{}:{}:{}", t.symbol, t.file, t.kind),
            None => format!("to:{}", to_entity_id.unwrap_or("")),
        }
    } else {
        format!("to:{}", to_entity_id.unwrap_or(""))
    };

    let mut hasher = Sha256::new();
    hasher.update(from_entity_id.as_bytes());
    hasher.update(b"\0");
    hasher.update(type_tag.as_bytes());
    hasher.update(b"\0");
    hasher.update(target_tag.as_bytes());
    let digest = hasher.finalize();
    format!("rel_{}", hex::encode(&digest[..16]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pre_and_post_resolution_collapse_to_same_id() {
        let target = TargetRef {
            symbol: "bar".into(),
            file: "src/m.ts".into(),
            kind: "function".into(),
        };
        let pre = canonical_relationship_id(
            "entity_foo",
            RelationshipType::Calls,
            None,
            Some(&target),
        );
        // Even once resolved, supplying the same target_ref must collapse.
        let post = canonical_relationship_id(
            "entity_foo",
            RelationshipType::Calls,
            Some("entity_bar"),
            Some(&target),
        );
        assert_eq!(pre, post);
    }

    #[test]
    fn distinct_targets_produce_distinct_ids() {
        let a = canonical_relationship_id(
            "entity_foo",
            RelationshipType::Calls,
            Some("entity_bar"),
            None,
        );
        let b = canonical_relationship_id(
            "entity_foo",
            RelationshipType::Calls,
            Some("entity_baz"),
            None,
        );
        assert_ne!(a, b);
    }

    #[test]
    fn non_code_edges_key_on_resolved_target() {
        let id = canonical_relationship_id(
            "entity_foo",
            RelationshipType::Contains,
            Some("entity_bar"),
            None,
        );
        assert!(id.starts_with("rel_"));
    }

    #[test]
    fn id_is_deterministic() {
        let a = canonical_relationship_id("e1", RelationshipType::Imports, Some("e2"), None);
        let b = canonical_relationship_id("e1", RelationshipType::Imports, Some("e2"), None);
        assert_eq!(a, b);
    }
}
