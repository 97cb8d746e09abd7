//! Tenant/namespace id-prefix policy applied uniformly by every store (C10).
//!
//! Grounded on the tenant-label sanitization idiom in the teacher's
//! `dashflow-streaming/src/rate_limiter.rs` (`is_safe_tenant_label`,
//! `tenant_label_value`): a namespace prefix is bound once at process start
//! and applied on the way in; stores never re-apply it on read.

use std::sync::Arc;

/// Immutable, process-wide namespace binding.
///
/// Cloning is cheap: the prefixes are held behind an `Arc<str>` so every
/// component can carry a read-only handle without re-allocating.
#[derive(Debug, Clone)]
pub struct NamespaceScope {
    entity_prefix: Arc<str>,
    redis_prefix: Arc<str>,
    qdrant_code_collection: Arc<str>,
    qdrant_doc_collection: Arc<str>,
}

impl Default for NamespaceScope {
    fn default() -> Self {
        Self::new("default")
    }
}

impl NamespaceScope {
    /// Bind a namespace scope from a single tenant/namespace name.
    ///
    /// Derives an entity-id prefix, a Redis key prefix, and the two Qdrant
    /// collection names ("code" and "documentation") from the same root, so
    /// a single configuration value is enough to isolate a tenant across
    /// every substore.
    pub fn new(namespace: impl AsRef<str>) -> Self {
        let ns = sanitize(namespace.as_ref());
        Self {
            entity_prefix: Arc::from(format!("{ns}:")),
            redis_prefix: Arc::from(format!("{ns}:")),
            qdrant_code_collection: Arc::from(format!("{ns}_code")),
            qdrant_doc_collection: Arc::from(format!("{ns}_documentation")),
        }
    }

    /// Prefix a required entity or relationship id, unless it already
    /// carries this scope's prefix.
    pub fn require_entity_id(&self, id: impl Into<String>) -> String {
        qualify(&self.entity_prefix, id.into())
    }

    /// Prefix an optional id, passing `None` through untouched.
    pub fn optional_entity_id(&self, id: Option<impl Into<String>>) -> Option<String> {
        id.map(|id| self.require_entity_id(id))
    }

    /// Prefix every id in a collection.
    pub fn entity_id_array(&self, ids: impl IntoIterator<Item = impl Into<String>>) -> Vec<String> {
        ids.into_iter().map(|id| self.require_entity_id(id)).collect()
    }

    /// Relationship ids share the entity-id prefixing policy.
    pub fn require_relationship_id(&self, id: impl Into<String>) -> String {
        self.require_entity_id(id)
    }

    /// Prefix an auxiliary Redis/KV key for this namespace.
    pub fn qualify_redis_key(&self, key: impl Into<String>) -> String {
        qualify(&self.redis_prefix, key.into())
    }

    /// The bound collection name for a vector-index domain.
    pub fn qdrant_collection(&self, domain: VectorDomain) -> &str {
        match domain {
            VectorDomain::Code => &self.qdrant_code_collection,
            VectorDomain::Documentation => &self.qdrant_doc_collection,
        }
    }
}

/// The two vector-index domains a namespace binds a collection name for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorDomain {
    /// The code-entity embedding collection.
    Code,
    /// The documentation-entity embedding collection.
    Documentation,
}

fn qualify(prefix: &str, value: String) -> String {
    if value.starts_with(prefix) {
        value
    } else {
        format!("{prefix}{value}")
    }
}

fn sanitize(namespace: &str) -> String {
    let cleaned: String = namespace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefixes_plain_ids_once() {
        let scope = NamespaceScope::new("acme");
        let id = scope.require_entity_id("file_1");
        assert_eq!(id, "acme:file_1");
        // Re-applying is a no-op.
        assert_eq!(scope.require_entity_id(id.clone()), id);
    }

    #[test]
    fn optional_id_passthrough() {
        let scope = NamespaceScope::new("acme");
        assert_eq!(scope.optional_entity_id(None::<String>), None);
        assert_eq!(
            scope.optional_entity_id(Some("x")),
            Some("acme:x".to_string())
        );
    }

    #[test]
    fn sanitizes_unsafe_namespace_characters() {
        let scope = NamespaceScope::new("acme/prod team");
        assert_eq!(scope.require_entity_id("e1"), "acme_prod_team:e1");
    }

    #[test]
    fn qdrant_collections_are_namespaced() {
        let scope = NamespaceScope::new("acme");
        assert_eq!(scope.qdrant_collection(VectorDomain::Code), "acme_code");
        assert_eq!(
            scope.qdrant_collection(VectorDomain::Documentation),
            "acme_documentation"
        );
    }
}
