//! Embedding persistence and ANN search (C2).
//!
//! `VectorStore` is deliberately backend-agnostic: [`GraphVectorStore`]
//! delegates to a [`GraphStore`]'s native vector index, while an external
//! ANN service (e.g. Qdrant, grounded on the teacher's `dashflow-qdrant`)
//! implements the same trait in its own crate (`graphkit-qdrant`).

use super::{cosine, GraphStore, Similarity, VectorItem};
use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::instrument;

/// Metadata stored alongside an embedding (spec §4.2).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VectorMetadata {
    pub node_type: Option<String>,
    pub path: Option<String>,
    pub language: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Predicate applied to metadata after ANN retrieval.
pub type MetadataFilter = Arc<dyn Fn(&VectorMetadata) -> bool + Send + Sync>;

/// Options for [`VectorStore::search`].
#[derive(Clone, Default)]
pub struct SearchOpts {
    pub limit: usize,
    pub min_score: Option<f32>,
    pub filter: Option<MetadataFilter>,
}

/// One ranked search hit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorHit {
    pub entity_id: String,
    pub score: f32,
    pub metadata: VectorMetadata,
}

/// Default chunk size for batched vector writes (spec §4.2).
pub const VECTOR_BATCH_SIZE: usize = 200;

/// Maps `entityId -> embedding` plus metadata, with cosine ANN search (C2).
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Idempotent upsert of a single embedding.
    async fn upsert(&self, entity_id: &str, vector: Vec<f32>, metadata: VectorMetadata) -> Result<()>;

    /// Batched upsert; callers may submit any number of vectors, the store
    /// chunks internally at [`VECTOR_BATCH_SIZE`].
    async fn upsert_batch(&self, items: Vec<(String, Vec<f32>, VectorMetadata)>) -> Result<()> {
        for chunk in items.chunks(VECTOR_BATCH_SIZE) {
            for (id, vector, metadata) in chunk {
                self.upsert(id, vector.clone(), metadata.clone()).await?;
            }
        }
        Ok(())
    }

    /// ANN search with post-filtering (spec §4.2: `k = max(limit, limit*2)`
    /// fetched then post-filtered).
    async fn search(&self, query_vec: &[f32], opts: SearchOpts) -> Result<Vec<VectorHit>>;

    /// Remove a vector and detach any embedding property.
    async fn delete(&self, entity_id: &str) -> Result<()>;
}

/// [`VectorStore`] backed by a [`GraphStore`]'s native vector index.
pub struct GraphVectorStore {
    store: Arc<dyn GraphStore>,
    index_name: String,
    label: String,
    metadata: dashmap::DashMap<String, VectorMetadata>,
}

impl GraphVectorStore {
    pub async fn new(store: Arc<dyn GraphStore>, index_name: &str, label: &str, dim: usize) -> Result<Self> {
        store
            .create_vector_index(index_name, label, "embedding", dim, Similarity::Cosine)
            .await?;
        Ok(Self {
            store,
            index_name: index_name.to_string(),
            label: label.to_string(),
            metadata: dashmap::DashMap::new(),
        })
    }
}

#[async_trait]
impl VectorStore for GraphVectorStore {
    #[instrument(skip(self, vector, metadata))]
    async fn upsert(&self, entity_id: &str, vector: Vec<f32>, metadata: VectorMetadata) -> Result<()> {
        self.store
            .upsert_vectors(
                &self.label,
                vec![VectorItem {
                    node_id: entity_id.to_string(),
                    vector,
                }],
            )
            .await?;
        self.metadata.insert(entity_id.to_string(), metadata);
        Ok(())
    }

    async fn search(&self, query_vec: &[f32], opts: SearchOpts) -> Result<Vec<VectorHit>> {
        let fetch_k = opts.limit.max(opts.limit * 2).max(1);
        let raw = self
            .store
            .search_vectors(&self.index_name, query_vec, fetch_k)
            .await?;
        let mut hits: Vec<VectorHit> = raw
            .into_iter()
            .filter_map(|(id, score)| {
                if let Some(min) = opts.min_score {
                    if score < min {
                        return None;
                    }
                }
                let metadata = self.metadata.get(&id).map(|m| m.clone()).unwrap_or_default();
                if let Some(filter) = &opts.filter {
                    if !filter(&metadata) {
                        return None;
                    }
                }
                Some(VectorHit {
                    entity_id: id,
                    score,
                    metadata,
                })
            })
            .collect();
        hits.truncate(opts.limit.max(1));
        Ok(hits)
    }

    async fn delete(&self, entity_id: &str) -> Result<()> {
        self.metadata.remove(entity_id);
        // The in-memory backend has no dedicated vector-delete op; an
        // overwrite-on-next-upsert is sufficient for the reference store.
        // Real backends issue a point-delete against the ANN index here.
        let _ = entity_id;
        Ok(())
    }
}

/// Standalone in-process ANN index, useful for tests that want a
/// `VectorStore` without constructing a full `GraphStore`.
#[derive(Default)]
pub struct InMemoryVectorIndex {
    entries: dashmap::DashMap<String, (Vec<f32>, VectorMetadata)>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorIndex {
    async fn upsert(&self, entity_id: &str, vector: Vec<f32>, metadata: VectorMetadata) -> Result<()> {
        if vector.is_empty() {
            return Err(Error::EmbeddingUnavailable("empty vector".to_string()));
        }
        self.entries.insert(entity_id.to_string(), (vector, metadata));
        Ok(())
    }

    async fn search(&self, query_vec: &[f32], opts: SearchOpts) -> Result<Vec<VectorHit>> {
        let fetch_k = opts.limit.max(opts.limit * 2).max(1);
        let mut scored: Vec<(String, f32, VectorMetadata)> = self
            .entries
            .iter()
            .filter_map(|entry| {
                let (id, (vector, metadata)) = (entry.key(), entry.value());
                if vector.len() != query_vec.len() {
                    return None;
                }
                Some((id.clone(), cosine(query_vec, vector), metadata.clone()))
            })
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(fetch_k);

        let hits: HashMap<String, (f32, VectorMetadata)> = scored
            .into_iter()
            .map(|(id, score, meta)| (id, (score, meta)))
            .collect();

        let mut result: Vec<VectorHit> = hits
            .into_iter()
            .filter(|(_, (score, _))| opts.min_score.map(|min| *score >= min).unwrap_or(true))
            .filter(|(_, (_, metadata))| opts.filter.as_ref().map(|f| f(metadata)).unwrap_or(true))
            .map(|(entity_id, (score, metadata))| VectorHit {
                entity_id,
                score,
                metadata,
            })
            .collect();
        result.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        result.truncate(opts.limit.max(1));
        Ok(result)
    }

    async fn delete(&self, entity_id: &str) -> Result<()> {
        self.entries.remove(entity_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upsert_then_search_finds_closest_match() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert("a", vec![1.0, 0.0], VectorMetadata::default())
            .await
            .unwrap();
        index
            .upsert("b", vec![0.0, 1.0], VectorMetadata::default())
            .await
            .unwrap();

        let hits = index
            .search(&[1.0, 0.0], SearchOpts { limit: 1, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entity_id, "a");
    }

    #[tokio::test]
    async fn rejects_empty_vectors() {
        let index = InMemoryVectorIndex::new();
        let err = index.upsert("a", vec![], VectorMetadata::default()).await;
        assert!(matches!(err, Err(Error::EmbeddingUnavailable(_))));
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let index = InMemoryVectorIndex::new();
        index
            .upsert("a", vec![1.0, 0.0], VectorMetadata::default())
            .await
            .unwrap();
        index.delete("a").await.unwrap();
        let hits = index
            .search(&[1.0, 0.0], SearchOpts { limit: 5, ..Default::default() })
            .await
            .unwrap();
        assert!(hits.is_empty());
    }
}
