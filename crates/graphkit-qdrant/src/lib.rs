//! Qdrant-backed [`VectorStore`] for the code-knowledge graph engine.
//!
//! Grounded on the teacher's `dashflow-qdrant` crate: a thin wrapper around
//! `qdrant_client::Qdrant` that translates the generic trait into gRPC
//! calls, storing [`VectorMetadata`] as a JSON payload alongside each point
//! (mirroring `QdrantVectorStore`'s `content_key`/`metadata_key` payload
//! convention, collapsed to a single `metadata` field since this store has
//! no document-content concept of its own).

use async_trait::async_trait;
use graphkit::error::{Error, Result};
use graphkit::store::vector::{SearchOpts, VectorHit, VectorMetadata, VectorStore};
use qdrant_client::qdrant::{
    CreateCollectionBuilder, Distance, PointId, PointStruct, QueryPointsBuilder,
    UpsertPointsBuilder, VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};
use std::collections::HashMap;

const METADATA_KEY: &str = "metadata";

/// Similarity metric exposed at construction, mirrored 1:1 onto
/// `qdrant_client::qdrant::Distance`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMetric {
    Cosine,
    Euclidean,
    Dot,
}

impl From<DistanceMetric> for Distance {
    fn from(metric: DistanceMetric) -> Self {
        match metric {
            DistanceMetric::Cosine => Distance::Cosine,
            DistanceMetric::Euclidean => Distance::Euclid,
            DistanceMetric::Dot => Distance::Dot,
        }
    }
}

/// [`VectorStore`] implementation backed by a remote Qdrant collection.
pub struct QdrantVectorStore {
    client: Qdrant,
    collection_name: String,
}

impl QdrantVectorStore {
    /// Connect to `url` and ensure `collection_name` exists with the given
    /// dense-vector dimension and distance metric, creating it if absent.
    pub async fn connect(
        url: &str,
        collection_name: impl Into<String>,
        dim: u64,
        metric: DistanceMetric,
    ) -> Result<Self> {
        let client = Qdrant::from_url(url)
            .build()
            .map_err(|e| Error::DependencyUnavailable(format!("failed to build qdrant client: {e}")))?;
        let store = Self { client, collection_name: collection_name.into() };
        store.ensure_collection(dim, metric).await?;
        Ok(store)
    }

    /// Build from an already-configured client, e.g. one carrying API-key
    /// or TLS settings a plain URL can't express.
    pub fn from_client(client: Qdrant, collection_name: impl Into<String>) -> Self {
        Self { client, collection_name: collection_name.into() }
    }

    async fn ensure_collection(&self, dim: u64, metric: DistanceMetric) -> Result<()> {
        let exists = self
            .client
            .collection_exists(&self.collection_name)
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("collection_exists failed: {e}")))?;
        if exists {
            return Ok(());
        }
        let vector_params = VectorParamsBuilder::new(dim, metric.into()).build();
        let create = CreateCollectionBuilder::new(&self.collection_name).vectors_config(vector_params);
        self.client
            .create_collection(create)
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("create_collection failed: {e}")))?;
        Ok(())
    }

    fn build_payload(metadata: &VectorMetadata) -> Result<Payload> {
        let json = serde_json::to_value(metadata)
            .map_err(|e| Error::Malformed(format!("failed to serialize metadata: {e}")))?;
        let mut payload = Payload::new();
        payload.insert(METADATA_KEY, json);
        Ok(payload)
    }

    fn metadata_from_payload(payload: &HashMap<String, qdrant_client::qdrant::Value>) -> VectorMetadata {
        payload
            .get(METADATA_KEY)
            .and_then(|v| serde_json::to_value(v).ok())
            .and_then(|v| serde_json::from_value(v).ok())
            .unwrap_or_default()
    }
}

#[async_trait]
impl VectorStore for QdrantVectorStore {
    async fn upsert(&self, entity_id: &str, vector: Vec<f32>, metadata: VectorMetadata) -> Result<()> {
        let payload = Self::build_payload(&metadata)?;
        let point = PointStruct {
            id: Some(PointId::from(entity_id)),
            vectors: Some(vector.into()),
            payload: payload.into(),
        };
        let request = UpsertPointsBuilder::new(&self.collection_name, vec![point]);
        self.client
            .upsert_points(request)
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("qdrant upsert failed: {e}")))?;
        Ok(())
    }

    async fn search(&self, query_vec: &[f32], opts: SearchOpts) -> Result<Vec<VectorHit>> {
        let fetch_k = opts.limit.max(opts.limit * 2).max(1);
        let mut builder = QueryPointsBuilder::new(&self.collection_name)
            .query(query_vec.to_vec())
            .limit(fetch_k as u64)
            .with_payload(true)
            .with_vectors(false);
        if let Some(min_score) = opts.min_score {
            builder = builder.score_threshold(min_score);
        }
        let response = self
            .client
            .query(builder)
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("qdrant query failed: {e}")))?;

        let mut hits: Vec<VectorHit> = response
            .result
            .into_iter()
            .filter_map(|scored| {
                let entity_id = match scored.id.as_ref().and_then(|id| id.point_id_options.clone()) {
                    Some(qdrant_client::qdrant::point_id::PointIdOptions::Uuid(uuid)) => uuid,
                    Some(qdrant_client::qdrant::point_id::PointIdOptions::Num(num)) => num.to_string(),
                    None => return None,
                };
                let metadata = Self::metadata_from_payload(&scored.payload);
                if let Some(filter) = &opts.filter {
                    if !filter(&metadata) {
                        return None;
                    }
                }
                Some(VectorHit { entity_id, score: scored.score, metadata })
            })
            .collect();
        hits.truncate(opts.limit.max(1));
        Ok(hits)
    }

    async fn delete(&self, entity_id: &str) -> Result<()> {
        use qdrant_client::qdrant::{DeletePointsBuilder, PointsIdsList};
        let ids = PointsIdsList { ids: vec![PointId::from(entity_id)] };
        let request = DeletePointsBuilder::new(&self.collection_name).points(ids);
        self.client
            .delete_points(request)
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("qdrant delete failed: {e}")))?;
        Ok(())
    }
}
