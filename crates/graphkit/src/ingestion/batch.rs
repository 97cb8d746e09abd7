//! Batch accumulation, dependency-ordered flush, and idempotent replay
//! (C8, spec §4.8 "Batch processor with dependency DAG").
//!
//! Drafts accumulate per `kind` until a size or time threshold closes the
//! batch. Entities must land before the relationships and embeddings that
//! reference them, so flush order follows a fixed three-layer DAG
//! (`Entity -> Relationship`, `Entity -> Embedding`) built with `petgraph`
//! and topologically sorted, rather than tracking per-item dependency edges
//! individually — the batch either contains an item's prerequisite kind or
//! it doesn't, so a kind-level DAG captures the ordering the spec asks for
//! without the bookkeeping of per-draft edges.

use crate::entity_store::EntityStore;
use crate::error::Result;
use crate::model::{Entity, Relationship};
use crate::relationship_store::{RelationshipObservation, RelationshipStore};
use crate::store::vector::VectorMetadata;
use crate::store::VectorStore;
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::sync::Semaphore;
use tracing::instrument;

/// Thresholds controlling when a batch is closed and flushed (spec §4.8
/// `batching` config block).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BatchConfig {
    pub entity_batch_size: usize,
    pub relationship_batch_size: usize,
    pub embedding_batch_size: usize,
    pub timeout: Duration,
    pub max_concurrent_batches: usize,
    pub idempotency_ttl: Duration,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            entity_batch_size: 50,
            relationship_batch_size: 100,
            embedding_batch_size: 25,
            timeout: Duration::from_secs(5),
            max_concurrent_batches: 4,
            idempotency_ttl: Duration::from_secs(600),
        }
    }
}

/// A staged draft awaiting the next flush.
#[derive(Debug, Clone)]
pub enum ChangePayload {
    Entity(Entity),
    Relationship(RelationshipObservation),
    Embedding { entity_id: String, vector: Vec<f32>, metadata: VectorMetadata },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ItemKind {
    Entity,
    Relationship,
    Embedding,
}

impl ChangePayload {
    fn kind(&self) -> ItemKind {
        match self {
            ChangePayload::Entity(_) => ItemKind::Entity,
            ChangePayload::Relationship(_) => ItemKind::Relationship,
            ChangePayload::Embedding { .. } => ItemKind::Embedding,
        }
    }

    fn fingerprint_seed(&self) -> String {
        match self {
            ChangePayload::Entity(e) => format!("entity:{}", e.id),
            ChangePayload::Relationship(r) => {
                format!("rel:{:?}:{}:{:?}", r.relationship_type, r.from_entity_id, r.to_entity_id)
            }
            ChangePayload::Embedding { entity_id, .. } => format!("embedding:{entity_id}"),
        }
    }
}

/// Result of flushing one kind's layer.
#[derive(Debug, Clone, Default)]
pub struct BatchOutcome {
    pub entities_written: usize,
    pub relationships_written: usize,
    pub embeddings_written: usize,
    pub failed: Vec<BatchFailure>,
}

/// One item that failed even after the retry budget was exhausted at the
/// caller's retry layer (the batch processor itself does not retry; that is
/// the worker pool's job, see `workers.rs`).
#[derive(Debug, Clone)]
pub struct BatchFailure {
    pub fingerprint: String,
    pub kind: &'static str,
    pub error: String,
}

struct CacheEntry {
    outcome: BatchOutcomeSummary,
    inserted_at: Instant,
}

/// A cheaply cloneable summary, cached for idempotent replay (spec §4.8:
/// "a recently-completed key short-circuits to its cached result").
#[derive(Debug, Clone, Default)]
pub struct BatchOutcomeSummary {
    pub entities_written: usize,
    pub relationships_written: usize,
    pub embeddings_written: usize,
    pub failed_count: usize,
}

impl From<&BatchOutcome> for BatchOutcomeSummary {
    fn from(outcome: &BatchOutcome) -> Self {
        Self {
            entities_written: outcome.entities_written,
            relationships_written: outcome.relationships_written,
            embeddings_written: outcome.embeddings_written,
            failed_count: outcome.failed.len(),
        }
    }
}

/// The downstream stores a flush writes to.
#[derive(Clone)]
pub struct Stores {
    pub entities: EntityStore,
    pub relationships: RelationshipStore,
    pub vectors: Option<Arc<dyn VectorStore>>,
}

/// Accumulates staged drafts and flushes them in dependency order.
pub struct BatchProcessor {
    config: BatchConfig,
    buffers: Mutex<HashMap<ItemKind, Vec<(String, ChangePayload)>>>,
    opened_at: Mutex<Option<Instant>>,
    idempotency: Mutex<HashMap<String, CacheEntry>>,
}

impl BatchProcessor {
    pub fn new(config: BatchConfig) -> Self {
        Self {
            config,
            buffers: Mutex::new(HashMap::new()),
            opened_at: Mutex::new(None),
            idempotency: Mutex::new(HashMap::new()),
        }
    }

    /// Stage a draft; returns `true` if this push crossed a size threshold
    /// and the caller should flush now.
    pub async fn push(&self, fingerprint: String, payload: ChangePayload) -> bool {
        let kind = payload.kind();
        let mut buffers = self.buffers.lock().await;
        let entry = buffers.entry(kind).or_default();
        entry.push((fingerprint, payload));
        let len = entry.len();
        drop(buffers);

        let mut opened_at = self.opened_at.lock().await;
        if opened_at.is_none() {
            *opened_at = Some(Instant::now());
        }
        drop(opened_at);

        match kind {
            ItemKind::Entity => len >= self.config.entity_batch_size,
            ItemKind::Relationship => len >= self.config.relationship_batch_size,
            ItemKind::Embedding => len >= self.config.embedding_batch_size,
        }
    }

    /// Whether the open batch has aged past `timeoutMs` without closing on
    /// size alone.
    pub async fn is_timed_out(&self) -> bool {
        match *self.opened_at.lock().await {
            Some(opened_at) => opened_at.elapsed() >= self.config.timeout,
            None => false,
        }
    }

    pub async fn is_empty(&self) -> bool {
        self.buffers.lock().await.values().all(|v| v.is_empty())
    }

    /// Drain all staged drafts and write them to `stores` in dependency
    /// order, short-circuiting to a cached result when this exact batch
    /// content was flushed within the idempotency TTL.
    #[instrument(skip(self, stores))]
    pub async fn flush(&self, stores: &Stores) -> Result<BatchOutcome> {
        let mut buffers = self.buffers.lock().await;
        let drained: HashMap<ItemKind, Vec<(String, ChangePayload)>> = buffers.drain().collect();
        drop(buffers);
        *self.opened_at.lock().await = None;

        let key = content_fingerprint(&drained);
        if let Some(cached) = self.cached(&key).await {
            return Ok(BatchOutcome {
                entities_written: cached.entities_written,
                relationships_written: cached.relationships_written,
                embeddings_written: cached.embeddings_written,
                failed: Vec::new(),
            });
        }

        let mut outcome = BatchOutcome::default();
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_batches.max(1)));
        for kind in flush_order() {
            let Some(items) = drained.get(&kind) else { continue };
            if items.is_empty() {
                continue;
            }
            match kind {
                ItemKind::Entity => {
                    let entities: Vec<Entity> = items
                        .iter()
                        .filter_map(|(_, p)| match p {
                            ChangePayload::Entity(e) => Some(e.clone()),
                            _ => None,
                        })
                        .collect();
                    outcome.entities_written += write_entities(stores, entities, &mut outcome.failed).await;
                }
                ItemKind::Relationship => {
                    let relationships: Vec<(String, RelationshipObservation)> = items
                        .iter()
                        .filter_map(|(fp, p)| match p {
                            ChangePayload::Relationship(r) => Some((fp.clone(), r.clone())),
                            _ => None,
                        })
                        .collect();
                    outcome.relationships_written +=
                        write_relationships(stores, relationships, Arc::clone(&semaphore), &mut outcome.failed)
                            .await;
                }
                ItemKind::Embedding => {
                    let Some(vectors) = stores.vectors.clone() else { continue };
                    let embeddings: Vec<(String, Vec<f32>, VectorMetadata)> = items
                        .iter()
                        .filter_map(|(_, p)| match p {
                            ChangePayload::Embedding { entity_id, vector, metadata } => {
                                Some((entity_id.clone(), vector.clone(), metadata.clone()))
                            }
                            _ => None,
                        })
                        .collect();
                    let count = embeddings.len();
                    if vectors.upsert_batch(embeddings).await.is_ok() {
                        outcome.embeddings_written += count;
                    } else {
                        for (fingerprint, _) in items {
                            outcome.failed.push(BatchFailure {
                                fingerprint: fingerprint.clone(),
                                kind: "embedding",
                                error: "embedding upsert failed".to_string(),
                            });
                        }
                    }
                }
            }
        }

        self.cache(key, &outcome).await;
        Ok(outcome)
    }

    async fn cached(&self, key: &str) -> Option<BatchOutcomeSummary> {
        let cache = self.idempotency.lock().await;
        let entry = cache.get(key)?;
        if entry.inserted_at.elapsed() < self.config.idempotency_ttl {
            Some(entry.outcome.clone())
        } else {
            None
        }
    }

    async fn cache(&self, key: String, outcome: &BatchOutcome) {
        let mut cache = self.idempotency.lock().await;
        cache.retain(|_, entry| entry.inserted_at.elapsed() < self.config.idempotency_ttl);
        cache.insert(
            key,
            CacheEntry { outcome: BatchOutcomeSummary::from(outcome), inserted_at: Instant::now() },
        );
    }
}

async fn write_entities(stores: &Stores, entities: Vec<Entity>, failed: &mut Vec<BatchFailure>) -> usize {
    let mut written = 0;
    for entity in entities {
        let fingerprint = format!("entity:{}", entity.id);
        match stores.entities.create(entity).await {
            Ok(_) => written += 1,
            Err(error) => failed.push(BatchFailure { fingerprint, kind: "entity", error: error.to_string() }),
        }
    }
    written
}

async fn write_relationships(
    stores: &Stores,
    relationships: Vec<(String, RelationshipObservation)>,
    semaphore: Arc<Semaphore>,
    failed: &mut Vec<BatchFailure>,
) -> usize {
    let mut handles = Vec::with_capacity(relationships.len());
    for (fingerprint, observation) in relationships {
        let relationships_store = stores.relationships.clone();
        let semaphore = Arc::clone(&semaphore);
        handles.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.ok();
            let result = relationships_store.upsert(observation).await;
            (fingerprint, result)
        }));
    }
    let mut written = 0;
    for handle in handles {
        if let Ok((fingerprint, result)) = handle.await {
            match result {
                Ok(_) => written += 1,
                Err(error) => failed.push(BatchFailure { fingerprint, kind: "relationship", error: error.to_string() }),
            }
        }
    }
    written
}

/// Flush order honoring `entity -> relationship`, `entity -> embedding`.
fn flush_order() -> Vec<ItemKind> {
    let mut graph: DiGraph<ItemKind, ()> = DiGraph::new();
    let entity = graph.add_node(ItemKind::Entity);
    let relationship = graph.add_node(ItemKind::Relationship);
    let embedding = graph.add_node(ItemKind::Embedding);
    graph.add_edge(entity, relationship, ());
    graph.add_edge(entity, embedding, ());
    toposort(&graph, None)
        .expect("fixed three-node DAG is acyclic by construction")
        .into_iter()
        .map(|idx| graph[idx])
        .collect()
}

fn content_fingerprint(drained: &HashMap<ItemKind, Vec<(String, ChangePayload)>>) -> String {
    let mut fingerprints: Vec<&str> = drained.values().flatten().map(|(fp, _)| fp.as_str()).collect();
    fingerprints.sort_unstable();
    let mut hasher = Sha256::new();
    for fp in fingerprints {
        hasher.update(fp.as_bytes());
        hasher.update(b"\0");
    }
    hex::encode(hasher.finalize())
}

/// Derives the ordering-preserving fingerprint a producer should use when
/// enqueuing a draft (spec §4.8 "assigned to a partition by
/// `hash(primaryFingerprint)`").
pub fn fingerprint_for(payload: &ChangePayload) -> String {
    payload.fingerprint_seed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;
    use crate::namespace::NamespaceScope;
    use crate::store::MemoryGraphStore;
    use crate::telemetry::Telemetry;
    use chrono::Utc;

    fn stores() -> Stores {
        let store: Arc<dyn crate::store::GraphStore> = Arc::new(MemoryGraphStore::new());
        let scope = NamespaceScope::new("test");
        let telemetry = Telemetry::new();
        Stores {
            entities: EntityStore::new(Arc::clone(&store), scope.clone(), telemetry.clone()),
            relationships: RelationshipStore::new(store, scope, telemetry),
            vectors: None,
        }
    }

    #[tokio::test]
    async fn push_signals_close_at_threshold() {
        let processor = BatchProcessor::new(BatchConfig { entity_batch_size: 2, ..BatchConfig::default() });
        let closed_first =
            processor.push("e1".to_string(), ChangePayload::Entity(Entity::new("e1", EntityType::File, Utc::now()))).await;
        assert!(!closed_first);
        let closed_second =
            processor.push("e2".to_string(), ChangePayload::Entity(Entity::new("e2", EntityType::File, Utc::now()))).await;
        assert!(closed_second);
    }

    #[tokio::test]
    async fn flush_writes_entities_before_relationships() {
        let processor = BatchProcessor::new(BatchConfig::default());
        let stores = stores();
        processor
            .push("e1".to_string(), ChangePayload::Entity(Entity::new("e1", EntityType::File, Utc::now())))
            .await;
        processor
            .push("e2".to_string(), ChangePayload::Entity(Entity::new("e2", EntityType::File, Utc::now())))
            .await;
        processor
            .push(
                "r1".to_string(),
                ChangePayload::Relationship(RelationshipObservation {
                    relationship_type: crate::model::RelationshipType::Contains,
                    from_entity_id: "e1".to_string(),
                    to_entity_id: Some("e2".to_string()),
                    target_ref: None,
                    evidence: vec![],
                    locations: vec![],
                    confidence: 1.0,
                    change_set_id: None,
                }),
            )
            .await;
        let outcome = processor.flush(&stores).await.unwrap();
        assert_eq!(outcome.entities_written, 2);
        assert_eq!(outcome.relationships_written, 1);
        assert!(outcome.failed.is_empty());
    }

    #[tokio::test]
    async fn repeated_flush_of_identical_content_hits_idempotency_cache() {
        let processor = BatchProcessor::new(BatchConfig::default());
        let stores = stores();
        processor
            .push("e1".to_string(), ChangePayload::Entity(Entity::new("e1", EntityType::File, Utc::now())))
            .await;
        let first = processor.flush(&stores).await.unwrap();
        assert_eq!(first.entities_written, 1);

        processor
            .push("e1".to_string(), ChangePayload::Entity(Entity::new("e1", EntityType::File, Utc::now())))
            .await;
        let second = processor.flush(&stores).await.unwrap();
        assert_eq!(second.entities_written, 1);
        assert!(second.failed.is_empty());
    }

    #[test]
    fn flush_order_puts_entity_layer_first() {
        let order = flush_order();
        let entity_pos = order.iter().position(|k| *k == ItemKind::Entity).unwrap();
        let relationship_pos = order.iter().position(|k| *k == ItemKind::Relationship).unwrap();
        let embedding_pos = order.iter().position(|k| *k == ItemKind::Embedding).unwrap();
        assert!(entity_pos < relationship_pos);
        assert!(entity_pos < embedding_pos);
    }
}
