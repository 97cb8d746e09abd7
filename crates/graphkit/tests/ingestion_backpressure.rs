//! `IngestionPipeline::submit` surfaces partition backpressure instead of
//! blocking the caller once a partition's bounded queue is full.

use chrono::Utc;
use graphkit::entity_store::EntityStore;
use graphkit::error::Error;
use graphkit::ingestion::{ChangePayload, IngestionConfig, IngestionPipeline, QueueConfig, Stores};
use graphkit::model::{Entity, EntityType};
use graphkit::namespace::NamespaceScope;
use graphkit::relationship_store::RelationshipStore;
use graphkit::store::MemoryGraphStore;
use graphkit::telemetry::Telemetry;
use std::sync::Arc;

fn harness(config: IngestionConfig) -> Arc<IngestionPipeline> {
    let backing: Arc<dyn graphkit::store::GraphStore> = Arc::new(MemoryGraphStore::new());
    let scope = NamespaceScope::new("acme");
    let telemetry = Telemetry::new();
    let entities = EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
    let relationships = RelationshipStore::new(backing, scope, telemetry.clone());
    let stores = Stores { entities, relationships, vectors: None };
    let (pipeline, _receivers) = IngestionPipeline::new(config, stores, telemetry);
    pipeline
}

fn small_queue(queue: QueueConfig) -> IngestionConfig {
    IngestionConfig { queue, ..IngestionConfig::default() }
}

fn entity_payload(id: &str) -> ChangePayload {
    ChangePayload::Entity(Entity::new(id, EntityType::File, Utc::now()))
}

#[test]
fn submit_past_partition_capacity_returns_queue_overflow() {
    // Single partition, depth 1: the second submit must overflow since
    // nothing drains the queue without spawning `pipeline.run(...)`.
    let pipeline = harness(small_queue(QueueConfig { partitions: 1, max_depth: 1, high_water: 1, low_water: 0 }));

    pipeline.submit(None, entity_payload("a")).expect("first submit fits under capacity");
    let second = pipeline.submit(None, entity_payload("b"));
    assert!(
        matches!(second, Err(Error::QueueOverflow { partition: 0, .. })),
        "a full partition must fail fast rather than block the caller"
    );
}

#[test]
fn file_filters_silently_drop_rejected_paths_before_they_reach_the_queue() {
    let mut config = small_queue(QueueConfig { partitions: 1, max_depth: 1, high_water: 1, low_water: 0 });
    config.file_filters = graphkit::ingestion::FileFilters {
        accept: vec![],
        reject: vec!["**/target/**".to_string()],
    };
    let pipeline = harness(config);

    // A rejected path never touches the queue, so the single slot of
    // capacity is still free for the submit that follows it.
    pipeline
        .submit(Some("target/debug/build.rs"), entity_payload("rejected"))
        .expect("rejected path is dropped, not enqueued");
    pipeline
        .submit(Some("src/lib.rs"), entity_payload("lib"))
        .expect("accepted path still fits in the untouched single slot");
    let overflow = pipeline.submit(Some("src/other.rs"), entity_payload("other"));
    assert!(matches!(overflow, Err(Error::QueueOverflow { .. })));
}

#[test]
fn partition_depths_reflect_unconsumed_submissions() {
    let pipeline = harness(small_queue(QueueConfig { partitions: 2, max_depth: 10, high_water: 8, low_water: 2 }));
    for i in 0..5 {
        pipeline.submit(None, entity_payload(&format!("e{i}"))).unwrap();
    }
    let total_depth: usize = pipeline.partition_depths().iter().sum();
    assert_eq!(total_depth, 5, "every submitted change sits in some partition until a worker drains it");
}
