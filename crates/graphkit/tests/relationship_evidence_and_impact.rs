//! Repeated observations of the same edge merge evidence/confidence instead
//! of creating duplicates, and the merged graph is what impact analysis
//! walks for its blast-radius report.

use chrono::Utc;
use graphkit::analysis::{AnalysisEngine, Severity};
use graphkit::entity_store::EntityStore;
use graphkit::model::{Entity, EntityType, Evidence, RelationshipType};
use graphkit::namespace::NamespaceScope;
use graphkit::relationship_store::{RelationshipListParams, RelationshipObservation, RelationshipStore};
use graphkit::store::GraphStore;
use graphkit::store::MemoryGraphStore;
use graphkit::telemetry::Telemetry;
use std::sync::Arc;

fn observation(from: &str, to: &str, fingerprint: &str, confidence: f64) -> RelationshipObservation {
    RelationshipObservation {
        relationship_type: RelationshipType::Calls,
        from_entity_id: from.to_string(),
        to_entity_id: Some(to.to_string()),
        target_ref: None,
        evidence: vec![Evidence {
            fingerprint: fingerprint.to_string(),
            note: Some(format!("call site {fingerprint}")),
            observed_at: Utc::now(),
        }],
        locations: vec![],
        confidence,
        change_set_id: None,
    }
}

#[tokio::test]
async fn repeated_observations_merge_into_one_edge_with_union_evidence() {
    let backing: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    let scope = NamespaceScope::new("acme");
    let telemetry = Telemetry::new();
    let entities = EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
    let relationships = RelationshipStore::new(backing.clone(), scope.clone(), telemetry);

    entities.create(Entity::new("handler", EntityType::Function, Utc::now())).await.unwrap();
    entities.create(Entity::new("parse_config", EntityType::Function, Utc::now())).await.unwrap();

    relationships.upsert(observation("handler", "parse_config", "call_a", 0.6)).await.unwrap();
    relationships.upsert(observation("handler", "parse_config", "call_b", 0.95)).await.unwrap();
    let merged = relationships.upsert(observation("handler", "parse_config", "call_a", 0.7)).await.unwrap();

    // call_a re-observed, so occurrences_total counts 3 submissions but
    // evidence dedups down to 2 distinct fingerprints.
    assert_eq!(merged.occurrences_total, 3);
    assert_eq!(merged.evidence.len(), 2);
    assert_eq!(merged.confidence, 0.95);

    let all = relationships.list(RelationshipListParams::default()).await.unwrap();
    assert_eq!(all.len(), 1, "parallel observations of the same edge must not duplicate rows");
}

#[tokio::test]
async fn impact_report_escalates_severity_with_fan_out() {
    // analyze_impact walks outgoing dependent-edges from the root (same
    // direction the root's own BFS unit test exercises), so the root is
    // the caller and the affected set sits downstream of it.
    let backing: Arc<dyn GraphStore> = Arc::new(MemoryGraphStore::new());
    let scope = NamespaceScope::new("acme");
    let telemetry = Telemetry::new();
    let entities = EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
    let relationships = RelationshipStore::new(backing.clone(), scope.clone(), telemetry);

    entities.create(Entity::new("dispatcher", EntityType::Function, Utc::now())).await.unwrap();
    for i in 0..12 {
        let callee = format!("handler_{i}");
        entities.create(Entity::new(callee.clone(), EntityType::Function, Utc::now())).await.unwrap();
        relationships
            .upsert(observation("dispatcher", &callee, &format!("fp{i}"), 0.9))
            .await
            .unwrap();
    }

    let analysis = AnalysisEngine::new(backing, relationships, scope);
    let report = analysis.analyze_impact("dispatcher", 3, None).await.unwrap();

    assert_eq!(report.by_distance.get(&1).map(|v| v.len()), Some(12));
    assert_eq!(report.severity, Some(Severity::High));
}
