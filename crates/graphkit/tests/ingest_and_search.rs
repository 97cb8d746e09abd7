//! End-to-end ingest-then-search: entities and `CONTAINS` edges land through
//! `EntityStore`/`RelationshipStore`, then `SearchEngine` finds them by name,
//! path prefix, and fuzzy match without a vector backend wired in.

use chrono::Utc;
use graphkit::entity_store::{EntityStore, ListParams};
use graphkit::model::{Entity, EntityType, RelationshipType};
use graphkit::namespace::NamespaceScope;
use graphkit::relationship_store::{RelationshipObservation, RelationshipStore};
use graphkit::search::{SearchEngine, SearchRequest, Strategy};
use graphkit::store::MemoryGraphStore;
use graphkit::telemetry::Telemetry;
use std::sync::Arc;

fn harness() -> (EntityStore, RelationshipStore, SearchEngine) {
    let backing: Arc<dyn graphkit::store::GraphStore> = Arc::new(MemoryGraphStore::new());
    let scope = NamespaceScope::new("acme");
    let telemetry = Telemetry::new();
    let entities = EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
    let relationships = RelationshipStore::new(backing, scope, telemetry);
    let search = SearchEngine::new(entities.clone(), None);
    (entities, relationships, search)
}

#[tokio::test]
async fn walking_a_tree_into_entities_is_searchable_by_name_and_path() {
    let (entities, relationships, search) = harness();

    let mut root = Entity::new("dir_src", EntityType::Directory, Utc::now());
    root.path = Some("src".to_string());
    root.name = Some("src".to_string());
    entities.create(root).await.unwrap();

    let mut file = Entity::new("file_lib_rs", EntityType::File, Utc::now());
    file.path = Some("src/lib.rs".to_string());
    file.name = Some("lib.rs".to_string());
    entities.create(file).await.unwrap();

    let mut function = Entity::new("fn_parse_config", EntityType::Function, Utc::now());
    function.path = Some("src/lib.rs".to_string());
    function.name = Some("parseConfig".to_string());
    entities.create(function).await.unwrap();

    relationships
        .upsert(RelationshipObservation {
            relationship_type: RelationshipType::Contains,
            from_entity_id: "dir_src".to_string(),
            to_entity_id: Some("file_lib_rs".to_string()),
            target_ref: None,
            evidence: vec![],
            locations: vec![],
            confidence: 1.0,
            change_set_id: None,
        })
        .await
        .unwrap();
    relationships
        .upsert(RelationshipObservation {
            relationship_type: RelationshipType::Defines,
            from_entity_id: "file_lib_rs".to_string(),
            to_entity_id: Some("fn_parse_config".to_string()),
            target_ref: None,
            evidence: vec![],
            locations: vec![],
            confidence: 1.0,
            change_set_id: None,
        })
        .await
        .unwrap();

    // Path-like query routes to structural search and matches by path prefix.
    let by_path = search
        .search(SearchRequest {
            query: "src/lib.rs".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(by_path.iter().any(|hit| hit.entity_id == "acme:file_lib_rs"));

    // Exact-name structural match.
    let by_name = search
        .search(SearchRequest {
            query: "parseConfig".to_string(),
            strategy: Some(Strategy::Structural),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(by_name.len(), 1);
    assert_eq!(by_name[0].entity_id, "acme:fn_parse_config");

    // Fuzzy match tolerates a typo.
    let fuzzy = search
        .search(SearchRequest {
            query: "parsConfig".to_string(),
            strategy: Some(Strategy::Structural),
            fuzzy: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert!(fuzzy.iter().any(|hit| hit.entity_id == "acme:fn_parse_config"));

    let listing = entities.list(ListParams::default()).await.unwrap();
    assert_eq!(listing.total, 3);
}
