//! Full backup/restore gate: create a backup of a populated graph, preview
//! it against a fresh store, and apply it only once the approval token has
//! been satisfied.

use chrono::Utc;
use graphkit::backup::coordinator::{
    BackupCoordinator, BackupStatus, CreateBackupOpts, RetentionPolicy,
};
use graphkit::backup::provider::ProviderRegistry;
use graphkit::entity_store::EntityStore;
use graphkit::error::Error;
use graphkit::model::{Entity, EntityType, RelationshipType};
use graphkit::namespace::NamespaceScope;
use graphkit::relationship_store::{RelationshipObservation, RelationshipStore};
use graphkit::store::MemoryGraphStore;
use graphkit::telemetry::Telemetry;
use std::sync::Arc;
use tempfile::tempdir;

fn build(require_second_approval: bool, dir: &std::path::Path) -> (BackupCoordinator, EntityStore) {
    let backing: Arc<dyn graphkit::store::GraphStore> = Arc::new(MemoryGraphStore::new());
    let scope = NamespaceScope::new("acme");
    let telemetry = Telemetry::new();
    let entities = EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
    let relationships = RelationshipStore::new(backing, scope, telemetry.clone());
    let providers = ProviderRegistry::new(dir);
    let coordinator = BackupCoordinator::new(
        providers,
        entities.clone(),
        relationships,
        telemetry,
        require_second_approval,
        RetentionPolicy::default(),
    );
    (coordinator, entities)
}

#[tokio::test]
async fn unapproved_restore_is_blocked_then_succeeds_once_approved() {
    let dir = tempdir().expect("test: tempdir");
    let (coordinator, entities) = build(true, dir.path());

    entities.create(Entity::new("handler", EntityType::Function, Utc::now())).await.unwrap();
    entities.create(Entity::new("parse_config", EntityType::Function, Utc::now())).await.unwrap();

    let metadata = coordinator.create_backup(CreateBackupOpts::default()).await.unwrap();
    assert_eq!(metadata.status, BackupStatus::Completed);
    assert!(metadata.checksum.is_some());

    let preview = coordinator.preview_restore(&metadata.backup_id, Some("oncall".to_string())).await.unwrap();
    assert_eq!(preview.status, "dry_run_completed");
    assert!(preview.token.requires_approval);
    assert!(!preview.token.approved);

    let blocked = coordinator.apply_restore(&preview.token.token).await;
    assert!(
        matches!(blocked, Err(Error::RestoreApprovalRequired)),
        "apply must be rejected until a human approves the token"
    );

    coordinator
        .approve_restore(&preview.token.token, "release-manager", Some("verified checksum manually".to_string()))
        .await
        .unwrap();

    let outcome = coordinator.apply_restore(&preview.token.token).await.unwrap();
    assert_eq!(outcome.entities_restored, 2);

    // Tokens are single-use even after a successful apply.
    let reused = coordinator.apply_restore(&preview.token.token).await;
    assert!(matches!(reused, Err(Error::RestoreTokenInvalid(_))));
}

#[tokio::test]
async fn preview_flags_missing_artifacts_and_blocks_apply() {
    let dir = tempdir().expect("test: tempdir");
    let (coordinator, entities) = build(false, dir.path());
    entities.create(Entity::new("f1", EntityType::File, Utc::now())).await.unwrap();
    let metadata = coordinator.create_backup(CreateBackupOpts::default()).await.unwrap();

    // Simulate artifact loss by previewing a backup id whose files were
    // never written under this provider root.
    let bogus_id = format!("{}_missing", metadata.backup_id);
    let result = coordinator.preview_restore(&bogus_id, None).await;
    assert!(result.is_err(), "previewing an unknown backup id must fail outright, not fabricate a preview");
}

#[tokio::test]
async fn relationships_created_before_backup_are_restored_too() {
    let dir = tempdir().expect("test: tempdir");
    let backing: Arc<dyn graphkit::store::GraphStore> = Arc::new(MemoryGraphStore::new());
    let scope = NamespaceScope::new("acme");
    let telemetry = Telemetry::new();
    let entities = EntityStore::new(backing.clone(), scope.clone(), telemetry.clone());
    let relationships = RelationshipStore::new(backing, scope, telemetry.clone());
    let providers = ProviderRegistry::new(dir.path());
    let coordinator = BackupCoordinator::new(
        providers,
        entities.clone(),
        relationships.clone(),
        telemetry,
        false,
        RetentionPolicy::default(),
    );

    entities.create(Entity::new("handler", EntityType::Function, Utc::now())).await.unwrap();
    entities.create(Entity::new("parse_config", EntityType::Function, Utc::now())).await.unwrap();
    relationships
        .upsert(RelationshipObservation {
            relationship_type: RelationshipType::Calls,
            from_entity_id: "handler".to_string(),
            to_entity_id: Some("parse_config".to_string()),
            target_ref: None,
            evidence: vec![],
            locations: vec![],
            confidence: 0.9,
            change_set_id: None,
        })
        .await
        .unwrap();

    let metadata = coordinator.create_backup(CreateBackupOpts::default()).await.unwrap();
    let preview = coordinator.preview_restore(&metadata.backup_id, None).await.unwrap();
    let outcome = coordinator.apply_restore(&preview.token.token).await.unwrap();

    // The second apply_restore creates entities/edges that already exist;
    // `apply_restore` only counts successful creates/upserts, so re-applying
    // onto the same store restores the relationship (an upsert) even though
    // the entity creates above already landed the nodes once.
    assert_eq!(outcome.relationships_restored, 1);
}
