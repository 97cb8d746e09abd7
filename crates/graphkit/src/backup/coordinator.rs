//! Snapshot creation and two-phase token-gated restore (C9, spec §4.9).
//!
//! The approval gate is grounded on the teacher's `ApprovalRequest`/`RiskLevel`
//! (`dashflow/src/approval.rs`): a restore preview issues a time-boxed token
//! the caller must present to `apply`, optionally after a human approves it
//! out of band, mirroring that crate's human-in-the-loop pattern without
//! pulling in its graph-execution machinery.

use crate::backup::provider::ProviderRegistry;
use crate::entity_store::{EntityStore, ListParams};
use crate::error::{Error, Result};
use crate::events::{kind, Event, Level};
use crate::relationship_store::{RelationshipListParams, RelationshipStore};
use crate::telemetry::Telemetry;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::instrument;

/// `full` captures every entity/relationship; `incremental` is reserved for
/// a future change-set-scoped dump (spec §4.9 names both but does not
/// specify incremental's selection rule beyond "changed since last backup").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Full,
    Incremental,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Completed,
    Failed,
}

/// Options for [`BackupCoordinator::create_backup`].
#[derive(Debug, Clone)]
pub struct CreateBackupOpts {
    pub backup_type: BackupType,
    pub include_data: bool,
    pub include_config: bool,
    pub storage_provider_id: Option<String>,
    pub labels: HashMap<String, String>,
}

impl Default for CreateBackupOpts {
    fn default() -> Self {
        Self {
            backup_type: BackupType::Full,
            include_data: true,
            include_config: false,
            storage_provider_id: None,
            labels: HashMap::new(),
        }
    }
}

/// Persisted record of one backup (spec §4.9 step 7: "durable metadata
/// table; fallback legacy `<backupId>_metadata.json`").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub backup_id: String,
    pub status: BackupStatus,
    pub backup_type: BackupType,
    pub includes_data: bool,
    pub includes_config: bool,
    pub checksum: Option<String>,
    pub size: u64,
    pub labels: HashMap<String, String>,
    pub provider_id: String,
    pub created_at: DateTime<Utc>,
    pub error: Option<String>,
}

/// Outcome of validating one artifact during restore preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Valid,
    Warning,
    Invalid,
    Missing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentValidation {
    pub component: String,
    pub status: ValidationStatus,
    pub detail: Option<String>,
}

/// Result of an (optional) integrity recheck during preview or apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityCheck {
    pub checksum_matches: bool,
    pub missing_files: Vec<String>,
}

/// Single-use, TTL-bound authorization to run phase 2 of a restore
/// (spec §4.9 "Restore — two-phase with approval token").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreToken {
    pub token: String,
    pub backup_id: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub requested_by: Option<String>,
    pub requires_approval: bool,
    pub approved: bool,
    pub can_proceed: bool,
    consumed: bool,
}

/// Response returned by [`BackupCoordinator::preview_restore`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestorePreview {
    pub status: &'static str,
    pub changes: Vec<ComponentValidation>,
    pub integrity_check: Option<IntegrityCheck>,
    pub token: RestoreToken,
}

/// Per-policy retention rule (spec §4.9 "Retention").
#[derive(Debug, Clone, Default)]
pub struct RetentionPolicy {
    pub max_age_days: Option<i64>,
    pub max_entries: Option<usize>,
    pub max_total_size_bytes: Option<u64>,
    pub delete_artifacts: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub entities_restored: usize,
    pub relationships_restored: usize,
}

/// Snapshot/restore orchestration for the entity and relationship graph
/// (spec §4.9). Vector and tabular-store artifacts are delegated to the
/// respective `VectorStore`/tabular backend a deployment wires in; this
/// coordinator always handles the graph component itself.
pub struct BackupCoordinator {
    providers: ProviderRegistry,
    entities: EntityStore,
    relationships: RelationshipStore,
    telemetry: Telemetry,
    metadata: Mutex<HashMap<String, BackupMetadata>>,
    tokens: Mutex<HashMap<String, RestoreToken>>,
    token_ttl: ChronoDuration,
    require_second_approval: bool,
    retention: RetentionPolicy,
}

impl BackupCoordinator {
    pub fn new(
        providers: ProviderRegistry,
        entities: EntityStore,
        relationships: RelationshipStore,
        telemetry: Telemetry,
        require_second_approval: bool,
        retention: RetentionPolicy,
    ) -> Self {
        Self {
            providers,
            entities,
            relationships,
            telemetry,
            metadata: Mutex::new(HashMap::new()),
            tokens: Mutex::new(HashMap::new()),
            token_ttl: ChronoDuration::minutes(15),
            require_second_approval,
            retention,
        }
    }

    #[instrument(skip(self, opts))]
    pub async fn create_backup(&self, opts: CreateBackupOpts) -> Result<BackupMetadata> {
        let backup_id = format!("backup_{}", Utc::now().timestamp_millis());
        let provider_id = opts.storage_provider_id.clone().unwrap_or_else(|| crate::backup::provider::LOCAL_PROVIDER_ID.to_string());
        let provider = self.providers.get(&provider_id)?;
        provider
            .ensure_ready()
            .await
            .map_err(|e| e.into_maintenance("backup", "prepare"))?;

        let result = self.write_artifacts(&backup_id, &opts, provider.as_ref()).await;
        let metadata = match result {
            Ok((size, checksum)) => BackupMetadata {
                backup_id: backup_id.clone(),
                status: BackupStatus::Completed,
                backup_type: opts.backup_type,
                includes_data: opts.include_data,
                includes_config: opts.include_config,
                checksum: Some(checksum),
                size,
                labels: opts.labels.clone(),
                provider_id: provider_id.clone(),
                created_at: Utc::now(),
                error: None,
            },
            Err(error) => {
                let metadata = BackupMetadata {
                    backup_id: backup_id.clone(),
                    status: BackupStatus::Failed,
                    backup_type: opts.backup_type,
                    includes_data: opts.include_data,
                    includes_config: opts.include_config,
                    checksum: None,
                    size: 0,
                    labels: opts.labels.clone(),
                    provider_id: provider_id.clone(),
                    created_at: Utc::now(),
                    error: Some(error.to_string()),
                };
                self.metadata.lock().await.insert(backup_id.clone(), metadata);
                self.telemetry
                    .events()
                    .publish(Event::new(kind::PIPELINE_ERROR, Level::Error, error.to_string()));
                return Err(error.into_maintenance("backup", "write_artifacts"));
            }
        };

        self.metadata.lock().await.insert(backup_id.clone(), metadata.clone());

        // Legacy fallback mirror of the metadata row. Best-effort: a
        // failure here does not fail the backup, since the tabular
        // metadata table above is authoritative.
        if let Ok(legacy) = serde_json::to_vec_pretty(&metadata) {
            let _ = provider.write_file(&format!("{backup_id}/{backup_id}_metadata.json"), &legacy).await;
        }

        self.enforce_retention().await;
        Ok(metadata)
    }

    async fn write_artifacts(
        &self,
        backup_id: &str,
        opts: &CreateBackupOpts,
        provider: &dyn crate::backup::provider::StorageProvider,
    ) -> Result<(u64, String)> {
        let mut artifact_names = Vec::new();

        if opts.include_data {
            let entities = self.entities.list(ListParams { limit: 0, ..Default::default() }).await?;
            let entities_json = serde_json::to_vec_pretty(&entities.items)
                .map_err(|e| Error::Malformed(format!("failed to serialize entities: {e}")))?;
            let entities_path = format!("{backup_id}/graph/entities.json");
            provider.write_file(&entities_path, &entities_json).await?;
            artifact_names.push(entities_path);

            let relationships = self.relationships.list(RelationshipListParams { limit: 0, ..Default::default() }).await?;
            let relationships_json = serde_json::to_vec_pretty(&relationships)
                .map_err(|e| Error::Malformed(format!("failed to serialize relationships: {e}")))?;
            let relationships_path = format!("{backup_id}/graph/relationships.json");
            provider.write_file(&relationships_path, &relationships_json).await?;
            artifact_names.push(relationships_path);
        }

        if opts.include_config {
            let redacted = serde_json::json!({ "note": "config artifact is a redacted placeholder" });
            let config_path = format!("{backup_id}/config.json");
            provider
                .write_file(&config_path, redacted.to_string().as_bytes())
                .await?;
            artifact_names.push(config_path);
        }

        artifact_names.sort();
        let mut total_size = 0u64;
        let mut hasher = Sha256::new();
        for name in &artifact_names {
            let bytes = provider.read_file(name).await?;
            total_size += bytes.len() as u64;
            hasher.update(&bytes);
        }
        Ok((total_size, hex::encode(hasher.finalize())))
    }

    #[instrument(skip(self))]
    pub async fn preview_restore(&self, backup_id: &str, requested_by: Option<String>) -> Result<RestorePreview> {
        let metadata = self
            .metadata
            .lock()
            .await
            .get(backup_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("backup {backup_id}")))?;

        let provider = self.providers.get(&metadata.provider_id)?;
        let mut changes = Vec::new();
        let mut missing_files = Vec::new();
        let entities_path = format!("{backup_id}/graph/entities.json");
        let relationships_path = format!("{backup_id}/graph/relationships.json");
        for (component, path) in [("entities", &entities_path), ("relationships", &relationships_path)] {
            if provider.exists(path).await.unwrap_or(false) {
                changes.push(ComponentValidation {
                    component: component.to_string(),
                    status: ValidationStatus::Valid,
                    detail: None,
                });
            } else {
                missing_files.push(path.clone());
                changes.push(ComponentValidation {
                    component: component.to_string(),
                    status: ValidationStatus::Missing,
                    detail: Some("artifact not found".to_string()),
                });
            }
        }

        let integrity_check = if let Some(expected) = &metadata.checksum {
            let mut hasher = Sha256::new();
            let mut ok = true;
            for path in [&entities_path, &relationships_path] {
                match provider.read_file(path).await {
                    Ok(bytes) => hasher.update(&bytes),
                    Err(_) => ok = false,
                }
            }
            let actual = hex::encode(hasher.finalize());
            Some(IntegrityCheck { checksum_matches: ok && &actual == expected, missing_files: missing_files.clone() })
        } else {
            None
        };

        let can_proceed = missing_files.is_empty();
        let now = Utc::now();
        let token = RestoreToken {
            token: uuid::Uuid::new_v4().to_string(),
            backup_id: backup_id.to_string(),
            issued_at: now,
            expires_at: now + self.token_ttl,
            requested_by,
            requires_approval: self.require_second_approval,
            approved: false,
            can_proceed,
            consumed: false,
        };
        self.tokens.lock().await.insert(token.token.clone(), token.clone());

        Ok(RestorePreview {
            status: if can_proceed { "dry_run_completed" } else { "failed" },
            changes,
            integrity_check,
            token,
        })
    }

    #[instrument(skip(self, reason))]
    pub async fn approve_restore(&self, token: &str, approved_by: &str, reason: Option<String>) -> Result<()> {
        let mut tokens = self.tokens.lock().await;
        let entry = tokens.get_mut(token).ok_or_else(|| Error::RestoreTokenInvalid(token.to_string()))?;
        if Utc::now() > entry.expires_at {
            return Err(Error::RestoreTokenExpired(entry.expires_at));
        }
        entry.approved = true;
        self.telemetry.emit(Event::new(
            "backup",
            Level::Info,
            format!("restore of {} approved by {approved_by}: {}", entry.backup_id, reason.unwrap_or_default()),
        ));
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn apply_restore(&self, token: &str) -> Result<RestoreOutcome> {
        let mut tokens = self.tokens.lock().await;
        let entry = tokens.get_mut(token).ok_or_else(|| Error::RestoreTokenInvalid(token.to_string()))?;
        if entry.consumed {
            return Err(Error::RestoreTokenInvalid(format!("{token} already consumed")));
        }
        if Utc::now() > entry.expires_at {
            return Err(Error::RestoreTokenExpired(entry.expires_at));
        }
        if !entry.can_proceed {
            return Err(Error::RestoreValidationFailed(entry.backup_id.clone()));
        }
        if entry.requires_approval && !entry.approved {
            return Err(Error::RestoreApprovalRequired);
        }
        let backup_id = entry.backup_id.clone();
        entry.consumed = true;
        drop(tokens);

        let metadata = self
            .metadata
            .lock()
            .await
            .get(&backup_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("backup {backup_id}")))?;
        let provider = self.providers.get(&metadata.provider_id)?;

        let entities_bytes = provider.read_file(&format!("{backup_id}/graph/entities.json")).await?;
        let entities: Vec<crate::model::Entity> = serde_json::from_slice(&entities_bytes)
            .map_err(|e| Error::Malformed(format!("corrupt entity dump: {e}")))?;
        let relationships_bytes = provider.read_file(&format!("{backup_id}/graph/relationships.json")).await?;
        let relationships: Vec<crate::model::Relationship> = serde_json::from_slice(&relationships_bytes)
            .map_err(|e| Error::Malformed(format!("corrupt relationship dump: {e}")))?;

        let mut entities_restored = 0;
        for entity in entities {
            if self.entities.create(entity).await.is_ok() {
                entities_restored += 1;
            }
        }
        let mut relationships_restored = 0;
        for relationship in relationships {
            let observation = crate::relationship_store::RelationshipObservation {
                relationship_type: relationship.relationship_type,
                from_entity_id: relationship.from_entity_id,
                to_entity_id: relationship.to_entity_id,
                target_ref: relationship.target_ref,
                evidence: relationship.evidence,
                locations: relationship.locations,
                confidence: relationship.confidence,
                change_set_id: relationship.change_set_id,
            };
            if self.relationships.upsert(observation).await.is_ok() {
                relationships_restored += 1;
            }
        }

        self.telemetry
            .events()
            .publish(Event::new(kind::BATCH_COMPLETED, Level::Info, format!("restore of {backup_id} applied")));
        Ok(RestoreOutcome { entities_restored, relationships_restored })
    }

    /// Evaluate the retention policy against every stored backup, deleting
    /// artifacts (when `delete_artifacts`) and metadata for those that no
    /// longer satisfy it (spec §4.9 "Retention").
    pub async fn enforce_retention(&self) {
        let mut metadata = self.metadata.lock().await;
        let mut entries: Vec<BackupMetadata> = metadata.values().cloned().collect();
        entries.sort_by_key(|m| m.created_at);

        let mut to_delete = Vec::new();
        if let Some(max_age) = self.retention.max_age_days {
            let cutoff = Utc::now() - ChronoDuration::days(max_age);
            to_delete.extend(entries.iter().filter(|m| m.created_at < cutoff).map(|m| m.backup_id.clone()));
        }
        if let Some(max_entries) = self.retention.max_entries {
            if entries.len() > max_entries {
                let overflow = entries.len() - max_entries;
                to_delete.extend(entries.iter().take(overflow).map(|m| m.backup_id.clone()));
            }
        }
        if let Some(max_total) = self.retention.max_total_size_bytes {
            let mut running_total: u64 = entries.iter().map(|m| m.size).sum();
            for entry in &entries {
                if running_total <= max_total {
                    break;
                }
                to_delete.push(entry.backup_id.clone());
                running_total = running_total.saturating_sub(entry.size);
            }
        }

        for backup_id in to_delete.into_iter().collect::<std::collections::HashSet<_>>() {
            if self.retention.delete_artifacts {
                if let Some(meta) = metadata.get(&backup_id) {
                    if let Ok(provider) = self.providers.get(&meta.provider_id) {
                        if let Ok(files) = provider.list(Some(&backup_id)).await {
                            for file in files {
                                let _ = provider.remove_file(&file).await;
                            }
                        }
                    }
                }
            }
            metadata.remove(&backup_id);
        }
    }

    pub async fn get_metadata(&self, backup_id: &str) -> Option<BackupMetadata> {
        self.metadata.lock().await.get(backup_id).cloned()
    }

    pub async fn list_backups(&self) -> Vec<BackupMetadata> {
        let mut entries: Vec<BackupMetadata> = self.metadata.lock().await.values().cloned().collect();
        entries.sort_by_key(|m| m.created_at);
        entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Entity, EntityType};
    use crate::namespace::NamespaceScope;
    use crate::relationship_store::RelationshipObservation;
    use crate::store::MemoryGraphStore;
    use std::sync::Arc;
    use tempfile::tempdir;

    async fn setup() -> (BackupCoordinator, EntityStore) {
        let store: Arc<dyn crate::store::GraphStore> = Arc::new(MemoryGraphStore::new());
        let scope = NamespaceScope::new("test");
        let telemetry = Telemetry::new();
        let entities = EntityStore::new(Arc::clone(&store), scope.clone(), telemetry.clone());
        let relationships = RelationshipStore::new(store, scope, telemetry.clone());
        let dir = tempdir().unwrap();
        let providers = ProviderRegistry::new(dir.path());
        let coordinator = BackupCoordinator::new(
            providers,
            entities.clone(),
            relationships,
            telemetry,
            false,
            RetentionPolicy::default(),
        );
        (coordinator, entities)
    }

    #[tokio::test]
    async fn backup_then_preview_then_apply_roundtrips_entities() {
        let (coordinator, entities) = setup().await;
        entities.create(Entity::new("f1", EntityType::File, Utc::now())).await.unwrap();
        let metadata = coordinator.create_backup(CreateBackupOpts::default()).await.unwrap();
        assert_eq!(metadata.status, BackupStatus::Completed);

        let preview = coordinator.preview_restore(&metadata.backup_id, None).await.unwrap();
        assert_eq!(preview.status, "dry_run_completed");

        let outcome = coordinator.apply_restore(&preview.token.token).await.unwrap();
        assert_eq!(outcome.entities_restored, 1);
    }

    #[tokio::test]
    async fn apply_without_token_preview_is_rejected() {
        let (coordinator, _entities) = setup().await;
        let err = coordinator.apply_restore("nonexistent").await;
        assert!(matches!(err, Err(Error::RestoreTokenInvalid(_))));
    }

    #[tokio::test]
    async fn token_is_single_use() {
        let (coordinator, entities) = setup().await;
        entities.create(Entity::new("f1", EntityType::File, Utc::now())).await.unwrap();
        let metadata = coordinator.create_backup(CreateBackupOpts::default()).await.unwrap();
        let preview = coordinator.preview_restore(&metadata.backup_id, None).await.unwrap();
        coordinator.apply_restore(&preview.token.token).await.unwrap();
        let second = coordinator.apply_restore(&preview.token.token).await;
        assert!(matches!(second, Err(Error::RestoreTokenInvalid(_))));
    }

    #[tokio::test]
    async fn approval_required_gate_blocks_unapproved_apply() {
        let store: Arc<dyn crate::store::GraphStore> = Arc::new(MemoryGraphStore::new());
        let scope = NamespaceScope::new("test");
        let telemetry = Telemetry::new();
        let entities = EntityStore::new(Arc::clone(&store), scope.clone(), telemetry.clone());
        let relationships = RelationshipStore::new(store, scope, telemetry.clone());
        let dir = tempdir().unwrap();
        let providers = ProviderRegistry::new(dir.path());
        let coordinator =
            BackupCoordinator::new(providers, entities.clone(), relationships, telemetry, true, RetentionPolicy::default());
        entities.create(Entity::new("f1", EntityType::File, Utc::now())).await.unwrap();
        let metadata = coordinator.create_backup(CreateBackupOpts::default()).await.unwrap();
        let preview = coordinator.preview_restore(&metadata.backup_id, None).await.unwrap();
        let err = coordinator.apply_restore(&preview.token.token).await;
        assert!(matches!(err, Err(Error::RestoreApprovalRequired)));
        coordinator.approve_restore(&preview.token.token, "alice", None).await.unwrap();
        assert!(coordinator.apply_restore(&preview.token.token).await.is_ok());
    }

    #[tokio::test]
    async fn retention_by_max_entries_drops_oldest() {
        let (coordinator, entities) = setup().await;
        entities.create(Entity::new("f1", EntityType::File, Utc::now())).await.unwrap();
        for _ in 0..3 {
            coordinator.create_backup(CreateBackupOpts::default()).await.unwrap();
        }
        {
            let mut metadata = coordinator.metadata.lock().await;
            let mut t = Utc::now();
            let mut ids: Vec<String> = metadata.keys().cloned().collect();
            ids.sort();
            for id in ids {
                if let Some(entry) = metadata.get_mut(&id) {
                    entry.created_at = t;
                    t += ChronoDuration::seconds(1);
                }
            }
        }
        let mut coordinator = coordinator;
        coordinator.retention = RetentionPolicy { max_entries: Some(1), ..RetentionPolicy::default() };
        coordinator.enforce_retention().await;
        assert_eq!(coordinator.list_backups().await.len(), 1);
    }
}
