//! Entity CRUD, bulk upsert, and listing (C3, spec §4.3).

use crate::error::{Error, Result};
use crate::events::{kind, Event, Level};
use crate::model::{Entity, EntityType};
use crate::namespace::NamespaceScope;
use crate::store::{from_value_map, to_value_map, GraphOp, GraphRecord, GraphStore, QueryOpts, Value};
use crate::telemetry::Telemetry;
use chrono::{Duration, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::instrument;

/// Filter/paging parameters for [`EntityStore::list`] (spec §4.3).
#[derive(Debug, Clone, Default)]
pub struct ListParams {
    pub entity_type: Option<EntityType>,
    pub path_prefix: Option<String>,
    pub name_contains: Option<String>,
    pub limit: usize,
    pub offset: usize,
    pub order_by: Option<String>,
    pub order_desc: bool,
}

/// Paged listing result; `total` is computed in the same logical pass as
/// `items` (spec §4.3: "total is computed in the same logical transaction").
#[derive(Debug, Clone)]
pub struct ListResult {
    pub items: Vec<Entity>,
    pub total: usize,
}

/// Options controlling [`EntityStore::bulk_create`] conflict handling.
#[derive(Debug, Clone, Copy, Default)]
pub struct BulkCreateOpts {
    pub skip_existing: bool,
    pub update_existing: bool,
}

/// Outcome of a bulk create (spec §4.3: "failure of the whole batch returns
/// `{0,0,len}` and is reported, never silently partial").
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct BulkCreateResult {
    pub created: usize,
    pub updated: usize,
    pub failed: usize,
}

/// Aggregate entity statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct EntityStats {
    pub total: usize,
    pub by_type: BTreeMap<String, usize>,
    pub recently_modified_7d: usize,
}

/// Entity CRUD, bulk upsert, type-indexed listing, property normalization (C3).
#[derive(Clone)]
pub struct EntityStore {
    store: Arc<dyn GraphStore>,
    scope: NamespaceScope,
    telemetry: Telemetry,
}

impl EntityStore {
    pub fn new(store: Arc<dyn GraphStore>, scope: NamespaceScope, telemetry: Telemetry) -> Self {
        Self { store, scope, telemetry }
    }

    #[instrument(skip(self, entity))]
    pub async fn create(&self, mut entity: Entity) -> Result<Entity> {
        entity.id = self.scope.require_entity_id(entity.id);
        let properties = to_value_map(&entity)?;
        let rows = self
            .store
            .run(
                GraphOp::MergeNode {
                    id: entity.id.clone(),
                    labels: vec![entity.entity_type.label().to_string()],
                    properties,
                },
                QueryOpts::default(),
            )
            .await?;
        let stored = entity_from_row(&rows)?;
        self.telemetry.emit(
            Event::new("entity_store", Level::Info, "entity created")
                .with_data(serde_json::json!({ "id": stored.id })),
        );
        self.telemetry
            .events()
            .publish(Event::new(kind::ENTITY_CREATED, Level::Info, stored.id.clone()));
        Ok(stored)
    }

    #[instrument(skip(self, patch))]
    pub async fn update(&self, id: &str, patch: BTreeMap<String, Value>) -> Result<Entity> {
        let id = self.scope.require_entity_id(id);
        if patch.contains_key("id") {
            return Err(Error::Validation("id is immutable".to_string()));
        }
        let existing = self.get(&id).await?.ok_or_else(|| Error::NotFound(id.clone()))?;
        let mut merged = to_value_map(&existing)?;
        for (k, v) in patch {
            merged.insert(k, v);
        }
        merged.insert("lastModified".to_string(), Value::Timestamp(Utc::now()));
        let rows = self
            .store
            .run(
                GraphOp::UpdateNode {
                    id: id.clone(),
                    patch: merged,
                },
                QueryOpts::default(),
            )
            .await?;
        let stored = entity_from_row(&rows)?;
        self.telemetry
            .events()
            .publish(Event::new(kind::ENTITY_UPDATED, Level::Info, stored.id.clone()));
        Ok(stored)
    }

    pub async fn get(&self, id: &str) -> Result<Option<Entity>> {
        let id = self.scope.require_entity_id(id);
        let rows = self
            .store
            .run(GraphOp::GetNode { id }, QueryOpts::default())
            .await?;
        if rows.is_empty() {
            Ok(None)
        } else {
            Ok(Some(entity_from_row(&rows)?))
        }
    }

    /// Deletes the entity; the store's `DeleteNode` detaches every incident
    /// edge (spec §3: "deletion detaches all incident relationships").
    pub async fn delete(&self, id: &str) -> Result<()> {
        let id = self.scope.require_entity_id(id);
        self.store
            .run(GraphOp::DeleteNode { id }, QueryOpts::default())
            .await?;
        Ok(())
    }

    pub async fn list(&self, params: ListParams) -> Result<ListResult> {
        let label = params.entity_type.map(|t| t.label().to_string());
        let limit = if params.limit == 0 { usize::MAX } else { params.limit };
        let rows = self
            .store
            .run(
                GraphOp::ListNodes {
                    label: label.clone(),
                    path_prefix: params.path_prefix.clone(),
                    name_contains: params.name_contains.clone(),
                    limit,
                    offset: params.offset,
                    order_by: params.order_by.clone(),
                    order_desc: params.order_desc,
                },
                QueryOpts::default(),
            )
            .await?;
        let mut items = Vec::with_capacity(rows.len());
        for row in &rows {
            items.push(entity_from_row(std::slice::from_ref(row))?);
        }
        // `total` is the full matching count, not `offset + page_len`
        // (spec §4.3: computed in the same logical transaction as the page).
        let count_rows = self
            .store
            .run(
                GraphOp::CountNodes {
                    label,
                    path_prefix: params.path_prefix.clone(),
                    name_contains: params.name_contains.clone(),
                },
                QueryOpts::default(),
            )
            .await?;
        let total = match count_rows.first().and_then(|row| row.get("count")) {
            Some(GraphRecord::Scalar(Value::Int(n))) => *n as usize,
            _ => return Err(Error::Malformed("CountNodes returned no count".to_string())),
        };
        Ok(ListResult { items, total })
    }

    /// Bulk upsert; never partially applies a failing batch (spec §4.3).
    pub async fn bulk_create(
        &self,
        entities: Vec<Entity>,
        opts: BulkCreateOpts,
    ) -> Result<BulkCreateResult> {
        let len = entities.len();
        let mut ops = Vec::with_capacity(len);
        for mut entity in entities {
            entity.id = self.scope.require_entity_id(entity.id);
            if opts.skip_existing && self.get(&entity.id).await?.is_some() {
                continue;
            }
            if !opts.update_existing && !opts.skip_existing {
                if self.get(&entity.id).await?.is_some() {
                    return Ok(BulkCreateResult { created: 0, updated: 0, failed: len });
                }
            }
            let properties = to_value_map(&entity).map_err(|_| {
                Error::Malformed(format!("entity {} failed to serialize", entity.id))
            })?;
            ops.push((
                entity.id.clone(),
                GraphOp::MergeNode {
                    id: entity.id,
                    labels: vec![entity.entity_type.label().to_string()],
                    properties,
                },
            ));
        }

        let existed_before: Vec<bool> = {
            let mut flags = Vec::with_capacity(ops.len());
            for (id, _) in &ops {
                flags.push(self.get(id).await?.is_some());
            }
            flags
        };

        match self
            .store
            .run_tx(ops.iter().map(|(_, op)| op.clone()).collect(), QueryOpts::default())
            .await
        {
            Ok(_) => {
                let updated = existed_before.iter().filter(|existed| **existed).count();
                let created = ops.len() - updated;
                self.telemetry.emit(Event::new(
                    "entity_store",
                    Level::Info,
                    format!("bulk_create created={created} updated={updated}"),
                ));
                Ok(BulkCreateResult { created, updated, failed: 0 })
            }
            Err(_) => Ok(BulkCreateResult { created: 0, updated: 0, failed: len }),
        }
    }

    pub async fn stats(&self) -> Result<EntityStats> {
        let all = self
            .list(ListParams {
                limit: 0,
                ..Default::default()
            })
            .await?;
        let cutoff = Utc::now() - Duration::days(7);
        let mut by_type: BTreeMap<String, usize> = BTreeMap::new();
        let mut recently_modified_7d = 0;
        for entity in &all.items {
            *by_type.entry(entity.entity_type.label().to_string()).or_default() += 1;
            if entity.last_modified >= cutoff {
                recently_modified_7d += 1;
            }
        }
        Ok(EntityStats {
            total: all.items.len(),
            by_type,
            recently_modified_7d,
        })
    }
}

fn entity_from_row(rows: &[crate::store::Row]) -> Result<Entity> {
    let row = rows
        .first()
        .ok_or_else(|| Error::NotFound("no row returned".to_string()))?;
    match row.get("n") {
        Some(GraphRecord::Node { properties, .. }) => from_value_map(properties),
        _ => Err(Error::Malformed("expected a node row".to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryGraphStore;

    fn setup() -> EntityStore {
        EntityStore::new(
            Arc::new(MemoryGraphStore::new()),
            NamespaceScope::new("test"),
            Telemetry::new(),
        )
    }

    #[tokio::test]
    async fn create_applies_namespace_prefix() {
        let store = setup();
        let entity = Entity::new("file_1", EntityType::File, Utc::now());
        let created = store.create(entity).await.unwrap();
        assert_eq!(created.id, "test:file_1");
    }

    #[tokio::test]
    async fn get_after_create_roundtrips() {
        let store = setup();
        let mut entity = Entity::new("sym_1", EntityType::Symbol, Utc::now());
        entity.name = Some("foo".to_string());
        store.create(entity).await.unwrap();
        let fetched = store.get("sym_1").await.unwrap().unwrap();
        assert_eq!(fetched.name.as_deref(), Some("foo"));
    }

    #[tokio::test]
    async fn update_rejects_id_change() {
        let store = setup();
        let entity = Entity::new("sym_1", EntityType::Symbol, Utc::now());
        store.create(entity).await.unwrap();
        let mut patch = BTreeMap::new();
        patch.insert("id".to_string(), Value::Str("other".to_string()));
        let err = store.update("sym_1", patch).await;
        assert!(matches!(err, Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn update_missing_entity_is_not_found() {
        let store = setup();
        let mut patch = BTreeMap::new();
        patch.insert("name".to_string(), Value::Str("x".to_string()));
        let err = store.update("missing", patch).await;
        assert!(matches!(err, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_detaches_entity() {
        let store = setup();
        let entity = Entity::new("sym_1", EntityType::Symbol, Utc::now());
        store.create(entity).await.unwrap();
        store.delete("sym_1").await.unwrap();
        assert!(store.get("sym_1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn bulk_create_reports_failed_len_never_partial() {
        let store = setup();
        let e1 = Entity::new("dup", EntityType::File, Utc::now());
        store.create(e1.clone()).await.unwrap();
        let batch = vec![
            Entity::new("dup", EntityType::File, Utc::now()),
            Entity::new("new_one", EntityType::File, Utc::now()),
        ];
        let result = store.bulk_create(batch, BulkCreateOpts::default()).await.unwrap();
        assert_eq!(result, BulkCreateResult { created: 0, updated: 0, failed: 2 });
    }

    #[tokio::test]
    async fn list_total_reflects_full_match_count_not_just_this_page() {
        let store = setup();
        for i in 0..5 {
            store
                .create(Entity::new(format!("f{i}"), EntityType::File, Utc::now()))
                .await
                .unwrap();
        }
        let page = store
            .list(ListParams { limit: 2, offset: 0, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(page.items.len(), 2);
        assert_eq!(page.total, 5, "total must count every match, not offset + this page's length");

        let last_page = store
            .list(ListParams { limit: 2, offset: 4, ..Default::default() })
            .await
            .unwrap();
        assert_eq!(last_page.items.len(), 1);
        assert_eq!(last_page.total, 5);
    }

    #[tokio::test]
    async fn stats_groups_by_type() {
        let store = setup();
        store
            .create(Entity::new("f1", EntityType::File, Utc::now()))
            .await
            .unwrap();
        store
            .create(Entity::new("s1", EntityType::Symbol, Utc::now()))
            .await
            .unwrap();
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_type.get("File"), Some(&1));
    }
}
