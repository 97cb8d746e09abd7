//! `graphkit ingest <path>` — walk a directory tree and stage it as
//! `File`/`Directory` entities linked by `Contains` edges.
//!
//! Real AST/documentation extraction is an external collaborator the core
//! only consumes the output of (spec §1); this command produces the
//! structural skeleton a parser would otherwise feed in.

use crate::app::App;
use crate::output::{print_info, print_success};
use anyhow::Result;
use chrono::Utc;
use clap::Args;
use graphkit::model::{Entity, EntityType, RelationshipType};
use graphkit::relationship_store::RelationshipObservation;
use std::path::{Path, PathBuf};

#[derive(Debug, Args)]
pub struct IngestArgs {
    /// Root directory to walk.
    pub path: PathBuf,

    /// Skip files whose extension isn't in this allow-list (repeatable).
    #[arg(long = "ext")]
    pub extensions: Vec<String>,
}

pub async fn run(app: &App, args: IngestArgs) -> Result<()> {
    let root = args.path.canonicalize().unwrap_or(args.path.clone());
    let root_id = path_entity_id(&root, &root);
    let now = Utc::now();

    let mut entities = 0usize;
    let mut relationships = 0usize;

    let root_entity = Entity { path: Some(root_id.clone()), name: dir_name(&root), ..Entity::new(&root_id, EntityType::Directory, now) };
    if app.entities.create(root_entity).await.is_ok() {
        entities += 1;
    }

    walk(app, &root, &root, &root_id, &args.extensions, now, &mut entities, &mut relationships).await?;

    app.save_snapshot().await?;
    print_success(&format!("ingested {entities} entities and {relationships} relationships from {}", root.display()));
    Ok(())
}

fn walk<'a>(
    app: &'a App,
    root: &'a Path,
    dir: &'a Path,
    dir_id: &'a str,
    extensions: &'a [String],
    now: chrono::DateTime<Utc>,
    entities: &'a mut usize,
    relationships: &'a mut usize,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + 'a>> {
    Box::pin(async move {
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            let child_id = path_entity_id(root, &path);

            if file_type.is_dir() {
                let child = Entity {
                    path: Some(child_id.clone()),
                    name: dir_name(&path),
                    ..Entity::new(&child_id, EntityType::Directory, now)
                };
                if app.entities.create(child).await.is_ok() {
                    *entities += 1;
                }
                link_contains(app, dir_id, &child_id, relationships).await;
                walk(app, root, &path, &child_id, extensions, now, entities, relationships).await?;
            } else if file_type.is_file() {
                if !extensions.is_empty() {
                    let matches = path
                        .extension()
                        .and_then(|ext| ext.to_str())
                        .is_some_and(|ext| extensions.iter().any(|allowed| allowed.trim_start_matches('.') == ext));
                    if !matches {
                        continue;
                    }
                }
                let child = Entity {
                    path: Some(child_id.clone()),
                    name: dir_name(&path),
                    language: path.extension().and_then(|e| e.to_str()).map(str::to_string),
                    ..Entity::new(&child_id, EntityType::File, now)
                };
                if app.entities.create(child).await.is_ok() {
                    *entities += 1;
                }
                link_contains(app, dir_id, &child_id, relationships).await;
                print_info(&format!("  + {child_id}"));
            }
        }
        Ok(())
    })
}

async fn link_contains(app: &App, from: &str, to: &str, relationships: &mut usize) {
    let observation = RelationshipObservation {
        relationship_type: RelationshipType::Contains,
        from_entity_id: from.to_string(),
        to_entity_id: Some(to.to_string()),
        target_ref: None,
        evidence: Vec::new(),
        locations: Vec::new(),
        confidence: 1.0,
        change_set_id: None,
    };
    if app.relationships.upsert(observation).await.is_ok() {
        *relationships += 1;
    }
}

fn path_entity_id(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    if relative.as_os_str().is_empty() {
        root.file_name().and_then(|n| n.to_str()).unwrap_or(".").to_string()
    } else {
        relative.to_string_lossy().replace('\\', "/")
    }
}

fn dir_name(path: &Path) -> Option<String> {
    path.file_name().and_then(|n| n.to_str()).map(str::to_string)
}
