//! Storage provider plug-in contract (C9, spec §4.9) plus a local-filesystem
//! default. Alternative providers (object storage) register into the same
//! [`ProviderRegistry`] from a satellite crate (e.g. `graphkit-s3-backup`).

use crate::error::{Error, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::instrument;

/// The default provider id, always present in a fresh [`ProviderRegistry`].
pub const LOCAL_PROVIDER_ID: &str = "local";

/// Size and modification time of a stored artifact.
#[derive(Debug, Clone, Copy)]
pub struct FileStat {
    pub size: u64,
    pub modified_at: DateTime<Utc>,
}

/// Plug-in contract every backup destination implements (spec §4.9).
#[async_trait]
pub trait StorageProvider: Send + Sync {
    /// Verify the destination is reachable/writable; called before a backup
    /// or restore begins.
    async fn ensure_ready(&self) -> Result<()>;

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()>;

    async fn read_file(&self, path: &str) -> Result<Vec<u8>>;

    async fn remove_file(&self, path: &str) -> Result<()>;

    async fn exists(&self, path: &str) -> Result<bool>;

    async fn stat(&self, path: &str) -> Result<FileStat>;

    /// List artifacts under `prefix` (or everything, if `None`).
    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>>;

    /// Whether `createReadStream`/`createWriteStream`-style chunked transfer
    /// is available; gates the gzip-archive packaging step (spec §4.9 step 5).
    fn supports_streaming(&self) -> bool {
        false
    }
}

/// Local filesystem implementation, always registered as [`LOCAL_PROVIDER_ID`].
pub struct LocalFilesystemProvider {
    root: PathBuf,
}

impl LocalFilesystemProvider {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl StorageProvider for LocalFilesystemProvider {
    #[instrument(skip(self))]
    async fn ensure_ready(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("local storage root unwritable: {e}")))
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Integrity(format!("failed to create {parent:?}: {e}")))?;
        }
        tokio::fs::write(&full, data)
            .await
            .map_err(|e| Error::Integrity(format!("failed to write {full:?}: {e}")))
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.resolve(path))
            .await
            .map_err(|e| Error::NotFound(format!("{path}: {e}")))
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        tokio::fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| Error::Integrity(format!("failed to remove {path}: {e}")))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.resolve(path)).await.unwrap_or(false))
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let meta = tokio::fs::metadata(self.resolve(path))
            .await
            .map_err(|e| Error::NotFound(format!("{path}: {e}")))?;
        let modified_at = meta
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or_else(|_| Utc::now());
        Ok(FileStat { size: meta.len(), modified_at })
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let base = match prefix {
            Some(p) => self.root.join(p),
            None => self.root.clone(),
        };
        let mut out = Vec::new();
        collect_files(&base, &self.root, &mut out).await?;
        out.sort();
        Ok(out)
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}

fn collect_files<'a>(
    dir: &'a Path,
    root: &'a Path,
    out: &'a mut Vec<String>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
    Box::pin(async move {
        if !tokio::fs::try_exists(dir).await.unwrap_or(false) {
            return Ok(());
        }
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .map_err(|e| Error::Integrity(format!("failed to list {dir:?}: {e}")))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| Error::Integrity(format!("failed to read entry under {dir:?}: {e}")))?
        {
            let path = entry.path();
            if path.is_dir() {
                collect_files(&path, root, out).await?;
            } else if let Ok(relative) = path.strip_prefix(root) {
                out.push(relative.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    })
}

/// Maps `providerId -> provider`. Always carries [`LOCAL_PROVIDER_ID`].
#[derive(Clone)]
pub struct ProviderRegistry {
    providers: Arc<DashMap<String, Arc<dyn StorageProvider>>>,
}

impl ProviderRegistry {
    pub fn new(default_root: impl Into<PathBuf>) -> Self {
        let registry = Self { providers: Arc::new(DashMap::new()) };
        registry.register(LOCAL_PROVIDER_ID, Arc::new(LocalFilesystemProvider::new(default_root)));
        registry
    }

    pub fn register(&self, id: impl Into<String>, provider: Arc<dyn StorageProvider>) {
        self.providers.insert(id.into(), provider);
    }

    pub fn get(&self, id: &str) -> Result<Arc<dyn StorageProvider>> {
        self.providers
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| Error::DependencyUnavailable(format!("no storage provider registered for {id}")))
    }

    pub fn default_provider(&self) -> Arc<dyn StorageProvider> {
        self.get(LOCAL_PROVIDER_ID)
            .expect("local provider is registered at construction")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn local_provider_roundtrips_a_file() {
        let dir = tempdir().unwrap();
        let provider = LocalFilesystemProvider::new(dir.path());
        provider.ensure_ready().await.unwrap();
        provider.write_file("backup_1/graph.json", b"{}").await.unwrap();
        assert!(provider.exists("backup_1/graph.json").await.unwrap());
        let data = provider.read_file("backup_1/graph.json").await.unwrap();
        assert_eq!(data, b"{}");
    }

    #[tokio::test]
    async fn list_returns_nested_relative_paths() {
        let dir = tempdir().unwrap();
        let provider = LocalFilesystemProvider::new(dir.path());
        provider.write_file("backup_1/graph.json", b"{}").await.unwrap();
        provider.write_file("backup_1/vectors/code.json", b"[]").await.unwrap();
        let files = provider.list(Some("backup_1")).await.unwrap();
        assert_eq!(files.len(), 2);
    }

    #[tokio::test]
    async fn registry_always_has_local_provider() {
        let dir = tempdir().unwrap();
        let registry = ProviderRegistry::new(dir.path());
        assert!(registry.get(LOCAL_PROVIDER_ID).is_ok());
    }
}
