//! S3-backed [`StorageProvider`] for backup/restore artifacts.
//!
//! Grounded on the teacher's `dashflow-s3-checkpointer` crate: the same
//! `aws_config::load_from_env()` client construction, `put_object`/
//! `get_object`/`delete_object`/`list_objects_v2` call shapes, and a
//! size-gated choice between a simple put and a multipart upload for large
//! artifacts. Thread/checkpoint indexing has no counterpart here — a backup
//! artifact is just bytes at a key, so this crate is considerably smaller
//! than its teacher.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use graphkit::backup::{FileStat, StorageProvider};
use graphkit::error::{Error, Result};
use tracing::{debug, info, warn};

/// Above this size a `put_object` is split into a multipart upload, matching
/// the teacher's threshold for checkpoint payloads.
const MULTIPART_THRESHOLD: usize = 5 * 1024 * 1024;
const MULTIPART_PART_SIZE: usize = 8 * 1024 * 1024;

/// [`StorageProvider`] backed by an S3 bucket, keyed under a fixed prefix.
pub struct S3BackupProvider {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3BackupProvider {
    /// Build a client from the standard AWS environment/credential chain.
    pub async fn new(bucket: impl Into<String>) -> Result<Self> {
        Self::with_prefix(bucket, "graphkit").await
    }

    pub async fn with_prefix(bucket: impl Into<String>, prefix: impl Into<String>) -> Result<Self> {
        let bucket = bucket.into();
        let prefix = prefix.into();
        info!(%bucket, %prefix, "initializing S3 backup provider");
        let config = aws_config::load_from_env().await;
        let client = Client::new(&config);
        Ok(Self { client, bucket, prefix })
    }

    /// Build from an already-configured client, e.g. pointed at a test
    /// endpoint via a custom `SdkConfig`.
    #[must_use]
    pub fn with_client(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self { client, bucket: bucket.into(), prefix: prefix.into() }
    }

    fn key(&self, path: &str) -> String {
        format!("{}/{}", self.prefix, path)
    }

    fn is_not_found(err: &impl std::fmt::Display) -> bool {
        let message = err.to_string();
        message.contains("NoSuchKey") || message.contains("NotFound")
    }

    async fn put_small(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(data))
            .content_type("application/octet-stream")
            .send()
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("s3 put_object failed: {e}")))?;
        Ok(())
    }

    async fn put_multipart(&self, key: &str, data: Vec<u8>) -> Result<()> {
        let create = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("s3 create_multipart_upload failed: {e}")))?;
        let upload_id = create
            .upload_id()
            .ok_or_else(|| Error::DependencyUnavailable("s3 multipart upload returned no id".into()))?
            .to_string();

        let mut parts = Vec::new();
        for (index, chunk) in data.chunks(MULTIPART_PART_SIZE).enumerate() {
            let part_number = (index + 1) as i32;
            let upload = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(key)
                .upload_id(&upload_id)
                .part_number(part_number)
                .body(ByteStream::from(chunk.to_vec()))
                .send()
                .await
                .map_err(|e| Error::DependencyUnavailable(format!("s3 upload_part failed: {e}")))?;
            let e_tag = upload.e_tag().unwrap_or_default().to_string();
            parts.push(CompletedPart::builder().part_number(part_number).e_tag(e_tag).build());
        }

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(CompletedMultipartUpload::builder().set_parts(Some(parts)).build())
            .send()
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("s3 complete_multipart_upload failed: {e}")))?;
        Ok(())
    }
}

#[async_trait]
impl StorageProvider for S3BackupProvider {
    async fn ensure_ready(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| Error::DependencyUnavailable(format!("s3 bucket {} unreachable: {e}", self.bucket)))?;
        Ok(())
    }

    async fn write_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let key = self.key(path);
        let size = data.len();
        if size < MULTIPART_THRESHOLD {
            debug!(%key, size, "using simple put_object");
            self.put_small(&key, data.to_vec()).await
        } else {
            info!(%key, size, "using multipart upload");
            self.put_multipart(&key, data.to_vec()).await
        }
    }

    async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let key = self.key(path);
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| {
                if Self::is_not_found(&e) {
                    Error::NotFound(format!("{path}: {e}"))
                } else {
                    Error::DependencyUnavailable(format!("s3 get_object failed: {e}"))
                }
            })?;
        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| Error::Integrity(format!("failed to read s3 body for {path}: {e}")))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn remove_file(&self, path: &str) -> Result<()> {
        let key = self.key(path);
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Error::Integrity(format!("s3 delete_object failed for {path}: {e}")))?;
        Ok(())
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = self.key(path);
        match self.client.head_object().bucket(&self.bucket).key(&key).send().await {
            Ok(_) => Ok(true),
            Err(e) if Self::is_not_found(&e) => Ok(false),
            Err(e) => {
                warn!(%key, error = %e, "s3 head_object failed");
                Ok(false)
            }
        }
    }

    async fn stat(&self, path: &str) -> Result<FileStat> {
        let key = self.key(path);
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&key)
            .send()
            .await
            .map_err(|e| Error::NotFound(format!("{path}: {e}")))?;
        let size = u64::try_from(head.content_length().unwrap_or(0)).unwrap_or(0);
        let modified_at = head
            .last_modified()
            .and_then(|t| DateTime::from_timestamp(t.secs(), 0))
            .unwrap_or_else(Utc::now);
        Ok(FileStat { size, modified_at })
    }

    async fn list(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let list_prefix = match prefix {
            Some(p) => self.key(p),
            None => format!("{}/", self.prefix),
        };
        let mut out = Vec::new();
        let mut continuation_token: Option<String> = None;
        loop {
            let mut request = self.client.list_objects_v2().bucket(&self.bucket).prefix(&list_prefix);
            if let Some(token) = continuation_token.take() {
                request = request.continuation_token(token);
            }
            let result = request
                .send()
                .await
                .map_err(|e| Error::DependencyUnavailable(format!("s3 list_objects_v2 failed: {e}")))?;
            if let Some(contents) = result.contents {
                for object in contents {
                    if let Some(key) = object.key() {
                        if let Some(relative) = key.strip_prefix(&format!("{}/", self.prefix)) {
                            out.push(relative.to_string());
                        }
                    }
                }
            }
            match result.next_continuation_token {
                Some(token) => continuation_token = Some(token),
                None => break,
            }
        }
        out.sort();
        Ok(out)
    }

    fn supports_streaming(&self) -> bool {
        true
    }
}
