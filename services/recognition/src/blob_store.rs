use crate::config::S3Config;
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{
    BucketLocationConstraint, CompletedMultipartUpload, CompletedPart, CreateBucketConfiguration,
};
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
#[cfg(any(test, feature = "mock"))]
use parking_lot::RwLock;
#[cfg(any(test, feature = "mock"))]
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors reported by a blob store
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to upload object {key}: {message}")]
    Upload { key: String, message: String },

    #[error("Bucket {bucket} unavailable: {message}")]
    Container { bucket: String, message: String },

    #[error("Failed to look up object {key}: {message}")]
    Lookup { key: String, message: String },
}

/// Outcome of [`BlobStore::ensure_container`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    AlreadyExists,
}

/// An object to be written
#[derive(Debug, Clone)]
pub struct BlobUpload {
    pub key: String,
    pub body: Bytes,
    pub content_type: String,
    /// User metadata stored alongside the object
    pub metadata: Vec<(String, String)>,
}

/// Put/exists object store holding the raw image bytes.
///
/// Implementations do not retry; a failed upload is reported as-is.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create the backing bucket if it is missing. Safe to call repeatedly.
    async fn ensure_container(&self) -> Result<ContainerStatus, StorageError>;

    async fn container_exists(&self) -> Result<bool, StorageError>;

    /// Store an object and return its locator URL
    async fn upload(&self, upload: BlobUpload) -> Result<String, StorageError>;

    async fn exists(&self, key: &str) -> Result<bool, StorageError>;
}

/// Blob key for an ingested image: `{id}/{filename}`.
///
/// The id prefix keeps keys unique even when filenames repeat.
pub fn object_key(id: Uuid, filename: &str) -> String {
    format!("{}/{}", id, sanitize_filename(filename))
}

/// Build the locator for `key` under `base` and `bucket`
pub fn object_locator(base: &str, bucket: &str, key: &str) -> String {
    format!("{}/{}/{}", base.trim_end_matches('/'), bucket, key)
}

/// Keep a filename usable as a single URL path segment
fn sanitize_filename(filename: &str) -> String {
    let cleaned: String = filename
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => c,
            _ => '_',
        })
        .collect();

    let cleaned = cleaned.trim_start_matches('.');
    if cleaned.is_empty() {
        "upload".to_string()
    } else {
        cleaned.to_string()
    }
}

/// S3 (or S3-compatible, e.g. MinIO) blob store
pub struct S3BlobStore {
    client: S3Client,
    bucket: String,
    region: String,
    locator_base: String,
    multipart_threshold_bytes: usize,
    part_size_bytes: usize,
}

impl S3BlobStore {
    /// Create a new S3 blob store
    pub async fn new(config: &S3Config) -> anyhow::Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

        // Configure custom endpoint for MinIO/LocalStack
        if let Some(ref endpoint_url) = config.endpoint_url {
            s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
        }

        // Force path-style access for MinIO compatibility
        if config.force_path_style {
            s3_config_builder = s3_config_builder.force_path_style(true);
        }

        let client = S3Client::from_conf(s3_config_builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 blob store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
            region: config.region.clone(),
            locator_base: config.locator_base(),
            multipart_threshold_bytes: config.multipart_threshold_bytes,
            part_size_bytes: config.part_size_bytes.max(5 * 1024 * 1024),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn create_bucket(&self) -> Result<ContainerStatus, StorageError> {
        let mut request = self.client.create_bucket().bucket(&self.bucket);

        // us-east-1 rejects an explicit location constraint
        if self.region != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(self.region.as_str()))
                    .build(),
            );
        }

        match request.send().await {
            Ok(_) => {
                info!(bucket = %self.bucket, "Bucket created");
                Ok(ContainerStatus::Created)
            }
            Err(e)
                if e.as_service_error()
                    .map(|e| e.is_bucket_already_owned_by_you())
                    .unwrap_or(false) =>
            {
                Ok(ContainerStatus::AlreadyExists)
            }
            Err(e) => Err(StorageError::Container {
                bucket: self.bucket.clone(),
                message: DisplayErrorContext(&e).to_string(),
            }),
        }
    }

    /// Simple single-part upload for small objects
    async fn simple_upload(&self, upload: &BlobUpload) -> Result<(), StorageError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(&upload.key)
            .body(ByteStream::from(upload.body.clone()))
            .content_type(&upload.content_type);

        for (name, value) in &upload.metadata {
            request = request.metadata(name, value);
        }

        request
            .send()
            .await
            .map_err(|e| upload_error(&upload.key, DisplayErrorContext(&e)))?;

        Ok(())
    }

    /// Multipart upload for large objects
    async fn multipart_upload(&self, upload: &BlobUpload) -> Result<(), StorageError> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(&upload.key)
            .content_type(&upload.content_type);

        for (name, value) in &upload.metadata {
            request = request.metadata(name, value);
        }

        let create_response = request
            .send()
            .await
            .map_err(|e| upload_error(&upload.key, DisplayErrorContext(&e)))?;

        let upload_id = create_response
            .upload_id()
            .ok_or_else(|| upload_error(&upload.key, "no upload id in response"))?;

        match self.upload_parts(upload, upload_id).await {
            Ok(parts) => {
                self.client
                    .complete_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&upload.key)
                    .upload_id(upload_id)
                    .multipart_upload(
                        CompletedMultipartUpload::builder()
                            .set_parts(Some(parts))
                            .build(),
                    )
                    .send()
                    .await
                    .map_err(|e| upload_error(&upload.key, DisplayErrorContext(&e)))?;
                Ok(())
            }
            Err(e) => {
                if let Err(abort) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(&self.bucket)
                    .key(&upload.key)
                    .upload_id(upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %upload.key,
                        error = %DisplayErrorContext(&abort),
                        "Failed to abort multipart upload"
                    );
                }
                Err(e)
            }
        }
    }

    async fn upload_parts(
        &self,
        upload: &BlobUpload,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, StorageError> {
        let mut completed_parts = Vec::new();
        let mut part_number = 1;
        let mut offset = 0;

        while offset < upload.body.len() {
            let end = (offset + self.part_size_bytes).min(upload.body.len());

            let upload_part_response = self
                .client
                .upload_part()
                .bucket(&self.bucket)
                .key(&upload.key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(ByteStream::from(upload.body.slice(offset..end)))
                .send()
                .await
                .map_err(|e| upload_error(&upload.key, DisplayErrorContext(&e)))?;

            completed_parts.push(
                CompletedPart::builder()
                    .part_number(part_number)
                    .e_tag(upload_part_response.e_tag().unwrap_or_default())
                    .build(),
            );

            part_number += 1;
            offset = end;
        }

        Ok(completed_parts)
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn ensure_container(&self) -> Result<ContainerStatus, StorageError> {
        if self.container_exists().await? {
            info!(bucket = %self.bucket, "Bucket already exists");
            return Ok(ContainerStatus::AlreadyExists);
        }

        self.create_bucket().await
    }

    async fn container_exists(&self) -> Result<bool, StorageError> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StorageError::Container {
                        bucket: self.bucket.clone(),
                        message: DisplayErrorContext(&e).to_string(),
                    })
                }
            }
        }
    }

    #[instrument(skip(self, upload), fields(key = %upload.key, size_bytes = upload.body.len()))]
    async fn upload(&self, upload: BlobUpload) -> Result<String, StorageError> {
        debug!("Uploading object to S3");

        if upload.body.len() > self.multipart_threshold_bytes {
            self.multipart_upload(&upload).await?;
        } else {
            self.simple_upload(&upload).await?;
        }

        metrics::counter!("blob_store.bytes.uploaded").increment(upload.body.len() as u64);

        info!(
            key = %upload.key,
            size_bytes = upload.body.len(),
            "Object uploaded successfully"
        );

        Ok(object_locator(&self.locator_base, &self.bucket, &upload.key))
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_not_found())
                    .unwrap_or(false)
                {
                    Ok(false)
                } else {
                    Err(StorageError::Lookup {
                        key: key.to_string(),
                        message: DisplayErrorContext(&e).to_string(),
                    })
                }
            }
        }
    }
}

fn upload_error(key: &str, message: impl std::fmt::Display) -> StorageError {
    StorageError::Upload {
        key: key.to_string(),
        message: message.to_string(),
    }
}

/// A stored in-memory object
#[cfg(any(test, feature = "mock"))]
#[derive(Debug, Clone)]
pub struct StoredBlob {
    pub body: Bytes,
    pub content_type: String,
    pub metadata: Vec<(String, String)>,
}

/// In-process blob store with S3-like semantics: uploads fail until the
/// container exists, and a put replaces any object under the same key.
#[cfg(any(test, feature = "mock"))]
pub struct MemoryBlobStore {
    bucket: String,
    locator_base: String,
    container: RwLock<bool>,
    objects: RwLock<HashMap<String, StoredBlob>>,
}

#[cfg(any(test, feature = "mock"))]
impl MemoryBlobStore {
    pub fn new(locator_base: &str, bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            locator_base: locator_base.to_string(),
            container: RwLock::new(false),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<StoredBlob> {
        self.objects.read().get(key).cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

#[cfg(any(test, feature = "mock"))]
#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn ensure_container(&self) -> Result<ContainerStatus, StorageError> {
        let mut container = self.container.write();
        if *container {
            Ok(ContainerStatus::AlreadyExists)
        } else {
            *container = true;
            Ok(ContainerStatus::Created)
        }
    }

    async fn container_exists(&self) -> Result<bool, StorageError> {
        Ok(*self.container.read())
    }

    async fn upload(&self, upload: BlobUpload) -> Result<String, StorageError> {
        if !*self.container.read() {
            return Err(StorageError::Upload {
                key: upload.key,
                message: format!("bucket {} does not exist", self.bucket),
            });
        }

        let locator = object_locator(&self.locator_base, &self.bucket, &upload.key);
        self.objects.write().insert(
            upload.key,
            StoredBlob {
                body: upload.body,
                content_type: upload.content_type,
                metadata: upload.metadata,
            },
        );

        Ok(locator)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.objects.read().contains_key(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upload(key: &str) -> BlobUpload {
        BlobUpload {
            key: key.to_string(),
            body: Bytes::from_static(b"\x89PNG"),
            content_type: "image/png".to_string(),
            metadata: vec![("image-id".to_string(), "abc".to_string())],
        }
    }

    #[test]
    fn test_object_key_uses_id_prefix() {
        let id = Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap();
        assert_eq!(
            object_key(id, "cat.png"),
            "550e8400-e29b-41d4-a716-446655440000/cat.png"
        );
    }

    #[test]
    fn test_same_filename_different_ids_never_collide() {
        let a = object_key(Uuid::new_v4(), "photo.jpg");
        let b = object_key(Uuid::new_v4(), "photo.jpg");
        assert_ne!(a, b);
    }

    #[test]
    fn test_sanitize_filename() {
        assert_eq!(sanitize_filename("holiday-01.jpeg"), "holiday-01.jpeg");
        assert_eq!(sanitize_filename("my photo.png"), "my_photo.png");
        assert_eq!(sanitize_filename("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(sanitize_filename(".."), "upload");
        assert_eq!(sanitize_filename(""), "upload");
        assert_eq!(sanitize_filename("fötö.png"), "f_t_.png");
    }

    #[test]
    fn test_object_locator() {
        assert_eq!(
            object_locator("http://minio:9000/", "images", "id/cat.png"),
            "http://minio:9000/images/id/cat.png"
        );
    }

    #[tokio::test]
    async fn test_memory_store_ensure_container_is_idempotent() {
        let store = MemoryBlobStore::new("http://minio:9000", "images");

        assert!(!store.container_exists().await.unwrap());
        assert_eq!(
            store.ensure_container().await.unwrap(),
            ContainerStatus::Created
        );
        assert_eq!(
            store.ensure_container().await.unwrap(),
            ContainerStatus::AlreadyExists
        );
        assert!(store.container_exists().await.unwrap());
    }

    #[tokio::test]
    async fn test_memory_store_upload_requires_container() {
        let store = MemoryBlobStore::new("http://minio:9000", "images");

        assert!(matches!(
            store.upload(upload("a/b.png")).await,
            Err(StorageError::Upload { .. })
        ));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_memory_store_upload_and_exists() {
        let store = MemoryBlobStore::new("http://minio:9000", "images");
        store.ensure_container().await.unwrap();

        let locator = store.upload(upload("a/b.png")).await.unwrap();

        assert_eq!(locator, "http://minio:9000/images/a/b.png");
        assert!(store.exists("a/b.png").await.unwrap());
        assert!(!store.exists("a/c.png").await.unwrap());

        let stored = store.get("a/b.png").unwrap();
        assert_eq!(stored.content_type, "image/png");
        assert_eq!(stored.metadata[0].0, "image-id");
    }
}
