use async_trait::async_trait;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;

use crate::config::StorageConfig;
use crate::error::BlockStorageError;

pub mod loader;
pub mod tree;

pub use loader::{BlockStorageDirective, FeatureLoader, EVIDENCE_DIR, MANIFEST_FILE};
pub use tree::FeatureTree;

/// Object storage operations the feature loader needs. Kept narrow so the
/// loader can be tested against an in-memory fake.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStorageClient: Send + Sync {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, BlockStorageError>;
    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, BlockStorageError>;
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> Result<(), BlockStorageError>;
}

pub struct S3StorageClient {
    client: aws_sdk_s3::Client,
}

impl S3StorageClient {
    pub async fn new(config: &StorageConfig) -> Self {
        let mut loader = aws_config::from_env()
            .region(aws_config::Region::new(config.storage_region.clone()));
        if let Some(endpoint) = &config.storage_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if config.storage_endpoint.is_some() {
            // Custom endpoints are minio-style deployments without
            // virtual-hosted bucket DNS
            builder = builder.force_path_style(true);
        }
        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
        }
    }
}

#[async_trait]
impl ObjectStorageClient for S3StorageClient {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, BlockStorageError> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(bucket)
            .prefix(prefix)
            .into_paginator()
            .send();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| BlockStorageError::Operation(e.to_string()))?;
            for object in page.contents() {
                if let Some(key) = object.key() {
                    keys.push(key.to_string());
                }
            }
        }
        Ok(keys)
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, BlockStorageError> {
        let output = self
            .client
            .get_object()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let message = e.to_string();
                if matches!(e.into_service_error(), GetObjectError::NoSuchKey(_)) {
                    BlockStorageError::NotFound(key.to_string())
                } else {
                    BlockStorageError::Operation(message)
                }
            })?;
        let body = output
            .body
            .collect()
            .await
            .map_err(|e| BlockStorageError::Operation(e.to_string()))?;
        Ok(body.into_bytes())
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> Result<(), BlockStorageError> {
        self.client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| BlockStorageError::Operation(e.to_string()))?;
        Ok(())
    }
}
