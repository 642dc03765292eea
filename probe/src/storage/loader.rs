use std::io::Write;
use std::sync::Arc;

use bytes::Bytes;
use serde::Deserialize;
use tracing::info;
use zip::write::FileOptions;
use zip::ZipWriter;

use crate::error::BlockStorageError;
use crate::storage::{FeatureTree, ObjectStorageClient};
use crate::types::{TestExecutionResult, TestId, TopicDirective};

/// Descriptor the test author uploads at the root of the feature tree.
pub const MANIFEST_FILE: &str = "manifest.json";
/// Virtual directory the BDD run writes its artefacts into.
pub const EVIDENCE_DIR: &str = "evidence";

/// Everything the downstream children need to know about one test's
/// storage: the materialized feature tree, where evidence goes, which
/// topics the test touches, and the bucket it all came from.
#[derive(Clone)]
pub struct BlockStorageDirective {
    pub features: Arc<FeatureTree>,
    pub evidence_dir: String,
    pub topic_directives: Vec<TopicDirective>,
    pub bucket: String,
}

#[derive(Deserialize)]
struct Manifest {
    #[serde(default)]
    topics: Vec<TopicDirective>,
}

/// Streams a test's feature tree out of object storage and uploads the
/// zipped evidence after the run.
pub struct FeatureLoader {
    storage: Arc<dyn ObjectStorageClient>,
}

impl FeatureLoader {
    pub fn new(storage: Arc<dyn ObjectStorageClient>) -> Self {
        Self { storage }
    }

    /// Downloads `bucket/<testId>/` into a fresh in-memory tree and parses
    /// the manifest into topic directives.
    pub async fn initialize(
        &self,
        bucket: &str,
        test_id: TestId,
    ) -> Result<BlockStorageDirective, BlockStorageError> {
        let prefix = format!("{test_id}/");
        let keys = self.storage.list_keys(bucket, &prefix).await?;
        if keys.is_empty() {
            return Err(BlockStorageError::EmptyPrefix {
                bucket: bucket.to_string(),
                prefix,
            });
        }

        let tree = FeatureTree::new();
        for key in &keys {
            let body = self.storage.get_object(bucket, key).await?;
            let relative = key.strip_prefix(&prefix).unwrap_or(key);
            if relative.is_empty() {
                continue;
            }
            tree.insert(relative, body);
        }
        info!(%test_id, files = tree.len(), "materialized feature tree");

        let manifest_raw = tree
            .read(MANIFEST_FILE)
            .ok_or(BlockStorageError::MissingManifest)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_raw)
            .map_err(|e| BlockStorageError::Manifest(e.to_string()))?;

        Ok(BlockStorageDirective {
            features: Arc::new(tree),
            evidence_dir: EVIDENCE_DIR.to_string(),
            topic_directives: manifest.topics,
            bucket: bucket.to_string(),
        })
    }

    /// Zips the evidence directory plus a `result.json` summary and uploads
    /// it under a fresh timestamped key. Returns the object key.
    pub async fn upload_evidence(
        &self,
        directive: &BlockStorageDirective,
        test_id: TestId,
        result: &TestExecutionResult,
    ) -> Result<String, BlockStorageError> {
        let archive = build_evidence_archive(directive, result)?;
        let key = format!(
            "{test_id}/{}/evidence.zip",
            time::OffsetDateTime::now_utc().unix_timestamp()
        );
        self.storage
            .put_object(&directive.bucket, &key, Bytes::from(archive))
            .await?;
        info!(%test_id, key, "uploaded evidence archive");
        Ok(key)
    }
}

fn build_evidence_archive(
    directive: &BlockStorageDirective,
    result: &TestExecutionResult,
) -> Result<Vec<u8>, BlockStorageError> {
    let evidence = |e: &dyn std::fmt::Display| BlockStorageError::Evidence(e.to_string());

    let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    let summary = serde_json::to_vec_pretty(result).map_err(|e| evidence(&e))?;
    zip.start_file("result.json", options)
        .map_err(|e| evidence(&e))?;
    zip.write_all(&summary).map_err(|e| evidence(&e))?;

    for (path, contents) in directive.features.files_under(&directive.evidence_dir) {
        zip.start_file(&path, options).map_err(|e| evidence(&e))?;
        zip.write_all(&contents).map_err(|e| evidence(&e))?;
    }

    let cursor = zip.finish().map_err(|e| evidence(&e))?;
    Ok(cursor.into_inner())
}
