//! End-to-end lifecycle runs against in-memory collaborators: object
//! storage, vault and the schema registry are stubbed, the scheduler, FSM
//! and children are real.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use probe::bdd::DryRunEngine;
use probe::config::{Config, KafkaConfig, StorageConfig, VaultConfig};
use probe::directory::StreamDirectory;
use probe::error::{BlockStorageError, ServiceError, VaultError};
use probe::scheduler::{ProbeDeps, QueueScheduler};
use probe::service::ProbeHandle;
use probe::storage::ObjectStorageClient;
use probe::types::{SecurityProtocol, TestId, TestState, TopicDirective};
use probe::vault::{CredentialBroker, CredentialsMapping, VaultClient};

const MANIFEST: &str = r#"{"topics": []}"#;
const FEATURE: &str = "\
Feature: smoke

  Scenario: first
    Given nothing happens
    Then nothing is observed

  Scenario: second
    Given nothing happens
";

const MAPPING_YAML: &str = r#"
mappings:
  - targetField: clientId
    sourcePath: $.client_id
  - targetField: clientSecret
    sourcePath: $.client_secret
  - targetField: tokenEndpoint
    sourcePath: $.token_endpoint
"#;

/// Object storage backed by a shared map, so tests can both seed feature
/// trees and observe evidence uploads. `upload_delay` stands in for real
/// network latency, keeping short-lived states observable.
#[derive(Clone, Default)]
struct MemoryStorage {
    objects: Arc<Mutex<HashMap<String, Bytes>>>,
    upload_delay: Duration,
}

impl MemoryStorage {
    fn seed_feature_tree(&self, bucket: &str, test_id: TestId) {
        let mut objects = self.objects.lock().unwrap();
        objects.insert(
            format!("{bucket}/{test_id}/manifest.json"),
            Bytes::from(MANIFEST),
        );
        objects.insert(
            format!("{bucket}/{test_id}/features/smoke.feature"),
            Bytes::from(FEATURE),
        );
    }

    fn evidence_keys(&self, bucket: &str, test_id: TestId) -> Vec<String> {
        let prefix = format!("{bucket}/{test_id}/");
        self.objects
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.starts_with(&prefix) && key.ends_with("evidence.zip"))
            .cloned()
            .collect()
    }
}

#[async_trait]
impl ObjectStorageClient for MemoryStorage {
    async fn list_keys(&self, bucket: &str, prefix: &str) -> Result<Vec<String>, BlockStorageError> {
        let wanted = format!("{bucket}/{prefix}");
        Ok(self
            .objects
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.starts_with(&wanted))
            .map(|key| key[bucket.len() + 1..].to_string())
            .collect())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> Result<Bytes, BlockStorageError> {
        self.objects
            .lock()
            .unwrap()
            .get(&format!("{bucket}/{key}"))
            .cloned()
            .ok_or_else(|| BlockStorageError::NotFound(key.to_string()))
    }

    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        body: Bytes,
    ) -> Result<(), BlockStorageError> {
        if !self.upload_delay.is_zero() {
            tokio::time::sleep(self.upload_delay).await;
        }
        self.objects
            .lock()
            .unwrap()
            .insert(format!("{bucket}/{key}"), body);
        Ok(())
    }
}

struct NoVault;

#[async_trait]
impl VaultClient for NoVault {
    async fn fetch(&self, directive: &TopicDirective) -> Result<serde_json::Value, VaultError> {
        Err(VaultError::Transport {
            topic: directive.topic.clone(),
            detail: "vault must not be called on a plaintext cluster".to_string(),
        })
    }
}

fn test_config() -> Config {
    Config {
        address: "127.0.0.1:0".parse().unwrap(),
        schema_registry_url: "http://localhost:8081".to_string(),
        kafka: KafkaConfig {
            kafka_hosts: "localhost:9092".to_string(),
            kafka_producer_linger_ms: 0,
            kafka_producer_queue_mib: 50,
            kafka_message_timeout_ms: 500,
            kafka_compression_codec: "none".to_string(),
            kafka_security_protocol: "PLAINTEXT".to_string(),
        },
        vault: VaultConfig {
            vault_endpoint: "http://localhost:8200/v1/creds".to_string(),
            vault_auth: "static".to_string(),
            vault_token: Some("integration-token".to_string()),
            vault_mapping_path: "credentials-mapping.yaml".to_string(),
        },
        storage: StorageConfig {
            storage_bucket: "probe-tests".to_string(),
            storage_region: "us-east-1".to_string(),
            storage_endpoint: None,
        },
        queue_capacity: 8,
        poison_pill_ms: 30_000,
        exception_cleanup_ms: 50,
        io_blocking_pool_size: 8,
        export_prometheus: false,
    }
}

fn boot(storage: MemoryStorage) -> ProbeHandle {
    let mapping = CredentialsMapping::from_yaml(MAPPING_YAML).expect("mapping");
    let directory = Arc::new(StreamDirectory::new());
    let deps = Arc::new(ProbeDeps {
        config: Arc::new(test_config()),
        storage: Arc::new(storage),
        broker: Arc::new(CredentialBroker::new(
            Arc::new(NoVault),
            mapping,
            SecurityProtocol::Plaintext,
        )),
        engine: Arc::new(DryRunEngine),
        directory: directory.clone(),
    });
    let scheduler = QueueScheduler::spawn(deps, None);
    ProbeHandle::new(scheduler, directory)
}

async fn wait_for<F>(what: &str, mut check: F)
where
    F: FnMut() -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + 'static>>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn happy_path_submit_start_complete_upload() {
    let storage = MemoryStorage {
        upload_delay: Duration::from_millis(400),
        ..MemoryStorage::default()
    };
    let handle = boot(storage.clone());

    let init = handle.submit_test().await.expect("submit");
    let test_id = init.test_id;
    assert!(init.message.contains("probe-tests"));
    assert!(init.message.contains(&test_id.to_string()));

    // "Upload" the feature tree the hint asked for, then start
    storage.seed_feature_tree("probe-tests", test_id);
    let start = handle
        .start_test(test_id, "probe-tests", Some("functional".to_string()))
        .await
        .expect("start");
    assert!(start.accepted);

    let mut completed = None;
    for _ in 0..300 {
        if let Ok(status) = handle.get_status(test_id).await {
            if status.state == TestState::Completed && status.success == Some(true) {
                completed = Some(status);
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let status = completed.expect("test never reached Completed");
    let result = status.result.expect("result");
    assert_eq!(result.scenario_count, 2);
    assert_eq!(result.scenarios_passed, 2);
    assert_eq!(result.steps_failed, 0);
    assert_eq!(status.test_type.as_deref(), Some("functional"));

    // Entry disappears once evidence lands and children wind down
    wait_for("registry teardown", || {
        let handle = handle.clone();
        Box::pin(async move {
            matches!(
                handle.get_status(test_id).await,
                Err(ServiceError::NotFound(_))
            )
        })
    })
    .await;

    assert_eq!(storage.evidence_keys("probe-tests", test_id).len(), 1);

    let queue = handle.queue_status(None).await.expect("queue status");
    assert_eq!(queue.total_tests, 1);
    assert_eq!(queue.completed_count, 1);
    assert_eq!(queue.currently_testing, None);
}

#[tokio::test]
async fn cancel_mid_lifecycle_skips_evidence() {
    let storage = MemoryStorage::default();
    let handle = boot(storage.clone());

    let init = handle.submit_test().await.expect("submit");
    let test_id = init.test_id;
    storage.seed_feature_tree("probe-tests", test_id);

    // Cancel right after start; whatever state the test reached, it must
    // wind down without uploading evidence
    handle
        .start_test(test_id, "probe-tests", None)
        .await
        .expect("start");
    let cancel = handle.cancel_test(test_id).await.expect("cancel");
    assert!(cancel.cancelled);

    wait_for("registry teardown", || {
        let handle = handle.clone();
        Box::pin(async move {
            matches!(
                handle.get_status(test_id).await,
                Err(ServiceError::NotFound(_))
            )
        })
    })
    .await;

    assert!(storage.evidence_keys("probe-tests", test_id).is_empty());
    let queue = handle.queue_status(None).await.expect("queue status");
    assert_eq!(queue.completed_count, 0);
    assert_eq!(queue.currently_testing, None);
}

#[tokio::test]
async fn missing_upload_surfaces_as_block_storage_exception() {
    let storage = MemoryStorage::default();
    let handle = boot(storage.clone());

    let init = handle.submit_test().await.expect("submit");
    let test_id = init.test_id;

    // Start without uploading anything: loading must fail
    handle
        .start_test(test_id, "probe-tests", None)
        .await
        .expect("start");

    wait_for("exception state", || {
        let handle = handle.clone();
        Box::pin(async move {
            match handle.get_status(test_id).await {
                Ok(status) if status.state == TestState::Exception => {
                    let error = status.error.expect("error detail");
                    assert_eq!(error.kind, "BlockStorage");
                    true
                }
                Ok(_) => false,
                // Already torn down after the cleanup timer
                Err(ServiceError::NotFound(_)) => true,
                Err(other) => panic!("status failed: {other}"),
            }
        })
    })
    .await;
}
