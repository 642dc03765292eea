use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::types::TestId;

/// Feature download or evidence upload failed.
#[derive(Error, Debug, Clone)]
pub enum BlockStorageError {
    #[error("bucket {bucket} has no objects under {prefix}")]
    EmptyPrefix { bucket: String, prefix: String },
    #[error("object {0} not found")]
    NotFound(String),
    #[error("storage operation failed: {0}")]
    Operation(String),
    #[error("manifest.json is missing from the uploaded feature tree")]
    MissingManifest,
    #[error("failed to parse manifest.json: {0}")]
    Manifest(String),
    #[error("failed to assemble evidence archive: {0}")]
    Evidence(String),
}

/// Vault fetch or credential-mapping failure. Messages carry topic names,
/// status codes and mapping field names; never credential values.
#[derive(Error, Debug, Clone)]
pub enum VaultError {
    #[error("vault request for topic {topic} failed with status {status}")]
    Http { topic: String, status: u16 },
    #[error("vault request for topic {topic} failed: {detail}")]
    Transport { topic: String, detail: String },
    #[error("credential mapping failed for field {field}")]
    Mapping { field: String },
    #[error("credential mapping file is invalid: {0}")]
    MappingFile(String),
    #[error("vault client is misconfigured: {0}")]
    Config(String),
}

/// Schema-registry codec failures, classified so producer and consumer
/// workers can tell a missing subject from a transport problem.
#[derive(Error, Debug, Clone)]
pub enum CodecError {
    #[error("schema registry codec is not initialized")]
    NotInitialized,
    #[error("404/schema_not_found: no schema registered for subject {0}")]
    SchemaNotFound(String),
    #[error("serialization failed for subject {subject}: {detail}")]
    Serialization { subject: String, detail: String },
    #[error("schema registry request failed: {0}")]
    Registry(String),
    #[error("record is not in schema registry wire format: {0}")]
    BadFrame(&'static str),
}

/// The BDD runner could not be configured. Failures of the scenarios
/// themselves are not errors; they travel inside a completed result.
#[derive(Error, Debug, Clone)]
pub enum BddError {
    #[error("no feature files found under {0}")]
    NoFeatures(String),
    #[error("bdd engine failed: {0}")]
    Engine(String),
}

/// Per-event producer failure, returned to the caller as a nack. The
/// producer stream itself keeps running.
#[derive(Error, Debug, Clone)]
pub enum ProduceError {
    #[error("failed to encode event: {0}")]
    Encode(String),
    #[error("failed to publish event: {0}")]
    Publish(String),
    #[error("producer client could not be created: {0}")]
    Client(String),
}

/// Consumer worker start-up failure. Per-record decode failures are not
/// errors at this level; they are logged and skipped inside the stream.
#[derive(Error, Debug, Clone)]
pub enum ConsumeError {
    #[error("failed to create consumer client: {0}")]
    Client(String),
    #[error("failed to subscribe to {topic}: {detail}")]
    Subscribe { topic: String, detail: String },
}

/// Errors surfaced through the public DSL.
#[derive(Error, Debug, Clone)]
pub enum ServiceError {
    #[error("test {0} is not registered")]
    NotFound(TestId),
    #[error("no stream registered for test {test_id} on topic {topic}")]
    NotRegistered { test_id: TestId, topic: String },
    #[error("reply timed out after {0:?}")]
    Timeout(Duration),
    #[error("service is shutting down or not booted")]
    Unavailable,
    #[error("scheduler is not ready yet")]
    NotReady,
    #[error("test queue is at capacity")]
    QueueFull,
}

/// Coarse classification of what took a test to the `Exception` state,
/// surfaced by the status endpoint alongside a sanitized message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureKind {
    BlockStorage,
    Vault,
    Bdd,
    Producer,
    Consumer,
    Internal,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::BlockStorage => "BlockStorage",
            FailureKind::Vault => "Vault",
            FailureKind::Bdd => "Bdd",
            FailureKind::Producer => "Producer",
            FailureKind::Consumer => "Consumer",
            FailureKind::Internal => "Internal",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl TestFailure {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Internal,
            message: message.into(),
        }
    }
}

impl From<BlockStorageError> for TestFailure {
    fn from(err: BlockStorageError) -> Self {
        Self {
            kind: FailureKind::BlockStorage,
            message: err.to_string(),
        }
    }
}

impl From<VaultError> for TestFailure {
    fn from(err: VaultError) -> Self {
        Self {
            kind: FailureKind::Vault,
            message: err.to_string(),
        }
    }
}

impl From<BddError> for TestFailure {
    fn from(err: BddError) -> Self {
        Self {
            kind: FailureKind::Bdd,
            message: err.to_string(),
        }
    }
}

impl From<ProduceError> for TestFailure {
    fn from(err: ProduceError) -> Self {
        Self {
            kind: FailureKind::Producer,
            message: err.to_string(),
        }
    }
}

impl From<ConsumeError> for TestFailure {
    fn from(err: ConsumeError) -> Self {
        Self {
            kind: FailureKind::Consumer,
            message: err.to_string(),
        }
    }
}
