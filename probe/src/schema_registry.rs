use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use reqwest::StatusCode;
use serde::Deserialize;
use url::Url;

use crate::error::CodecError;

/// Leading byte of the Confluent wire format: `<magic><schema id><payload>`.
pub const WIRE_MAGIC: u8 = 0;
const WIRE_HEADER_LEN: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaType {
    Avro,
    Protobuf,
    Json,
}

impl SchemaType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SchemaType::Avro => "AVRO",
            SchemaType::Protobuf => "PROTOBUF",
            SchemaType::Json => "JSON",
        }
    }

    /// The registry omits `schemaType` for Avro subjects, so absence means
    /// Avro. Anything else is normalized to uppercase before matching.
    fn from_registry(raw: Option<&str>) -> Result<Self, CodecError> {
        let Some(raw) = raw else {
            return Ok(SchemaType::Avro);
        };
        match raw.to_uppercase().as_ref() {
            "AVRO" => Ok(SchemaType::Avro),
            "PROTOBUF" => Ok(SchemaType::Protobuf),
            "JSON" => Ok(SchemaType::Json),
            other => Err(CodecError::Registry(format!(
                "registry returned unsupported schema type {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegisteredSchema {
    pub id: u32,
    pub schema_type: SchemaType,
}

/// The slice of the Schema Registry REST surface the codec needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SchemaRegistryApi: Send + Sync {
    /// Latest registered schema for a subject. A subject without any
    /// version must surface as `CodecError::SchemaNotFound`.
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, CodecError>;
}

pub struct RestSchemaRegistry {
    http: reqwest::Client,
    base: Url,
}

impl RestSchemaRegistry {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let mut base = Url::parse(base_url)?;
        if !base.path().ends_with('/') {
            base.set_path(&format!("{}/", base.path()));
        }
        Ok(Self {
            http: reqwest::Client::new(),
            base,
        })
    }
}

#[derive(Deserialize)]
struct SubjectVersionResponse {
    id: u32,
    #[serde(rename = "schemaType")]
    schema_type: Option<String>,
}

#[async_trait]
impl SchemaRegistryApi for RestSchemaRegistry {
    async fn latest(&self, subject: &str) -> Result<RegisteredSchema, CodecError> {
        let url = self
            .base
            .join(&format!("subjects/{subject}/versions/latest"))
            .map_err(|e| CodecError::Registry(e.to_string()))?;
        let response = self
            .http
            .get(url)
            .send()
            .await
            .map_err(|e| CodecError::Registry(e.to_string()))?;

        match response.status() {
            StatusCode::OK => {
                let body: SubjectVersionResponse = response
                    .json()
                    .await
                    .map_err(|e| CodecError::Registry(e.to_string()))?;
                Ok(RegisteredSchema {
                    id: body.id,
                    schema_type: SchemaType::from_registry(body.schema_type.as_deref())?,
                })
            }
            StatusCode::NOT_FOUND => Err(CodecError::SchemaNotFound(subject.to_string())),
            status => Err(CodecError::Registry(format!(
                "registry returned {status} for subject {subject}"
            ))),
        }
    }
}

/// Record value stripped of its wire-format frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    pub schema_id: u32,
    pub payload: Bytes,
}

/// Wire-format encoder/decoder over a Schema Registry client.
///
/// Avro and Protobuf payloads arrive pre-serialized against the registered
/// schema; the codec's job is subject resolution, type dispatch, framing and
/// error classification. JSON payloads are additionally validated by parsing.
pub struct SchemaRegistryCodec {
    api: Arc<dyn SchemaRegistryApi>,
    subjects: DashMap<String, RegisteredSchema>,
}

static CODEC: OnceCell<Arc<SchemaRegistryCodec>> = OnceCell::new();

/// Publishes the process-wide codec. Called once at boot, before the
/// scheduler accepts any work.
pub fn initialize(api: Arc<dyn SchemaRegistryApi>) -> Result<(), CodecError> {
    CODEC
        .set(Arc::new(SchemaRegistryCodec::new(api)))
        .map_err(|_| CodecError::Registry("schema registry codec initialized twice".to_string()))
}

/// The process-wide codec, resolved by the streaming pools when they build
/// their workers; fails fast before `initialize` has run.
pub fn global() -> Result<Arc<SchemaRegistryCodec>, CodecError> {
    CODEC.get().cloned().ok_or(CodecError::NotInitialized)
}

impl SchemaRegistryCodec {
    pub fn new(api: Arc<dyn SchemaRegistryApi>) -> Self {
        Self {
            api,
            subjects: DashMap::new(),
        }
    }

    pub fn subject_for_topic(topic: &str) -> String {
        format!("{topic}-value")
    }

    async fn resolve(&self, subject: &str) -> Result<RegisteredSchema, CodecError> {
        if let Some(found) = self.subjects.get(subject) {
            return Ok(found.clone());
        }
        let schema = self.api.latest(subject).await?;
        self.subjects.insert(subject.to_string(), schema.clone());
        Ok(schema)
    }

    pub async fn schema_type_for_subject(&self, subject: &str) -> Result<SchemaType, CodecError> {
        Ok(self.resolve(subject).await?.schema_type)
    }

    /// Frames `payload` for the topic's value subject.
    pub async fn encode(&self, topic: &str, payload: &[u8]) -> Result<Vec<u8>, CodecError> {
        let subject = Self::subject_for_topic(topic);
        let schema = self.resolve(&subject).await?;
        if schema.schema_type == SchemaType::Json {
            serde_json::from_slice::<serde::de::IgnoredAny>(payload).map_err(|e| {
                CodecError::Serialization {
                    subject: subject.clone(),
                    detail: e.to_string(),
                }
            })?;
        }

        let mut framed = Vec::with_capacity(WIRE_HEADER_LEN + payload.len());
        framed.push(WIRE_MAGIC);
        framed.extend_from_slice(&schema.id.to_be_bytes());
        framed.extend_from_slice(payload);
        Ok(framed)
    }

    /// Strips and validates the frame of a consumed record.
    pub async fn decode(&self, topic: &str, raw: &[u8]) -> Result<DecodedRecord, CodecError> {
        if raw.len() < WIRE_HEADER_LEN {
            return Err(CodecError::BadFrame("record shorter than the frame header"));
        }
        if raw[0] != WIRE_MAGIC {
            return Err(CodecError::BadFrame("unknown magic byte"));
        }
        let schema_id = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        let payload = &raw[WIRE_HEADER_LEN..];

        let subject = Self::subject_for_topic(topic);
        let schema = self.resolve(&subject).await?;
        if schema.schema_type == SchemaType::Json {
            serde_json::from_slice::<serde::de::IgnoredAny>(payload).map_err(|e| {
                CodecError::Serialization {
                    subject,
                    detail: e.to_string(),
                }
            })?;
        }

        Ok(DecodedRecord {
            schema_id,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}
