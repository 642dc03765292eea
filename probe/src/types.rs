use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a registered test. Allocated by the scheduler at
/// registration time, unique for the lifetime of the process, never reused.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TestId(Uuid);

impl TestId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl fmt::Debug for TestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for TestId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// Lifecycle states of a test, in the order a healthy run walks them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestState {
    Setup,
    Loading,
    Loaded,
    Testing,
    Completed,
    Exception,
    ShuttingDown,
}

impl TestState {
    /// Whether `next` is a legal forward transition from this state.
    /// Regressions and self-transitions are rejected, which is what makes
    /// state updates idempotent against out-of-order event delivery.
    pub fn may_advance_to(self, next: TestState) -> bool {
        use TestState as S;
        if self == next {
            return false;
        }
        match (self, next) {
            (S::ShuttingDown, _) => false,
            (_, S::Exception) => true,
            (_, S::ShuttingDown) => true,
            (S::Setup, S::Loading)
            | (S::Loading, S::Loaded)
            | (S::Loaded, S::Testing)
            | (S::Testing, S::Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TestState::Setup => "Setup",
            TestState::Loading => "Loading",
            TestState::Loaded => "Loaded",
            TestState::Testing => "Testing",
            TestState::Completed => "Completed",
            TestState::Exception => "Exception",
            TestState::ShuttingDown => "ShuttingDown",
        };
        f.write_str(name)
    }
}

/// Which side of a topic a test exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TopicRole {
    #[serde(rename = "PRODUCER")]
    Producer,
    #[serde(rename = "CONSUMER")]
    Consumer,
}

/// An `(eventType, version)` pair a consumer stream keeps; everything else
/// on the topic is dropped before it reaches the event registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventFilter {
    pub event_type: String,
    pub version: String,
}

/// One topic a test touches, parsed from the uploaded manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicDirective {
    pub topic: String,
    pub role: TopicRole,
    pub client_principal: String,
    #[serde(default)]
    pub event_filters: Vec<EventFilter>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityProtocol {
    Plaintext,
    SaslSsl,
}

impl SecurityProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SecurityProtocol::Plaintext => "PLAINTEXT",
            SecurityProtocol::SaslSsl => "SASL_SSL",
        }
    }
}

impl FromStr for SecurityProtocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_ref() {
            "PLAINTEXT" => Ok(SecurityProtocol::Plaintext),
            "SASL_SSL" => Ok(SecurityProtocol::SaslSsl),
            _ => Err(format!(
                "unknown security protocol: {s}, must be PLAINTEXT or SASL_SSL"
            )),
        }
    }
}

/// A value that must never reach a log line. `Debug` and `Display` both
/// print a fixed marker; the only way to the inner string is `expose()`,
/// which keeps accidental leaks greppable.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

/// OAuth client credentials extracted from a vault response. All four
/// fields are treated as secret material for logging purposes.
#[derive(Clone)]
pub struct OauthClientConfig {
    pub client_id: String,
    pub client_secret: Secret,
    pub token_endpoint: String,
    pub scope: Option<String>,
}

impl fmt::Debug for OauthClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OauthClientConfig").finish_non_exhaustive()
    }
}

/// Per-topic security settings handed to the Kafka client layer. The JAAS
/// line is the canonical serialization of the credentials; the structured
/// `oauth` fields are what librdkafka actually consumes.
#[derive(Clone)]
pub struct KafkaSecurityDirective {
    pub topic: String,
    pub role: TopicRole,
    pub protocol: SecurityProtocol,
    pub oauth: Option<OauthClientConfig>,
    pub jaas_config: Secret,
}

impl KafkaSecurityDirective {
    pub fn plaintext(topic: String, role: TopicRole) -> Self {
        Self {
            topic,
            role,
            protocol: SecurityProtocol::Plaintext,
            oauth: None,
            jaas_config: Secret::new(""),
        }
    }
}

impl fmt::Debug for KafkaSecurityDirective {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaSecurityDirective")
            .field("topic", &self.topic)
            .field("role", &self.role)
            .field("protocol", &self.protocol)
            .finish_non_exhaustive()
    }
}

/// In-memory record exchanged with BDD step code. `correlation_id` is the
/// lookup key the consumer registry indexes by; it is chosen by the test
/// author to match an identifier inside the event itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    pub correlation_id: String,
    pub key: Bytes,
    pub value: Bytes,
    pub headers: HashMap<String, String>,
}

impl EventEnvelope {
    pub fn new(correlation_id: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            key: Bytes::new(),
            value: value.into(),
            headers: HashMap::new(),
        }
    }
}

/// Structured outcome of one BDD run, as reported by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestExecutionResult {
    pub test_id: TestId,
    pub passed: bool,
    pub scenario_count: u32,
    pub scenarios_passed: u32,
    pub scenarios_failed: u32,
    pub scenarios_skipped: u32,
    pub step_count: u32,
    pub steps_passed: u32,
    pub steps_failed: u32,
    pub steps_skipped: u32,
    pub steps_undefined: u32,
    pub duration_millis: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_note: Option<String>,
}

impl TestExecutionResult {
    /// A result representing a run the engine could not carry to completion.
    pub fn aborted(test_id: TestId, duration_millis: u64, note: impl Into<String>) -> Self {
        Self {
            test_id,
            passed: false,
            scenario_count: 0,
            scenarios_passed: 0,
            scenarios_failed: 0,
            scenarios_skipped: 0,
            step_count: 0,
            steps_passed: 0,
            steps_failed: 0,
            steps_skipped: 0,
            steps_undefined: 0,
            duration_millis,
            error_note: Some(note.into()),
        }
    }
}
