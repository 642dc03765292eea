use serde::Serialize;
use time::OffsetDateTime;

use crate::types::{EventEnvelope, TestExecutionResult, TestId, TestState};

/// Reply to `Submit`: the allocated id plus a hint telling the caller
/// where to upload the feature tree before calling `Start`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResponse {
    pub test_id: TestId,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StartResponse {
    pub test_id: TestId,
    pub accepted: bool,
    pub message: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub test_id: TestId,
    pub cancelled: bool,
}

/// Sanitized error surfaced on the status endpoint: an error-kind label
/// and a message guaranteed free of credential material.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatusError {
    pub kind: String,
    pub message: String,
}

/// Point-in-time snapshot of one test, synthesized by its FSM without a
/// state transition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestStatus {
    pub test_id: TestId,
    pub state: TestState,
    pub bucket: Option<String>,
    pub test_type: Option<String>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_request_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub start_time: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub end_time: Option<OffsetDateTime>,
    pub success: Option<bool>,
    pub error: Option<TestStatusError>,
    pub result: Option<TestExecutionResult>,
    pub evidence_key: Option<String>,
}

/// Aggregate queue view. Per-state counts cover live registrations;
/// `total_tests`, `completed_count` and `exception_count` are lifetime
/// counters that survive entry teardown.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatusResponse {
    pub total_tests: u64,
    pub setup: usize,
    pub loading: usize,
    pub loaded: usize,
    pub testing: usize,
    pub shutting_down: usize,
    pub completed_count: u64,
    pub exception_count: u64,
    pub currently_testing: Option<TestId>,
}

/// Outcome of one `produce_event` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerResult {
    Acked,
    Nacked { detail: String },
}

/// Outcome of one `fetch_consumed_event` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchResult {
    Ack(EventEnvelope),
    Nack,
    TimedOut,
}
