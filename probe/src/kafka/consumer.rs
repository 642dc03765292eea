use std::collections::HashMap;
use std::sync::Arc;

use metrics::counter;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Headers, OwnedMessage};
use rdkafka::Message;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::config::KafkaConfig;
use crate::directory::StreamDirectory;
use crate::error::ConsumeError;
use crate::kafka::{
    base_client_config, ProbeKafkaContext, CORRELATION_ID_HEADER, EVENT_TYPE_HEADER,
    EVENT_VERSION_HEADER,
};
use crate::schema_registry::SchemaRegistryCodec;
use crate::types::{EventEnvelope, EventFilter, KafkaSecurityDirective, TestId};

/// Offsets are committed in batches of this size; whatever is pending when
/// the worker stops is abandoned. Per-test-unique group ids make the
/// bounded re-consumption on a rerun harmless.
pub const COMMIT_BATCH_SIZE: usize = 20;

const DECODE_WARN_REASON_LIMIT: usize = 120;

pub enum ConsumerCmd {
    Fetch {
        correlation_id: String,
        reply: oneshot::Sender<Option<EventEnvelope>>,
    },
    Stop,
}

/// Envelopes that arrived, decoded and passed filtering, keyed by
/// correlation id. Fetches do not remove entries; a scenario may assert on
/// the same event several times. No eviction; the registry lives exactly as
/// long as its worker.
#[derive(Default)]
pub struct ConsumerRegistry {
    events: HashMap<String, EventEnvelope>,
}

impl ConsumerRegistry {
    pub fn insert(&mut self, envelope: EventEnvelope) {
        self.events
            .insert(envelope.correlation_id.clone(), envelope);
    }

    pub fn get(&self, correlation_id: &str) -> Option<&EventEnvelope> {
        self.events.get(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// One consumer stream per topic: subscribe, decode, filter, register.
/// A record that fails to decode is logged and skipped; it never takes the
/// stream down.
pub struct ConsumerWorker {
    test_id: TestId,
    topic: String,
    filters: Vec<EventFilter>,
    consumer: StreamConsumer<ProbeKafkaContext>,
    codec: Arc<SchemaRegistryCodec>,
    registry: ConsumerRegistry,
    uncommitted: usize,
}

impl ConsumerWorker {
    pub fn new(
        test_id: TestId,
        security: &KafkaSecurityDirective,
        filters: Vec<EventFilter>,
        config: &KafkaConfig,
        codec: Arc<SchemaRegistryCodec>,
    ) -> Result<Self, ConsumeError> {
        let topic = security.topic.clone();
        let mut client_config = base_client_config(config, security);
        client_config
            .set("group.id", group_id(test_id, &topic))
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("auto.offset.reset", "earliest");

        let consumer: StreamConsumer<ProbeKafkaContext> = client_config
            .create_with_context(ProbeKafkaContext)
            .map_err(|e| ConsumeError::Client(e.to_string()))?;
        consumer
            .subscribe(&[topic.as_str()])
            .map_err(|e| ConsumeError::Subscribe {
                topic: topic.clone(),
                detail: e.to_string(),
            })?;

        Ok(Self {
            test_id,
            topic,
            filters,
            consumer,
            codec,
            registry: ConsumerRegistry::default(),
            uncommitted: 0,
        })
    }

    pub async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<ConsumerCmd>,
        directory: Arc<StreamDirectory>,
    ) {
        info!(test_id = %self.test_id, topic = %self.topic, "consumer stream up");
        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(ConsumerCmd::Fetch { correlation_id, reply }) => {
                        _ = reply.send(self.registry.get(&correlation_id).cloned());
                    }
                    Some(ConsumerCmd::Stop) | None => break,
                },
                received = self.consumer.recv() => match received {
                    Ok(message) => {
                        let owned = message.detach();
                        drop(message);
                        self.absorb(owned).await;
                    }
                    Err(err) => {
                        warn!(test_id = %self.test_id, topic = %self.topic, "consumer poll error: {err}");
                    }
                },
            }
        }
        // The test is over; pending offsets are intentionally abandoned
        directory.deregister_consumer(self.test_id, &self.topic);
        info!(test_id = %self.test_id, topic = %self.topic, "consumer stream down");
    }

    /// Handles one received record: track its offset, decode, filter, and
    /// index by correlation id.
    async fn absorb(&mut self, message: OwnedMessage) {
        self.track_offset(message.partition(), message.offset());

        let Some(payload) = message.payload() else {
            warn!(test_id = %self.test_id, topic = %self.topic, "skipping record with empty payload");
            return;
        };
        let decoded = match self.codec.decode(&self.topic, payload).await {
            Ok(decoded) => decoded,
            Err(err) => {
                let reason: String = err.to_string().chars().take(DECODE_WARN_REASON_LIMIT).collect();
                warn!(test_id = %self.test_id, topic = %self.topic, "skipping undecodable record: {reason}");
                counter!("probe_consumer_decode_failures_total", "topic" => self.topic.clone())
                    .increment(1);
                return;
            }
        };

        let headers = header_map(&message);
        if !passes_filters(&headers, &self.filters) {
            return;
        }
        let Some(correlation_id) = correlation_of(&headers, message.key()) else {
            warn!(test_id = %self.test_id, topic = %self.topic, "skipping record without correlation id");
            return;
        };

        counter!("probe_consumer_events_registered_total", "topic" => self.topic.clone())
            .increment(1);
        self.registry.insert(EventEnvelope {
            correlation_id,
            key: message.key().map(bytes::Bytes::copy_from_slice).unwrap_or_default(),
            value: decoded.payload,
            headers,
        });
    }

    fn track_offset(&mut self, partition: i32, offset: i64) {
        if let Err(err) = self.consumer.store_offset(&self.topic, partition, offset) {
            warn!(test_id = %self.test_id, topic = %self.topic, "failed to store offset: {err}");
        }
        self.uncommitted += 1;
        if self.uncommitted >= COMMIT_BATCH_SIZE {
            if let Err(err) = self.consumer.commit_consumer_state(CommitMode::Async) {
                warn!(test_id = %self.test_id, topic = %self.topic, "offset commit failed: {err}");
            }
            self.uncommitted = 0;
        }
    }
}

pub(crate) fn group_id(test_id: TestId, topic: &str) -> String {
    format!("probe-{test_id}-{topic}")
}

fn header_map(message: &OwnedMessage) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value {
                map.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }
    map
}

/// An empty filter list keeps everything; otherwise the record's
/// `(event-type, event-version)` headers must match one configured pair.
fn passes_filters(headers: &HashMap<String, String>, filters: &[EventFilter]) -> bool {
    if filters.is_empty() {
        return true;
    }
    let Some(event_type) = headers.get(EVENT_TYPE_HEADER) else {
        return false;
    };
    let Some(version) = headers.get(EVENT_VERSION_HEADER) else {
        return false;
    };
    filters
        .iter()
        .any(|f| &f.event_type == event_type && &f.version == version)
}

/// The correlation-id header wins; a record without it falls back to its
/// key, which covers producers that key by entity id.
fn correlation_of(headers: &HashMap<String, String>, key: Option<&[u8]>) -> Option<String> {
    if let Some(correlation_id) = headers.get(CORRELATION_ID_HEADER) {
        return Some(correlation_id.clone());
    }
    let key = key?;
    if key.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(key).into_owned())
}
