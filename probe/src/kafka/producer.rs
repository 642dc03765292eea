use std::sync::Arc;

use metrics::counter;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::config::KafkaConfig;
use crate::directory::StreamDirectory;
use crate::error::ProduceError;
use crate::kafka::{base_client_config, ProbeKafkaContext, CORRELATION_ID_HEADER};
use crate::schema_registry::SchemaRegistryCodec;
use crate::types::{EventEnvelope, KafkaSecurityDirective, TestId};

pub enum ProducerCmd {
    Produce {
        envelope: EventEnvelope,
        reply: oneshot::Sender<Result<(), ProduceError>>,
    },
    Stop,
}

/// One producer stream per topic. Each `Produce` materializes a single
/// event through encode and publish; failures are returned to the caller
/// and never terminate the worker. OAuth tokens have multi-hour TTLs and
/// the underlying connection is pooled by librdkafka, so per-event
/// dispatch is cheap at this system's throughput.
pub struct ProducerWorker {
    test_id: TestId,
    topic: String,
    producer: FutureProducer<ProbeKafkaContext>,
    codec: Arc<SchemaRegistryCodec>,
}

impl ProducerWorker {
    pub fn new(
        test_id: TestId,
        security: &KafkaSecurityDirective,
        config: &KafkaConfig,
        codec: Arc<SchemaRegistryCodec>,
    ) -> Result<Self, ProduceError> {
        let mut client_config = base_client_config(config, security);
        client_config
            .set("linger.ms", config.kafka_producer_linger_ms.to_string())
            .set(
                "message.timeout.ms",
                config.kafka_message_timeout_ms.to_string(),
            )
            .set(
                "compression.codec",
                config.kafka_compression_codec.to_owned(),
            )
            .set(
                "queue.buffering.max.kbytes",
                (config.kafka_producer_queue_mib * 1024).to_string(),
            );

        let producer: FutureProducer<ProbeKafkaContext> = client_config
            .create_with_context(ProbeKafkaContext)
            .map_err(|e| ProduceError::Client(e.to_string()))?;

        Ok(Self {
            test_id,
            topic: security.topic.clone(),
            producer,
            codec,
        })
    }

    pub async fn run(
        self,
        mut commands: mpsc::UnboundedReceiver<ProducerCmd>,
        directory: Arc<StreamDirectory>,
    ) {
        info!(test_id = %self.test_id, topic = %self.topic, "producer stream up");
        while let Some(cmd) = commands.recv().await {
            match cmd {
                ProducerCmd::Produce { envelope, reply } => {
                    let outcome = self.produce_one(envelope).await;
                    if let Err(err) = &outcome {
                        counter!("probe_producer_nacks_total", "topic" => self.topic.clone())
                            .increment(1);
                        debug!(test_id = %self.test_id, topic = %self.topic, "produce nack: {err}");
                    } else {
                        counter!("probe_producer_acks_total", "topic" => self.topic.clone())
                            .increment(1);
                    }
                    _ = reply.send(outcome);
                }
                ProducerCmd::Stop => break,
            }
        }
        directory.deregister_producer(self.test_id, &self.topic);
        info!(test_id = %self.test_id, topic = %self.topic, "producer stream down");
    }

    async fn produce_one(&self, envelope: EventEnvelope) -> Result<(), ProduceError> {
        let payload = self
            .codec
            .encode(&self.topic, &envelope.value)
            .await
            .map_err(|e| ProduceError::Encode(e.to_string()))?;

        let mut headers = OwnedHeaders::new().insert(Header {
            key: CORRELATION_ID_HEADER,
            value: Some(envelope.correlation_id.as_str()),
        });
        for (key, value) in &envelope.headers {
            headers = headers.insert(Header {
                key: key.as_str(),
                value: Some(value.as_str()),
            });
        }

        let mut record = FutureRecord::<[u8], [u8]>::to(self.topic.as_str())
            .payload(payload.as_slice())
            .headers(headers);
        if !envelope.key.is_empty() {
            record = record.key(envelope.key.as_ref());
        }

        let delivery = match self.producer.send_result(record) {
            Ok(delivery) => delivery,
            Err((err, _)) => return Err(ProduceError::Publish(err.to_string())),
        };
        match delivery.await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err((err, _))) => Err(ProduceError::Publish(err.to_string())),
            Err(_) => Err(ProduceError::Publish(
                "delivery canceled before broker ack".to_string(),
            )),
        }
    }
}
