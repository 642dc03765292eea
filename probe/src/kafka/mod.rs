use metrics::gauge;
use rdkafka::consumer::ConsumerContext;
use rdkafka::ClientConfig;

use crate::config::KafkaConfig;
use crate::types::{KafkaSecurityDirective, SecurityProtocol};

pub mod consumer;
pub mod producer;

/// Kafka record header carrying the correlation id the consumer registry
/// indexes by.
pub const CORRELATION_ID_HEADER: &str = "correlation-id";
/// Headers the event filters match against.
pub const EVENT_TYPE_HEADER: &str = "event-type";
pub const EVENT_VERSION_HEADER: &str = "event-version";

/// Client config shared by producers and consumers: bootstrap, stats and
/// the security settings from one test's credential directive. librdkafka
/// consumes the structured OIDC fields, not the JAAS line.
pub(crate) fn base_client_config(
    config: &KafkaConfig,
    security: &KafkaSecurityDirective,
) -> ClientConfig {
    let mut client_config = ClientConfig::new();
    client_config
        .set("bootstrap.servers", &config.kafka_hosts)
        .set("statistics.interval.ms", "10000");

    match security.protocol {
        SecurityProtocol::Plaintext => {
            client_config.set("security.protocol", "plaintext");
        }
        SecurityProtocol::SaslSsl => {
            client_config
                .set("security.protocol", "sasl_ssl")
                .set("sasl.mechanism", "OAUTHBEARER")
                .set("sasl.oauthbearer.method", "oidc");
            if let Some(oauth) = &security.oauth {
                client_config
                    .set("sasl.oauthbearer.client.id", &oauth.client_id)
                    .set("sasl.oauthbearer.client.secret", oauth.client_secret.expose())
                    .set("sasl.oauthbearer.token.endpoint.url", &oauth.token_endpoint);
                if let Some(scope) = &oauth.scope {
                    client_config.set("sasl.oauthbearer.scope", scope);
                }
            }
        }
    }
    client_config
}

/// Shared rdkafka client context: exports queue-depth gauges from the
/// statistics callback.
pub struct ProbeKafkaContext;

impl rdkafka::ClientContext for ProbeKafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("probe_kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("probe_kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("probe_kafka_producer_queue_bytes").set(stats.msg_size as f64);
    }
}

impl ConsumerContext for ProbeKafkaContext {}
