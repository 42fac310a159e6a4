use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;

use crate::config::KafkaConfig;
use crate::kafka::message::{
    DeadLetterMessage, DispatchMessage, HEADER_IDEMPOTENCY_KEY, HEADER_NOT_BEFORE,
    HEADER_PRIORITY, HEADER_PRODUCER_FAILURE, HEADER_RETRY_COUNT, HEADER_SCHEMA_VERSION,
    TOPIC_DLQ, TOPIC_MAIN, TOPIC_RETRY,
};

/// Thin wrapper over the Kafka producer that owns the topic names, the
/// required header set, and the publish timeout.
#[derive(Clone)]
pub struct LogProducer {
    inner: FutureProducer,
    timeout: Duration,
}

impl LogProducer {
    pub fn new(config: &KafkaConfig) -> Result<LogProducer, KafkaError> {
        let inner: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.publish_timeout_ms.to_string())
            .set("acks", "all")
            .create()?;
        Ok(LogProducer {
            inner,
            timeout: Duration::from_millis(config.publish_timeout_ms),
        })
    }

    fn base_headers(msg: &DispatchMessage) -> OwnedHeaders {
        OwnedHeaders::new()
            .insert(Header {
                key: HEADER_SCHEMA_VERSION,
                value: Some(&msg.schema_version.to_string()),
            })
            .insert(Header {
                key: HEADER_IDEMPOTENCY_KEY,
                value: Some(&msg.idempotency_key),
            })
            .insert(Header {
                key: HEADER_PRIORITY,
                value: Some(msg.priority.as_str()),
            })
            .insert(Header {
                key: HEADER_RETRY_COUNT,
                value: Some(&msg.retry_count.to_string()),
            })
    }

    async fn send(
        &self,
        topic: &str,
        key: &str,
        body: Vec<u8>,
        headers: OwnedHeaders,
    ) -> Result<(i32, i64), KafkaError> {
        let record = FutureRecord::to(topic)
            .key(key)
            .payload(&body)
            .headers(headers);
        self.inner
            .send(record, Timeout::After(self.timeout))
            .await
            .map_err(|(e, _msg)| e)
    }

    /// Publish to the main work topic, key = `user_id`.
    pub async fn publish_main(&self, msg: &DispatchMessage) -> Result<(i32, i64), KafkaError> {
        let body = serde_json::to_vec(msg).map_err(|_| KafkaError::MessageProduction(
            rdkafka::types::RDKafkaErrorCode::BadMessage,
        ))?;
        self.send(TOPIC_MAIN, &msg.user_id, body, Self::base_headers(msg))
            .await
    }

    /// Publish to the retry topic with the `delivery-not-before` gate.
    /// `producer_failure` marks the fallback publish ingestion makes when the
    /// main-topic publish failed.
    pub async fn publish_retry(
        &self,
        msg: &DispatchMessage,
        not_before: DateTime<Utc>,
        producer_failure: bool,
    ) -> Result<(i32, i64), KafkaError> {
        let body = serde_json::to_vec(msg).map_err(|_| KafkaError::MessageProduction(
            rdkafka::types::RDKafkaErrorCode::BadMessage,
        ))?;
        let not_before_value = not_before.to_rfc3339_opts(SecondsFormat::Millis, true);
        let mut headers = Self::base_headers(msg).insert(Header {
            key: HEADER_NOT_BEFORE,
            value: Some(&not_before_value),
        });
        if producer_failure {
            headers = headers.insert(Header {
                key: HEADER_PRODUCER_FAILURE,
                value: Some("true"),
            });
        }
        self.send(TOPIC_RETRY, &msg.user_id, body, headers).await
    }

    /// Publish a dead-letter envelope. The record must never vanish, so the
    /// caller treats an error here as its own terminal failure to log.
    pub async fn publish_dlq(&self, dead: &DeadLetterMessage) -> Result<(i32, i64), KafkaError> {
        let body = serde_json::to_vec(dead).map_err(|_| KafkaError::MessageProduction(
            rdkafka::types::RDKafkaErrorCode::BadMessage,
        ))?;
        let headers = Self::base_headers(&dead.original_message);
        self.send(TOPIC_DLQ, &dead.original_message.user_id, body, headers)
            .await
    }

    /// Flush outstanding deliveries; used during shutdown.
    pub fn flush(&self, timeout: Duration) -> Result<(), KafkaError> {
        self.inner.flush(Timeout::After(timeout))
    }
}
