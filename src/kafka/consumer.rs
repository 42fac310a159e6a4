use chrono::{DateTime, Utc};
use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, ConsumerContext, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::statistics::Statistics;

use crate::config::KafkaConfig;
use crate::kafka::message::{DispatchMessage, HEADER_NOT_BEFORE};

/// Client context that forwards librdkafka statistics into the metrics
/// sink. Consumer lag per topic-partition is observed here rather than
/// polled.
pub struct StatsContext;

impl ClientContext for StatsContext {
    fn stats(&self, statistics: Statistics) {
        for (topic, topic_stats) in &statistics.topics {
            for partition_stats in topic_stats.partitions.values() {
                if partition_stats.consumer_lag >= 0 {
                    metrics::gauge!(
                        crate::metrics::CONSUMER_LAG,
                        "topic" => topic.clone(),
                        "partition" => partition_stats.partition.to_string()
                    )
                    .set(partition_stats.consumer_lag as f64);
                }
            }
        }
    }
}

impl ConsumerContext for StatsContext {}

/// Thin wrapper over a Kafka stream consumer with auto-commit disabled.
///
/// Offsets are committed per message, only after the terminal step for that
/// message (ack, drop, or retry-router hand-off). `commit_message` records
/// the position after the message, so a restart resumes without duplicates.
pub struct LogConsumer {
    inner: StreamConsumer<StatsContext>,
}

impl LogConsumer {
    pub fn new(config: &KafkaConfig, topics: &[&str]) -> Result<LogConsumer, KafkaError> {
        let inner: StreamConsumer<StatsContext> = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("group.id", &config.consumer_group)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("enable.partition.eof", "false")
            .set("statistics.interval.ms", "5000")
            .create_with_context(StatsContext)?;
        inner.subscribe(topics)?;
        Ok(LogConsumer { inner })
    }

    /// Wait for the next message on any assigned partition.
    pub async fn recv(&self) -> Result<BorrowedMessage<'_>, KafkaError> {
        self.inner.recv().await
    }

    /// Decode the JSON body into the log message schema.
    pub fn parse(msg: &BorrowedMessage<'_>) -> Option<DispatchMessage> {
        let payload = msg.payload()?;
        match serde_json::from_slice(payload) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::error!(
                    topic = msg.topic(),
                    partition = msg.partition(),
                    offset = msg.offset(),
                    "Undecodable log message: {}",
                    e
                );
                None
            }
        }
    }

    /// Read a UTF-8 header value.
    pub fn header(msg: &BorrowedMessage<'_>, name: &str) -> Option<String> {
        let headers = msg.headers()?;
        headers.iter().find_map(|h| {
            if h.key == name {
                h.value
                    .and_then(|v| std::str::from_utf8(v).ok())
                    .map(|s| s.to_string())
            } else {
                None
            }
        })
    }

    /// The retry-topic delivery gate, when present.
    pub fn delivery_not_before(msg: &BorrowedMessage<'_>) -> Option<DateTime<Utc>> {
        Self::header(msg, HEADER_NOT_BEFORE)
            .and_then(|v| DateTime::parse_from_rfc3339(&v).ok())
            .map(|t| t.with_timezone(&Utc))
    }

    /// Commit the position after this message. Called only once the message
    /// reached its terminal step.
    pub fn commit(&self, msg: &BorrowedMessage<'_>) -> Result<(), KafkaError> {
        self.inner.commit_message(msg, CommitMode::Async)
    }
}
