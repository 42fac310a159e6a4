//! Message log plumbing: the wire schema shared by the three topics and the
//! producer/consumer wrappers the pipeline uses.

pub mod consumer;
pub mod message;
pub mod producer;

pub use consumer::LogConsumer;
pub use message::{
    DeadLetterMessage, DispatchMessage, HEADER_IDEMPOTENCY_KEY, HEADER_NOT_BEFORE,
    HEADER_PRIORITY, HEADER_PRODUCER_FAILURE, HEADER_RETRY_COUNT, HEADER_SCHEMA_VERSION,
    SCHEMA_VERSION, TOPIC_DLQ, TOPIC_MAIN, TOPIC_RETRY,
};
pub use producer::LogProducer;
