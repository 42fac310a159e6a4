//! Counter and gauge names emitted through the `metrics` facade. The core
//! installs no exporter; the deployment wires one (or none) at the edge.

/// Dispatch outcomes per channel: outcome ∈ {sent, transient_error,
/// permanent_error, timeout, dropped}.
pub const DISPATCH_TOTAL: &str = "dispatch_total";
/// Messages routed to the retry topic.
pub const RETRIES_TOTAL: &str = "retries_total";
/// DLQ admissions, labelled by reason.
pub const DLQ_TOTAL: &str = "dlq_total";
/// Circuit breaker transitions, labelled by provider and target state.
pub const BREAKER_TRANSITIONS_TOTAL: &str = "circuit_breaker_transitions_total";
/// Ingestion results: result ∈ {accepted, replayed, conflict, invalid}.
pub const INGEST_TOTAL: &str = "ingest_total";
/// Scheduled rows advanced to PENDING.
pub const SCHEDULER_ADVANCED_TOTAL: &str = "scheduler_advanced_total";
/// Stuck PENDING rows republished by the recovery sweep.
pub const SCHEDULER_RECOVERED_TOTAL: &str = "scheduler_recovered_total";
/// In-flight dispatches across the process; the drain loop polls this.
pub const WORKER_INFLIGHT: &str = "worker_inflight_dispatches";
/// Consumer lag per topic-partition, from librdkafka statistics.
pub const CONSUMER_LAG: &str = "consumer_lag";

pub fn dispatch(channel: &str, outcome: &'static str) {
    metrics::counter!(DISPATCH_TOTAL, "channel" => channel.to_string(), "outcome" => outcome)
        .increment(1);
}

pub fn retry_enqueued() {
    metrics::counter!(RETRIES_TOTAL).increment(1);
}

pub fn dlq(reason: &'static str) {
    metrics::counter!(DLQ_TOTAL, "reason" => reason).increment(1);
}

pub fn breaker_transition(provider: &str, to: &'static str) {
    metrics::counter!(BREAKER_TRANSITIONS_TOTAL, "provider" => provider.to_string(), "to" => to)
        .increment(1);
}

pub fn ingest(result: &'static str) {
    metrics::counter!(INGEST_TOTAL, "result" => result).increment(1);
}

pub fn inflight(current: usize) {
    metrics::gauge!(WORKER_INFLIGHT).set(current as f64);
}
