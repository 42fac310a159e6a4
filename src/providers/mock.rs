use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::providers::{DispatchContext, ProviderAck, ProviderAdapter, ProviderError};

/// Scripted outcome for one dispatch attempt.
#[derive(Debug, Clone)]
pub enum MockOutcome {
    Ack(String),
    Transient(String),
    Permanent(String),
    Timeout(String),
}

/// In-memory adapter for tests. Plays back a script of outcomes and records
/// every dispatch it receives; once the script is exhausted it keeps acking.
pub struct MockAdapter {
    name: String,
    script: Mutex<VecDeque<MockOutcome>>,
    calls: Mutex<Vec<DispatchContext>>,
}

impl MockAdapter {
    pub fn new(name: &str) -> MockAdapter {
        MockAdapter {
            name: name.to_string(),
            script: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn script(self, outcomes: impl IntoIterator<Item = MockOutcome>) -> MockAdapter {
        if let Ok(mut s) = self.script.lock() {
            s.extend(outcomes);
        }
        self
    }

    pub fn push_outcome(&self, outcome: MockOutcome) {
        if let Ok(mut s) = self.script.lock() {
            s.push_back(outcome);
        }
    }

    /// Number of dispatch calls observed so far.
    pub fn call_count(&self) -> usize {
        self.calls.lock().map(|c| c.len()).unwrap_or(0)
    }

    /// Snapshot of the recorded dispatch contexts.
    pub fn calls(&self) -> Vec<DispatchContext> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, ctx: &DispatchContext) -> Result<ProviderAck, ProviderError> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(ctx.clone());
        }
        let outcome = self
            .script
            .lock()
            .ok()
            .and_then(|mut s| s.pop_front())
            .unwrap_or_else(|| MockOutcome::Ack(format!("mock-{}", ctx.notification_id)));

        match outcome {
            MockOutcome::Ack(id) => Ok(ProviderAck {
                provider_message_id: id,
                accepted_at: Utc::now(),
            }),
            MockOutcome::Transient(msg) => Err(ProviderError::transient(msg)),
            MockOutcome::Permanent(msg) => Err(ProviderError::permanent(msg)),
            MockOutcome::Timeout(msg) => Err(ProviderError::timeout(msg)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Channel;
    use uuid::Uuid;

    fn ctx() -> DispatchContext {
        DispatchContext {
            notification_id: Uuid::new_v4(),
            channel: Channel::Email,
            payload: serde_json::json!({"to": "a@b.c", "subject": "s", "body": "b"}),
            correlation_id: "corr".to_string(),
        }
    }

    #[tokio::test]
    async fn plays_back_script_then_acks() {
        let adapter = MockAdapter::new("email.primary").script([
            MockOutcome::Transient("flaky".to_string()),
            MockOutcome::Ack("m-1".to_string()),
        ]);

        let first = adapter.dispatch(&ctx()).await;
        assert!(first.is_err());
        let second = adapter.dispatch(&ctx()).await.unwrap();
        assert_eq!(second.provider_message_id, "m-1");
        let third = adapter.dispatch(&ctx()).await;
        assert!(third.is_ok(), "exhausted script defaults to ack");
        assert_eq!(adapter.call_count(), 3);
    }
}
