use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use uuid::Uuid;

use crate::db::models::Channel;
use crate::providers::{
    classify_status, validate_payload, DispatchContext, ErrorKind, ProviderAck, ProviderAdapter,
    ProviderError,
};

/// SMS gateway adapter.
pub struct SmsAdapter {
    name: String,
    endpoint: String,
    api_token: Option<String>,
    client: reqwest::Client,
}

impl SmsAdapter {
    pub fn new(
        name: &str,
        endpoint: String,
        api_token: Option<String>,
        timeout_ms: u64,
    ) -> SmsAdapter {
        SmsAdapter {
            name: name.to_string(),
            endpoint,
            api_token,
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for SmsAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, ctx: &DispatchContext) -> Result<ProviderAck, ProviderError> {
        validate_payload(Channel::Sms, &ctx.payload).map_err(ProviderError::permanent)?;

        let mut body = ctx.payload.clone();
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "notification_id".to_string(),
                serde_json::json!(ctx.notification_id),
            );
        }

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("X-Correlation-Id", &ctx.correlation_id)
            .json(&body);
        if let Some(token) = &self.api_token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::timeout(format!("sms gateway timed out: {e}"))
            } else {
                ProviderError::transient(format!("sms gateway unreachable: {e}"))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            let message_id = response
                .json::<serde_json::Value>()
                .await
                .ok()
                .and_then(|v| v.get("message_id").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| Uuid::new_v4().to_string());
            Ok(ProviderAck {
                provider_message_id: message_id,
                accepted_at: Utc::now(),
            })
        } else {
            let detail = response.text().await.unwrap_or_default();
            let message = format!("sms gateway returned {status}: {detail}");
            match classify_status(status) {
                ErrorKind::Permanent => Err(ProviderError::permanent(message)),
                _ => Err(ProviderError::transient(message)),
            }
        }
    }
}
