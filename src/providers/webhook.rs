use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;

use crate::db::models::Channel;
use crate::providers::{
    classify_status, validate_payload, DispatchContext, ErrorKind, ProviderAck, ProviderAdapter,
    ProviderError,
};

/// Webhook adapter. The destination URL lives in the payload itself; the
/// webhook body is the payload's `payload` field when present, else the
/// whole object minus the URL.
pub struct WebhookAdapter {
    name: String,
    client: reqwest::Client,
}

impl WebhookAdapter {
    pub fn new(name: &str, timeout_ms: u64) -> WebhookAdapter {
        WebhookAdapter {
            name: name.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_millis(timeout_ms))
                .build()
                .unwrap_or_default(),
        }
    }
}

#[async_trait]
impl ProviderAdapter for WebhookAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn dispatch(&self, ctx: &DispatchContext) -> Result<ProviderAck, ProviderError> {
        validate_payload(Channel::Webhook, &ctx.payload).map_err(ProviderError::permanent)?;

        let url = ctx
            .payload
            .get("url")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProviderError::permanent("webhook payload missing url"))?;

        let body = ctx
            .payload
            .get("payload")
            .cloned()
            .unwrap_or_else(|| ctx.payload.clone());

        let response = self
            .client
            .post(url)
            .header("X-Correlation-Id", &ctx.correlation_id)
            .header("X-Notification-Id", ctx.notification_id.to_string())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::timeout(format!("webhook target timed out: {e}"))
                } else {
                    ProviderError::transient(format!("webhook target unreachable: {e}"))
                }
            })?;

        let status = response.status();
        if status.is_success() {
            // Webhook targets rarely return a message id; the notification id
            // doubles as the provider-side handle.
            Ok(ProviderAck {
                provider_message_id: ctx.notification_id.to_string(),
                accepted_at: Utc::now(),
            })
        } else {
            let message = format!("webhook target returned {status}");
            match classify_status(status) {
                ErrorKind::Permanent => Err(ProviderError::permanent(message)),
                _ => Err(ProviderError::transient(message)),
            }
        }
    }
}
