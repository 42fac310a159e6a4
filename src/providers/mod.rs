//! Channel provider adapters.
//!
//! Adapters are injected behind the `ProviderAdapter` trait so real
//! providers, in-memory mocks, and file-writing fakes are interchangeable in
//! tests. Each adapter validates the payload shape before any network call
//! and exposes a name used as the circuit-breaker key.

pub mod email;
pub mod mock;
pub mod push;
pub mod sms;
pub mod webhook;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::config::Config;
use crate::db::models::Channel;

pub use email::EmailAdapter;
pub use mock::{MockAdapter, MockOutcome};
pub use push::PushAdapter;
pub use sms::SmsAdapter;
pub use webhook::WebhookAdapter;

/// Classification of a dispatch failure, decided inside the adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Network failures, 5xx, throttling. Worth retrying.
    Transient,
    /// Validation rejections, unknown recipients. Retrying cannot help.
    Permanent,
    /// The adapter-level deadline elapsed; treated as transient.
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Transient => "transient",
            ErrorKind::Permanent => "permanent",
            ErrorKind::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    pub retryable: bool,
}

impl ProviderError {
    pub fn transient(message: impl Into<String>) -> ProviderError {
        ProviderError {
            kind: ErrorKind::Transient,
            message: message.into(),
            retryable: true,
        }
    }

    pub fn permanent(message: impl Into<String>) -> ProviderError {
        ProviderError {
            kind: ErrorKind::Permanent,
            message: message.into(),
            retryable: false,
        }
    }

    pub fn timeout(message: impl Into<String>) -> ProviderError {
        ProviderError {
            kind: ErrorKind::Timeout,
            message: message.into(),
            retryable: true,
        }
    }
}

impl std::fmt::Display for ProviderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// A provider's acknowledgement that it accepted the message for delivery.
#[derive(Debug, Clone)]
pub struct ProviderAck {
    pub provider_message_id: String,
    pub accepted_at: DateTime<Utc>,
}

/// Everything an adapter needs for one dispatch attempt.
#[derive(Debug, Clone)]
pub struct DispatchContext {
    pub notification_id: Uuid,
    pub channel: Channel,
    pub payload: serde_json::Value,
    pub correlation_id: String,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable adapter name; used as the circuit-breaker key
    /// (e.g. `email.primary`, `email.fallback`).
    fn name(&self) -> &str;

    async fn dispatch(&self, ctx: &DispatchContext) -> Result<ProviderAck, ProviderError>;
}

/// Validate a payload against the channel's required fields. Shared between
/// ingestion (reject before persist) and the adapters (refuse before any
/// network call).
pub fn validate_payload(channel: Channel, payload: &serde_json::Value) -> Result<(), String> {
    let obj = payload
        .as_object()
        .ok_or_else(|| "payload must be a JSON object".to_string())?;

    let required: &[&str] = match channel {
        Channel::Email => &["to", "subject", "body"],
        Channel::Sms => &["phone_number", "message"],
        Channel::PushIos | Channel::PushAndroid => &["device_token", "title", "body"],
        Channel::Webhook => &["url"],
    };

    for field in required {
        match obj.get(*field) {
            Some(v) if v.is_string() && !v.as_str().unwrap_or("").is_empty() => {}
            Some(_) => return Err(format!("field '{field}' must be a non-empty string")),
            None => return Err(format!("missing required field '{field}'")),
        }
    }
    Ok(())
}

/// Map an HTTP response status from a provider gateway to an error class.
pub fn classify_status(status: reqwest::StatusCode) -> ErrorKind {
    if status.as_u16() == 429 || status.is_server_error() {
        ErrorKind::Transient
    } else {
        ErrorKind::Permanent
    }
}

/// Primary adapter plus an optional fallback for one channel.
#[derive(Clone)]
pub struct AdapterPair {
    pub primary: Arc<dyn ProviderAdapter>,
    pub fallback: Option<Arc<dyn ProviderAdapter>>,
}

/// Channel -> adapter mapping built from configuration. Channels with no
/// configured endpoint have no entry; dispatching to them fails permanently.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<&'static str, AdapterPair>,
}

impl AdapterRegistry {
    pub fn from_config(config: &Config) -> AdapterRegistry {
        let mut registry = AdapterRegistry::default();
        let token = config.providers.api_token.clone();

        if let Some(endpoint) = &config.providers.email_endpoint {
            let fallback = config.providers.email_fallback_endpoint.as_ref().map(|e| {
                Arc::new(EmailAdapter::new(
                    "email.fallback",
                    e.clone(),
                    token.clone(),
                    config.dispatch.email_timeout_ms,
                )) as Arc<dyn ProviderAdapter>
            });
            registry.register_pair(
                Channel::Email,
                Arc::new(EmailAdapter::new(
                    "email.primary",
                    endpoint.clone(),
                    token.clone(),
                    config.dispatch.email_timeout_ms,
                )),
                fallback,
            );
        }

        if let Some(endpoint) = &config.providers.sms_endpoint {
            registry.register_pair(
                Channel::Sms,
                Arc::new(SmsAdapter::new(
                    "sms.primary",
                    endpoint.clone(),
                    token.clone(),
                    config.dispatch.sms_timeout_ms,
                )),
                None,
            );
        }

        if let Some(endpoint) = &config.providers.push_endpoint {
            let push = Arc::new(PushAdapter::new(
                "push.primary",
                endpoint.clone(),
                token.clone(),
                config.dispatch.push_timeout_ms,
            ));
            registry.register_pair(Channel::PushIos, push.clone(), None);
            registry.register_pair(Channel::PushAndroid, push, None);
        }

        // Webhook needs no gateway; the destination is in the payload.
        registry.register_pair(
            Channel::Webhook,
            Arc::new(WebhookAdapter::new(
                "webhook.primary",
                config.dispatch.webhook_timeout_ms,
            )),
            None,
        );

        registry
    }

    pub fn register_pair(
        &mut self,
        channel: Channel,
        primary: Arc<dyn ProviderAdapter>,
        fallback: Option<Arc<dyn ProviderAdapter>>,
    ) {
        self.adapters
            .insert(channel.as_str(), AdapterPair { primary, fallback });
    }

    pub fn get(&self, channel: Channel) -> Option<&AdapterPair> {
        self.adapters.get(channel.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_payload_requires_to_subject_body() {
        let ok = serde_json::json!({"to": "a@b.c", "subject": "hi", "body": "x"});
        assert!(validate_payload(Channel::Email, &ok).is_ok());

        let missing = serde_json::json!({"to": "a@b.c", "subject": "hi"});
        let err = validate_payload(Channel::Email, &missing).unwrap_err();
        assert!(err.contains("body"));

        let empty = serde_json::json!({"to": "", "subject": "hi", "body": "x"});
        assert!(validate_payload(Channel::Email, &empty).is_err());
    }

    #[test]
    fn sms_and_push_payload_shapes() {
        let sms = serde_json::json!({"phone_number": "+15550001111", "message": "yo"});
        assert!(validate_payload(Channel::Sms, &sms).is_ok());
        assert!(validate_payload(Channel::Sms, &serde_json::json!({"message": "yo"})).is_err());

        let push = serde_json::json!({"device_token": "t", "title": "a", "body": "b"});
        assert!(validate_payload(Channel::PushIos, &push).is_ok());
        assert!(validate_payload(Channel::PushAndroid, &push).is_ok());
    }

    #[test]
    fn non_object_payload_is_rejected() {
        assert!(validate_payload(Channel::Webhook, &serde_json::json!("nope")).is_err());
        assert!(validate_payload(Channel::Webhook, &serde_json::json!(["x"])).is_err());
    }

    #[test]
    fn status_classification() {
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_GATEWAY),
            ErrorKind::Transient
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::TOO_MANY_REQUESTS),
            ErrorKind::Transient
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::BAD_REQUEST),
            ErrorKind::Permanent
        );
        assert_eq!(
            classify_status(reqwest::StatusCode::NOT_FOUND),
            ErrorKind::Permanent
        );
    }

    #[test]
    fn registry_serves_push_channels_from_one_adapter() {
        let mut cfg = Config::default();
        cfg.providers.push_endpoint = Some("http://push.gateway".to_string());
        let registry = AdapterRegistry::from_config(&cfg);
        let ios = registry.get(Channel::PushIos).unwrap();
        let android = registry.get(Channel::PushAndroid).unwrap();
        assert_eq!(ios.primary.name(), android.primary.name());
        assert!(registry.get(Channel::Email).is_none());
        assert!(registry.get(Channel::Webhook).is_some());
    }
}
