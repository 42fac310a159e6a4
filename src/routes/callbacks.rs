use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::post,
    Json, Router,
};

use crate::db::repository::NotificationRepository;
use crate::error::{AppError, AppResult};
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new().route("/:provider", post(handle_provider_callback))
}

/// Normalized delivery outcome extracted from a provider-specific body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallbackOutcome {
    pub provider_message_id: String,
    pub delivered: bool,
    pub reason: Option<String>,
}

/// Translate a provider-specific callback body into the normalized outcome.
/// Each provider posts its own shape; only the fields below matter here.
pub fn normalize(provider: &str, body: &serde_json::Value) -> Option<CallbackOutcome> {
    let message_id = body
        .get("message_id")
        .or_else(|| body.get("provider_message_id"))
        .and_then(|v| v.as_str())?
        .to_string();

    match provider {
        "email" => {
            // Email gateways post lifecycle events; anything past a bounce
            // or drop is a terminal failure.
            let event = body.get("event").and_then(|v| v.as_str())?;
            match event {
                "delivered" => Some(CallbackOutcome {
                    provider_message_id: message_id,
                    delivered: true,
                    reason: None,
                }),
                "bounce" | "bounced" | "dropped" | "failed" => Some(CallbackOutcome {
                    provider_message_id: message_id,
                    delivered: false,
                    reason: body
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .map(String::from)
                        .or_else(|| Some(event.to_string())),
                }),
                _ => None,
            }
        }
        "sms" => {
            let status = body.get("status").and_then(|v| v.as_str())?;
            match status {
                "delivered" => Some(CallbackOutcome {
                    provider_message_id: message_id,
                    delivered: true,
                    reason: None,
                }),
                "undelivered" | "failed" => Some(CallbackOutcome {
                    provider_message_id: message_id,
                    delivered: false,
                    reason: body
                        .get("error_code")
                        .map(|v| v.to_string())
                        .or_else(|| Some(status.to_string())),
                }),
                _ => None,
            }
        }
        "push" | "webhook" => {
            let status = body.get("status").and_then(|v| v.as_str())?;
            match status {
                "delivered" => Some(CallbackOutcome {
                    provider_message_id: message_id,
                    delivered: true,
                    reason: None,
                }),
                "failed" => Some(CallbackOutcome {
                    provider_message_id: message_id,
                    delivered: false,
                    reason: body
                        .get("reason")
                        .and_then(|v| v.as_str())
                        .map(String::from),
                }),
                _ => None,
            }
        }
        _ => None,
    }
}

/// Status ingress: flip SENT -> DELIVERED or SENT -> FAILED from provider
/// callbacks. Unknown message ids and repeated callbacks are acknowledged
/// and ignored; providers retry callbacks and must always get a 200 once
/// the body parses.
async fn handle_provider_callback(
    State(state): State<Arc<AppState>>,
    Path(provider): Path<String>,
    Json(body): Json<serde_json::Value>,
) -> AppResult<impl IntoResponse> {
    if !matches!(provider.as_str(), "email" | "sms" | "push" | "webhook") {
        return Err(AppError::NotFound(format!("unknown provider '{provider}'")));
    }

    let Some(outcome) = normalize(&provider, &body) else {
        return Err(AppError::BadRequest(format!(
            "unrecognized {provider} callback body"
        )));
    };

    let row = NotificationRepository::find_by_provider_message_id(
        &state.db,
        &outcome.provider_message_id,
    )
    .await?;

    let Some(row) = row else {
        tracing::info!(
            provider = %provider,
            provider_message_id = %outcome.provider_message_id,
            "Callback for unknown provider message id, ignoring"
        );
        return Ok((StatusCode::OK, Json(serde_json::json!({"status": "ignored"}))));
    };

    if outcome.delivered {
        match NotificationRepository::mark_delivered(&state.db, row.id).await? {
            Some(updated) => {
                tracing::info!(
                    notification_id = %updated.id,
                    correlation_id = %updated.correlation_id,
                    "Delivery confirmed by provider callback"
                );
            }
            None => {
                tracing::debug!(
                    notification_id = %row.id,
                    status = %row.status,
                    "Delivered callback ignored, row is not SENT"
                );
            }
        }
    } else {
        let reason = outcome
            .reason
            .unwrap_or_else(|| "provider reported failure".to_string());
        match NotificationRepository::mark_failed(&state.db, row.id, &reason, false).await? {
            Some(updated) => {
                tracing::warn!(
                    notification_id = %updated.id,
                    correlation_id = %updated.correlation_id,
                    reason = %reason,
                    "Provider reported post-send failure"
                );
            }
            None => {
                tracing::debug!(
                    notification_id = %row.id,
                    status = %row.status,
                    "Failed callback ignored, row is not SENT"
                );
            }
        }
    }

    Ok((StatusCode::OK, Json(serde_json::json!({"status": "ok"}))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_delivered_and_bounce_events() {
        let delivered = normalize(
            "email",
            &serde_json::json!({"message_id": "m-1", "event": "delivered"}),
        )
        .unwrap();
        assert!(delivered.delivered);
        assert_eq!(delivered.provider_message_id, "m-1");

        let bounced = normalize(
            "email",
            &serde_json::json!({"message_id": "m-2", "event": "bounce", "reason": "mailbox full"}),
        )
        .unwrap();
        assert!(!bounced.delivered);
        assert_eq!(bounced.reason.as_deref(), Some("mailbox full"));
    }

    #[test]
    fn sms_status_mapping() {
        let ok = normalize(
            "sms",
            &serde_json::json!({"message_id": "s-1", "status": "delivered"}),
        )
        .unwrap();
        assert!(ok.delivered);

        let failed = normalize(
            "sms",
            &serde_json::json!({"message_id": "s-2", "status": "undelivered", "error_code": 30006}),
        )
        .unwrap();
        assert!(!failed.delivered);
        assert_eq!(failed.reason.as_deref(), Some("30006"));
    }

    #[test]
    fn unknown_provider_or_event_is_rejected() {
        assert!(normalize(
            "pigeon",
            &serde_json::json!({"message_id": "m", "status": "delivered"})
        )
        .is_none());
        assert!(normalize(
            "email",
            &serde_json::json!({"message_id": "m", "event": "opened"})
        )
        .is_none());
        assert!(normalize("email", &serde_json::json!({"event": "delivered"})).is_none());
    }

    #[test]
    fn provider_message_id_field_alias() {
        let outcome = normalize(
            "push",
            &serde_json::json!({"provider_message_id": "p-1", "status": "delivered"}),
        )
        .unwrap();
        assert_eq!(outcome.provider_message_id, "p-1");
    }
}
