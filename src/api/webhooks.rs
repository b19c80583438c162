use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use super::AppState;
use crate::error::ApiError;
use crate::webhook::{self, Outcome, WebhookError, DELIVERY_HEADER, SIGNATURE_HEADER, TOPIC_HEADER};

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

impl From<WebhookError> for ApiError {
    fn from(err: WebhookError) -> Self {
        match err {
            WebhookError::MissingSignature | WebhookError::BadSignature => ApiError::Unauthorized,
            WebhookError::Malformed(msg) => ApiError::validation(msg),
            WebhookError::Internal(err) => ApiError::Internal(err),
        }
    }
}

/// WooCommerce delivery endpoint. Pings are acknowledged before the signature
/// check since WooCommerce sends them unsigned while a hook is being saved.
pub async fn woocommerce(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    match receive(&state, &headers, &body).await {
        Ok(outcome) => {
            let body = match outcome {
                Outcome::Ping => json!({ "status": "ping" }),
                Outcome::Duplicate => json!({ "status": "duplicate" }),
                Outcome::Ignored { topic } => json!({ "status": "ignored", "topic": topic }),
                Outcome::Applied {
                    company_id,
                    created,
                } => json!({ "status": "applied", "company_id": company_id, "created": created }),
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(err) => err.into_response(),
    }
}

async fn receive(state: &AppState, headers: &HeaderMap, body: &[u8]) -> Result<Outcome, ApiError> {
    if webhook::is_ping(body) {
        return Ok(Outcome::Ping);
    }
    let secret = &state.cfg.woocommerce.webhook_secret;
    if let Err(err) = webhook::verify_signature(secret, body, header(headers, SIGNATURE_HEADER)) {
        warn!(%err, "rejected webhook delivery");
        return Err(err.into());
    }
    let topic = header(headers, TOPIC_HEADER).unwrap_or_default();
    let delivery_id = header(headers, DELIVERY_HEADER).filter(|d| !d.is_empty());
    let outcome = webhook::handle_delivery(&state.pool, &state.cfg, topic, delivery_id, body).await?;
    if matches!(outcome, Outcome::Applied { .. }) {
        state.invalidate_companies();
        state.invalidate_boards();
    }
    Ok(outcome)
}
