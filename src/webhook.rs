//! Signed content-event webhook.
//!
//! The CMS posts `{"type": "...", "data": {...}}` with a
//! `x-webhook-signature: sha256=<hex>` header over the raw body plus the
//! shared secret. Verification happens on the raw bytes before any JSON
//! parsing, and the digest comparison is constant-time.

use std::sync::Arc;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::post;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::swr::ContentCache;

/// Header carrying the payload signature.
pub const SIGNATURE_HEADER: &str = "x-webhook-signature";

const SIGNATURE_PREFIX: &str = "sha256=";

/// A content event as posted by the CMS.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub data: Value,
}

/// Signature header value for a payload: `sha256=` plus the hex digest
/// of the raw body concatenated with the secret.
pub fn signature_for(payload: &[u8], secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(secret.as_bytes());
    format!("{SIGNATURE_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// Check a signature header against a payload. An empty secret always
/// fails; misconfiguration must not become an open endpoint.
pub fn verify_signature(payload: &[u8], secret: &str, header: &str) -> bool {
    if secret.is_empty() {
        return false;
    }
    let Some(hex_digest) = header.strip_prefix(SIGNATURE_PREFIX) else {
        return false;
    };
    let Ok(provided) = hex::decode(hex_digest) else {
        return false;
    };

    let mut hasher = Sha256::new();
    hasher.update(payload);
    hasher.update(secret.as_bytes());
    let expected = hasher.finalize();

    if provided.len() != expected.len() {
        return false;
    }
    expected.ct_eq(provided.as_slice()).into()
}

/// Routes for the webhook surface: `POST /webhooks/content`.
pub fn webhook_routes(cache: Arc<ContentCache>) -> Router {
    Router::new()
        .route("/webhooks/content", post(handle_content_event))
        .with_state(cache)
}

#[derive(Serialize)]
struct WebhookResponse {
    invalidated: Vec<String>,
    count: u64,
}

async fn handle_content_event(
    State(cache): State<Arc<ContentCache>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let secret = cache.config().webhook.secret.as_str();
    let signature = headers
        .get(SIGNATURE_HEADER)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    if !verify_signature(&body, secret, signature) {
        warn!("webhook rejected: bad or missing signature");
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "invalid signature"})),
        )
            .into_response();
    }

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(err) => {
            debug!(error = %err, "webhook rejected: unparseable payload");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "malformed payload"})),
            )
                .into_response();
        }
    };

    let outcome = cache.apply_event(&payload).await;
    Json(WebhookResponse {
        invalidated: outcome.patterns,
        count: outcome.removed,
    })
    .into_response()
}
