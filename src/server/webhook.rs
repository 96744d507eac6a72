//! Host webhook endpoint.
//!
//! Authenticates each delivery with the repository's shared secret
//! (HMAC-SHA1 of the raw body, `X-Hub-Signature` header), normalizes the
//! payload and enqueues it on the owning supervisor's queue. Authentication
//! failures answer 400 with no further action and nothing secret-derived in
//! the logs.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{ParseError, parse_github_webhook, verify_signature};
use crate::types::DeliveryId;
use crate::worker::{DispatchError, Envelope};

use super::AppState;

/// Header name for the event type.
const HEADER_EVENT: &str = "x-github-event";
/// Header name for the delivery ID.
const HEADER_DELIVERY: &str = "x-github-delivery";
/// Header name for the HMAC-SHA1 signature.
const HEADER_SIGNATURE: &str = "x-hub-signature";

/// Errors answered to the webhook sender.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("authentication failed")]
    AuthFailure,

    #[error("payload does not identify a configured repository")]
    UnknownRepository,

    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("event could not be queued")]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for WebhookError {
    fn into_response(self) -> Response {
        let status = match &self {
            WebhookError::MissingHeader(_)
            | WebhookError::AuthFailure
            | WebhookError::UnknownRepository
            | WebhookError::Parse(_) => StatusCode::BAD_REQUEST,
            WebhookError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// `POST /github`.
///
/// Responds 202 Accepted once the event is authenticated and queued (or
/// recognized as irrelevant); the supervisor processes it asynchronously.
/// A full supervisor queue delays the response, which makes the host retry
/// later - that is the intended backpressure.
pub async fn github_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), WebhookError> {
    let event_type = get_header(&headers, HEADER_EVENT)?;
    let delivery = DeliveryId::new(get_header(&headers, HEADER_DELIVERY)?);
    let signature = get_header(&headers, HEADER_SIGNATURE)?;

    // The secret is per-repository, so the repository must be identified
    // before the signature can be checked. Nothing from the body is acted
    // on until the signature verifies.
    let (owner, name) =
        extract_repository(&body).ok_or(WebhookError::UnknownRepository)?;
    let label = app_state
        .config()
        .label_for(&owner, &name)
        .ok_or(WebhookError::UnknownRepository)?;
    let repo_cfg = app_state
        .config()
        .repo(&label)
        .ok_or(WebhookError::UnknownRepository)?;

    if !verify_signature(&body, &signature, repo_cfg.webhook_secret.as_bytes()) {
        warn!(delivery = %delivery, repo = %label, "Invalid webhook signature");
        return Err(WebhookError::AuthFailure);
    }

    let Some((_, event)) = parse_github_webhook(&event_type, &body)? else {
        debug!(delivery = %delivery, event_type = %event_type, "Irrelevant event ignored");
        return Ok((StatusCode::ACCEPTED, "Ignored"));
    };

    debug!(delivery = %delivery, repo = %label, event_type = %event_type, "Webhook accepted");
    app_state
        .dispatcher()
        .dispatch(&label, Envelope::new(Some(delivery), event))
        .await?;

    Ok((StatusCode::ACCEPTED, "Accepted"))
}

/// Extracts a required header value as a string.
fn get_header(headers: &HeaderMap, name: &'static str) -> Result<String, WebhookError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .ok_or(WebhookError::MissingHeader(name))
}

/// Pulls `repository.owner.login` and `repository.name` out of a payload
/// without committing to any event shape.
fn extract_repository(body: &[u8]) -> Option<(String, String)> {
    let value: serde_json::Value = serde_json::from_slice(body).ok()?;
    let repository = value.get("repository")?;
    let owner = repository.get("owner")?.get("login")?.as_str()?;
    let name = repository.get("name")?.as_str()?;
    Some((owner.to_string(), name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn extract_repository_valid() {
        let body = serde_json::to_vec(&json!({
            "action": "opened",
            "repository": {
                "name": "rust",
                "owner": { "login": "rust-lang" }
            }
        }))
        .unwrap();

        assert_eq!(
            extract_repository(&body),
            Some(("rust-lang".to_string(), "rust".to_string()))
        );
    }

    #[test]
    fn extract_repository_missing_pieces() {
        assert_eq!(extract_repository(b"{}"), None);
        assert_eq!(extract_repository(b"not json"), None);

        let body = serde_json::to_vec(&json!({
            "repository": { "name": "rust" }
        }))
        .unwrap();
        assert_eq!(extract_repository(&body), None);
    }

    #[test]
    fn get_header_present_and_missing() {
        let mut headers = HeaderMap::new();
        headers.insert("x-github-event", "pull_request".parse().unwrap());

        assert_eq!(
            get_header(&headers, "x-github-event").unwrap(),
            "pull_request"
        );
        assert!(matches!(
            get_header(&headers, "x-github-delivery"),
            Err(WebhookError::MissingHeader(_))
        ));
    }
}
