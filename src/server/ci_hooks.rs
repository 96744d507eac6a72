//! CI provider status endpoints.
//!
//! Each handler tries the payload against every repository configured for
//! that provider; the first repository whose secret authenticates it wins.
//! No match answers 400, indistinguishably from malformed input.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use thiserror::Error;
use tracing::{debug, warn};

use crate::ci;
use crate::events::{BuildOutcome, Event};
use crate::types::RepoLabel;
use crate::worker::{DispatchError, Envelope};

use super::AppState;

/// Errors answered to a CI provider.
#[derive(Debug, Error)]
pub enum CiHookError {
    /// Authentication failed for every configured repository, or the
    /// payload was malformed. Deliberately carries no distinguishing
    /// detail.
    #[error("bad request")]
    Rejected,

    #[error("event could not be queued")]
    Dispatch(#[from] DispatchError),
}

impl IntoResponse for CiHookError {
    fn into_response(self) -> Response {
        let status = match &self {
            CiHookError::Rejected => StatusCode::BAD_REQUEST,
            CiHookError::Dispatch(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

/// `POST /buildbot` - form-encoded, authenticated by the `secret` field.
pub async fn buildbot_handler(
    State(app_state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, &'static str), CiHookError> {
    let form = parse_form(&body);

    let matched = app_state.config().repo.iter().find_map(|(label, cfg)| {
        let binding = cfg.buildbot.as_ref()?;
        match ci::buildbot::authenticate(&form, &binding.secret) {
            Ok(outcome) => Some((RepoLabel::new(label.clone()), outcome)),
            Err(err) => {
                debug!(repo = %label, error = %err, "Buildbot payload did not match");
                None
            }
        }
    });

    dispatch_outcome(&app_state, matched).await
}

/// `POST /travis` - JSON, authenticated by the `Authorization` token.
pub async fn travis_handler(
    State(app_state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, &'static str), CiHookError> {
    let authorization = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok());

    let matched = app_state.config().repo.iter().find_map(|(label, cfg)| {
        let binding = cfg.travis.as_ref()?;
        ci::travis::authenticate(&body, authorization, &binding.token)
            .ok()
            .map(|outcome| (RepoLabel::new(label.clone()), outcome))
    });

    dispatch_outcome(&app_state, matched).await
}

/// `POST /jenkins` - JSON carrying an HMAC signature in the body.
pub async fn jenkins_handler(
    State(app_state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, &'static str), CiHookError> {
    let matched = app_state.config().repo.iter().find_map(|(label, cfg)| {
        let binding = cfg.jenkins.as_ref()?;
        ci::signed_json::authenticate(&body, &binding.secret)
            .ok()
            .map(|outcome| (RepoLabel::new(label.clone()), outcome))
    });

    dispatch_outcome(&app_state, matched).await
}

/// `POST /solano` - same body format as jenkins, separate binding.
pub async fn solano_handler(
    State(app_state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, &'static str), CiHookError> {
    let matched = app_state.config().repo.iter().find_map(|(label, cfg)| {
        let binding = cfg.solano.as_ref()?;
        ci::signed_json::authenticate(&body, &binding.secret)
            .ok()
            .map(|outcome| (RepoLabel::new(label.clone()), outcome))
    });

    dispatch_outcome(&app_state, matched).await
}

/// Enqueues an authenticated build outcome on its repository's supervisor.
async fn dispatch_outcome(
    app_state: &AppState,
    matched: Option<(RepoLabel, BuildOutcome)>,
) -> Result<(StatusCode, &'static str), CiHookError> {
    let Some((label, outcome)) = matched else {
        warn!("CI status rejected: no repository authenticated the payload");
        return Err(CiHookError::Rejected);
    };

    debug!(
        repo = %label,
        builder = %outcome.builder,
        sha = %outcome.sha.short(),
        verdict = ?outcome.verdict,
        "CI status accepted"
    );
    app_state
        .dispatcher()
        .dispatch(&label, Envelope::anonymous(Event::BuildStatus(outcome)))
        .await?;

    Ok((StatusCode::ACCEPTED, "Accepted"))
}

/// Parses an `application/x-www-form-urlencoded` body.
fn parse_form(body: &[u8]) -> HashMap<String, String> {
    let text = String::from_utf8_lossy(body);
    text.split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            Some((percent_decode(key)?, percent_decode(value)?))
        })
        .collect()
}

/// Decodes percent-escapes and `+`-as-space. Returns `None` on invalid
/// escapes rather than guessing.
fn percent_decode(s: &str) -> Option<String> {
    let mut out = Vec::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                out.push(u8::from_str_radix(hex, 16).ok()?);
                i += 3;
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_form_basic() {
        let form = parse_form(b"secret=abc&payload=%7B%22x%22%3A1%7D");
        assert_eq!(form.get("secret").map(String::as_str), Some("abc"));
        assert_eq!(form.get("payload").map(String::as_str), Some(r#"{"x":1}"#));
    }

    #[test]
    fn parse_form_plus_is_space() {
        let form = parse_form(b"a=hello+world");
        assert_eq!(form.get("a").map(String::as_str), Some("hello world"));
    }

    #[test]
    fn parse_form_skips_invalid_escapes() {
        let form = parse_form(b"a=%zz&b=ok");
        assert!(!form.contains_key("a"));
        assert_eq!(form.get("b").map(String::as_str), Some("ok"));
    }

    #[test]
    fn percent_decode_edge_cases() {
        assert_eq!(percent_decode("").as_deref(), Some(""));
        assert_eq!(percent_decode("%41").as_deref(), Some("A"));
        assert_eq!(percent_decode("%4"), None);
        assert_eq!(percent_decode("%gg"), None);
    }
}
