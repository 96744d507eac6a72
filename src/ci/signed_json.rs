//! Jenkins/Solano status intake.
//!
//! Both providers post a JSON body carrying its own HMAC-SHA1 signature:
//!
//! ```json
//! {
//!   "signature": "…hex hmac…",
//!   "builder": "linux",
//!   "sha": "…40 hex…",
//!   "status": "success",
//!   "url": "…"
//! }
//! ```
//!
//! The signature is HMAC-SHA1 over `"{builder}\n{sha}\n{status}\n{url}"`
//! (empty string for a missing url) with the repository's configured secret,
//! so the authenticated fields are exactly the ones we act on.

use serde::Deserialize;

use crate::events::BuildOutcome;
use crate::events::verify_hex_hmac;
use crate::types::{BuildVerdict, Sha};

use super::CiError;

#[derive(Debug, Deserialize)]
struct Payload {
    signature: String,
    builder: String,
    sha: String,
    status: String,
    url: Option<String>,
}

/// The canonical byte string the body signature covers.
fn signed_content(builder: &str, sha: &str, status: &str, url: Option<&str>) -> Vec<u8> {
    format!("{}\n{}\n{}\n{}", builder, sha, status, url.unwrap_or("")).into_bytes()
}

/// Authenticates and decodes one Jenkins/Solano notification.
pub fn authenticate(body: &[u8], secret: &str) -> Result<BuildOutcome, CiError> {
    let payload: Payload =
        serde_json::from_slice(body).map_err(|e| CiError::Malformed(e.to_string()))?;

    let content = signed_content(
        &payload.builder,
        &payload.sha,
        &payload.status,
        payload.url.as_deref(),
    );
    if !verify_hex_hmac(&content, &payload.signature, secret.as_bytes()) {
        return Err(CiError::Auth);
    }

    let sha = Sha::parse(&payload.sha)
        .map_err(|e| CiError::Malformed(format!("bad sha: {}", e)))?;

    let verdict = match payload.status.as_str() {
        "success" => BuildVerdict::Success,
        "pending" | "running" => BuildVerdict::Pending,
        _ => BuildVerdict::Failure,
    };

    Ok(BuildOutcome {
        builder: payload.builder,
        sha,
        verdict,
        url: payload.url,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::compute_signature;

    fn sha_str(c: char) -> String {
        c.to_string().repeat(40)
    }

    fn signed_body(builder: &str, sha: &str, status: &str, url: Option<&str>, secret: &str) -> Vec<u8> {
        let content = signed_content(builder, sha, status, url);
        let signature = hex::encode(compute_signature(&content, secret.as_bytes()));
        serde_json::to_vec(&serde_json::json!({
            "signature": signature,
            "builder": builder,
            "sha": sha,
            "status": status,
            "url": url,
        }))
        .unwrap()
    }

    #[test]
    fn valid_signature_decodes() {
        let body = signed_body("linux", &sha_str('a'), "success", Some("http://j/1"), "sec");
        let outcome = authenticate(&body, "sec").unwrap();
        assert_eq!(outcome.builder, "linux");
        assert_eq!(outcome.verdict, BuildVerdict::Success);
        assert_eq!(outcome.url.as_deref(), Some("http://j/1"));
    }

    #[test]
    fn failure_status_decodes() {
        let body = signed_body("linux", &sha_str('a'), "failure", None, "sec");
        let outcome = authenticate(&body, "sec").unwrap();
        assert_eq!(outcome.verdict, BuildVerdict::Failure);
    }

    #[test]
    fn wrong_secret_rejected() {
        let body = signed_body("linux", &sha_str('a'), "success", None, "sec");
        assert!(matches!(authenticate(&body, "other"), Err(CiError::Auth)));
    }

    #[test]
    fn tampered_field_rejected() {
        // Sign with status "failure", then claim "success".
        let content = signed_content("linux", &sha_str('a'), "failure", None);
        let signature = hex::encode(compute_signature(&content, b"sec"));
        let body = serde_json::to_vec(&serde_json::json!({
            "signature": signature,
            "builder": "linux",
            "sha": sha_str('a'),
            "status": "success",
        }))
        .unwrap();
        assert!(matches!(authenticate(&body, "sec"), Err(CiError::Auth)));
    }

    #[test]
    fn malformed_body_rejected() {
        assert!(matches!(
            authenticate(b"[]", "sec"),
            Err(CiError::Malformed(_))
        ));
    }

    #[test]
    fn bad_sha_rejected_after_auth() {
        let body = signed_body("linux", "nothex", "success", None, "sec");
        assert!(matches!(
            authenticate(&body, "sec"),
            Err(CiError::Malformed(_))
        ));
    }
}
