//! Travis status intake.
//!
//! Travis posts a JSON body and authenticates with a token carried in the
//! `Authorization` header. The whole Travis run maps onto one builder named
//! `"travis"`:
//!
//! ```json
//! { "commit": "…40 hex…", "state": "passed", "build_url": "…" }
//! ```

use serde::Deserialize;

use crate::events::BuildOutcome;
use crate::types::{BuildVerdict, Sha};

use super::CiError;

/// The builder name Travis results are recorded under.
pub const BUILDER: &str = "travis";

#[derive(Debug, Deserialize)]
struct Payload {
    commit: String,
    state: String,
    build_url: Option<String>,
}

/// Authenticates and decodes one Travis notification.
///
/// `authorization` is the raw `Authorization` header value; `token` is the
/// repository's configured Travis token.
pub fn authenticate(
    body: &[u8],
    authorization: Option<&str>,
    token: &str,
) -> Result<BuildOutcome, CiError> {
    let presented = authorization.ok_or(CiError::Auth)?;
    if !constant_time_eq(presented.as_bytes(), token.as_bytes()) {
        return Err(CiError::Auth);
    }

    let payload: Payload =
        serde_json::from_slice(body).map_err(|e| CiError::Malformed(e.to_string()))?;

    let sha = Sha::parse(&payload.commit)
        .map_err(|e| CiError::Malformed(format!("bad commit: {}", e)))?;

    let verdict = match payload.state.as_str() {
        "passed" => BuildVerdict::Success,
        "started" | "created" | "queued" => BuildVerdict::Pending,
        // failed, errored, canceled
        _ => BuildVerdict::Failure,
    };

    Ok(BuildOutcome {
        builder: BUILDER.to_string(),
        sha,
        verdict,
        url: payload.build_url,
    })
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sha_str(c: char) -> String {
        c.to_string().repeat(40)
    }

    fn body(state: &str) -> Vec<u8> {
        format!(
            r#"{{"commit": "{}", "state": "{}", "build_url": "http://travis/9"}}"#,
            sha_str('a'),
            state
        )
        .into_bytes()
    }

    #[test]
    fn passed_is_success() {
        let outcome = authenticate(&body("passed"), Some("tok"), "tok").unwrap();
        assert_eq!(outcome.builder, BUILDER);
        assert_eq!(outcome.verdict, BuildVerdict::Success);
        assert_eq!(outcome.url.as_deref(), Some("http://travis/9"));
    }

    #[test]
    fn failed_and_errored_are_failures() {
        for state in ["failed", "errored", "canceled"] {
            let outcome = authenticate(&body(state), Some("tok"), "tok").unwrap();
            assert_eq!(outcome.verdict, BuildVerdict::Failure, "state {}", state);
        }
    }

    #[test]
    fn started_is_pending() {
        let outcome = authenticate(&body("started"), Some("tok"), "tok").unwrap();
        assert_eq!(outcome.verdict, BuildVerdict::Pending);
    }

    #[test]
    fn missing_or_wrong_token_rejected() {
        assert!(matches!(
            authenticate(&body("passed"), None, "tok"),
            Err(CiError::Auth)
        ));
        assert!(matches!(
            authenticate(&body("passed"), Some("other"), "tok"),
            Err(CiError::Auth)
        ));
    }

    #[test]
    fn malformed_body_rejected() {
        assert!(matches!(
            authenticate(b"not json", Some("tok"), "tok"),
            Err(CiError::Malformed(_))
        ));
    }
}
