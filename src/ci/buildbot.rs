//! Buildbot status intake.
//!
//! Buildbot's HTTP notifier posts form-encoded bodies. We expect two fields:
//! `secret` (compared against the repository's configured secret) and
//! `payload`, a JSON document describing one finished build:
//!
//! ```json
//! { "builder": "linux", "sha": "…40 hex…", "result": 0, "url": "…" }
//! ```
//!
//! Buildbot result codes: 0 is success, anything else is a failure. A
//! missing result means the build is still running.

use std::collections::HashMap;

use serde::Deserialize;

use crate::events::BuildOutcome;
use crate::types::{BuildVerdict, Sha};

use super::CiError;

#[derive(Debug, Deserialize)]
struct Payload {
    builder: String,
    sha: String,
    result: Option<i32>,
    url: Option<String>,
}

/// Authenticates and decodes one buildbot notification.
///
/// `form` is the parsed form body; `secret` is the repository's configured
/// buildbot secret.
pub fn authenticate(form: &HashMap<String, String>, secret: &str) -> Result<BuildOutcome, CiError> {
    let presented = form.get("secret").ok_or(CiError::Auth)?;
    if !constant_time_eq(presented.as_bytes(), secret.as_bytes()) {
        return Err(CiError::Auth);
    }

    let payload = form
        .get("payload")
        .ok_or_else(|| CiError::Malformed("missing payload field".to_string()))?;
    let payload: Payload =
        serde_json::from_str(payload).map_err(|e| CiError::Malformed(e.to_string()))?;

    let sha = Sha::parse(&payload.sha)
        .map_err(|e| CiError::Malformed(format!("bad sha: {}", e)))?;

    let verdict = match payload.result {
        None => BuildVerdict::Pending,
        Some(0) => BuildVerdict::Success,
        Some(_) => BuildVerdict::Failure,
    };

    Ok(BuildOutcome {
        builder: payload.builder,
        sha,
        verdict,
        url: payload.url,
    })
}

/// Constant-time byte comparison, so secret matching does not leak length
/// prefixes via timing.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn form(secret: &str, payload: &str) -> HashMap<String, String> {
        HashMap::from([
            ("secret".to_string(), secret.to_string()),
            ("payload".to_string(), payload.to_string()),
        ])
    }

    fn sha_str(c: char) -> String {
        c.to_string().repeat(40)
    }

    #[test]
    fn success_decodes() {
        let payload = format!(
            r#"{{"builder": "linux", "sha": "{}", "result": 0, "url": "http://bb/1"}}"#,
            sha_str('a')
        );
        let outcome = authenticate(&form("s3cret", &payload), "s3cret").unwrap();
        assert_eq!(outcome.builder, "linux");
        assert_eq!(outcome.verdict, BuildVerdict::Success);
        assert_eq!(outcome.url.as_deref(), Some("http://bb/1"));
    }

    #[test]
    fn nonzero_result_is_failure() {
        let payload = format!(r#"{{"builder": "mac", "sha": "{}", "result": 2}}"#, sha_str('a'));
        let outcome = authenticate(&form("s", &payload), "s").unwrap();
        assert_eq!(outcome.verdict, BuildVerdict::Failure);
    }

    #[test]
    fn missing_result_is_pending() {
        let payload = format!(r#"{{"builder": "mac", "sha": "{}"}}"#, sha_str('a'));
        let outcome = authenticate(&form("s", &payload), "s").unwrap();
        assert_eq!(outcome.verdict, BuildVerdict::Pending);
    }

    #[test]
    fn wrong_secret_rejected() {
        let payload = format!(r#"{{"builder": "x", "sha": "{}", "result": 0}}"#, sha_str('a'));
        assert!(matches!(
            authenticate(&form("wrong", &payload), "right"),
            Err(CiError::Auth)
        ));
    }

    #[test]
    fn missing_secret_rejected() {
        let form = HashMap::from([("payload".to_string(), "{}".to_string())]);
        assert!(matches!(authenticate(&form, "right"), Err(CiError::Auth)));
    }

    #[test]
    fn malformed_payload_rejected_after_auth() {
        assert!(matches!(
            authenticate(&form("s", "not json"), "s"),
            Err(CiError::Malformed(_))
        ));
    }

    #[test]
    fn bad_sha_rejected() {
        let payload = r#"{"builder": "x", "sha": "short", "result": 0}"#;
        assert!(matches!(
            authenticate(&form("s", payload), "s"),
            Err(CiError::Malformed(_))
        ));
    }
}
