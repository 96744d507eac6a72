//! CI provider bindings.
//!
//! Each binding authenticates an incoming status callback against the
//! repository's configured secret and decodes it into a [`BuildOutcome`]
//! (builder, SHA, verdict, URL). Authentication failure is indistinguishable
//! from the caller's perspective regardless of cause, and secret material is
//! never included in errors or logs.
//!
//! Supported providers:
//!
//! - **buildbot**: form-encoded POST with a `secret` field and a JSON
//!   `payload` ([`buildbot`])
//! - **travis**: JSON POST authenticated by an `Authorization` token
//!   ([`travis`])
//! - **jenkins** / **solano**: JSON POST carrying an HMAC-SHA1 signature in
//!   the body ([`signed_json`])

pub mod buildbot;
pub mod signed_json;
pub mod travis;

use thiserror::Error;

/// Errors raised by CI provider bindings.
///
/// `Auth` deliberately carries no detail: the HTTP layer answers 400 either
/// way, and nothing secret-derived may leak into logs.
#[derive(Debug, Error)]
pub enum CiError {
    #[error("authentication failed")]
    Auth,

    #[error("malformed payload: {0}")]
    Malformed(String),
}
