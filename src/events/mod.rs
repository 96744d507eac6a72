//! Webhook event intake: payload parsing and signature verification.
//!
//! Intake is stateless; any number of concurrent handler tasks may run. All
//! authenticated payloads are normalized into [`Event`] values and handed to
//! the owning repository's supervisor.

mod event;
mod github;
mod signature;

pub use event::{BuildOutcome, Event};
pub use github::{ParseError, RepoCoordinates, parse_github_webhook};
pub use signature::{
    compute_signature, format_signature_header, parse_signature_header, verify_hex_hmac,
    verify_signature,
};
