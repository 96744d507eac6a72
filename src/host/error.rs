//! Host API error types.
//!
//! The transient/refusal distinction drives both retry logic and the state
//! machine: transient errors are retried with backoff and eventually park the
//! pull request in `Error` with a retry-eligible marker, while refusals
//! (4xx: conflicts, permissions, branch protection) move it to `Error`
//! immediately with a user-visible comment.

use std::fmt;

use thiserror::Error;

/// The kind of host API error, categorized for retry decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostErrorKind {
    /// Transient failure - safe to retry with backoff.
    ///
    /// HTTP 5xx, 429, rate-limited 403, network timeouts.
    Transient,

    /// The host refused the operation - requires human intervention.
    ///
    /// Merge conflicts, missing permissions, branch protection, 404s.
    Refusal,
}

/// A host API error with categorization for retry decisions.
#[derive(Debug, Error)]
pub struct HostError {
    pub kind: HostErrorKind,

    /// The HTTP status code, if one could be determined.
    pub status: Option<u16>,

    pub message: String,

    #[source]
    pub source: Option<octocrab::Error>,
}

impl fmt::Display for HostError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status {
            Some(code) => write!(f, "host API error (HTTP {}): {}", code, self.message),
            None => write!(f, "host API error: {}", self.message),
        }
    }
}

impl HostError {
    pub fn is_transient(&self) -> bool {
        self.kind == HostErrorKind::Transient
    }

    /// Creates a transient error without an underlying octocrab source.
    pub fn transient(message: impl Into<String>) -> Self {
        HostError {
            kind: HostErrorKind::Transient,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// Creates a refusal without an underlying octocrab source.
    pub fn refusal(message: impl Into<String>) -> Self {
        HostError {
            kind: HostErrorKind::Refusal,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    /// Categorizes an octocrab error by status code and message.
    pub fn from_octocrab(err: octocrab::Error) -> Self {
        let status = extract_status_code(&err);
        let message = err.to_string();

        let kind = match status {
            Some(429) => HostErrorKind::Transient,
            Some(403) if is_rate_limit_message(&message) => HostErrorKind::Transient,
            Some(code) if (500..600).contains(&code) => HostErrorKind::Transient,
            Some(_) => HostErrorKind::Refusal,
            None => {
                if is_network_message(&message) {
                    HostErrorKind::Transient
                } else {
                    HostErrorKind::Refusal
                }
            }
        };

        HostError {
            kind,
            status,
            message,
            source: Some(err),
        }
    }
}

/// Extracts the HTTP status code from an octocrab error, if present.
///
/// octocrab's `Error` type does not expose a stable status-code accessor
/// across all variants, so this falls back to message inspection; returning
/// `None` is safe (it yields conservative categorization).
fn extract_status_code(err: &octocrab::Error) -> Option<u16> {
    let err_str = err.to_string();

    if let Some(idx) = err_str.find("status: ") {
        let rest = &err_str[idx + 8..];
        let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
        if let Ok(code) = digits.parse() {
            return Some(code);
        }
    }

    for code in [404u16, 409, 422, 403, 401, 429, 500, 502, 503] {
        if err_str.contains(&code.to_string()) {
            return Some(code);
        }
    }
    None
}

fn is_rate_limit_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("rate limit") || lower.contains("secondary rate")
}

fn is_network_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("timed out")
        || lower.contains("timeout")
        || lower.contains("connection")
        || lower.contains("dns")
}
