//! GitHub webhook payload parsing.
//!
//! Parses raw webhook JSON into normalized [`Event`] values. The event type
//! comes from the `X-GitHub-Event` header; unknown event types and actions
//! are ignored (`Ok(None)`), while malformed payloads for known types are
//! errors.

use serde::Deserialize;
use thiserror::Error;

use crate::types::{PrNumber, Sha};

use super::event::Event;

/// Error type for webhook parsing failures.
#[derive(Debug, Error)]
pub enum ParseError {
    /// JSON deserialization failed (includes missing required fields).
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    /// Field has an invalid value (e.g. malformed SHA).
    #[error("invalid field value for {field}: {value}")]
    InvalidField { field: &'static str, value: String },
}

/// The repository a payload belongs to, as `(owner, name)`.
pub type RepoCoordinates = (String, String);

/// Parses a GitHub webhook payload into a normalized event.
///
/// Returns the repository coordinates alongside the event so intake can
/// route it to the right supervisor. `Ok(None)` means the event type or
/// action is not relevant to the merge queue.
pub fn parse_github_webhook(
    event_type: &str,
    payload: &[u8],
) -> Result<Option<(RepoCoordinates, Event)>, ParseError> {
    match event_type {
        "pull_request" => parse_pull_request(payload),
        "issue_comment" => parse_issue_comment(payload),
        "push" => parse_push(payload),
        // Unknown event types are ignored (not an error)
        _ => Ok(None),
    }
}

// ============================================================================
// Raw payload structures for deserialization
//
// These match GitHub's webhook JSON structure. Option<T> is used liberally
// to handle missing fields gracefully; required fields are validated
// explicitly afterwards.
// ============================================================================

#[derive(Debug, Deserialize)]
struct RawRepository {
    owner: RawOwner,
    name: String,
}

#[derive(Debug, Deserialize)]
struct RawOwner {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawPullRequestPayload {
    action: String,
    pull_request: RawPullRequest,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawPullRequest {
    number: u64,
    title: Option<String>,
    body: Option<String>,
    head: RawRef,
    base: RawRef,
    user: Option<RawUser>,
    assignee: Option<RawUser>,
}

#[derive(Debug, Deserialize)]
struct RawRef {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
}

fn parse_pull_request(payload: &[u8]) -> Result<Option<(RepoCoordinates, Event)>, ParseError> {
    let raw: RawPullRequestPayload = serde_json::from_slice(payload)?;
    let repo = (raw.repository.owner.login, raw.repository.name);
    let number = PrNumber(raw.pull_request.number);

    let head_sha = Sha::parse(&raw.pull_request.head.sha).map_err(|_| ParseError::InvalidField {
        field: "pull_request.head.sha",
        value: raw.pull_request.head.sha.clone(),
    })?;

    let event = match raw.action.as_str() {
        "opened" | "reopened" => Event::PrOpened {
            number,
            title: raw.pull_request.title.unwrap_or_default(),
            body: raw.pull_request.body.unwrap_or_default(),
            head_sha,
            head_ref: raw.pull_request.head.ref_name,
            base_ref: raw.pull_request.base.ref_name,
            author: raw.pull_request.user.map(|u| u.login).unwrap_or_default(),
            assignee: raw.pull_request.assignee.map(|u| u.login),
        },
        "closed" => Event::PrClosed { number },
        "synchronize" => Event::PrSynchronized { number, head_sha },
        // Other actions (labeled, assigned, edited, ...) are irrelevant
        _ => return Ok(None),
    };

    Ok(Some((repo, event)))
}

#[derive(Debug, Deserialize)]
struct RawIssueCommentPayload {
    action: String,
    comment: RawComment,
    issue: RawIssue,
    repository: RawRepository,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    body: Option<String>,
    user: RawUser,
}

#[derive(Debug, Deserialize)]
struct RawIssue {
    number: u64,
    // If this field is present, the issue is actually a PR
    pull_request: Option<serde_json::Value>,
}

fn parse_issue_comment(payload: &[u8]) -> Result<Option<(RepoCoordinates, Event)>, ParseError> {
    let raw: RawIssueCommentPayload = serde_json::from_slice(payload)?;

    // Only freshly created comments on pull requests carry commands.
    if raw.action != "created" || raw.issue.pull_request.is_none() {
        return Ok(None);
    }

    let repo = (raw.repository.owner.login, raw.repository.name);
    Ok(Some((
        repo,
        Event::PrComment {
            number: PrNumber(raw.issue.number),
            author: raw.comment.user.login,
            body: raw.comment.body.unwrap_or_default(),
        },
    )))
}

#[derive(Debug, Deserialize)]
struct RawPushPayload {
    #[serde(rename = "ref")]
    ref_name: String,
    after: String,
    repository: RawRepository,
}

fn parse_push(payload: &[u8]) -> Result<Option<(RepoCoordinates, Event)>, ParseError> {
    let raw: RawPushPayload = serde_json::from_slice(payload)?;

    let Some(branch) = raw.ref_name.strip_prefix("refs/heads/") else {
        // Tag pushes and the like
        return Ok(None);
    };

    let sha = Sha::parse(&raw.after).map_err(|_| ParseError::InvalidField {
        field: "after",
        value: raw.after.clone(),
    })?;

    let repo = (raw.repository.owner.login, raw.repository.name);
    Ok(Some((
        repo,
        Event::PushToBranch {
            branch: branch.to_string(),
            sha,
        },
    )))
}
