//! The narrow capability interface to the code host.
//!
//! The supervisor and scheduler only ever talk to the host through this
//! trait, so tests can substitute an in-memory fake and the production
//! implementation stays in one place.

use async_trait::async_trait;

use crate::types::{PrNumber, Sha};

use super::error::HostError;

/// A snapshot of one pull request as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrSnapshot {
    pub number: PrNumber,
    pub title: String,
    pub body: String,
    pub head_sha: Sha,
    pub head_ref: String,
    pub base_ref: String,
    pub assignee: Option<String>,

    /// The host's mergeability hint; `None` while it is still computing.
    pub mergeable: Option<bool>,
}

/// A comment as reported by the host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommentRecord {
    pub author: String,
    pub body: String,
}

/// Commit status states understood by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusState {
    Pending,
    Success,
    Failure,
    Error,
}

impl StatusState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusState::Pending => "pending",
            StatusState::Success => "success",
            StatusState::Failure => "failure",
            StatusState::Error => "error",
        }
    }
}

/// Repo-scoped host operations.
///
/// All operations target the repository the implementation was built for;
/// callers never pass owner/name. Every call carries a deadline in the
/// implementation.
#[async_trait]
pub trait HostApi: Send + Sync {
    /// Fetches the current state of a pull request.
    async fn get_pr(&self, number: PrNumber) -> Result<PrSnapshot, HostError>;

    /// Lists the comments on a pull request, oldest first.
    async fn list_comments(&self, number: PrNumber) -> Result<Vec<CommentRecord>, HostError>;

    /// Posts a comment on a pull request.
    async fn post_comment(&self, number: PrNumber, body: &str) -> Result<(), HostError>;

    /// Creates a merge commit on `branch` merging `head` into it, with the
    /// given commit message. Returns the SHA of the merge commit.
    ///
    /// A merge conflict is a [`HostErrorKind::Refusal`](super::HostErrorKind).
    async fn create_merge(
        &self,
        branch: &str,
        head: &Sha,
        message: &str,
    ) -> Result<Sha, HostError>;

    /// Force-sets `branch` to point at `sha`, creating it if necessary.
    async fn push_branch(&self, branch: &str, sha: &Sha) -> Result<(), HostError>;

    /// Fast-forwards `branch` to `sha`. Refused by the host if the update
    /// is not a fast-forward (someone else pushed).
    async fn fast_forward(&self, branch: &str, sha: &Sha) -> Result<(), HostError>;

    /// Sets a commit status on `sha`.
    async fn set_status(
        &self,
        sha: &Sha,
        state: StatusState,
        context: &str,
        description: &str,
    ) -> Result<(), HostError>;

    /// Reads the SHA at the tip of `branch`.
    async fn branch_sha(&self, branch: &str) -> Result<Sha, HostError>;
}
