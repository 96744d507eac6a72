//! Normalized internal events.
//!
//! Webhook intake converts every accepted payload, whatever its origin, into
//! one of these records before enqueueing it on the owning repository's
//! supervisor queue. Supervisors never see raw payloads.

use serde::{Deserialize, Serialize};

use crate::types::{BuildVerdict, PrNumber, Sha};

/// A CI verdict for one builder at one commit, as authenticated and decoded
/// by a provider binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutcome {
    /// The builder name this verdict belongs to (e.g. `"linux"`).
    pub builder: String,

    /// The commit the provider built — matched against integration SHAs.
    pub sha: Sha,

    pub verdict: BuildVerdict,

    /// Link to the build, if the provider reported one.
    pub url: Option<String>,
}

/// A normalized event on a repository's supervisor queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    /// A pull request was opened (or reopened).
    PrOpened {
        number: PrNumber,
        title: String,
        body: String,
        head_sha: Sha,
        head_ref: String,
        base_ref: String,
        author: String,
        assignee: Option<String>,
    },

    /// A pull request was closed (merged or not).
    PrClosed { number: PrNumber },

    /// The head ref moved to a new SHA.
    PrSynchronized { number: PrNumber, head_sha: Sha },

    /// A comment was posted on a pull request.
    PrComment {
        number: PrNumber,
        author: String,
        body: String,
    },

    /// A branch in the repository was pushed.
    PushToBranch { branch: String, sha: Sha },

    /// A CI provider reported a build status.
    BuildStatus(BuildOutcome),
}
