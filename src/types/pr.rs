//! Pull request records and their scheduling state.
//!
//! These types represent the state of pull requests as tracked by the merge
//! queue. The in-memory record is the source of truth at runtime; the store
//! mirrors it row-for-row.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ids::{PrNumber, RepoLabel, Sha};

/// The scheduling state of a pull request.
///
/// Persisted as a stable lowercase string at the store boundary; the enum is
/// never serialized positionally so variants can be reordered freely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrStatus {
    /// Tracked but not approved.
    Pending,

    /// Approved, eligible to be picked by the scheduler.
    Approved,

    /// Currently on the integration branch with CI running.
    Testing,

    /// CI passed on the current integration SHA; ready to fast-forward.
    Success,

    /// CI failed; requires re-approval or `retry` to run again.
    Failure,

    /// The host refused a merge/push, or the PR became unmergeable.
    Error,
}

impl PrStatus {
    /// The stable string stored in the `pull.status` column.
    pub fn as_str(&self) -> &'static str {
        match self {
            PrStatus::Pending => "pending",
            PrStatus::Approved => "approved",
            PrStatus::Testing => "testing",
            PrStatus::Success => "success",
            PrStatus::Failure => "failure",
            PrStatus::Error => "error",
        }
    }

    /// Parses the stable string form. Returns `None` for unknown strings.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(PrStatus::Pending),
            "approved" => Some(PrStatus::Approved),
            "testing" => Some(PrStatus::Testing),
            "success" => Some(PrStatus::Success),
            "failure" => Some(PrStatus::Failure),
            "error" => Some(PrStatus::Error),
            _ => None,
        }
    }

    /// Returns true if a build for this PR currently occupies the
    /// integration branch.
    pub fn is_testing(&self) -> bool {
        matches!(self, PrStatus::Testing)
    }
}

/// The host's cached "can this merge cleanly?" signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mergeable {
    Yes,
    No,
    Unknown,
}

impl Mergeable {
    /// Converts the host API's optional boolean into the tri-state.
    pub fn from_hint(hint: Option<bool>) -> Self {
        match hint {
            Some(true) => Mergeable::Yes,
            Some(false) => Mergeable::No,
            None => Mergeable::Unknown,
        }
    }

    /// The database representation: `NULL` for unknown.
    pub fn to_hint(self) -> Option<bool> {
        match self {
            Mergeable::Yes => Some(true),
            Mergeable::No => Some(false),
            Mergeable::Unknown => None,
        }
    }
}

/// The verdict reported by one builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildVerdict {
    Pending,
    Success,
    Failure,
}

impl BuildVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            BuildVerdict::Pending => "pending",
            BuildVerdict::Success => "success",
            BuildVerdict::Failure => "failure",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(BuildVerdict::Pending),
            "success" => Some(BuildVerdict::Success),
            "failure" => Some(BuildVerdict::Failure),
            _ => None,
        }
    }
}

/// One builder's result for a pull request, keyed by builder name in
/// [`PullRequest::builds`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildResult {
    pub verdict: BuildVerdict,

    /// Link to the build, if the provider reported one.
    pub url: Option<String>,

    /// The integration SHA this result was produced for. Results whose SHA
    /// no longer matches the PR's current integration SHA are stale.
    pub integration_sha: Option<Sha>,
}

impl BuildResult {
    fn pending() -> Self {
        BuildResult {
            verdict: BuildVerdict::Pending,
            url: None,
            integration_sha: None,
        }
    }
}

/// A tracked pull request with all transient scheduling fields.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub repo: RepoLabel,
    pub number: PrNumber,
    pub title: String,
    pub body: String,
    pub head_sha: Sha,
    pub head_ref: String,
    pub base_ref: String,

    /// PR author login. Informational only, so not persisted; repopulated
    /// from host events after a restart.
    #[serde(skip)]
    pub author: String,

    pub assignee: Option<String>,

    /// Reviewer who approved; `None` means unapproved.
    pub approved_by: Option<String>,

    /// User granted approval authority over this PR via `delegate`.
    /// In-memory only; delegation does not survive a restart.
    #[serde(skip)]
    pub delegate: Option<String>,

    /// Signed queue priority, default 0.
    pub priority: i32,
    pub rollup: bool,
    pub try_build: bool,
    pub mergeable: Mergeable,
    pub status: PrStatus,

    /// The SHA of the speculative merge commit last built for this PR.
    pub integration_sha: Option<Sha>,

    /// Link to the most recent build, surfaced in try reports.
    pub build_url: Option<String>,

    /// Per-builder results for the current integration SHA.
    pub builds: HashMap<String, BuildResult>,

    /// Monotonically increasing counter used to ignore stale async
    /// callbacks. Not persisted; restarts reset it.
    #[serde(skip)]
    pub revision: u64,
}

impl PullRequest {
    /// Creates a freshly tracked pull request in `Pending`.
    pub fn new(repo: RepoLabel, number: PrNumber, head_sha: Sha) -> Self {
        PullRequest {
            repo,
            number,
            title: String::new(),
            body: String::new(),
            head_sha,
            head_ref: String::new(),
            base_ref: String::new(),
            author: String::new(),
            assignee: None,
            approved_by: None,
            delegate: None,
            priority: 0,
            rollup: false,
            try_build: false,
            mergeable: Mergeable::Unknown,
            status: PrStatus::Pending,
            integration_sha: None,
            build_url: None,
            builds: HashMap::new(),
            revision: 0,
        }
    }

    /// Applies a head-ref push: the approval, any running build and the
    /// mergeability hint are all invalidated.
    pub fn head_advanced(&mut self, new_head: Sha) {
        self.head_sha = new_head;
        self.approved_by = None;
        self.status = PrStatus::Pending;
        self.integration_sha = None;
        self.build_url = None;
        self.builds.clear();
        self.try_build = false;
        self.mergeable = Mergeable::Unknown;
        self.revision += 1;
    }

    /// Initializes one pending [`BuildResult`] per required builder,
    /// discarding any previous results.
    pub fn init_builds<I, S>(&mut self, builders: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.builds = builders
            .into_iter()
            .map(|b| (b.into(), BuildResult::pending()))
            .collect();
    }

    /// Records a builder verdict for the given integration SHA.
    ///
    /// Returns `false` (and changes nothing) when the callback is stale:
    /// the SHA does not match the current integration SHA, or the builder
    /// is not one of the configured builders for this build.
    pub fn record_build(
        &mut self,
        builder: &str,
        verdict: BuildVerdict,
        url: Option<String>,
        sha: &Sha,
    ) -> bool {
        if self.integration_sha.as_ref() != Some(sha) {
            return false;
        }
        let Some(entry) = self.builds.get_mut(builder) else {
            return false;
        };
        entry.verdict = verdict;
        entry.integration_sha = Some(sha.clone());
        if url.is_some() {
            entry.url = url.clone();
            self.build_url = url;
        }
        true
    }

    /// Returns true when every configured builder has reported success for
    /// the current integration SHA. Empty builder sets are never green.
    pub fn all_green(&self) -> bool {
        let Some(sha) = self.integration_sha.as_ref() else {
            return false;
        };
        !self.builds.is_empty()
            && self.builds.values().all(|b| {
                b.verdict == BuildVerdict::Success && b.integration_sha.as_ref() == Some(sha)
            })
    }

    /// Returns true if any builder has reported failure for the current
    /// integration SHA.
    pub fn any_failed(&self) -> bool {
        let Some(sha) = self.integration_sha.as_ref() else {
            return false;
        };
        self.builds.values().any(|b| {
            b.verdict == BuildVerdict::Failure && b.integration_sha.as_ref() == Some(sha)
        })
    }

    /// The scheduler's ordering key: try builds first, then higher priority,
    /// then non-rollup before rollup, then lower PR number. Lower keys sort
    /// first.
    pub fn queue_key(&self) -> (u8, i64, bool, PrNumber) {
        let try_rank = if self.try_build { 0 } else { 1 };
        // Negate into i64 so that i32::MIN does not overflow.
        (try_rank, -(self.priority as i64), self.rollup, self.number)
    }
}
