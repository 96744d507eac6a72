//! In-memory registry of pull requests for one repository.
//!
//! Each repository supervisor owns exactly one `RepoModel`; all mutation
//! happens on that supervisor's task, so the model needs no locking. The
//! store mirrors every transition synchronously.

use std::collections::HashMap;

use thiserror::Error;

use crate::types::{PrNumber, PrStatus, PullRequest, RepoLabel, Sha};

/// What currently occupies the repository's integration branch.
///
/// A rollup is a single synthetic tracking record referencing its
/// constituent pull requests. Its first constituent carries the `Testing`
/// state and the build results (so that at most one pull request is ever in
/// `Testing`); the remaining constituents stay `Approved` until the rollup
/// resolves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActiveBuild {
    /// One pull request, merging on success.
    Single(PrNumber),

    /// One pull request, never merging (`try`).
    Try(PrNumber),

    /// Several approved pull requests merged into one integration commit.
    /// The first entry is the tracking pull request.
    Rollup {
        prs: Vec<PrNumber>,
        integration_sha: Sha,
    },
}

impl ActiveBuild {
    /// The pull request carrying the `Testing` state for this build.
    pub fn testing_pr(&self) -> Option<PrNumber> {
        match self {
            ActiveBuild::Single(pr) | ActiveBuild::Try(pr) => Some(*pr),
            ActiveBuild::Rollup { prs, .. } => prs.first().copied(),
        }
    }
}

/// A violation of the model's structural invariants.
///
/// These are fatal: the supervisor logs the violation and aborts rather
/// than continuing from a corrupt state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvariantViolation {
    #[error("both {first} and {second} are in testing")]
    MultipleTesting { first: PrNumber, second: PrNumber },

    #[error("{pr} is testing but has no integration SHA")]
    TestingWithoutSha { pr: PrNumber },

    #[error("{pr} is approved but has no approver")]
    ApprovedWithoutApprover { pr: PrNumber },

    #[error("{pr} has both rollup and try set")]
    RollupAndTry { pr: PrNumber },

    #[error("active build references untracked {pr}")]
    ActiveBuildUntracked { pr: PrNumber },

    #[error("{pr} is testing but no build is active")]
    TestingWithoutActiveBuild { pr: PrNumber },
}

/// Per-repository pull request registry.
#[derive(Debug)]
pub struct RepoModel {
    label: RepoLabel,
    prs: HashMap<PrNumber, PullRequest>,
    active: Option<ActiveBuild>,
}

impl RepoModel {
    pub fn new(label: RepoLabel) -> Self {
        RepoModel {
            label,
            prs: HashMap::new(),
            active: None,
        }
    }

    /// Rebuilds a model from persisted rows, keeping only those belonging
    /// to this repository.
    ///
    /// A pull request that was `Testing` at shutdown resumes as the active
    /// build; an interrupted rollup is not resumable (its constituents are
    /// still `Approved` and will simply be re-scheduled).
    pub fn rehydrate(label: RepoLabel, rows: Vec<PullRequest>) -> Self {
        let mut model = RepoModel::new(label);
        for pr in rows {
            if pr.repo != model.label {
                continue;
            }
            if pr.status == PrStatus::Testing {
                model.active = Some(if pr.try_build {
                    ActiveBuild::Try(pr.number)
                } else {
                    ActiveBuild::Single(pr.number)
                });
            }
            model.prs.insert(pr.number, pr);
        }
        model
    }

    pub fn label(&self) -> &RepoLabel {
        &self.label
    }

    pub fn get(&self, number: PrNumber) -> Option<&PullRequest> {
        self.prs.get(&number)
    }

    pub fn get_mut(&mut self, number: PrNumber) -> Option<&mut PullRequest> {
        self.prs.get_mut(&number)
    }

    pub fn contains(&self, number: PrNumber) -> bool {
        self.prs.contains_key(&number)
    }

    pub fn insert(&mut self, pr: PullRequest) {
        self.prs.insert(pr.number, pr);
    }

    /// Removes a pull request, clearing any active build that references it.
    pub fn remove(&mut self, number: PrNumber) -> Option<PullRequest> {
        if let Some(active) = &self.active {
            let referenced = match active {
                ActiveBuild::Single(pr) | ActiveBuild::Try(pr) => *pr == number,
                ActiveBuild::Rollup { prs, .. } => prs.contains(&number),
            };
            if referenced {
                self.active = None;
            }
        }
        self.prs.remove(&number)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PullRequest> {
        self.prs.values()
    }

    pub fn len(&self) -> usize {
        self.prs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prs.is_empty()
    }

    /// The scheduler's sorted view: try builds first, then higher priority,
    /// then non-rollup before rollup, then lower number. Deterministic for
    /// a given model.
    pub fn queue(&self) -> Vec<&PullRequest> {
        let mut queue: Vec<&PullRequest> = self.prs.values().collect();
        queue.sort_by_key(|pr| pr.queue_key());
        queue
    }

    pub fn active(&self) -> Option<&ActiveBuild> {
        self.active.as_ref()
    }

    pub fn set_active(&mut self, build: ActiveBuild) {
        self.active = Some(build);
    }

    pub fn clear_active(&mut self) {
        self.active = None;
    }

    /// The pull request currently in `Testing`, if any.
    pub fn testing_pr(&self) -> Option<PrNumber> {
        self.prs
            .values()
            .find(|pr| pr.status.is_testing())
            .map(|pr| pr.number)
    }

    /// Verifies the structural invariants of the model.
    pub fn check_invariants(&self) -> Result<(), InvariantViolation> {
        let mut testing: Option<PrNumber> = None;
        for pr in self.prs.values() {
            if pr.status == PrStatus::Testing {
                if let Some(first) = testing {
                    return Err(InvariantViolation::MultipleTesting {
                        first,
                        second: pr.number,
                    });
                }
                testing = Some(pr.number);
                if pr.integration_sha.is_none() {
                    return Err(InvariantViolation::TestingWithoutSha { pr: pr.number });
                }
                if self.active.is_none() {
                    return Err(InvariantViolation::TestingWithoutActiveBuild { pr: pr.number });
                }
            }
            if pr.status == PrStatus::Approved && pr.approved_by.is_none() {
                return Err(InvariantViolation::ApprovedWithoutApprover { pr: pr.number });
            }
            if pr.rollup && pr.try_build {
                return Err(InvariantViolation::RollupAndTry { pr: pr.number });
            }
        }

        if let Some(active) = &self.active {
            let referenced: Vec<PrNumber> = match active {
                ActiveBuild::Single(pr) | ActiveBuild::Try(pr) => vec![*pr],
                ActiveBuild::Rollup { prs, .. } => prs.clone(),
            };
            for pr in referenced {
                if !self.prs.contains_key(&pr) {
                    return Err(InvariantViolation::ActiveBuildUntracked { pr });
                }
            }
        }

        Ok(())
    }
}
