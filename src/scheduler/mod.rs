//! Build selection and launch.
//!
//! The scheduler runs on the owning supervisor after every event. Selection
//! is a pure function over the model; launching a build talks to the host,
//! records provenance in the store, and transitions the chosen pull request
//! to `Testing`.

use tracing::{info, warn};

use crate::config::RepoConfig;
use crate::host::{HostApi, HostError, RetryConfig, StatusState, with_retry};
use crate::model::{ActiveBuild, RepoModel};
use crate::store::{Store, StoreError};
use crate::types::{Mergeable, PrNumber, PrStatus, PullRequest, Sha};

/// The commit-status context the bot reports under.
pub const STATUS_CONTEXT: &str = "homu";

/// What the scheduler decided to build next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    /// A try build for one pull request; never merges.
    Try(PrNumber),

    /// A single merge candidate.
    Single(PrNumber),

    /// A rollup of several candidates, in queue order. Always at least two
    /// entries (a rollup of one is just a single build).
    Rollup(Vec<PrNumber>),
}

/// Picks the next build, or `None` when a build is active or no candidate
/// is eligible.
///
/// Merge candidates are `Approved` pull requests whose mergeability hint is
/// not `No`, ordered by the queue view. The try set wins if non-empty; try
/// builds do not require approval (their result reverts to the pre-try
/// state either way). If the top merge candidate carries the rollup flag,
/// the contiguous rollup prefix (capped) is combined into one build.
pub fn select_next(model: &RepoModel, rollup_cap: usize) -> Option<Selection> {
    if model.active().is_some() {
        return None;
    }

    let queue = model.queue();

    // Try builds bypass the merge queue entirely.
    if let Some(try_pr) = queue.iter().find(|pr| {
        pr.try_build
            && matches!(pr.status, PrStatus::Approved | PrStatus::Pending)
            && pr.mergeable != Mergeable::No
    }) {
        return Some(Selection::Try(try_pr.number));
    }

    let candidates: Vec<&PullRequest> = queue
        .into_iter()
        .filter(|pr| {
            pr.status == PrStatus::Approved && !pr.try_build && pr.mergeable != Mergeable::No
        })
        .collect();

    let top = candidates.first()?;
    if !top.rollup {
        return Some(Selection::Single(top.number));
    }

    // The ordering puts rollup candidates last, so if the top candidate is a
    // rollup, the whole remaining queue is; take the contiguous prefix.
    let batch: Vec<PrNumber> = candidates
        .iter()
        .take_while(|pr| pr.rollup)
        .take(rollup_cap.max(1))
        .map(|pr| pr.number)
        .collect();

    if batch.len() >= 2 {
        Some(Selection::Rollup(batch))
    } else {
        Some(Selection::Single(top.number))
    }
}

/// The deterministic integration commit message for one pull request.
pub fn merge_message(pr: &PullRequest) -> String {
    let approver = if pr.try_build {
        "<try>"
    } else {
        pr.approved_by.as_deref().unwrap_or("")
    };
    format!(
        "Auto merge of {} - {}, r={}\n\n{}\n\n{}",
        pr.number, pr.head_ref, approver, pr.title, pr.body
    )
}

/// The integration commit message for one constituent of a rollup.
pub fn rollup_merge_message(pr: &PullRequest) -> String {
    format!(
        "Rollup merge of {} - {}, r={}\n\n{}\n\n{}",
        pr.number,
        pr.head_ref,
        pr.approved_by.as_deref().unwrap_or(""),
        pr.title,
        pr.body
    )
}

/// Runs one scheduling pass: pick and, if possible, launch the next build.
///
/// Returns `true` when the model changed without a build starting (a
/// candidate errored out), meaning the caller should run another pass.
/// Host failures never escape: they park the affected pull request in
/// `Error`. Store failures do escape; the supervisor treats them as fatal.
pub async fn schedule(
    model: &mut RepoModel,
    cfg: &RepoConfig,
    host: &dyn HostApi,
    store: &Store,
    retry: &RetryConfig,
) -> Result<bool, StoreError> {
    let Some(selection) = select_next(model, cfg.rollup_cap) else {
        return Ok(false);
    };

    match selection {
        Selection::Try(n) => start_single(model, cfg, host, store, retry, n, true).await,
        Selection::Single(n) => start_single(model, cfg, host, store, retry, n, false).await,
        Selection::Rollup(ns) => start_rollup(model, cfg, host, store, retry, ns).await,
    }
}

/// Launches a build for one pull request. `is_try` builds never merge.
async fn start_single(
    model: &mut RepoModel,
    cfg: &RepoConfig,
    host: &dyn HostApi,
    store: &Store,
    retry: &RetryConfig,
    number: PrNumber,
    is_try: bool,
) -> Result<bool, StoreError> {
    let base_sha = match prepare_integration_branch(cfg, host, retry).await {
        Ok(sha) => sha,
        Err(err) => return fail_pr(model, host, store, number, &err).await,
    };
    // The reset push echoes back as a webhook; record it so it is not
    // mistaken for a foreign push to the integration branch.
    store.record_trigger(&cfg.integration_branch, &base_sha, &base_sha)?;

    let message = {
        let Some(pr) = model.get(number) else {
            return Ok(false);
        };
        merge_message(pr)
    };
    let head_sha = model.get(number).map(|pr| pr.head_sha.clone());
    let Some(head_sha) = head_sha else {
        return Ok(false);
    };

    let merge_sha = match with_retry(retry, || {
        host.create_merge(&cfg.integration_branch, &head_sha, &message)
    })
    .await
    {
        Ok(sha) => sha,
        Err(err) => return fail_pr(model, host, store, number, &err).await,
    };

    store.record_trigger(&cfg.integration_branch, &merge_sha, &base_sha)?;
    store.increment_trigger_count(&merge_sha)?;

    let Some(pr) = model.get_mut(number) else {
        return Ok(false);
    };
    pr.integration_sha = Some(merge_sha.clone());
    pr.status = PrStatus::Testing;
    pr.build_url = None;
    pr.init_builds(cfg.builders.iter().cloned());
    pr.revision += 1;
    let head_sha = pr.head_sha.clone();
    let pr_snapshot = pr.clone();

    store.upsert_pull(&pr_snapshot)?;
    store.clear_builds(&pr_snapshot.repo, number)?;
    for builder in &cfg.builders {
        store.record_build(
            &pr_snapshot.repo,
            number,
            builder,
            crate::types::BuildVerdict::Pending,
            None,
            Some(&merge_sha),
        )?;
    }

    model.set_active(if is_try {
        ActiveBuild::Try(number)
    } else {
        ActiveBuild::Single(number)
    });

    info!(
        pr = %number,
        merge_sha = %merge_sha,
        branch = %cfg.integration_branch,
        try_build = is_try,
        "Started build"
    );

    let description = format!(
        "{} commit {} with merge {}...",
        if is_try { "Trying" } else { "Testing" },
        head_sha.short(),
        merge_sha.short()
    );
    best_effort_status(host, &head_sha, StatusState::Pending, &description).await;
    best_effort_comment(host, number, &format!(":hourglass: {}", description)).await;

    Ok(false)
}

/// Launches a rollup build. The first constituent tracks the build; the
/// rest stay `Approved` until the rollup resolves.
async fn start_rollup(
    model: &mut RepoModel,
    cfg: &RepoConfig,
    host: &dyn HostApi,
    store: &Store,
    retry: &RetryConfig,
    numbers: Vec<PrNumber>,
) -> Result<bool, StoreError> {
    let base_sha = match prepare_integration_branch(cfg, host, retry).await {
        Ok(sha) => sha,
        Err(err) => {
            // Charge the branch failure to the head of the batch.
            return fail_pr(model, host, store, numbers[0], &err).await;
        }
    };
    // The reset push echoes back as a webhook; record it so it is not
    // mistaken for a foreign push to the integration branch.
    store.record_trigger(&cfg.integration_branch, &base_sha, &base_sha)?;

    // Merge each constituent onto the integration branch in queue order.
    // A conflicting constituent is parked in `Error`; the pass is abandoned
    // and re-run without it.
    let mut last_merge: Option<Sha> = None;
    for &number in &numbers {
        let Some(pr) = model.get(number) else {
            continue;
        };
        let message = rollup_merge_message(pr);
        let head_sha = pr.head_sha.clone();

        match with_retry(retry, || {
            host.create_merge(&cfg.integration_branch, &head_sha, &message)
        })
        .await
        {
            Ok(sha) => last_merge = Some(sha),
            Err(err) => {
                fail_pr(model, host, store, number, &err).await?;
                return Ok(true);
            }
        }
    }

    let Some(merge_sha) = last_merge else {
        return Ok(false);
    };

    store.record_trigger(&cfg.integration_branch, &merge_sha, &base_sha)?;
    store.increment_trigger_count(&merge_sha)?;

    let tracker = numbers[0];
    let Some(pr) = model.get_mut(tracker) else {
        return Ok(false);
    };
    pr.integration_sha = Some(merge_sha.clone());
    pr.status = PrStatus::Testing;
    pr.build_url = None;
    pr.init_builds(cfg.builders.iter().cloned());
    pr.revision += 1;
    let pr_snapshot = pr.clone();

    store.upsert_pull(&pr_snapshot)?;
    store.clear_builds(&pr_snapshot.repo, tracker)?;
    for builder in &cfg.builders {
        store.record_build(
            &pr_snapshot.repo,
            tracker,
            builder,
            crate::types::BuildVerdict::Pending,
            None,
            Some(&merge_sha),
        )?;
    }

    info!(
        prs = ?numbers.iter().map(|n| n.0).collect::<Vec<_>>(),
        merge_sha = %merge_sha,
        "Started rollup build"
    );

    let list = numbers
        .iter()
        .map(|n| n.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    best_effort_comment(
        host,
        tracker,
        &format!(
            ":hourglass: Testing rollup of {} with merge {}...",
            list,
            merge_sha.short()
        ),
    )
    .await;

    model.set_active(ActiveBuild::Rollup {
        prs: numbers,
        integration_sha: merge_sha,
    });

    Ok(false)
}

/// Force-resets the integration branch to the protected branch tip,
/// returning that tip.
async fn prepare_integration_branch(
    cfg: &RepoConfig,
    host: &dyn HostApi,
    retry: &RetryConfig,
) -> Result<Sha, HostError> {
    let base_sha = with_retry(retry, || host.branch_sha(&cfg.protected_branch)).await?;
    with_retry(retry, || {
        host.push_branch(&cfg.integration_branch, &base_sha)
    })
    .await?;
    Ok(base_sha)
}

/// Parks a pull request in `Error` after a host failure, posting a comment
/// for refusals. Returns `Ok(true)`: the model changed, re-run the pass.
async fn fail_pr(
    model: &mut RepoModel,
    host: &dyn HostApi,
    store: &Store,
    number: PrNumber,
    err: &HostError,
) -> Result<bool, StoreError> {
    warn!(pr = %number, error = %err, "Build start failed");

    let Some(pr) = model.get_mut(number) else {
        return Ok(false);
    };
    pr.status = PrStatus::Error;
    pr.integration_sha = None;
    pr.builds.clear();
    pr.revision += 1;
    let head_sha = pr.head_sha.clone();
    let snapshot = pr.clone();
    store.upsert_pull(&snapshot)?;
    store.clear_builds(&snapshot.repo, number)?;

    if err.is_transient() {
        // Retry-eligible: a `retry` command or the next timer tick can
        // re-approve it without a reviewer.
        best_effort_comment(
            host,
            number,
            ":warning: The build could not be started; will retry.",
        )
        .await;
    } else {
        best_effort_status(host, &head_sha, StatusState::Error, "Merge conflict").await;
        best_effort_comment(host, number, ":lock: Merge conflict").await;
    }

    Ok(true)
}

/// Posts a comment, logging instead of failing: comments are advisory and
/// must never wedge the queue.
pub async fn best_effort_comment(host: &dyn HostApi, number: PrNumber, body: &str) {
    if let Err(err) = host.post_comment(number, body).await {
        warn!(pr = %number, error = %err, "Failed to post comment");
    }
}

/// Sets a commit status, logging instead of failing.
pub async fn best_effort_status(host: &dyn HostApi, sha: &Sha, state: StatusState, desc: &str) {
    if let Err(err) = host.set_status(sha, state, STATUS_CONTEXT, desc).await {
        warn!(sha = %sha.short(), error = %err, "Failed to set commit status");
    }
}
