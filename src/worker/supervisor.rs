//! Per-repository supervisor loop.
//!
//! One supervisor task owns the model for its repository, drains a bounded
//! FIFO queue of normalized events, applies them (command mutations, state
//! transitions, store writes) and re-runs the scheduler after each event.
//! No two events for the same repository are ever processed in parallel.
//!
//! Invariant violations are fatal: the supervisor logs at `error` and exits
//! its loop, leaving restart to the process supervisor.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::commands::{Approver, Command, Delegate, Parsed, parse_commands};
use crate::config::RepoConfig;
use crate::events::{BuildOutcome, Event};
use crate::host::{HostApi, RetryConfig, StatusState, with_retry};
use crate::model::{ActiveBuild, InvariantViolation, RepoModel};
use crate::scheduler::{best_effort_comment, best_effort_status, schedule};
use crate::store::{Store, StoreError};
use crate::types::{DeliveryId, Mergeable, PrNumber, PrStatus, PullRequest};

use super::message::{Envelope, SupervisorMessage};

/// Interval between timer ticks (mergeability refresh + scheduler re-run).
const TICK_INTERVAL: Duration = Duration::from_secs(60);

/// How many unknown-mergeability PRs one tick refreshes.
const MERGEABILITY_REFRESH_LIMIT: usize = 5;

/// How many webhook delivery ids are remembered for dedup.
const SEEN_DELIVERY_WINDOW: usize = 4096;

/// Fatal supervisor errors. Everything else is absorbed per pull request.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("invariant violated: {0}")]
    Invariant(#[from] InvariantViolation),
}

/// Per-repository supervisor: owns the model and drives the scheduler.
pub struct RepoSupervisor {
    cfg: RepoConfig,
    trigger: String,
    model: RepoModel,
    store: Arc<Store>,
    host: Arc<dyn HostApi>,
    retry: RetryConfig,
    seen_deliveries: HashSet<DeliveryId>,
    seen_order: VecDeque<DeliveryId>,
}

impl RepoSupervisor {
    /// Creates a supervisor, rehydrating its model from the store rows.
    pub fn new(
        cfg: RepoConfig,
        trigger: String,
        model: RepoModel,
        store: Arc<Store>,
        host: Arc<dyn HostApi>,
    ) -> Self {
        RepoSupervisor {
            cfg,
            trigger,
            model,
            store,
            host,
            retry: RetryConfig::DEFAULT,
            seen_deliveries: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    /// Overrides the host retry policy (tests use millisecond delays).
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn model(&self) -> &RepoModel {
        &self.model
    }

    /// Runs the supervisor loop until cancellation or a fatal error.
    pub async fn run(
        mut self,
        mut rx: mpsc::Receiver<SupervisorMessage>,
        cancel: CancellationToken,
    ) {
        let label = self.model.label().clone();
        info!(repo = %label, prs = self.model.len(), "Supervisor started");

        let mut tick = tokio::time::interval(TICK_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; use it as the startup pass.
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => {
                    // Drain whatever is already queued, then stop.
                    while let Ok(message) = rx.try_recv() {
                        if let Err(err) = self.handle_message(message).await {
                            error!(repo = %label, error = %err, "Fatal error during drain");
                            return;
                        }
                    }
                    info!(repo = %label, "Supervisor stopped");
                    return;
                }
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => {
                        info!(repo = %label, "Supervisor channel closed");
                        return;
                    }
                },
                _ = tick.tick() => SupervisorMessage::Tick,
            };

            if let Err(err) = self.handle_message(message).await {
                // Fatal: abort and let the process supervisor restart us.
                error!(repo = %label, error = %err, "Supervisor aborting");
                return;
            }
        }
    }

    /// Processes one message: apply, verify invariants, re-run scheduler.
    pub async fn handle_message(
        &mut self,
        message: SupervisorMessage,
    ) -> Result<(), SupervisorError> {
        match message {
            SupervisorMessage::Event(envelope) => self.handle_envelope(envelope).await,
            SupervisorMessage::Tick => {
                self.refresh_mergeability().await?;
                self.run_scheduler().await?;
                self.model.check_invariants()?;
                Ok(())
            }
        }
    }

    /// Processes one external event end-to-end.
    pub async fn handle_envelope(&mut self, envelope: Envelope) -> Result<(), SupervisorError> {
        if let Some(delivery) = &envelope.delivery {
            if !self.remember_delivery(delivery.clone()) {
                debug!(delivery = %delivery, "Duplicate delivery ignored");
                return Ok(());
            }
        }

        self.apply_event(envelope.event).await?;
        self.run_scheduler().await?;
        self.model.check_invariants()?;
        Ok(())
    }

    /// Records a delivery id; returns false if it was already seen.
    fn remember_delivery(&mut self, delivery: DeliveryId) -> bool {
        if self.seen_deliveries.contains(&delivery) {
            return false;
        }
        if self.seen_order.len() >= SEEN_DELIVERY_WINDOW {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen_deliveries.remove(&oldest);
            }
        }
        self.seen_order.push_back(delivery.clone());
        self.seen_deliveries.insert(delivery);
        true
    }

    /// Runs scheduling passes until the model stops changing.
    async fn run_scheduler(&mut self) -> Result<(), SupervisorError> {
        while schedule(
            &mut self.model,
            &self.cfg,
            self.host.as_ref(),
            &self.store,
            &self.retry,
        )
        .await?
        {}
        Ok(())
    }

    async fn apply_event(&mut self, event: Event) -> Result<(), SupervisorError> {
        match event {
            Event::PrOpened {
                number,
                title,
                body,
                head_sha,
                head_ref,
                base_ref,
                author,
                assignee,
            } => {
                let label = self.model.label().clone();
                if !self.model.contains(number) {
                    self.model
                        .insert(PullRequest::new(label, number, head_sha.clone()));
                }
                let Some(pr) = self.model.get_mut(number) else {
                    return Ok(());
                };
                pr.title = title;
                pr.body = body;
                pr.head_ref = head_ref;
                pr.base_ref = base_ref;
                pr.author = author;
                pr.assignee = assignee;
                if pr.head_sha != head_sha {
                    pr.head_advanced(head_sha);
                }
                let snapshot = pr.clone();
                self.store.upsert_pull(&snapshot)?;
            }

            Event::PrClosed { number } => {
                if let Some(pr) = self.model.remove(number) {
                    info!(pr = %number, "Pull request closed, untracking");
                    // The row is of no further use once the host confirms
                    // the close; rehydrating it would resurrect the PR.
                    self.store.delete_pull(&pr.repo, number)?;
                }
            }

            Event::PrSynchronized { number, head_sha } => {
                self.on_head_advanced(number, head_sha).await?;
            }

            Event::PrComment {
                number,
                author,
                body,
            } => {
                self.apply_comment(number, &author, &body).await?;
            }

            Event::PushToBranch { branch, sha } => {
                if branch == self.cfg.protected_branch {
                    // The base moved; every cached mergeability hint is now
                    // suspect.
                    let numbers: Vec<PrNumber> =
                        self.model.iter().map(|pr| pr.number).collect();
                    for number in numbers {
                        if let Some(pr) = self.model.get_mut(number) {
                            if pr.mergeable != Mergeable::Unknown {
                                pr.mergeable = Mergeable::Unknown;
                                let label = pr.repo.clone();
                                self.store.clear_mergeable(&label, number)?;
                            }
                        }
                    }
                } else if branch == self.cfg.integration_branch {
                    self.on_integration_branch_push(sha).await?;
                }
                // Pushes to PR head refs arrive as PrSynchronized.
            }

            Event::BuildStatus(outcome) => {
                self.on_build_status(outcome).await?;
            }
        }
        Ok(())
    }

    /// A push changed a pull request's head: the approval, any running
    /// build and the mergeability hint are all invalidated.
    async fn on_head_advanced(
        &mut self,
        number: PrNumber,
        head_sha: crate::types::Sha,
    ) -> Result<(), SupervisorError> {
        let label = self.model.label().clone();

        let in_active_build = self
            .model
            .active()
            .is_some_and(|active| match active {
                ActiveBuild::Single(pr) | ActiveBuild::Try(pr) => *pr == number,
                ActiveBuild::Rollup { prs, .. } => prs.contains(&number),
            });

        if !self.model.contains(number) {
            // First event for this PR; track it minimally.
            let pr = PullRequest::new(label, number, head_sha);
            let snapshot = pr.clone();
            self.model.insert(pr);
            self.store.upsert_pull(&snapshot)?;
            return Ok(());
        }
        let Some(pr) = self.model.get_mut(number) else {
            return Ok(());
        };

        if pr.head_sha == head_sha {
            return Ok(());
        }

        pr.head_advanced(head_sha);
        let snapshot = pr.clone();
        self.store.upsert_pull(&snapshot)?;
        self.store.clear_builds(&snapshot.repo, number)?;
        self.store.clear_mergeable(&snapshot.repo, number)?;

        if in_active_build {
            // The build on the integration branch no longer corresponds to
            // what would land; abandon it. For a rollup this abandons the
            // whole batch, and the untouched constituents are re-picked on
            // the next pass.
            warn!(pr = %number, "Head advanced during build, abandoning build");
            self.abandon_active_build(number).await?;
        }
        Ok(())
    }

    /// Abandons the active build after `changed` invalidated it, resetting
    /// the other rollup constituents (if any) to `Approved`.
    async fn abandon_active_build(&mut self, changed: PrNumber) -> Result<(), SupervisorError> {
        let Some(active) = self.model.active().cloned() else {
            return Ok(());
        };
        self.model.clear_active();

        if let ActiveBuild::Rollup { prs, .. } = active {
            for number in prs {
                if number == changed {
                    continue;
                }
                if let Some(pr) = self.model.get_mut(number) {
                    if pr.status == PrStatus::Testing {
                        pr.status = PrStatus::Approved;
                        pr.integration_sha = None;
                        pr.builds.clear();
                        let snapshot = pr.clone();
                        self.store.upsert_pull(&snapshot)?;
                        self.store.clear_builds(&snapshot.repo, number)?;
                    }
                }
            }
        }
        Ok(())
    }

    /// Someone pushed the integration branch. Our own pushes are recorded
    /// in `build_triggers`; anything else lands on top of a running build
    /// and invalidates it.
    async fn on_integration_branch_push(
        &mut self,
        sha: crate::types::Sha,
    ) -> Result<(), SupervisorError> {
        if self.store.trigger_for(&sha)?.is_some() {
            // Echo of our own push.
            return Ok(());
        }

        let Some(active) = self.model.active().cloned() else {
            return Ok(());
        };
        let Some(tracker) = active.testing_pr() else {
            return Ok(());
        };

        // A push matching the build under way is ours even if its trigger
        // row is gone.
        let current = self
            .model
            .get(tracker)
            .and_then(|pr| pr.integration_sha.as_ref());
        if current == Some(&sha) {
            return Ok(());
        }

        warn!(
            sha = %sha.short(),
            "Foreign push to integration branch during build"
        );
        if let Some(pr) = self.model.get_mut(tracker) {
            pr.status = PrStatus::Error;
            pr.integration_sha = None;
            pr.builds.clear();
            let snapshot = pr.clone();
            self.store.upsert_pull(&snapshot)?;
            self.store.clear_builds(&snapshot.repo, tracker)?;
            best_effort_comment(
                self.host.as_ref(),
                tracker,
                ":boom: The integration branch was modified outside the merge queue; build abandoned.",
            )
            .await;
        }
        self.abandon_active_build(tracker).await?;
        Ok(())
    }

    // ── Commands ──

    /// Parses and applies every command in one comment.
    ///
    /// Comments from users with no command authority over the pull request
    /// are dropped wholesale: no mutation, and no reply even for malformed
    /// input, so drive-by comments cannot draw the bot out.
    async fn apply_comment(
        &mut self,
        number: PrNumber,
        author: &str,
        body: &str,
    ) -> Result<(), SupervisorError> {
        let Some(pr) = self.model.get(number) else {
            debug!(pr = %number, "Comment on untracked pull request ignored");
            return Ok(());
        };
        if !self.can_review(pr, author) {
            debug!(pr = %number, author, "Comment from unauthorized user ignored");
            return Ok(());
        }

        let mut malformed_reply: Option<String> = None;
        for parsed in parse_commands(body, &self.trigger) {
            match parsed {
                Parsed::Command(command) => {
                    self.apply_command(number, author, command).await?;
                }
                Parsed::Malformed { word, reason } => {
                    // One reply per comment, however many tokens are bad.
                    if malformed_reply.is_none() {
                        malformed_reply =
                            Some(format!(":x: Could not parse `{}`: {}", word, reason));
                    }
                }
            }
        }

        if let Some(reply) = malformed_reply {
            best_effort_comment(self.host.as_ref(), number, &reply).await;
        }
        Ok(())
    }

    /// True if `login` may issue approval/priority commands for this PR.
    fn can_review(&self, pr: &PullRequest, login: &str) -> bool {
        self.cfg.is_reviewer(login)
            || self.cfg.is_admin(login)
            || pr.delegate.as_deref() == Some(login)
    }

    async fn apply_command(
        &mut self,
        number: PrNumber,
        author: &str,
        command: Command,
    ) -> Result<(), SupervisorError> {
        let Some(pr) = self.model.get(number) else {
            return Ok(());
        };

        // Authorization first; unauthorized commands are silently dropped
        // so drive-by comments cannot generate reply spam.
        let authorized = match &command {
            Command::Force | Command::Delegation(_) => self.cfg.is_admin(author),
            _ => self.can_review(pr, author),
        };
        if !authorized {
            debug!(pr = %number, author, ?command, "Unauthorized command ignored");
            return Ok(());
        }

        match command {
            Command::Approve { approver, sha } => {
                self.apply_approve(number, author, approver, sha).await?;
            }

            Command::Unapprove => {
                if let Some(pr) = self.model.get_mut(number) {
                    pr.approved_by = None;
                    if pr.status == PrStatus::Approved {
                        pr.status = PrStatus::Pending;
                    }
                    pr.revision += 1;
                    let snapshot = pr.clone();
                    self.store.upsert_pull(&snapshot)?;
                }
            }

            Command::Priority(priority) => {
                if let Some(pr) = self.model.get_mut(number) {
                    pr.priority = priority;
                    let snapshot = pr.clone();
                    self.store.upsert_pull(&snapshot)?;
                }
            }

            Command::SetTry(value) => {
                let conflicting = self
                    .model
                    .get(number)
                    .is_some_and(|pr| value && pr.rollup);
                if conflicting {
                    best_effort_comment(
                        self.host.as_ref(),
                        number,
                        ":x: `try` and `rollup` cannot be combined; clear one first.",
                    )
                    .await;
                    return Ok(());
                }
                if let Some(pr) = self.model.get_mut(number) {
                    pr.try_build = value;
                    let snapshot = pr.clone();
                    self.store.upsert_pull(&snapshot)?;
                }
            }

            Command::SetRollup(value) => {
                let conflicting = self
                    .model
                    .get(number)
                    .is_some_and(|pr| value && pr.try_build);
                if conflicting {
                    best_effort_comment(
                        self.host.as_ref(),
                        number,
                        ":x: `rollup` and `try` cannot be combined; clear one first.",
                    )
                    .await;
                    return Ok(());
                }
                if let Some(pr) = self.model.get_mut(number) {
                    pr.rollup = value;
                    let snapshot = pr.clone();
                    self.store.upsert_pull(&snapshot)?;
                }
            }

            Command::Retry => {
                if let Some(pr) = self.model.get_mut(number) {
                    if matches!(pr.status, PrStatus::Failure | PrStatus::Error) {
                        pr.status = if pr.approved_by.is_some() {
                            PrStatus::Approved
                        } else {
                            PrStatus::Pending
                        };
                        pr.integration_sha = None;
                        pr.builds.clear();
                        pr.revision += 1;
                        let snapshot = pr.clone();
                        self.store.upsert_pull(&snapshot)?;
                        self.store.clear_builds(&snapshot.repo, number)?;
                    }
                }
            }

            Command::Force => {
                // Clear the current testing state without merging.
                if let Some(active) = self.model.active().cloned() {
                    if let Some(tracker) = active.testing_pr() {
                        if let Some(pr) = self.model.get_mut(tracker) {
                            pr.status = if pr.approved_by.is_some() {
                                PrStatus::Approved
                            } else {
                                PrStatus::Pending
                            };
                            pr.integration_sha = None;
                            pr.builds.clear();
                            pr.revision += 1;
                            let snapshot = pr.clone();
                            self.store.upsert_pull(&snapshot)?;
                            self.store.clear_builds(&snapshot.repo, tracker)?;
                        }
                        self.abandon_active_build(tracker).await?;
                    } else {
                        self.model.clear_active();
                    }
                }
            }

            Command::Clean => {
                if let Some(pr) = self.model.get_mut(number) {
                    pr.mergeable = Mergeable::Unknown;
                    let repo = pr.repo.clone();
                    self.store.clear_mergeable(&repo, number)?;
                }
            }

            Command::Delegation(delegate) => {
                if let Some(pr) = self.model.get_mut(number) {
                    pr.delegate = match delegate {
                        Delegate::Author => {
                            if pr.author.is_empty() {
                                None
                            } else {
                                Some(pr.author.clone())
                            }
                        }
                        Delegate::Named(user) => Some(user),
                        Delegate::Revoke => None,
                    };
                }
            }
        }
        Ok(())
    }

    async fn apply_approve(
        &mut self,
        number: PrNumber,
        author: &str,
        approver: Approver,
        sha_arg: Option<String>,
    ) -> Result<(), SupervisorError> {
        let Some(pr) = self.model.get(number) else {
            return Ok(());
        };

        // An explicit SHA must abbreviate the current head, otherwise the
        // approval refers to a stale commit.
        if let Some(sha_arg) = &sha_arg {
            if !pr.head_sha.matches_prefix(sha_arg) {
                let reply = format!(
                    ":question: `{}` is not a valid commit SHA. Please try again with `{}`.",
                    sha_arg,
                    pr.head_sha.short()
                );
                best_effort_comment(self.host.as_ref(), number, &reply).await;
                return Ok(());
            }
        }

        let approver = match approver {
            Approver::Commenter => author.to_string(),
            Approver::Named(name) => name,
        };

        let Some(pr) = self.model.get_mut(number) else {
            return Ok(());
        };
        pr.approved_by = Some(approver.clone());
        if matches!(
            pr.status,
            PrStatus::Pending | PrStatus::Failure | PrStatus::Error
        ) {
            pr.status = PrStatus::Approved;
        }
        pr.revision += 1;
        let head_short = pr.head_sha.short().to_string();
        let snapshot = pr.clone();
        self.store.upsert_pull(&snapshot)?;

        best_effort_comment(
            self.host.as_ref(),
            number,
            &format!(
                ":pushpin: Commit {} has been approved by `{}`",
                head_short, approver
            ),
        )
        .await;
        Ok(())
    }

    // ── Build results ──

    /// Applies one CI verdict, discarding stale callbacks.
    async fn on_build_status(&mut self, outcome: BuildOutcome) -> Result<(), SupervisorError> {
        let Some(active) = self.model.active().cloned() else {
            debug!(
                builder = %outcome.builder,
                sha = %outcome.sha.short(),
                "Build status with no active build ignored"
            );
            return Ok(());
        };
        let Some(tracker) = active.testing_pr() else {
            return Ok(());
        };

        let Some(pr) = self.model.get_mut(tracker) else {
            return Ok(());
        };
        if !pr.record_build(
            &outcome.builder,
            outcome.verdict,
            outcome.url.clone(),
            &outcome.sha,
        ) {
            debug!(
                pr = %tracker,
                builder = %outcome.builder,
                sha = %outcome.sha.short(),
                "Stale or unknown build result discarded"
            );
            return Ok(());
        }

        let snapshot = pr.clone();
        self.store.record_build(
            &snapshot.repo,
            tracker,
            &outcome.builder,
            outcome.verdict,
            outcome.url.as_deref(),
            Some(&outcome.sha),
        )?;

        if snapshot.all_green() {
            self.on_build_success(active).await?;
        } else if snapshot.any_failed() {
            self.on_build_failure(active).await?;
        }
        Ok(())
    }

    /// Every required builder is green: merge (or report, for try builds).
    async fn on_build_success(&mut self, active: ActiveBuild) -> Result<(), SupervisorError> {
        match active {
            ActiveBuild::Try(number) => {
                let Some(pr) = self.model.get_mut(number) else {
                    return Ok(());
                };
                // A try build never merges; restore the pre-try state and
                // surface the result.
                pr.status = if pr.approved_by.is_some() {
                    PrStatus::Approved
                } else {
                    PrStatus::Pending
                };
                pr.try_build = false;
                let url = pr.build_url.clone().unwrap_or_default();
                let merge_short = pr
                    .integration_sha
                    .as_ref()
                    .map(|s| s.short().to_string())
                    .unwrap_or_default();
                pr.integration_sha = None;
                pr.builds.clear();
                let snapshot = pr.clone();
                self.store.upsert_pull(&snapshot)?;
                self.store.clear_builds(&snapshot.repo, number)?;
                self.model.clear_active();

                best_effort_comment(
                    self.host.as_ref(),
                    number,
                    &format!(
                        ":sunny: Try build successful (merge {}) {}",
                        merge_short, url
                    ),
                )
                .await;
            }

            ActiveBuild::Single(number) => {
                let Some(pr) = self.model.get(number) else {
                    return Ok(());
                };
                let Some(merge_sha) = pr.integration_sha.clone() else {
                    return Ok(());
                };
                let head_sha = pr.head_sha.clone();

                let branch = self.cfg.protected_branch.clone();
                let result = with_retry(&self.retry, || {
                    self.host.fast_forward(&branch, &merge_sha)
                })
                .await;

                match result {
                    Ok(()) => {
                        if let Some(pr) = self.model.get_mut(number) {
                            pr.status = PrStatus::Success;
                            let snapshot = pr.clone();
                            self.store.upsert_pull(&snapshot)?;
                        }
                        self.model.clear_active();
                        info!(pr = %number, sha = %merge_sha.short(), "Merged");
                        best_effort_status(
                            self.host.as_ref(),
                            &head_sha,
                            StatusState::Success,
                            "Test successful",
                        )
                        .await;
                        best_effort_comment(
                            self.host.as_ref(),
                            number,
                            &format!(
                                ":sunny: Test successful; {} fast-forwarded to {}",
                                self.cfg.protected_branch,
                                merge_sha.short()
                            ),
                        )
                        .await;
                    }
                    Err(err) if !err.is_transient() => {
                        // Someone pushed the protected branch under us; the
                        // PR goes back to the queue and the scheduler
                        // rebuilds it on a fresh base.
                        warn!(pr = %number, error = %err, "Fast-forward refused, re-queueing");
                        self.requeue_as_approved(number).await?;
                        self.model.clear_active();
                    }
                    Err(err) => {
                        warn!(pr = %number, error = %err, "Fast-forward failed transiently");
                        if let Some(pr) = self.model.get_mut(number) {
                            pr.status = PrStatus::Error;
                            pr.integration_sha = None;
                            pr.builds.clear();
                            let snapshot = pr.clone();
                            self.store.upsert_pull(&snapshot)?;
                            self.store.clear_builds(&snapshot.repo, number)?;
                        }
                        self.model.clear_active();
                        best_effort_comment(
                            self.host.as_ref(),
                            number,
                            ":warning: Could not fast-forward; will retry on `retry`.",
                        )
                        .await;
                    }
                }
            }

            ActiveBuild::Rollup {
                prs,
                integration_sha,
            } => {
                let branch = self.cfg.protected_branch.clone();
                let result = with_retry(&self.retry, || {
                    self.host.fast_forward(&branch, &integration_sha)
                })
                .await;

                match result {
                    Ok(()) => {
                        for &number in &prs {
                            if let Some(pr) = self.model.get_mut(number) {
                                pr.status = PrStatus::Success;
                                let snapshot = pr.clone();
                                self.store.upsert_pull(&snapshot)?;
                            }
                        }
                        self.model.clear_active();
                        info!(
                            prs = ?prs.iter().map(|n| n.0).collect::<Vec<_>>(),
                            sha = %integration_sha.short(),
                            "Rollup merged"
                        );
                        best_effort_comment(
                            self.host.as_ref(),
                            prs[0],
                            &format!(
                                ":sunny: Rollup successful; {} fast-forwarded to {}",
                                self.cfg.protected_branch,
                                integration_sha.short()
                            ),
                        )
                        .await;
                    }
                    Err(err) => {
                        warn!(error = %err, "Rollup fast-forward failed, re-queueing");
                        for &number in &prs {
                            self.requeue_as_approved(number).await?;
                        }
                        self.model.clear_active();
                    }
                }
            }
        }
        Ok(())
    }

    /// A required builder failed for the current integration SHA.
    async fn on_build_failure(&mut self, active: ActiveBuild) -> Result<(), SupervisorError> {
        let is_try = matches!(active, ActiveBuild::Try(_));
        match active {
            ActiveBuild::Try(number) | ActiveBuild::Single(number) => {
                let Some(pr) = self.model.get_mut(number) else {
                    return Ok(());
                };
                pr.status = PrStatus::Failure;
                if is_try {
                    pr.try_build = false;
                }
                let head_sha = pr.head_sha.clone();
                let url = pr.build_url.clone().unwrap_or_default();
                let snapshot = pr.clone();
                self.store.upsert_pull(&snapshot)?;
                self.model.clear_active();

                best_effort_status(
                    self.host.as_ref(),
                    &head_sha,
                    StatusState::Failure,
                    "Test failed",
                )
                .await;
                best_effort_comment(
                    self.host.as_ref(),
                    number,
                    &format!(
                        ":broken_heart: {} failed {}",
                        if is_try { "Try build" } else { "Test" },
                        url
                    ),
                )
                .await;
            }

            ActiveBuild::Rollup { prs, .. } => {
                if self.cfg.bisect_on_rollup {
                    // Blame the first constituent; the rest go back to the
                    // queue and will be re-tried without it.
                    let suspect = prs[0];
                    if let Some(pr) = self.model.get_mut(suspect) {
                        pr.status = PrStatus::Failure;
                        let snapshot = pr.clone();
                        self.store.upsert_pull(&snapshot)?;
                    }
                    for &number in &prs[1..] {
                        self.requeue_as_approved(number).await?;
                    }
                    best_effort_comment(
                        self.host.as_ref(),
                        suspect,
                        ":broken_heart: Rollup failed; this pull request is the suspect.",
                    )
                    .await;
                } else {
                    for &number in &prs {
                        if let Some(pr) = self.model.get_mut(number) {
                            pr.status = PrStatus::Failure;
                            pr.integration_sha = None;
                            pr.builds.clear();
                            let snapshot = pr.clone();
                            self.store.upsert_pull(&snapshot)?;
                            self.store.clear_builds(&snapshot.repo, number)?;
                        }
                    }
                    best_effort_comment(
                        self.host.as_ref(),
                        prs[0],
                        ":broken_heart: Rollup failed.",
                    )
                    .await;
                }
                self.model.clear_active();
            }
        }
        Ok(())
    }

    /// Returns a pull request to `Approved` with its build state cleared.
    async fn requeue_as_approved(&mut self, number: PrNumber) -> Result<(), SupervisorError> {
        if let Some(pr) = self.model.get_mut(number) {
            pr.status = if pr.approved_by.is_some() {
                PrStatus::Approved
            } else {
                PrStatus::Pending
            };
            pr.integration_sha = None;
            pr.builds.clear();
            pr.revision += 1;
            let snapshot = pr.clone();
            self.store.upsert_pull(&snapshot)?;
            self.store.clear_builds(&snapshot.repo, number)?;
        }
        Ok(())
    }

    // ── Mergeability ──

    /// Refreshes unknown mergeability hints from the host, a few at a time.
    ///
    /// The revision counter guards against the model changing underneath
    /// the host round-trip (e.g. a head push processed before this tick).
    async fn refresh_mergeability(&mut self) -> Result<(), SupervisorError> {
        let stale: Vec<(PrNumber, u64)> = self
            .model
            .iter()
            .filter(|pr| {
                pr.mergeable == Mergeable::Unknown
                    && matches!(pr.status, PrStatus::Approved | PrStatus::Testing)
            })
            .map(|pr| (pr.number, pr.revision))
            .take(MERGEABILITY_REFRESH_LIMIT)
            .collect();

        for (number, revision) in stale {
            let snapshot = match self.host.get_pr(number).await {
                Ok(snapshot) => snapshot,
                Err(err) => {
                    debug!(pr = %number, error = %err, "Mergeability refresh failed");
                    continue;
                }
            };

            let Some(pr) = self.model.get_mut(number) else {
                continue;
            };
            if pr.revision != revision {
                // Stale callback: the PR changed while we were asking.
                continue;
            }

            pr.mergeable = Mergeable::from_hint(snapshot.mergeable);
            let label = pr.repo.clone();
            let status = pr.status;
            match snapshot.mergeable {
                Some(value) => self.store.set_mergeable(&label, number, value)?,
                None => self.store.clear_mergeable(&label, number)?,
            }

            if snapshot.mergeable == Some(false) && status == PrStatus::Testing {
                // The build under way can no longer land cleanly.
                if let Some(pr) = self.model.get_mut(number) {
                    pr.status = PrStatus::Error;
                    pr.integration_sha = None;
                    pr.builds.clear();
                    let snapshot = pr.clone();
                    self.store.upsert_pull(&snapshot)?;
                    self.store.clear_builds(&snapshot.repo, number)?;
                }
                self.abandon_active_build(number).await?;
                best_effort_comment(
                    self.host.as_ref(),
                    number,
                    ":x: The latest upstream changes made this pull request unmergeable. Please resolve the merge conflicts.",
                )
                .await;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FakeHost, sha};
    use crate::types::{BuildVerdict, RepoLabel, Sha};

    fn repo_cfg() -> RepoConfig {
        RepoConfig {
            owner: "rust-lang".into(),
            name: "rust".into(),
            reviewers: vec!["alice".into(), "bob".into()],
            admins: vec!["alice".into()],
            builders: vec!["linux".into(), "mac".into()],
            integration_branch: "auto".into(),
            protected_branch: "master".into(),
            rollup_cap: 8,
            bisect_on_rollup: false,
            webhook_secret: "secret".into(),
            buildbot: None,
            travis: None,
            jenkins: None,
            solano: None,
        }
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            max_retries: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            backoff_multiplier: 2.0,
        }
    }

    fn setup() -> (RepoSupervisor, Arc<FakeHost>) {
        setup_with_cfg(repo_cfg())
    }

    fn setup_with_cfg(cfg: RepoConfig) -> (RepoSupervisor, Arc<FakeHost>) {
        let store = Arc::new(Store::in_memory().unwrap());
        let host = Arc::new(FakeHost::new());
        host.set_branch("master", sha('1'));
        let model = RepoModel::new(RepoLabel::new("rust"));
        let supervisor = RepoSupervisor::new(
            cfg,
            "homu".into(),
            model,
            store,
            host.clone() as Arc<dyn HostApi>,
        )
        .with_retry(fast_retry());
        (supervisor, host)
    }

    async fn open(sup: &mut RepoSupervisor, number: u64) {
        sup.handle_envelope(Envelope::anonymous(Event::PrOpened {
            number: PrNumber(number),
            title: format!("PR {}", number),
            body: "body".into(),
            head_sha: sha('a'),
            head_ref: format!("feature-{}", number),
            base_ref: "master".into(),
            author: "dave".into(),
            assignee: None,
        }))
        .await
        .unwrap();
    }

    async fn comment(sup: &mut RepoSupervisor, number: u64, author: &str, body: &str) {
        sup.handle_envelope(Envelope::anonymous(Event::PrComment {
            number: PrNumber(number),
            author: author.into(),
            body: body.into(),
        }))
        .await
        .unwrap();
    }

    async fn build_status(sup: &mut RepoSupervisor, builder: &str, sha: Sha, verdict: BuildVerdict) {
        sup.handle_envelope(Envelope::anonymous(Event::BuildStatus(BuildOutcome {
            builder: builder.into(),
            sha,
            verdict,
            url: Some("http://ci/build".into()),
        })))
        .await
        .unwrap();
    }

    fn status_of(sup: &RepoSupervisor, number: u64) -> PrStatus {
        sup.model().get(PrNumber(number)).unwrap().status
    }

    fn integration_sha(sup: &RepoSupervisor, number: u64) -> Sha {
        sup.model()
            .get(PrNumber(number))
            .unwrap()
            .integration_sha
            .clone()
            .unwrap()
    }

    // The full happy path: approve, build, merge, untrack.
    #[tokio::test]
    async fn approved_pr_is_built_merged_and_untracked() {
        let (mut sup, host) = setup();
        open(&mut sup, 7).await;
        assert_eq!(status_of(&sup, 7), PrStatus::Pending);

        comment(&mut sup, 7, "alice", "@homu r+").await;
        assert_eq!(status_of(&sup, 7), PrStatus::Testing);
        let merge = integration_sha(&sup, 7);
        assert_eq!(host.branch("auto"), Some(merge.clone()));

        build_status(&mut sup, "linux", merge.clone(), BuildVerdict::Success).await;
        // One green builder is not enough.
        assert_eq!(status_of(&sup, 7), PrStatus::Testing);

        build_status(&mut sup, "mac", merge.clone(), BuildVerdict::Success).await;
        assert_eq!(status_of(&sup, 7), PrStatus::Success);
        assert_eq!(host.branch("master"), Some(merge));

        sup.handle_envelope(Envelope::anonymous(Event::PrClosed {
            number: PrNumber(7),
        }))
        .await
        .unwrap();
        assert!(sup.model().is_empty());
    }

    // A higher-priority PR approved later still waits for
    // the build already in flight.
    #[tokio::test]
    async fn later_high_priority_pr_waits_for_running_build() {
        let (mut sup, _host) = setup();
        open(&mut sup, 7).await;
        open(&mut sup, 8).await;

        comment(&mut sup, 7, "alice", "@homu r+").await;
        assert_eq!(status_of(&sup, 7), PrStatus::Testing);

        comment(&mut sup, 8, "alice", "@homu r+ p=5").await;
        assert_eq!(status_of(&sup, 8), PrStatus::Approved);
        let merge = integration_sha(&sup, 7);

        build_status(&mut sup, "linux", merge.clone(), BuildVerdict::Success).await;
        build_status(&mut sup, "mac", merge, BuildVerdict::Success).await;

        // #7 merged; #8 is picked next.
        assert_eq!(status_of(&sup, 7), PrStatus::Success);
        assert_eq!(status_of(&sup, 8), PrStatus::Testing);
    }

    // A plain approved PR is picked ahead of rollups; the
    // rollup batch runs after it merges.
    #[tokio::test]
    async fn rollup_runs_after_plain_candidate() {
        let (mut sup, host) = setup();
        for n in [9, 10, 11] {
            open(&mut sup, n).await;
        }

        comment(&mut sup, 9, "alice", "@homu r+").await;
        assert_eq!(status_of(&sup, 9), PrStatus::Testing);
        comment(&mut sup, 10, "alice", "@homu r+ rollup").await;
        comment(&mut sup, 11, "alice", "@homu r+ rollup").await;
        assert_eq!(status_of(&sup, 10), PrStatus::Approved);
        assert_eq!(status_of(&sup, 11), PrStatus::Approved);

        let merge9 = integration_sha(&sup, 9);
        build_status(&mut sup, "linux", merge9.clone(), BuildVerdict::Success).await;
        build_status(&mut sup, "mac", merge9, BuildVerdict::Success).await;
        assert_eq!(status_of(&sup, 9), PrStatus::Success);

        // The rollup of {10, 11} is now active, tracked by #10.
        assert!(matches!(
            sup.model().active(),
            Some(ActiveBuild::Rollup { prs, .. }) if prs == &[PrNumber(10), PrNumber(11)]
        ));
        assert_eq!(status_of(&sup, 10), PrStatus::Testing);
        assert_eq!(status_of(&sup, 11), PrStatus::Approved);

        let rollup_sha = integration_sha(&sup, 10);
        build_status(&mut sup, "linux", rollup_sha.clone(), BuildVerdict::Success).await;
        build_status(&mut sup, "mac", rollup_sha.clone(), BuildVerdict::Success).await;

        assert_eq!(status_of(&sup, 10), PrStatus::Success);
        assert_eq!(status_of(&sup, 11), PrStatus::Success);
        assert_eq!(host.branch("master"), Some(rollup_sha));
    }

    // A head push during testing resets the PR and stale
    // callbacks for the old integration SHA are discarded.
    #[tokio::test]
    async fn head_push_during_testing_resets_and_discards_stale_results() {
        let (mut sup, host) = setup();
        open(&mut sup, 12).await;
        comment(&mut sup, 12, "alice", "@homu r+").await;
        let merge = integration_sha(&sup, 12);
        let master_before = host.branch("master");

        sup.handle_envelope(Envelope::anonymous(Event::PrSynchronized {
            number: PrNumber(12),
            head_sha: sha('b'),
        }))
        .await
        .unwrap();
        assert_eq!(status_of(&sup, 12), PrStatus::Pending);
        assert!(sup.model().active().is_none());

        // The late success callback for the abandoned build changes nothing.
        build_status(&mut sup, "linux", merge.clone(), BuildVerdict::Success).await;
        build_status(&mut sup, "mac", merge, BuildVerdict::Success).await;
        assert_eq!(status_of(&sup, 12), PrStatus::Pending);
        assert_eq!(host.branch("master"), master_before);
    }

    // A try build reports but never merges.
    #[tokio::test]
    async fn try_build_success_does_not_merge() {
        let (mut sup, host) = setup();
        open(&mut sup, 13).await;
        let master_before = host.branch("master");

        comment(&mut sup, 13, "alice", "@homu try").await;
        assert_eq!(status_of(&sup, 13), PrStatus::Testing);
        assert!(matches!(
            sup.model().active(),
            Some(ActiveBuild::Try(PrNumber(13)))
        ));

        let merge = integration_sha(&sup, 13);
        build_status(&mut sup, "linux", merge.clone(), BuildVerdict::Success).await;
        build_status(&mut sup, "mac", merge, BuildVerdict::Success).await;

        // Not approved before the try, so it reverts to pending.
        assert_eq!(status_of(&sup, 13), PrStatus::Pending);
        assert!(!sup.model().get(PrNumber(13)).unwrap().try_build);
        assert_eq!(host.branch("master"), master_before);
        assert!(
            host.comments_on(PrNumber(13))
                .iter()
                .any(|c| c.contains("Try build successful"))
        );
    }

    #[tokio::test]
    async fn unauthorized_approval_is_ignored() {
        let (mut sup, host) = setup();
        open(&mut sup, 14).await;
        comment(&mut sup, 14, "mallory", "@homu r+").await;

        assert_eq!(status_of(&sup, 14), PrStatus::Pending);
        assert_eq!(sup.model().get(PrNumber(14)).unwrap().approved_by, None);
        assert!(host.comments_on(PrNumber(14)).is_empty());
    }

    // r+ with a SHA that is not the head is rejected with a
    // reply and no approval.
    #[tokio::test]
    async fn approval_with_wrong_sha_rejected() {
        let (mut sup, host) = setup();
        open(&mut sup, 15).await;
        comment(&mut sup, 15, "alice", "@homu r+ deadbeef").await;

        assert_eq!(status_of(&sup, 15), PrStatus::Pending);
        assert!(
            host.comments_on(PrNumber(15))
                .iter()
                .any(|c| c.contains("not a valid commit SHA"))
        );
    }

    #[tokio::test]
    async fn approval_with_head_prefix_accepted() {
        let (mut sup, _host) = setup();
        open(&mut sup, 16).await;
        // Head is aaaa...; a 4-char prefix is enough.
        comment(&mut sup, 16, "alice", "@homu r+ aaaa").await;
        assert_eq!(
            sup.model().get(PrNumber(16)).unwrap().approved_by.as_deref(),
            Some("alice")
        );
    }

    #[tokio::test]
    async fn approval_on_behalf_records_named_approver() {
        let (mut sup, _host) = setup();
        open(&mut sup, 17).await;
        comment(&mut sup, 17, "alice", "@homu r=bob").await;
        assert_eq!(
            sup.model().get(PrNumber(17)).unwrap().approved_by.as_deref(),
            Some("bob")
        );
    }

    #[tokio::test]
    async fn duplicate_delivery_is_noop() {
        let (mut sup, host) = setup();
        open(&mut sup, 18).await;

        let envelope = Envelope::new(
            Some(DeliveryId::new("d-1")),
            Event::PrComment {
                number: PrNumber(18),
                author: "alice".into(),
                body: "@homu r+".into(),
            },
        );
        sup.handle_envelope(envelope.clone()).await.unwrap();
        sup.handle_envelope(envelope).await.unwrap();

        let approvals = host
            .comments_on(PrNumber(18))
            .iter()
            .filter(|c| c.contains("has been approved"))
            .count();
        assert_eq!(approvals, 1);
    }

    #[tokio::test]
    async fn build_failure_parks_pr_until_retry() {
        let (mut sup, host) = setup();
        open(&mut sup, 19).await;
        comment(&mut sup, 19, "alice", "@homu r+").await;
        let first_merge = integration_sha(&sup, 19);

        build_status(&mut sup, "linux", first_merge.clone(), BuildVerdict::Failure).await;
        assert_eq!(status_of(&sup, 19), PrStatus::Failure);
        assert!(sup.model().active().is_none());
        assert!(
            host.comments_on(PrNumber(19))
                .iter()
                .any(|c| c.contains("Test failed"))
        );

        // A late success for the same SHA changes nothing.
        build_status(&mut sup, "mac", first_merge.clone(), BuildVerdict::Success).await;
        assert_eq!(status_of(&sup, 19), PrStatus::Failure);

        // retry re-queues with the original approval and a fresh merge.
        comment(&mut sup, 19, "alice", "@homu retry").await;
        assert_eq!(status_of(&sup, 19), PrStatus::Testing);
        assert_ne!(integration_sha(&sup, 19), first_merge);
    }

    #[tokio::test]
    async fn merge_conflict_parks_pr_in_error() {
        let (mut sup, host) = setup();
        open(&mut sup, 20).await;
        host.fail_next_merge();
        comment(&mut sup, 20, "alice", "@homu r+").await;

        assert_eq!(status_of(&sup, 20), PrStatus::Error);
        assert!(sup.model().active().is_none());
        assert!(
            host.comments_on(PrNumber(20))
                .iter()
                .any(|c| c.contains("Merge conflict"))
        );
    }

    #[tokio::test]
    async fn transient_merge_failures_are_retried() {
        let (mut sup, host) = setup();
        open(&mut sup, 21).await;
        host.fail_merge_transiently(1);
        comment(&mut sup, 21, "alice", "@homu r+").await;
        // One transient failure is within the retry budget.
        assert_eq!(status_of(&sup, 21), PrStatus::Testing);
    }

    #[tokio::test]
    async fn fast_forward_conflict_requeues() {
        let (mut sup, host) = setup();
        open(&mut sup, 22).await;
        comment(&mut sup, 22, "alice", "@homu r+").await;
        let first_merge = integration_sha(&sup, 22);

        host.fail_next_fast_forward();
        build_status(&mut sup, "linux", first_merge.clone(), BuildVerdict::Success).await;
        build_status(&mut sup, "mac", first_merge.clone(), BuildVerdict::Success).await;

        // The fast-forward was refused; the PR went back to approved and
        // the scheduler immediately rebuilt it on a fresh base.
        assert_eq!(status_of(&sup, 22), PrStatus::Testing);
        assert_ne!(integration_sha(&sup, 22), first_merge);
    }

    /// Opens #9 and starts its build, queues a rollup of {#10, #11} behind
    /// it, then fails #9 so the rollup becomes the active build.
    async fn start_rollup_behind_failed_single(sup: &mut RepoSupervisor) -> Sha {
        open(sup, 9).await;
        comment(sup, 9, "alice", "@homu r+").await;
        for n in [10, 11] {
            open(sup, n).await;
            comment(sup, n, "alice", "@homu rollup r+").await;
        }
        let merge9 = integration_sha(sup, 9);
        build_status(sup, "linux", merge9, BuildVerdict::Failure).await;
        assert_eq!(status_of(sup, 9), PrStatus::Failure);
        assert!(matches!(
            sup.model().active(),
            Some(ActiveBuild::Rollup { .. })
        ));
        integration_sha(sup, 10)
    }

    #[tokio::test]
    async fn rollup_failure_blames_all_by_default() {
        let (mut sup, _host) = setup();
        let rollup_sha = start_rollup_behind_failed_single(&mut sup).await;

        build_status(&mut sup, "linux", rollup_sha, BuildVerdict::Failure).await;
        assert_eq!(status_of(&sup, 10), PrStatus::Failure);
        assert_eq!(status_of(&sup, 11), PrStatus::Failure);
    }

    #[tokio::test]
    async fn rollup_failure_bisect_blames_first() {
        let mut cfg = repo_cfg();
        cfg.bisect_on_rollup = true;
        let (mut sup, _host) = setup_with_cfg(cfg);
        let rollup_sha = start_rollup_behind_failed_single(&mut sup).await;

        build_status(&mut sup, "linux", rollup_sha, BuildVerdict::Failure).await;
        assert_eq!(status_of(&sup, 10), PrStatus::Failure);
        // The innocent constituent goes back into the queue and, with the
        // suspect parked, is immediately rebuilt alone.
        assert_eq!(status_of(&sup, 11), PrStatus::Testing);
    }

    #[tokio::test]
    async fn try_and_rollup_cannot_be_combined() {
        let (mut sup, host) = setup();
        open(&mut sup, 23).await;
        comment(&mut sup, 23, "alice", "@homu rollup").await;
        comment(&mut sup, 23, "alice", "@homu try").await;

        let pr = sup.model().get(PrNumber(23)).unwrap();
        assert!(pr.rollup);
        assert!(!pr.try_build);
        assert!(
            host.comments_on(PrNumber(23))
                .iter()
                .any(|c| c.contains("cannot be combined"))
        );
    }

    #[tokio::test]
    async fn force_clears_testing_state() {
        let (mut sup, _host) = setup();
        open(&mut sup, 24).await;
        comment(&mut sup, 24, "alice", "@homu r+").await;
        let first_merge = integration_sha(&sup, 24);

        // force clears the running build; the PR is still approved, so the
        // scheduler starts over with a fresh integration commit.
        comment(&mut sup, 24, "alice", "@homu force").await;
        assert_ne!(integration_sha(&sup, 24), first_merge);
    }

    #[tokio::test]
    async fn force_requires_admin() {
        let (mut sup, _host) = setup();
        open(&mut sup, 25).await;
        comment(&mut sup, 25, "alice", "@homu r+").await;
        let merge = integration_sha(&sup, 25);

        // bob is a reviewer but not an admin.
        comment(&mut sup, 25, "bob", "@homu force").await;
        assert_eq!(integration_sha(&sup, 25), merge);
    }

    #[tokio::test]
    async fn delegated_author_can_approve() {
        let (mut sup, _host) = setup();
        open(&mut sup, 26).await;
        // dave is the PR author; not a reviewer.
        comment(&mut sup, 26, "dave", "@homu r+").await;
        assert_eq!(status_of(&sup, 26), PrStatus::Pending);

        comment(&mut sup, 26, "alice", "@homu delegate+").await;
        comment(&mut sup, 26, "dave", "@homu r+").await;
        assert_eq!(
            sup.model().get(PrNumber(26)).unwrap().approved_by.as_deref(),
            Some("dave")
        );
    }

    #[tokio::test]
    async fn unauthorized_malformed_comment_gets_no_reply() {
        let (mut sup, host) = setup();
        open(&mut sup, 32).await;
        comment(&mut sup, 32, "mallory", "@homu p=high").await;

        assert_eq!(status_of(&sup, 32), PrStatus::Pending);
        assert!(host.comments_on(PrNumber(32)).is_empty());
    }

    #[tokio::test]
    async fn malformed_command_gets_single_reply() {
        let (mut sup, host) = setup();
        open(&mut sup, 27).await;
        comment(&mut sup, 27, "alice", "@homu p=high p=low").await;

        assert_eq!(status_of(&sup, 27), PrStatus::Pending);
        let replies = host
            .comments_on(PrNumber(27))
            .iter()
            .filter(|c| c.contains("Could not parse"))
            .count();
        assert_eq!(replies, 1);
    }

    #[tokio::test]
    async fn unapprove_returns_to_pending() {
        let (mut sup, _host) = setup();
        open(&mut sup, 28).await;
        comment(&mut sup, 28, "alice", "@homu r+").await;
        // The build is already running; r- removes the approval but does
        // not abort the build.
        comment(&mut sup, 28, "alice", "@homu r-").await;
        assert_eq!(sup.model().get(PrNumber(28)).unwrap().approved_by, None);
    }

    #[tokio::test]
    async fn foreign_push_to_integration_branch_aborts_build() {
        let (mut sup, host) = setup();
        open(&mut sup, 29).await;
        comment(&mut sup, 29, "alice", "@homu r+").await;
        assert_eq!(status_of(&sup, 29), PrStatus::Testing);

        // A push that we did not trigger lands on the integration branch.
        sup.handle_envelope(Envelope::anonymous(Event::PushToBranch {
            branch: "auto".into(),
            sha: sha('e'),
        }))
        .await
        .unwrap();

        assert_eq!(status_of(&sup, 29), PrStatus::Error);
        assert!(
            host.comments_on(PrNumber(29))
                .iter()
                .any(|c| c.contains("integration branch"))
        );
    }

    #[tokio::test]
    async fn own_reset_push_echo_is_ignored() {
        let (mut sup, _host) = setup();
        open(&mut sup, 31).await;
        comment(&mut sup, 31, "alice", "@homu r+").await;
        let merge = integration_sha(&sup, 31);

        // Before merging, the bot force-reset the integration branch to the
        // protected tip; that push echoes back too and must not be taken
        // for a foreign push (the protected tip was never a merge SHA).
        sup.handle_envelope(Envelope::anonymous(Event::PushToBranch {
            branch: "auto".into(),
            sha: sha('1'),
        }))
        .await
        .unwrap();

        assert_eq!(status_of(&sup, 31), PrStatus::Testing);
        assert_eq!(integration_sha(&sup, 31), merge);
    }

    #[tokio::test]
    async fn own_integration_push_echo_is_ignored() {
        let (mut sup, _host) = setup();
        open(&mut sup, 30).await;
        comment(&mut sup, 30, "alice", "@homu r+").await;
        let merge = integration_sha(&sup, 30);

        // The webhook echo of our own push carries the recorded trigger SHA.
        sup.handle_envelope(Envelope::anonymous(Event::PushToBranch {
            branch: "auto".into(),
            sha: merge.clone(),
        }))
        .await
        .unwrap();

        assert_eq!(status_of(&sup, 30), PrStatus::Testing);
        assert_eq!(integration_sha(&sup, 30), merge);
    }
}
