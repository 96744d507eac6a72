//! Routing of normalized events to per-repository supervisors.
//!
//! Each configured repository gets one supervisor task and one bounded
//! queue. Different repositories are fully independent; within one
//! repository, events are strictly serialized by its supervisor. When a
//! queue is full, `dispatch` waits, which delays the webhook HTTP response
//! and lets the host's retry machinery provide backpressure.

use std::collections::HashMap;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RepoConfig;
use crate::host::HostApi;
use crate::model::RepoModel;
use crate::store::Store;
use crate::types::{PullRequest, RepoLabel};

use super::message::{Envelope, SupervisorMessage};
use super::supervisor::RepoSupervisor;

/// Capacity of each supervisor's event queue.
const QUEUE_CAPACITY: usize = 128;

/// Errors raised while dispatching an event.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("no supervisor for repository: {0}")]
    UnknownRepo(RepoLabel),

    #[error("supervisor for {0} is gone")]
    SupervisorGone(RepoLabel),
}

struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorMessage>,
    task: JoinHandle<()>,
}

/// Routes events to per-repository supervisor queues.
pub struct Dispatcher {
    handles: HashMap<RepoLabel, SupervisorHandle>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    pub fn new(shutdown: CancellationToken) -> Self {
        Dispatcher {
            handles: HashMap::new(),
            shutdown,
        }
    }

    /// Spawns a supervisor for one repository and registers its queue.
    ///
    /// `rows` are this repository's persisted pull requests from
    /// [`Store::load_all`]; the supervisor's model is rehydrated from them.
    pub fn register(
        &mut self,
        label: RepoLabel,
        cfg: RepoConfig,
        trigger: String,
        store: Arc<Store>,
        host: Arc<dyn HostApi>,
        rows: Vec<PullRequest>,
    ) {
        let model = RepoModel::rehydrate(label.clone(), rows);
        let supervisor = RepoSupervisor::new(cfg, trigger, model, store, host);

        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let cancel = self.shutdown.child_token();
        let task = tokio::spawn(supervisor.run(rx, cancel));

        info!(repo = %label, "Registered supervisor");
        self.handles.insert(label, SupervisorHandle { tx, task });
    }

    /// True if a supervisor exists for this repository.
    pub fn contains(&self, label: &RepoLabel) -> bool {
        self.handles.contains_key(label)
    }

    /// Enqueues an event for a repository, waiting when its queue is full.
    pub async fn dispatch(&self, label: &RepoLabel, envelope: Envelope) -> Result<(), DispatchError> {
        let handle = self
            .handles
            .get(label)
            .ok_or_else(|| DispatchError::UnknownRepo(label.clone()))?;

        handle
            .tx
            .send(SupervisorMessage::Event(envelope))
            .await
            .map_err(|_| DispatchError::SupervisorGone(label.clone()))
    }

    /// Signals shutdown and waits for every supervisor to drain and stop.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for (label, handle) in self.handles {
            drop(handle.tx);
            if let Err(err) = handle.task.await {
                warn!(repo = %label, error = %err, "Supervisor task panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Event;
    use crate::test_utils::{FakeHost, sha};
    use crate::types::PrNumber;

    fn repo_cfg() -> RepoConfig {
        RepoConfig {
            owner: "o".into(),
            name: "n".into(),
            reviewers: vec!["alice".into()],
            admins: vec![],
            builders: vec!["all".into()],
            integration_branch: "auto".into(),
            protected_branch: "master".into(),
            rollup_cap: 8,
            bisect_on_rollup: false,
            webhook_secret: "s".into(),
            buildbot: None,
            travis: None,
            jenkins: None,
            solano: None,
        }
    }

    fn open_event(number: u64) -> Envelope {
        Envelope::anonymous(Event::PrOpened {
            number: PrNumber(number),
            title: "t".into(),
            body: "b".into(),
            head_sha: sha('a'),
            head_ref: "f".into(),
            base_ref: "master".into(),
            author: "dave".into(),
            assignee: None,
        })
    }

    #[tokio::test]
    async fn dispatch_to_unknown_repo_fails() {
        let dispatcher = Dispatcher::new(CancellationToken::new());
        let result = dispatcher
            .dispatch(&RepoLabel::new("nope"), open_event(1))
            .await;
        assert!(matches!(result, Err(DispatchError::UnknownRepo(_))));
    }

    #[tokio::test]
    async fn dispatched_event_reaches_supervisor_store() {
        let store = Arc::new(Store::in_memory().unwrap());
        let host = Arc::new(FakeHost::new());
        host.set_branch("master", sha('1'));

        let shutdown = CancellationToken::new();
        let mut dispatcher = Dispatcher::new(shutdown);
        dispatcher.register(
            RepoLabel::new("r"),
            repo_cfg(),
            "homu".into(),
            store.clone(),
            host as Arc<dyn HostApi>,
            Vec::new(),
        );

        dispatcher
            .dispatch(&RepoLabel::new("r"), open_event(7))
            .await
            .unwrap();

        // The supervisor mirrors the new PR into the store; wait for it.
        let mut found = false;
        for _ in 0..100 {
            if !store.load_all().unwrap().is_empty() {
                found = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(found, "supervisor never persisted the opened PR");

        dispatcher.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_drains_and_stops() {
        let store = Arc::new(Store::in_memory().unwrap());
        let host = Arc::new(FakeHost::new());
        host.set_branch("master", sha('1'));

        let shutdown = CancellationToken::new();
        let mut dispatcher = Dispatcher::new(shutdown);
        dispatcher.register(
            RepoLabel::new("r"),
            repo_cfg(),
            "homu".into(),
            store.clone(),
            host as Arc<dyn HostApi>,
            Vec::new(),
        );

        dispatcher
            .dispatch(&RepoLabel::new("r"), open_event(8))
            .await
            .unwrap();
        dispatcher.shutdown().await;

        // The queued event was processed before the supervisor stopped.
        assert_eq!(store.load_all().unwrap().len(), 1);
    }
}
