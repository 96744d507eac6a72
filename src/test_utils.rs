//! Shared test fixtures.
//!
//! `FakeHost` is an in-memory implementation of the host capability
//! interface: branches are a map, merge commits are generated
//! deterministically, and every comment/status is recorded for assertions.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::host::{CommentRecord, HostApi, HostError, PrSnapshot, StatusState};
use crate::types::{PrNumber, Sha};

/// Builds a SHA of one repeated character, for readable test fixtures.
pub fn sha(c: char) -> Sha {
    Sha::parse(c.to_string().repeat(40)).unwrap()
}

#[derive(Debug, Default)]
struct FakeHostState {
    branches: HashMap<String, Sha>,
    prs: HashMap<PrNumber, PrSnapshot>,
    comments: Vec<(PrNumber, String)>,
    statuses: Vec<(Sha, &'static str, String)>,
    merge_counter: u64,
    fail_next_merge: bool,
    fail_next_fast_forward: bool,
    transient_merge_failures: u32,
}

/// In-memory fake of the code host.
#[derive(Debug, Default)]
pub struct FakeHost {
    state: Mutex<FakeHostState>,
}

impl FakeHost {
    pub fn new() -> Self {
        FakeHost::default()
    }

    /// Sets the tip of a branch.
    pub fn set_branch(&self, branch: &str, sha: Sha) {
        self.state
            .lock()
            .unwrap()
            .branches
            .insert(branch.to_string(), sha);
    }

    /// Reads the tip of a branch.
    pub fn branch(&self, branch: &str) -> Option<Sha> {
        self.state.lock().unwrap().branches.get(branch).cloned()
    }

    /// Registers a PR snapshot served by `get_pr`.
    pub fn put_pr(&self, snapshot: PrSnapshot) {
        self.state
            .lock()
            .unwrap()
            .prs
            .insert(snapshot.number, snapshot);
    }

    /// All comments posted so far, in order.
    pub fn comments(&self) -> Vec<(PrNumber, String)> {
        self.state.lock().unwrap().comments.clone()
    }

    /// All comments posted on one PR.
    pub fn comments_on(&self, number: PrNumber) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .comments
            .iter()
            .filter(|(n, _)| *n == number)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// All commit statuses set so far.
    pub fn statuses(&self) -> Vec<(Sha, &'static str, String)> {
        self.state.lock().unwrap().statuses.clone()
    }

    /// The SHA the next `create_merge` call will produce.
    pub fn next_merge_sha(&self) -> Sha {
        let state = self.state.lock().unwrap();
        merge_sha_for(state.merge_counter)
    }

    /// Makes the next `create_merge` fail as a refusal (merge conflict).
    pub fn fail_next_merge(&self) {
        self.state.lock().unwrap().fail_next_merge = true;
    }

    /// Makes the next `create_merge` calls fail transiently `n` times.
    pub fn fail_merge_transiently(&self, n: u32) {
        self.state.lock().unwrap().transient_merge_failures = n;
    }

    /// Makes the next `fast_forward` fail as a refusal (concurrent push).
    pub fn fail_next_fast_forward(&self) {
        self.state.lock().unwrap().fail_next_fast_forward = true;
    }
}

/// Deterministic merge SHA sequence: 40 hex chars ending in the counter.
fn merge_sha_for(counter: u64) -> Sha {
    let tail = format!("{:08x}", counter);
    let head = "f".repeat(40 - tail.len());
    Sha::parse(format!("{}{}", head, tail)).unwrap()
}

#[async_trait]
impl HostApi for FakeHost {
    async fn get_pr(&self, number: PrNumber) -> Result<PrSnapshot, HostError> {
        self.state
            .lock()
            .unwrap()
            .prs
            .get(&number)
            .cloned()
            .ok_or_else(|| HostError::refusal(format!("no such PR {}", number)))
    }

    async fn list_comments(&self, _number: PrNumber) -> Result<Vec<CommentRecord>, HostError> {
        Ok(Vec::new())
    }

    async fn post_comment(&self, number: PrNumber, body: &str) -> Result<(), HostError> {
        self.state
            .lock()
            .unwrap()
            .comments
            .push((number, body.to_string()));
        Ok(())
    }

    async fn create_merge(
        &self,
        branch: &str,
        _head: &Sha,
        _message: &str,
    ) -> Result<Sha, HostError> {
        let mut state = self.state.lock().unwrap();
        if state.transient_merge_failures > 0 {
            state.transient_merge_failures -= 1;
            return Err(HostError::transient("fake 502"));
        }
        if state.fail_next_merge {
            state.fail_next_merge = false;
            return Err(HostError::refusal("Merge conflict"));
        }
        if !state.branches.contains_key(branch) {
            return Err(HostError::refusal(format!("no such branch {}", branch)));
        }
        let sha = merge_sha_for(state.merge_counter);
        state.merge_counter += 1;
        state.branches.insert(branch.to_string(), sha.clone());
        Ok(sha)
    }

    async fn push_branch(&self, branch: &str, sha: &Sha) -> Result<(), HostError> {
        self.state
            .lock()
            .unwrap()
            .branches
            .insert(branch.to_string(), sha.clone());
        Ok(())
    }

    async fn fast_forward(&self, branch: &str, sha: &Sha) -> Result<(), HostError> {
        let mut state = self.state.lock().unwrap();
        if state.fail_next_fast_forward {
            state.fail_next_fast_forward = false;
            return Err(HostError::refusal("not a fast forward"));
        }
        state.branches.insert(branch.to_string(), sha.clone());
        Ok(())
    }

    async fn set_status(
        &self,
        sha: &Sha,
        state: StatusState,
        _context: &str,
        description: &str,
    ) -> Result<(), HostError> {
        self.state.lock().unwrap().statuses.push((
            sha.clone(),
            state.as_str(),
            description.to_string(),
        ));
        Ok(())
    }

    async fn branch_sha(&self, branch: &str) -> Result<Sha, HostError> {
        self.state
            .lock()
            .unwrap()
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| HostError::refusal(format!("no such branch {}", branch)))
    }
}
