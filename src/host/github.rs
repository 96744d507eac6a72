//! Octocrab-backed implementation of the host capability interface.
//!
//! All operations are scoped to a single repository, rate-limited through a
//! shared token bucket and bounded by a deadline. The REST API is used
//! directly where octocrab's typed builders do not cover what we need
//! (git refs, merge commits, statuses).

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};

use crate::types::{PrNumber, Sha};

use super::api::{CommentRecord, HostApi, PrSnapshot, StatusState};
use super::error::HostError;
use super::rate::TokenBucket;

/// Default deadline for one outbound host call.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default token bucket: burst of 10, ~2 calls/second sustained.
const BUCKET_CAPACITY: u32 = 10;
const BUCKET_REFILL_PER_SEC: f64 = 2.0;

/// A GitHub client scoped to a single repository.
pub struct GithubHost {
    client: Octocrab,
    owner: String,
    name: String,
    bucket: TokenBucket,
    timeout: Duration,
}

impl GithubHost {
    /// Creates a host client from a personal access token.
    pub fn from_token(
        token: impl Into<String>,
        owner: impl Into<String>,
        name: impl Into<String>,
    ) -> Result<Self, octocrab::Error> {
        let client = Octocrab::builder().personal_token(token.into()).build()?;
        Ok(Self::new(client, owner, name))
    }

    /// Creates a host client from a pre-configured octocrab instance.
    pub fn new(client: Octocrab, owner: impl Into<String>, name: impl Into<String>) -> Self {
        GithubHost {
            client,
            owner: owner.into(),
            name: name.into(),
            bucket: TokenBucket::new(BUCKET_CAPACITY, BUCKET_REFILL_PER_SEC),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Overrides the per-call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Rate-limits and deadline-bounds one API call.
    async fn bounded<T, Fut>(&self, fut: Fut) -> Result<T, HostError>
    where
        Fut: Future<Output = Result<T, octocrab::Error>>,
    {
        self.bucket.acquire().await;
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(HostError::from_octocrab(e)),
            Err(_) => Err(HostError::transient("host call timed out")),
        }
    }

    fn repo_url(&self, rest: &str) -> String {
        format!("/repos/{}/{}{}", self.owner, self.name, rest)
    }
}

impl std::fmt::Debug for GithubHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GithubHost")
            .field("owner", &self.owner)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

// ── Raw REST payloads ──

#[derive(Debug, Deserialize)]
struct RawUser {
    login: String,
}

#[derive(Debug, Deserialize)]
struct RawRef {
    sha: String,
    #[serde(rename = "ref")]
    ref_name: String,
}

#[derive(Debug, Deserialize)]
struct RawPull {
    number: u64,
    title: Option<String>,
    body: Option<String>,
    head: RawRef,
    base: RawRef,
    assignee: Option<RawUser>,
    mergeable: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct RawComment {
    user: RawUser,
    body: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawMergeResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct RawGitRef {
    object: RawGitObject,
}

#[derive(Debug, Deserialize)]
struct RawGitObject {
    sha: String,
}

fn parse_sha(field: &str, value: &str) -> Result<Sha, HostError> {
    Sha::parse(value)
        .map_err(|e| HostError::refusal(format!("host returned invalid {}: {}", field, e)))
}

#[async_trait]
impl HostApi for GithubHost {
    async fn get_pr(&self, number: PrNumber) -> Result<PrSnapshot, HostError> {
        let url = self.repo_url(&format!("/pulls/{}", number.0));
        let raw: RawPull = self.bounded(self.client.get(&url, None::<&()>)).await?;

        Ok(PrSnapshot {
            number: PrNumber(raw.number),
            title: raw.title.unwrap_or_default(),
            body: raw.body.unwrap_or_default(),
            head_sha: parse_sha("head sha", &raw.head.sha)?,
            head_ref: raw.head.ref_name,
            base_ref: raw.base.ref_name,
            assignee: raw.assignee.map(|u| u.login),
            mergeable: raw.mergeable,
        })
    }

    async fn list_comments(&self, number: PrNumber) -> Result<Vec<CommentRecord>, HostError> {
        let url = self.repo_url(&format!("/issues/{}/comments?per_page=100", number.0));
        let raw: Vec<RawComment> = self.bounded(self.client.get(&url, None::<&()>)).await?;

        Ok(raw
            .into_iter()
            .map(|c| CommentRecord {
                author: c.user.login,
                body: c.body.unwrap_or_default(),
            })
            .collect())
    }

    async fn post_comment(&self, number: PrNumber, body: &str) -> Result<(), HostError> {
        let url = self.repo_url(&format!("/issues/{}/comments", number.0));

        #[derive(Serialize)]
        struct CommentRequest<'a> {
            body: &'a str,
        }

        let _: serde_json::Value = self
            .bounded(self.client.post(&url, Some(&CommentRequest { body })))
            .await?;
        Ok(())
    }

    async fn create_merge(
        &self,
        branch: &str,
        head: &Sha,
        message: &str,
    ) -> Result<Sha, HostError> {
        let url = self.repo_url("/merges");

        #[derive(Serialize)]
        struct MergeRequest<'a> {
            base: &'a str,
            head: &'a str,
            commit_message: &'a str,
        }

        let raw: RawMergeResponse = self
            .bounded(self.client.post(
                &url,
                Some(&MergeRequest {
                    base: branch,
                    head: head.as_str(),
                    commit_message: message,
                }),
            ))
            .await?;

        parse_sha("merge sha", &raw.sha)
    }

    async fn push_branch(&self, branch: &str, sha: &Sha) -> Result<(), HostError> {
        #[derive(Serialize)]
        struct UpdateRefRequest<'a> {
            sha: &'a str,
            force: bool,
        }

        let update_url = self.repo_url(&format!("/git/refs/heads/{}", branch));
        let update = self
            .bounded(self.client.patch::<serde_json::Value, _, _>(
                &update_url,
                Some(&UpdateRefRequest {
                    sha: sha.as_str(),
                    force: true,
                }),
            ))
            .await;

        match update {
            Ok(_) => Ok(()),
            // The branch may not exist yet; try to create it.
            Err(err) if !err.is_transient() => {
                #[derive(Serialize)]
                struct CreateRefRequest<'a> {
                    #[serde(rename = "ref")]
                    ref_name: String,
                    sha: &'a str,
                }

                let create_url = self.repo_url("/git/refs");
                let _: serde_json::Value = self
                    .bounded(self.client.post(
                        &create_url,
                        Some(&CreateRefRequest {
                            ref_name: format!("refs/heads/{}", branch),
                            sha: sha.as_str(),
                        }),
                    ))
                    .await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn fast_forward(&self, branch: &str, sha: &Sha) -> Result<(), HostError> {
        #[derive(Serialize)]
        struct UpdateRefRequest<'a> {
            sha: &'a str,
            force: bool,
        }

        let url = self.repo_url(&format!("/git/refs/heads/{}", branch));
        let _: serde_json::Value = self
            .bounded(self.client.patch(
                &url,
                Some(&UpdateRefRequest {
                    sha: sha.as_str(),
                    // Non-fast-forward updates must be refused by the host.
                    force: false,
                }),
            ))
            .await?;
        Ok(())
    }

    async fn set_status(
        &self,
        sha: &Sha,
        state: StatusState,
        context: &str,
        description: &str,
    ) -> Result<(), HostError> {
        let url = self.repo_url(&format!("/statuses/{}", sha));

        #[derive(Serialize)]
        struct StatusRequest<'a> {
            state: &'a str,
            context: &'a str,
            description: &'a str,
        }

        let _: serde_json::Value = self
            .bounded(self.client.post(
                &url,
                Some(&StatusRequest {
                    state: state.as_str(),
                    context,
                    description,
                }),
            ))
            .await?;
        Ok(())
    }

    async fn branch_sha(&self, branch: &str) -> Result<Sha, HostError> {
        let url = self.repo_url(&format!("/git/ref/heads/{}", branch));
        let raw: RawGitRef = self.bounded(self.client.get(&url, None::<&()>)).await?;
        parse_sha("ref sha", &raw.object.sha)
    }
}
