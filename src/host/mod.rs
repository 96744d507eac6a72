//! Code-host integration.
//!
//! The scheduler and supervisor only see the narrow [`HostApi`] capability
//! trait; the octocrab-backed [`GithubHost`] is wired in by the launcher.

mod api;
mod error;
mod github;
mod rate;
mod retry;

pub use api::{CommentRecord, HostApi, PrSnapshot, StatusState};
pub use error::{HostError, HostErrorKind};
pub use github::GithubHost;
pub use rate::TokenBucket;
pub use retry::{RetryConfig, with_retry};
