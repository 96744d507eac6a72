//! Core domain types shared across the crate.

mod ids;
mod pr;

pub use ids::{DeliveryId, InvalidSha, PrNumber, RepoLabel, Sha};
pub use pr::{BuildResult, BuildVerdict, Mergeable, PrStatus, PullRequest};
