//! Per-repository supervisors and event routing.
//!
//! One supervisor task per repository owns that repository's model and
//! serializes all mutation; the dispatcher routes normalized events to the
//! right supervisor via bounded queues.

mod dispatch;
mod message;
mod supervisor;

pub use dispatch::{DispatchError, Dispatcher};
pub use message::{Envelope, SupervisorMessage};
pub use supervisor::{RepoSupervisor, SupervisorError};
