//! Command types parsed from reviewer comments.

use serde::{Deserialize, Serialize};

/// Who an approval is attributed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Approver {
    /// `r+`: the commenter approves in their own name.
    Commenter,

    /// `r=USER`: the commenter approves on behalf of USER.
    Named(String),
}

/// Target of a `delegate` command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Delegate {
    /// `delegate+`: grant approval authority to the PR author.
    Author,

    /// `delegate=USER`: grant approval authority to USER.
    Named(String),

    /// `delegate-`: revoke any delegation.
    Revoke,
}

/// A single recognized command.
///
/// Parsing is pure: commands are intended mutations, applied (and
/// authorized) by the repository supervisor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// `r+ [sha]` or `r=USER [sha]`. The optional SHA is validated against
    /// the pull request's current head at application time.
    Approve {
        approver: Approver,
        sha: Option<String>,
    },

    /// `r-`.
    Unapprove,

    /// `p=N`.
    Priority(i32),

    /// `try` / `try-`.
    SetTry(bool),

    /// `rollup` / `rollup-`.
    SetRollup(bool),

    /// `retry`: re-queue from `Failure`/`Error`.
    Retry,

    /// `force`: administratively clear the current `Testing` state.
    Force,

    /// `clean`: drop the cached mergeability hint and build state.
    Clean,

    /// `delegate=USER` / `delegate+` / `delegate-`.
    Delegation(Delegate),
}

/// The outcome of parsing one token.
///
/// Unknown words are silently ignored and never produce a `Parsed` at all;
/// recognized verbs with bad arguments become `Malformed`, which the
/// supervisor answers with a single reply comment and no state change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Parsed {
    Command(Command),
    Malformed { word: String, reason: String },
}
