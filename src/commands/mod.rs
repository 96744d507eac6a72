//! Reviewer command parsing.
//!
//! Parsing is separated from application: [`parse_commands`] is a pure
//! function from comment text to intended mutations, and the repository
//! supervisor applies (and authorizes) them against the model.

mod parser;
mod types;

pub use parser::parse_commands;
pub use types::{Approver, Command, Delegate, Parsed};
