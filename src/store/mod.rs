//! Durable state layer.
//!
//! The store is a write-through log of the in-memory model: every state
//! transition is mirrored synchronously into SQLite so the service can
//! restart without re-downloading anything from the host. The model remains
//! the source of truth at runtime; the store is only read at startup.

mod sqlite;

pub use sqlite::{BuildTrigger, Store, StoreError};
