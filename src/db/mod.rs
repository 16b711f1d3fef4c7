//! Run journal storage.
//!
//! - `model`: rows returned by the journal queries.
//! - `repo`: SQL-only functions over the SQLite pool.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{ErrorRecord, PhaseRecord, RunState, RunSummary};
