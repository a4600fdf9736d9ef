//! Durable record persistence for the coordinator.
//!
//! Every record family (workers, accounts, jobs, rounds, aggregations) is an
//! append-only JSON-lines journal. Appends are flushed before the in-memory
//! mutation commits, so a coordinator restart replays the journals and
//! resumes from the last completed step.

mod blob;
mod error;
mod journal;

pub use blob::BlobStore;
pub use error::PersistErr;
pub use journal::{Journal, Record};

/// The store module's result type.
pub type Result<T> = std::result::Result<T, PersistErr>;
