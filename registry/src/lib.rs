//! Worker registry and health monitor.
//!
//! The registry is the sole writer of worker liveness and availability. Other
//! components read snapshots and mutate worker state only through its narrow
//! API, which is what keeps the one-job-per-worker exclusivity invariant safe
//! under concurrent completions and heartbeats.

mod error;
mod registry;
mod worker;

pub use error::RegistryErr;
pub use registry::{Registry, SweepReport};
pub use worker::{HealthConfig, Worker, WorkerStatus};

/// The registry module's result type.
pub type Result<T> = std::result::Result<T, RegistryErr>;
