//! The dispatch scheduler: matches queued work to available workers,
//! respecting priority and quota.
//!
//! Inference always outranks training chunks, to the point of cooperatively
//! preempting a running chunk when the pool is full. Preemption never loses
//! progress: a paused chunk resumes from its last reported step.

mod error;
mod events;
mod job;
mod link;
mod queue;
mod scheduler;

pub use error::DispatchErr;
pub use events::ChunkEvent;
pub use job::{CompletionOutcome, Job, JobStatus};
pub use link::WorkerLink;
pub use scheduler::{Scheduler, SchedulerConfig};

/// The scheduler module's result type.
pub type Result<T> = std::result::Result<T, DispatchErr>;
