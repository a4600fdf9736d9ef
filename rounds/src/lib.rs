//! The round coordinator: owns the lifecycle of federated training jobs
//! across many dispatch cycles.
//!
//! One round is one synchronized step: the dataset is partitioned into
//! chunks sized to the eligible worker count, each chunk runs as a training
//! job, partial results are merged by sample-weighted averaging, and the new
//! checkpoint is broadcast before the next wave starts.

mod aggregate;
mod coordinator;
mod error;
mod round;

pub use aggregate::{Contribution, Merged, aggregate};
pub use coordinator::{RoundConfig, RoundCoordinator, RoundEvent, RoundHandle};
pub use error::RoundErr;
pub use round::{
    AggregationResult, RoundStatus, TrainingJob, TrainingJobStatus, TrainingRound, partition,
};

/// The rounds module's result type.
pub type Result<T> = std::result::Result<T, RoundErr>;
