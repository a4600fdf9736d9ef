use comms::specs::{
    job::{ChunkRange, FailReason, JobId, RoundId},
    worker::WorkerId,
};

/// Chunk lifecycle notifications flowing from the scheduler to the round
/// coordinator.
#[derive(Debug)]
pub enum ChunkEvent {
    Dispatched {
        round_id: RoundId,
        job_id: JobId,
        worker_id: WorkerId,
        chunk: ChunkRange,
    },
    Completed {
        round_id: RoundId,
        job_id: JobId,
        worker_id: WorkerId,
        chunk: ChunkRange,
        delta: Vec<f32>,
        sample_count: u64,
    },
    /// The chunk reached a terminal failure (retries exhausted or a
    /// non-retryable reason).
    Failed {
        round_id: RoundId,
        job_id: JobId,
        chunk: ChunkRange,
        reason: FailReason,
    },
}
