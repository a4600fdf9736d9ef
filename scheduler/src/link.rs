use std::io;

use async_trait::async_trait;
use comms::specs::{
    job::{DispatchSpec, JobId, RoundId},
    worker::WorkerId,
};

/// The outbound path to remote workers.
///
/// The coordinator binary implements this over the live callback channels;
/// tests substitute an in-memory fake. Delivery is request/callback: none of
/// these wait for the worker to act, only for the command to be written.
#[async_trait]
pub trait WorkerLink: Send + Sync {
    /// Sends a job (or a resumed chunk) to a worker.
    async fn dispatch(&self, worker_id: WorkerId, spec: DispatchSpec) -> io::Result<()>;

    /// Asks a worker to cooperatively pause a running chunk.
    async fn pause(&self, worker_id: WorkerId, job_id: JobId) -> io::Result<()>;

    /// Announces a fresh merged checkpoint to a worker, best effort.
    async fn announce_checkpoint(
        &self,
        worker_id: WorkerId,
        round_id: RoundId,
        checkpoint_ref: String,
    ) -> io::Result<()>;
}
