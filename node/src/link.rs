use std::{collections::HashMap, io};

use async_trait::async_trait;
use comms::{
    msg::Command,
    specs::{
        job::{DispatchSpec, JobId, RoundId},
        worker::WorkerId,
    },
};
use parking_lot::RwLock;
use scheduler::WorkerLink;
use tokio::sync::mpsc;

/// The live outbound path to connected workers.
///
/// Each worker connection registers an outbound command channel; dispatch and
/// pause commands are queued there and written by the connection's writer
/// task. A worker without a channel is unreachable, which callers treat like
/// any other delivery failure.
#[derive(Default)]
pub struct ChannelLink {
    channels: RwLock<HashMap<WorkerId, mpsc::Sender<Command>>>,
}

impl ChannelLink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a worker's outbound channel, replacing any stale one.
    pub fn attach(&self, worker_id: WorkerId, tx: mpsc::Sender<Command>) {
        self.channels.write().insert(worker_id, tx);
    }

    /// Detaches a worker's channel when its connection closes.
    pub fn detach(&self, worker_id: WorkerId) {
        self.channels.write().remove(&worker_id);
    }

    async fn send(&self, worker_id: WorkerId, command: Command) -> io::Result<()> {
        let tx = self
            .channels
            .read()
            .get(&worker_id)
            .cloned()
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("worker {worker_id} has no live callback channel"),
                )
            })?;

        tx.send(command).await.map_err(|_| {
            io::Error::new(
                io::ErrorKind::BrokenPipe,
                format!("worker {worker_id} connection closed"),
            )
        })
    }
}

#[async_trait]
impl WorkerLink for ChannelLink {
    async fn dispatch(&self, worker_id: WorkerId, spec: DispatchSpec) -> io::Result<()> {
        self.send(worker_id, Command::Dispatch(spec)).await
    }

    async fn pause(&self, worker_id: WorkerId, job_id: JobId) -> io::Result<()> {
        self.send(worker_id, Command::Pause { job_id }).await
    }

    async fn announce_checkpoint(
        &self,
        worker_id: WorkerId,
        round_id: RoundId,
        checkpoint_ref: String,
    ) -> io::Result<()> {
        self.send(
            worker_id,
            Command::CheckpointReady {
                round_id,
                checkpoint_ref,
            },
        )
        .await
    }
}
