use std::{collections::HashMap, io, sync::Arc};

use chrono::Utc;
use comms::{
    WireReceiver, WireSender,
    msg::{Command, Msg, Payload},
    specs::{
        job::{CompletionReport, JobId, JobKind},
        worker::WorkerId,
    },
};
use log::{debug, info, warn};
use scheduler::CompletionOutcome;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::mpsc,
};

use crate::app::Coordinator;

/// Serves one accepted connection.
///
/// The first frame decides the peer: a `Register` makes it a worker callback
/// channel, anything else is treated as a client (submission / dashboard)
/// session.
pub async fn serve<R, W>(app: Arc<Coordinator>, rx: R, tx: W) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (mut rx, tx) = comms::channel(rx, tx);

    let first: Msg = rx.recv().await?;
    match first {
        Msg::Control(Command::Register(descriptor)) => {
            let descriptor_addr = descriptor.callback_addr.clone();
            match app.registry.register(descriptor, Utc::now()).await {
                Ok(worker_id) => worker_session(app, rx, tx, worker_id).await,
                Err(e) => {
                    warn!(addr = descriptor_addr; "registration rejected: {e}");
                    let mut tx = tx;
                    tx.send(&Msg::Err(format!("registration rejected: {e}").into()))
                        .await
                }
            }
        }
        Msg::Control(command) => client_session(app, rx, tx, command).await,
        other => {
            warn!("unexpected first frame: {other:?}");
            Ok(())
        }
    }
}

async fn worker_session<R, W>(
    app: Arc<Coordinator>,
    mut rx: WireReceiver<R>,
    mut tx: WireSender<W>,
    worker_id: WorkerId,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    tx.send(&Msg::Control(Command::RegisterAck { worker_id }))
        .await?;

    let (out_tx, mut out_rx) = mpsc::channel::<Command>(64);
    app.link.attach(worker_id, out_tx);
    app.policy
        .on_worker_registered(&app.registry.snapshot(), &app.ledger.snapshot(), Utc::now())
        .await;
    app.scheduler.kick();

    info!(worker_id = worker_id.to_string(); "worker channel established");

    let writer = tokio::spawn(async move {
        while let Some(command) = out_rx.recv().await {
            if tx.send(&Msg::Control(command)).await.is_err() {
                break;
            }
        }
    });

    // Completion reports and their delta frames may arrive in either order;
    // each side is held until its partner shows up.
    let mut deltas: HashMap<JobId, Vec<f32>> = HashMap::new();
    let mut completions: HashMap<JobId, CompletionReport> = HashMap::new();

    let result = loop {
        let msg: Msg = match rx.recv().await {
            Ok(msg) => msg,
            Err(e) => break Err(e),
        };

        match msg {
            Msg::Control(Command::Heartbeat(report)) => {
                if let Err(e) = app
                    .registry
                    .heartbeat(
                        report.worker_id,
                        report.usage_snapshot_seconds,
                        report.current_job_id,
                        Utc::now(),
                    )
                    .await
                {
                    warn!(worker_id = worker_id.to_string(); "heartbeat rejected: {e}");
                }
            }
            Msg::Control(Command::Progress { job_id, step }) => {
                if let Err(e) = app.scheduler.on_running(job_id, step, Utc::now()).await {
                    warn!(job_id = job_id.to_string(); "progress report rejected: {e}");
                }
            }
            Msg::Control(Command::Paused {
                job_id,
                progress_step,
            }) => {
                if let Err(e) = app
                    .scheduler
                    .on_paused(job_id, progress_step, Utc::now())
                    .await
                {
                    warn!(job_id = job_id.to_string(); "pause ack rejected: {e}");
                }
            }
            Msg::Control(Command::Completed(report)) => {
                let job_id = report.job_id;
                completions.insert(job_id, report);
                try_complete(&app, &mut deltas, &mut completions, job_id).await;
            }
            Msg::Control(Command::Failed { job_id, reason }) => {
                if let Err(e) = app.scheduler.fail(job_id, reason, Utc::now()).await {
                    warn!(job_id = job_id.to_string(); "failure report rejected: {e}");
                }
                app.notify_job_done(job_id).await;
            }
            Msg::Control(Command::Disconnect) => break Ok(()),
            Msg::Data(Payload::ChunkDelta { job_id, delta }) => {
                deltas.insert(job_id, delta.to_vec());
                try_complete(&app, &mut deltas, &mut completions, job_id).await;
            }
            Msg::Err(e) => warn!(worker_id = worker_id.to_string(); "worker error: {e}"),
            other => debug!(worker_id = worker_id.to_string(); "ignoring frame: {other:?}"),
        }
    };

    app.link.detach(worker_id);
    writer.abort();
    debug!(worker_id = worker_id.to_string(); "worker channel closed");
    result
}

/// Completes a job once everything it needs has arrived: inference completes
/// on its report alone, training chunks wait for report + delta frame.
async fn try_complete(
    app: &Coordinator,
    deltas: &mut HashMap<JobId, Vec<f32>>,
    completions: &mut HashMap<JobId, CompletionReport>,
    job_id: JobId,
) {
    let Some(job) = app.scheduler.get(job_id) else {
        warn!(job_id = job_id.to_string(); "completion for unknown job dropped");
        deltas.remove(&job_id);
        completions.remove(&job_id);
        return;
    };

    let needs_delta = matches!(job.kind, JobKind::TrainingChunk { .. });
    if needs_delta && !deltas.contains_key(&job_id) {
        return;
    }
    if !completions.contains_key(&job_id) {
        return;
    }

    let delta = deltas.remove(&job_id);
    let Some(report) = completions.remove(&job_id) else {
        return;
    };

    let outcome = CompletionOutcome {
        usage_snapshot_seconds: report.usage_snapshot_seconds,
        sample_count: report.sample_count,
        result_ref: report.result_ref,
        delta,
    };

    if let Err(e) = app.scheduler.complete(job_id, outcome, Utc::now()).await {
        warn!(job_id = job_id.to_string(); "completion rejected: {e}");
    }
    app.notify_job_done(job_id).await;
}

async fn client_session<R, W>(
    app: Arc<Coordinator>,
    mut rx: WireReceiver<R>,
    mut tx: WireSender<W>,
    first: Command,
) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::channel::<Command>(64);

    let writer = tokio::spawn(async move {
        while let Some(command) = out_rx.recv().await {
            if tx.send(&Msg::Control(command)).await.is_err() {
                break;
            }
        }
    });

    let mut next = Some(first);
    let result = loop {
        let command = match next.take() {
            Some(command) => command,
            None => match rx.recv::<Msg>().await {
                Ok(Msg::Control(command)) => command,
                Ok(other) => {
                    debug!("ignoring client frame: {other:?}");
                    continue;
                }
                Err(e) => break Err(e),
            },
        };

        match command {
            Command::SubmitInference(spec) => {
                let now = Utc::now();
                let deadline = spec
                    .deadline_seconds
                    .map(|secs| now + chrono::Duration::seconds(secs as i64));

                match app
                    .scheduler
                    .submit(JobKind::Inference, spec.payload_ref, None, deadline, now)
                    .await
                {
                    Ok(job_id) => {
                        app.watch_job(job_id, out_tx.clone());
                        if out_tx.send(Command::JobAccepted { job_id }).await.is_err() {
                            break Ok(());
                        }
                    }
                    Err(e) => {
                        warn!("inference submission failed: {e}");
                        break Err(io::Error::other(e));
                    }
                }
            }
            Command::SubmitTraining(spec) => match app.rounds.submit_training(spec).await {
                Ok(training_job_id) => {
                    let accepted = Command::TrainingAccepted { training_job_id };
                    if out_tx.send(accepted).await.is_err() {
                        break Ok(());
                    }
                }
                Err(e) => {
                    warn!("training submission failed: {e}");
                    break Err(io::Error::other(e));
                }
            },
            Command::Status => {
                let report = app.status().await;
                if out_tx.send(Command::StatusReport(report)).await.is_err() {
                    break Ok(());
                }
            }
            Command::Disconnect => break Ok(()),
            other => {
                debug!("unexpected client command: {other:?}");
            }
        }
    };

    writer.abort();
    result
}
