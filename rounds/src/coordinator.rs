use std::{
    collections::{HashMap, HashSet},
    path::Path,
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, Utc};
use comms::specs::{
    job::{JobId, JobKind, RoundId, TrainingJobId, TrainingSpec},
    status::RoundStatusLine,
};
use log::{debug, error, info, warn};
use rand::Rng;
use registry::{Registry, WorkerStatus};
use scheduler::{ChunkEvent, Scheduler, WorkerLink};
use store::{BlobStore, Journal};
use tokio::{
    sync::{mpsc, oneshot},
    task::AbortHandle,
    time,
};

use crate::{
    AggregationResult, Contribution, Result, RoundErr, RoundStatus, TrainingJob,
    TrainingJobStatus, TrainingRound, aggregate, partition,
};

/// Round policy knobs, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct RoundConfig {
    /// Bounded round deadline capping tail latency from slow or vanished
    /// workers.
    pub round_deadline: Duration,
    /// Consecutive zero-contributor rounds before the training job fails.
    pub max_consecutive_failures: u32,
    pub retry_backoff_base: Duration,
    pub retry_backoff_cap: Duration,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            round_deadline: Duration::from_secs(300),
            max_consecutive_failures: 3,
            retry_backoff_base: Duration::from_secs(5),
            retry_backoff_cap: Duration::from_secs(60),
        }
    }
}

/// Everything the coordinator's event loop reacts to.
#[derive(Debug)]
pub enum RoundEvent {
    Submit {
        spec: TrainingSpec,
        reply: oneshot::Sender<Result<TrainingJobId>>,
    },
    Chunk(ChunkEvent),
    Deadline(RoundId),
    Retry(TrainingJobId),
    Query {
        reply: oneshot::Sender<Vec<RoundStatusLine>>,
    },
}

/// Cloneable handle for talking to a running coordinator.
#[derive(Clone)]
pub struct RoundHandle {
    tx: mpsc::Sender<RoundEvent>,
}

impl RoundHandle {
    pub fn new(tx: mpsc::Sender<RoundEvent>) -> Self {
        Self { tx }
    }

    /// Submits a federated training job and returns its id.
    pub async fn submit_training(&self, spec: TrainingSpec) -> Result<TrainingJobId> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(RoundEvent::Submit { spec, reply })
            .await
            .map_err(|_| RoundErr::CoordinatorClosed)?;

        rx.await.map_err(|_| RoundErr::CoordinatorClosed)?
    }

    /// Point-in-time round progress for the dashboard.
    pub async fn status(&self) -> Result<Vec<RoundStatusLine>> {
        let (reply, rx) = oneshot::channel();

        self.tx
            .send(RoundEvent::Query { reply })
            .await
            .map_err(|_| RoundErr::CoordinatorClosed)?;

        rx.await.map_err(|_| RoundErr::CoordinatorClosed)
    }
}

struct RoundRuntime {
    record: TrainingRound,
    /// Chunk jobs still expected to report.
    pending: HashSet<JobId>,
    contributions: Vec<Contribution>,
}

/// The round coordinator: a single-writer actor owning all round and
/// training-job state.
///
/// All mutation happens inside the event loop, so no per-entity locking is
/// needed; timers re-enter through the event channel.
pub struct RoundCoordinator {
    scheduler: Arc<Scheduler>,
    registry: Arc<Registry>,
    link: Arc<dyn WorkerLink>,
    rounds_journal: Journal<TrainingRound>,
    jobs_journal: Journal<TrainingJob>,
    agg_journal: Journal<AggregationResult>,
    blobs: BlobStore,
    rounds: HashMap<RoundId, RoundRuntime>,
    jobs: HashMap<TrainingJobId, TrainingJob>,
    deadline_timers: HashMap<RoundId, AbortHandle>,
    self_tx: mpsc::Sender<RoundEvent>,
    cfg: RoundConfig,
}

impl RoundCoordinator {
    /// Opens the coordinator, replaying persisted rounds and training jobs.
    pub async fn open(
        state_dir: &Path,
        scheduler: Arc<Scheduler>,
        registry: Arc<Registry>,
        link: Arc<dyn WorkerLink>,
        self_tx: mpsc::Sender<RoundEvent>,
        cfg: RoundConfig,
    ) -> Result<Self> {
        let rounds_journal = Journal::open(state_dir.join("rounds.jsonl")).await?;
        let jobs_journal = Journal::open(state_dir.join("training_jobs.jsonl")).await?;
        let agg_journal = Journal::open(state_dir.join("aggregations.jsonl")).await?;
        let blobs = BlobStore::open(state_dir.join("checkpoints")).await?;

        let rounds: HashMap<_, _> = rounds_journal
            .replay()
            .await?
            .into_values()
            .map(|record: TrainingRound| {
                (
                    record.id,
                    RoundRuntime {
                        record,
                        pending: HashSet::new(),
                        contributions: Vec::new(),
                    },
                )
            })
            .collect();

        let jobs: HashMap<_, _> = jobs_journal
            .replay()
            .await?
            .into_values()
            .map(|job: TrainingJob| (job.id, job))
            .collect();

        if !rounds.is_empty() || !jobs.is_empty() {
            info!(rounds = rounds.len(), jobs = jobs.len(); "replayed training state");
        }

        Ok(Self {
            scheduler,
            registry,
            link,
            rounds_journal,
            jobs_journal,
            agg_journal,
            blobs,
            rounds,
            jobs,
            deadline_timers: HashMap::new(),
            self_tx,
            cfg,
        })
    }

    /// Crash-only recovery: every round that was in flight when the
    /// coordinator died is failed and its training job retried from the last
    /// completed step. No clean-shutdown path exists or is needed.
    pub async fn recover(&mut self) -> Result<()> {
        let stale: Vec<RoundId> = self
            .rounds
            .values()
            .filter(|rt| !rt.record.status.is_terminal())
            .map(|rt| rt.record.id)
            .collect();

        let mut to_retry = HashSet::new();

        for round_id in stale {
            if let Some(rt) = self.rounds.get_mut(&round_id) {
                rt.record.status = RoundStatus::Failed;
                let record = rt.record.clone();
                self.rounds_journal.append(&record).await?;
                to_retry.insert(record.training_job_id);
            }

            self.scheduler.cancel_round_chunks(round_id).await?;
            warn!(round_id = round_id.to_string(); "in-flight round failed by restart");
        }

        // Jobs that were between rounds get picked back up too.
        for job in self.jobs.values() {
            if job.status == TrainingJobStatus::Active {
                to_retry.insert(job.id);
            }
        }

        for training_job_id in to_retry {
            if self
                .self_tx
                .try_send(RoundEvent::Retry(training_job_id))
                .is_err()
            {
                warn!(training_job_id = training_job_id.to_string();
                    "could not queue recovery retry, event channel full");
            }
        }

        Ok(())
    }

    /// Runs the event loop until both channels close.
    ///
    /// Persistence failures stop the loop: quota for the state directory or a
    /// dead disk is not something to retry silently.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<RoundEvent>,
        mut chunks: mpsc::Receiver<ChunkEvent>,
    ) -> Result<()> {
        loop {
            let event = tokio::select! {
                Some(event) = events.recv() => event,
                Some(chunk) = chunks.recv() => RoundEvent::Chunk(chunk),
                else => break,
            };

            match self.handle(event).await {
                Ok(()) => {}
                Err(e @ RoundErr::Persist(_)) => {
                    error!("round coordinator stopping: {e}");
                    return Err(e);
                }
                Err(e) => warn!("round event failed: {e}"),
            }
        }

        Ok(())
    }

    async fn handle(&mut self, event: RoundEvent) -> Result<()> {
        match event {
            RoundEvent::Submit { spec, reply } => {
                let result = self.submit_training(spec, Utc::now()).await;
                let _ = reply.send(result);
                Ok(())
            }
            RoundEvent::Chunk(chunk) => self.on_chunk(chunk).await,
            RoundEvent::Deadline(round_id) => self.on_deadline(round_id).await,
            RoundEvent::Retry(training_job_id) => self.on_retry(training_job_id).await,
            RoundEvent::Query { reply } => {
                let _ = reply.send(self.status_lines());
                Ok(())
            }
        }
    }

    async fn submit_training(
        &mut self,
        spec: TrainingSpec,
        now: DateTime<Utc>,
    ) -> Result<TrainingJobId> {
        let job = TrainingJob::new(spec.dataset, spec.total_steps, spec.worker_count_hint, now);
        let training_job_id = job.id;

        self.jobs_journal.append(&job).await?;
        self.jobs.insert(training_job_id, job);

        info!(training_job_id = training_job_id.to_string(), total_steps = spec.total_steps;
            "training job submitted");

        self.start_round(training_job_id, now).await?;
        Ok(training_job_id)
    }

    /// Partitions the dataset over the currently eligible workers and
    /// dispatches one chunk job per partition.
    async fn start_round(
        &mut self,
        training_job_id: TrainingJobId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = self
            .jobs
            .get(&training_job_id)
            .cloned()
            .ok_or(RoundErr::UnknownTrainingJob(training_job_id))?;

        if job.status != TrainingJobStatus::Active {
            return Ok(());
        }
        if job.current_step >= job.total_steps {
            return self.complete_job(training_job_id).await;
        }

        // Fewer eligible workers than the desired parallelism means fewer,
        // larger chunks: the waves become sequential on their own.
        let eligible = self.registry.list_available(None, true).len();
        let parallelism = job.worker_count_hint.min(eligible.max(1));
        let chunks = partition(job.dataset.len, parallelism);

        let deadline = chrono::Duration::from_std(self.cfg.round_deadline)
            .unwrap_or_else(|_| chrono::Duration::seconds(3600));
        let record = TrainingRound {
            id: RoundId::new(),
            training_job_id,
            total_steps: job.total_steps,
            current_step: job.current_step,
            chunk_assignments: HashMap::new(),
            started_at: now,
            deadline: now + deadline,
            status: RoundStatus::Active,
        };
        let round_id = record.id;

        self.rounds_journal.append(&record).await?;

        let mut pending = HashSet::new();
        for chunk in chunks {
            let job_id = self
                .scheduler
                .submit(
                    JobKind::TrainingChunk { round_id, chunk },
                    job.dataset.uri.clone(),
                    job.checkpoint_ref.clone(),
                    None,
                    now,
                )
                .await?;
            pending.insert(job_id);
        }

        info!(
            round_id = round_id.to_string(),
            step = record.current_step,
            chunks = pending.len();
            "round started"
        );

        self.rounds.insert(
            round_id,
            RoundRuntime {
                record,
                pending,
                contributions: Vec::new(),
            },
        );
        self.arm_deadline(round_id);
        Ok(())
    }

    async fn on_chunk(&mut self, event: ChunkEvent) -> Result<()> {
        match event {
            ChunkEvent::Dispatched {
                round_id,
                worker_id,
                chunk,
                ..
            } => {
                let Some(rt) = self.rounds.get_mut(&round_id) else {
                    return Ok(());
                };
                if rt.record.status != RoundStatus::Active {
                    return Ok(());
                }

                rt.record.chunk_assignments.insert(worker_id, chunk);
                let record = rt.record.clone();
                self.rounds_journal.append(&record).await?;
                Ok(())
            }
            ChunkEvent::Completed {
                round_id,
                job_id,
                worker_id,
                delta,
                sample_count,
                ..
            } => {
                let Some(rt) = self.rounds.get_mut(&round_id) else {
                    debug!(job_id = job_id.to_string(); "chunk result for unknown round dropped");
                    return Ok(());
                };
                if rt.record.status != RoundStatus::Active || !rt.pending.remove(&job_id) {
                    debug!(job_id = job_id.to_string(); "late chunk result dropped");
                    return Ok(());
                }

                rt.contributions.push(Contribution {
                    worker_id,
                    job_id,
                    sample_count,
                    delta,
                });

                if rt.pending.is_empty() {
                    // Everyone reported before the deadline.
                    self.finish_round(round_id, Utc::now()).await?;
                }
                Ok(())
            }
            ChunkEvent::Failed {
                round_id, job_id, ..
            } => {
                let Some(rt) = self.rounds.get_mut(&round_id) else {
                    return Ok(());
                };
                if rt.record.status != RoundStatus::Active || !rt.pending.remove(&job_id) {
                    return Ok(());
                }

                if rt.pending.is_empty() {
                    self.finish_round(round_id, Utc::now()).await?;
                }
                Ok(())
            }
        }
    }

    async fn on_deadline(&mut self, round_id: RoundId) -> Result<()> {
        let Some(rt) = self.rounds.get(&round_id) else {
            return Ok(());
        };
        if rt.record.status != RoundStatus::Active {
            return Ok(());
        }

        let cancelled = self.scheduler.cancel_round_chunks(round_id).await?;
        if cancelled > 0 {
            warn!(round_id = round_id.to_string(), cancelled;
                "round deadline expired with chunks outstanding");
        }

        self.finish_round(round_id, Utc::now()).await
    }

    async fn on_retry(&mut self, training_job_id: TrainingJobId) -> Result<()> {
        let active = self
            .jobs
            .get(&training_job_id)
            .is_some_and(|job| job.status == TrainingJobStatus::Active);
        let round_in_flight = self
            .rounds
            .values()
            .any(|rt| rt.record.training_job_id == training_job_id && !rt.record.status.is_terminal());

        if active && !round_in_flight {
            self.start_round(training_job_id, Utc::now()).await?;
        }
        Ok(())
    }

    /// Closes out a round: aggregate whatever subset reported (if non-empty),
    /// persist the result, broadcast the checkpoint and advance; a round with
    /// zero contributors fails and backs off.
    async fn finish_round(&mut self, round_id: RoundId, now: DateTime<Utc>) -> Result<()> {
        self.cancel_deadline(round_id);

        let (mut record, contributions) = {
            let rt = self
                .rounds
                .get_mut(&round_id)
                .ok_or(RoundErr::UnknownRound(round_id))?;
            rt.pending.clear();
            (rt.record.clone(), std::mem::take(&mut rt.contributions))
        };
        let training_job_id = record.training_job_id;

        // A round may only aggregate with at least one usable contribution;
        // anything less is an explicit failure, never a silent drop.
        let Some(merged) = aggregate(&contributions) else {
            record.status = RoundStatus::Failed;
            self.rounds_journal.append(&record).await?;
            self.commit_round(record);

            warn!(round_id = round_id.to_string(); "round failed with zero contributions");
            return self.round_failed(training_job_id).await;
        };

        record.status = RoundStatus::Aggregating;
        self.rounds_journal.append(&record).await?;
        self.commit_round(record.clone());

        let checkpoint_ref = format!("ckpt-{}-step-{}.bin", training_job_id, record.current_step);
        self.blobs.write_f32(&checkpoint_ref, &merged.delta).await?;

        let result = AggregationResult {
            round_id,
            contributing_worker_ids: merged.contributors.clone(),
            merged_checkpoint_ref: checkpoint_ref.clone(),
            timestamp: now,
        };
        self.agg_journal.append(&result).await?;

        record.status = RoundStatus::Completed;
        self.rounds_journal.append(&record).await?;
        self.commit_round(record);

        info!(
            round_id = round_id.to_string(),
            contributors = merged.contributors.len(),
            samples = merged.total_samples;
            "round aggregated"
        );

        self.broadcast_checkpoint(round_id, &checkpoint_ref).await;
        self.advance(training_job_id, checkpoint_ref, now).await
    }

    /// Best-effort checkpoint push; workers that miss it pull the reference
    /// with their next chunk dispatch.
    async fn broadcast_checkpoint(&self, round_id: RoundId, checkpoint_ref: &str) {
        for worker in self.registry.snapshot() {
            if worker.status == WorkerStatus::Offline {
                continue;
            }

            if let Err(e) = self
                .link
                .announce_checkpoint(worker.id, round_id, checkpoint_ref.to_string())
                .await
            {
                debug!(worker_id = worker.id.to_string(); "checkpoint push missed: {e}");
            }
        }
    }

    async fn advance(
        &mut self,
        training_job_id: TrainingJobId,
        checkpoint_ref: String,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&training_job_id)
            .ok_or(RoundErr::UnknownTrainingJob(training_job_id))?;

        job.current_step += 1;
        job.checkpoint_ref = Some(checkpoint_ref);
        job.consecutive_failures = 0;

        let finished = job.current_step >= job.total_steps;
        let job = job.clone();
        self.jobs_journal.append(&job).await?;

        if finished {
            self.complete_job(training_job_id).await
        } else {
            self.start_round(training_job_id, now).await
        }
    }

    async fn complete_job(&mut self, training_job_id: TrainingJobId) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&training_job_id)
            .ok_or(RoundErr::UnknownTrainingJob(training_job_id))?;

        job.status = TrainingJobStatus::Completed;
        let job = job.clone();
        self.jobs_journal.append(&job).await?;

        info!(training_job_id = training_job_id.to_string(), steps = job.current_step;
            "training job completed");
        Ok(())
    }

    /// Bounded, jittered exponential backoff after a zero-contributor round;
    /// too many in a row surfaces the whole training job as failed.
    async fn round_failed(&mut self, training_job_id: TrainingJobId) -> Result<()> {
        let job = self
            .jobs
            .get_mut(&training_job_id)
            .ok_or(RoundErr::UnknownTrainingJob(training_job_id))?;

        job.consecutive_failures += 1;
        let failures = job.consecutive_failures;

        if failures >= self.cfg.max_consecutive_failures {
            job.status = TrainingJobStatus::Failed;
            let job = job.clone();
            self.jobs_journal.append(&job).await?;

            error!(training_job_id = training_job_id.to_string(), failures;
                "training job failed after consecutive empty rounds");
            return Ok(());
        }

        let job = job.clone();
        self.jobs_journal.append(&job).await?;

        let exp = self
            .cfg
            .retry_backoff_base
            .saturating_mul(1u32 << (failures - 1).min(16))
            .min(self.cfg.retry_backoff_cap);
        let jitter_ms = rand::rng().random_range(0..=exp.as_millis().max(1) as u64 / 4);
        let delay = exp + Duration::from_millis(jitter_ms);

        warn!(training_job_id = training_job_id.to_string(), failures,
            delay_ms = delay.as_millis() as u64; "round retry scheduled");

        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            time::sleep(delay).await;
            let _ = tx.send(RoundEvent::Retry(training_job_id)).await;
        });

        Ok(())
    }

    fn arm_deadline(&mut self, round_id: RoundId) {
        if let Some(prev) = self.deadline_timers.remove(&round_id) {
            prev.abort();
        }

        let tx = self.self_tx.clone();
        let deadline = self.cfg.round_deadline;
        let task = tokio::spawn(async move {
            time::sleep(deadline).await;
            let _ = tx.send(RoundEvent::Deadline(round_id)).await;
        });

        self.deadline_timers.insert(round_id, task.abort_handle());
    }

    fn cancel_deadline(&mut self, round_id: RoundId) {
        if let Some(handle) = self.deadline_timers.remove(&round_id) {
            handle.abort();
        }
    }

    fn commit_round(&mut self, record: TrainingRound) {
        if let Some(rt) = self.rounds.get_mut(&record.id) {
            rt.record = record;
        }
    }

    fn status_lines(&self) -> Vec<RoundStatusLine> {
        self.rounds
            .values()
            .map(|rt| RoundStatusLine {
                id: rt.record.id,
                training_job_id: rt.record.training_job_id,
                status: rt.record.status.as_str().to_string(),
                current_step: rt.record.current_step,
                total_steps: rt.record.total_steps,
                contributed: rt.contributions.len(),
                expected: rt.contributions.len() + rt.pending.len(),
            })
            .collect()
    }
}
