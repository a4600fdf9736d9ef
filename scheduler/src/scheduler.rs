use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use comms::specs::{
    job::{DispatchSpec, FailReason, JobId, JobKind, RoundId},
    worker::WorkerId,
};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use registry::{Registry, RegistryErr, WorkerStatus};
use store::Journal;
use tokio::{
    sync::{Notify, mpsc},
    task::AbortHandle,
    time,
};

use crate::{
    ChunkEvent, CompletionOutcome, DispatchErr, Job, JobStatus, Result, WorkerLink,
    queue::JobQueues,
};

/// Dispatch policy knobs, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Bounded retry budget for retryable failures.
    pub max_retries: u32,
    /// How long a dispatched job may stay unacknowledged before it is failed
    /// as a dispatch timeout.
    pub dispatch_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            dispatch_timeout: Duration::from_secs(30),
        }
    }
}

enum DispatchAttempt {
    Dispatched,
    /// The job is gone or no longer queued; nothing to do.
    Skip,
    NoWorker(JobKind),
}

/// The dispatch scheduler.
///
/// Job mutations are serialized through a per-job write gate; worker
/// exclusivity is enforced by the registry's `assign`, so a stale
/// availability read can never double-book a worker.
pub struct Scheduler {
    jobs: RwLock<HashMap<JobId, Job>>,
    gates: Mutex<HashMap<JobId, Arc<tokio::sync::Mutex<()>>>>,
    queue: Mutex<JobQueues>,
    registry: Arc<Registry>,
    link: Arc<dyn WorkerLink>,
    journal: Journal<Job>,
    chunk_tx: mpsc::Sender<ChunkEvent>,
    timers: Mutex<HashMap<JobId, AbortHandle>>,
    kick: Notify,
    cfg: SchedulerConfig,
}

impl Scheduler {
    /// Opens the scheduler, replaying persisted jobs.
    ///
    /// Replayed jobs are not queued here; `recover` decides what happens to
    /// in-flight work after a restart.
    pub async fn open(
        state_dir: &Path,
        registry: Arc<Registry>,
        link: Arc<dyn WorkerLink>,
        chunk_tx: mpsc::Sender<ChunkEvent>,
        cfg: SchedulerConfig,
    ) -> Result<Self> {
        let journal = Journal::open(state_dir.join("jobs.jsonl")).await?;
        let replayed = journal.replay().await?;

        let jobs: HashMap<_, _> = replayed.into_values().map(|job: Job| (job.id, job)).collect();

        if !jobs.is_empty() {
            info!(count = jobs.len(); "replayed jobs");
        }

        Ok(Self {
            jobs: RwLock::new(jobs),
            gates: Mutex::new(HashMap::new()),
            queue: Mutex::new(JobQueues::default()),
            registry,
            link,
            journal,
            chunk_tx,
            timers: Mutex::new(HashMap::new()),
            kick: Notify::new(),
            cfg,
        })
    }

    /// Crash-only recovery: queued and paused jobs go back in the queue;
    /// jobs that were in flight when the coordinator died are failed as
    /// retryable, which requeues them through the normal bounded path.
    pub async fn recover(self: &Arc<Self>, now: DateTime<Utc>) -> Result<()> {
        let replayed: Vec<(JobId, JobStatus, JobKind)> = self
            .jobs
            .read()
            .values()
            .filter(|job| !job.status.is_terminal())
            .map(|job| (job.id, job.status, job.kind))
            .collect();

        for (job_id, status, kind) in replayed {
            match status {
                JobStatus::Queued | JobStatus::Paused => {
                    self.queue.lock().push(&kind, job_id);
                }
                JobStatus::Dispatched | JobStatus::Running => {
                    self.fail(job_id, FailReason::WorkerUnavailable, now).await?;
                }
                _ => {}
            }
        }

        self.kick();
        Ok(())
    }

    /// Enqueues a job by priority and returns its id.
    pub async fn submit(
        &self,
        kind: JobKind,
        payload_ref: String,
        checkpoint_ref: Option<String>,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<JobId> {
        let job = Job::new(kind, payload_ref, checkpoint_ref, deadline, now);
        let job_id = job.id;

        self.journal.append(&job).await?;
        self.queue.lock().push(&job.kind, job_id);
        self.jobs.write().insert(job_id, job);

        debug!(job_id = job_id.to_string(); "job submitted");
        self.kick();
        Ok(job_id)
    }

    /// Drains the queue onto available workers, highest priority first.
    ///
    /// Stops at the first job the pool cannot take; for a starved inference
    /// job this is where preemption of a running training chunk kicks in.
    pub async fn assign_pending(self: &Arc<Self>, now: DateTime<Utc>) -> Result<()> {
        loop {
            let Some(job_id) = self.queue.lock().pop() else {
                break;
            };

            match self.try_dispatch(job_id, now).await? {
                DispatchAttempt::Dispatched | DispatchAttempt::Skip => continue,
                DispatchAttempt::NoWorker(kind) => {
                    self.queue.lock().push_front(&kind, job_id);

                    if kind.is_inference() {
                        self.preempt_for_inference().await?;
                    }

                    break;
                }
            }
        }

        Ok(())
    }

    /// Marks a job as running and records chunk progress.
    pub async fn on_running(&self, job_id: JobId, step: u64, _now: DateTime<Utc>) -> Result<()> {
        self.cancel_timer(job_id);

        let gate = self.gate(job_id);
        let _guard = gate.lock().await;

        let mut job = self.committed(job_id)?;
        if job.status.is_terminal() {
            return Ok(());
        }

        let was_dispatched = job.status == JobStatus::Dispatched;
        job.status = JobStatus::Running;
        job.progress_step = job.progress_step.max(step);

        // Progress markers between transitions stay in memory; the paused ack
        // is what makes resumption durable.
        if was_dispatched {
            self.journal.append(&job).await?;
        }

        self.jobs.write().insert(job_id, job);
        Ok(())
    }

    /// Handles a worker's pause acknowledgement: the chunk keeps its progress
    /// marker, goes back behind other training work, and the worker returns
    /// to the pool for the inference job that caused the preemption.
    pub async fn on_paused(
        self: &Arc<Self>,
        job_id: JobId,
        progress_step: u64,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        self.cancel_timer(job_id);

        let worker = {
            let gate = self.gate(job_id);
            let _guard = gate.lock().await;

            let mut job = self.committed(job_id)?;
            let worker = job.assigned_worker.take();

            if job.status.is_terminal() {
                // A cancelled chunk paused after its round moved on.
                self.jobs.write().insert(job_id, job);
                self.release_quietly(worker).await;
                self.kick();
                return Ok(());
            }

            job.status = JobStatus::Paused;
            job.progress_step = job.progress_step.max(progress_step);
            job.pause_requested = false;

            self.journal.append(&job).await?;
            self.queue.lock().push(&job.kind, job_id);
            self.jobs.write().insert(job_id, job);
            worker
        };

        debug!(job_id = job_id.to_string(), progress_step; "chunk paused");
        self.release_quietly(worker).await;
        self.kick();
        Ok(())
    }

    /// Completes a job: the worker is released, its usage snapshot flows to
    /// the ledger, and training chunks notify the round coordinator.
    pub async fn complete(
        self: &Arc<Self>,
        job_id: JobId,
        outcome: CompletionOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.cancel_timer(job_id);

        let (job, worker) = {
            let gate = self.gate(job_id);
            let _guard = gate.lock().await;

            let mut job = self.committed(job_id)?;
            let worker = job.assigned_worker.take();

            if job.status.is_terminal() {
                // Late result from a chunk its round already gave up on.
                debug!(job_id = job_id.to_string(); "dropping completion for terminal job");
                self.jobs.write().insert(job_id, job);
                self.release_quietly(worker).await;
                self.kick();
                return Ok(());
            }

            job.status = JobStatus::Completed;
            job.pause_requested = false;
            job.result_ref = outcome.result_ref.clone();

            self.journal.append(&job).await?;
            self.queue.lock().remove(job_id);
            self.jobs.write().insert(job_id, job.clone());
            (job, worker)
        };

        if let Some(worker_id) = worker {
            self.registry
                .report_usage(worker_id, outcome.usage_snapshot_seconds, now)
                .await?;
            self.release_quietly(Some(worker_id)).await;
        }

        if let JobKind::TrainingChunk { round_id, chunk } = job.kind {
            let event = ChunkEvent::Completed {
                round_id,
                job_id,
                worker_id: worker.unwrap_or_default(),
                chunk,
                delta: outcome.delta.unwrap_or_default(),
                sample_count: outcome.sample_count,
            };

            if self.chunk_tx.send(event).await.is_err() {
                warn!("round coordinator dropped its event channel");
            }
        }

        info!(job_id = job_id.to_string(); "job completed");
        self.kick();
        Ok(())
    }

    /// Fails a job. Retryable reasons requeue it up to the bounded retry
    /// budget; terminal reasons surface immediately.
    pub async fn fail(
        self: &Arc<Self>,
        job_id: JobId,
        reason: FailReason,
        _now: DateTime<Utc>,
    ) -> Result<()> {
        self.cancel_timer(job_id);

        let (job, worker, requeued) = {
            let gate = self.gate(job_id);
            let _guard = gate.lock().await;

            let mut job = self.committed(job_id)?;
            let worker = job.assigned_worker.take();

            if job.status.is_terminal() {
                // The per-job timeout of a cancelled chunk: the worker comes
                // back to the pool, the job stays terminal.
                self.jobs.write().insert(job_id, job);
                self.release_quietly(worker).await;
                self.kick();
                return Ok(());
            }

            let requeued = reason.retryable() && job.retry_count < self.cfg.max_retries;
            if requeued {
                job.retry_count += 1;
                job.status = JobStatus::Queued;
            } else {
                job.status = JobStatus::Failed;
            }
            job.pause_requested = false;

            self.journal.append(&job).await?;
            if requeued {
                self.queue.lock().push(&job.kind, job_id);
            } else {
                self.queue.lock().remove(job_id);
            }
            self.jobs.write().insert(job_id, job.clone());
            (job, worker, requeued)
        };

        if requeued {
            debug!(job_id = job_id.to_string(), retry = job.retry_count;
                "job failed ({reason}), requeued");
        } else {
            warn!(job_id = job_id.to_string(); "job failed terminally: {reason}");

            if let JobKind::TrainingChunk { round_id, chunk } = job.kind {
                let event = ChunkEvent::Failed {
                    round_id,
                    job_id,
                    chunk,
                    reason,
                };

                if self.chunk_tx.send(event).await.is_err() {
                    warn!("round coordinator dropped its event channel");
                }
            }
        }

        self.release_quietly(worker).await;
        self.kick();
        Ok(())
    }

    /// Entry point for the registry sweep: a silent worker's held job comes
    /// back as a retryable failure.
    pub async fn worker_offline(
        self: &Arc<Self>,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<()> {
        self.fail(job_id, FailReason::WorkerUnavailable, now).await
    }

    /// Cancels the outstanding chunks of a round that hit its deadline.
    ///
    /// Queued chunks are timed out on the spot. In-flight chunks get a
    /// cooperative pause; their workers return to the pool when the worker
    /// reports back or its per-job timeout elapses.
    pub async fn cancel_round_chunks(&self, round_id: RoundId) -> Result<usize> {
        let targets: Vec<JobId> = self
            .jobs
            .read()
            .values()
            .filter(|job| !job.status.is_terminal())
            .filter(|job| matches!(job.kind, JobKind::TrainingChunk { round_id: r, .. } if r == round_id))
            .map(|job| job.id)
            .collect();

        let mut cancelled = 0;

        for job_id in &targets {
            let job_id = *job_id;
            let gate = self.gate(job_id);
            let _guard = gate.lock().await;

            let Some(mut job) = self.jobs.read().get(&job_id).cloned() else {
                continue;
            };
            if job.status.is_terminal() {
                continue;
            }

            let in_flight = matches!(job.status, JobStatus::Dispatched | JobStatus::Running);
            job.status = JobStatus::TimedOut;

            self.journal.append(&job).await?;
            self.queue.lock().remove(job_id);

            let worker = job.assigned_worker;
            self.jobs.write().insert(job_id, job);
            cancelled += 1;

            if in_flight && let Some(worker_id) = worker {
                if let Err(e) = self.link.pause(worker_id, job_id).await {
                    warn!(job_id = job_id.to_string(); "pause for cancelled chunk failed: {e}");
                }
            }
        }

        Ok(cancelled)
    }

    /// Wakes anything waiting on `kicked` to run an assignment pass.
    pub fn kick(&self) {
        self.kick.notify_one();
    }

    /// Resolves when someone has kicked the scheduler.
    pub async fn kicked(&self) {
        self.kick.notified().await;
    }

    /// A point-in-time copy of one job.
    pub fn get(&self, job_id: JobId) -> Option<Job> {
        self.jobs.read().get(&job_id).cloned()
    }

    /// A point-in-time copy of every job, for status queries.
    pub fn snapshot(&self) -> Vec<Job> {
        self.jobs.read().values().cloned().collect()
    }

    /// Number of jobs currently waiting in the queue.
    pub fn queued_len(&self) -> usize {
        self.queue.lock().len()
    }

    async fn try_dispatch(
        self: &Arc<Self>,
        job_id: JobId,
        now: DateTime<Utc>,
    ) -> Result<DispatchAttempt> {
        let gate = self.gate(job_id);
        let _guard = gate.lock().await;

        let Some(mut job) = self.jobs.read().get(&job_id).cloned() else {
            return Ok(DispatchAttempt::Skip);
        };
        if !matches!(job.status, JobStatus::Queued | JobStatus::Paused) {
            return Ok(DispatchAttempt::Skip);
        }

        if let Some(deadline) = job.deadline
            && deadline < now
        {
            job.status = JobStatus::TimedOut;
            self.journal.append(&job).await?;
            self.jobs.write().insert(job_id, job);
            warn!(job_id = job_id.to_string(); "job deadline expired before dispatch");
            return Ok(DispatchAttempt::Skip);
        }

        let candidates = self.registry.list_available(None, true);

        for candidate in candidates {
            match self.registry.assign(candidate.id, job_id).await {
                Ok(()) => {
                    return self.finish_dispatch(job, candidate.id, now).await;
                }
                // Lost a race for this worker or its quota flipped; the next
                // candidate may still fit.
                Err(
                    RegistryErr::WorkerBusy { .. }
                    | RegistryErr::NotDispatchable { .. }
                    | RegistryErr::QuotaBlocked(_),
                ) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Ok(DispatchAttempt::NoWorker(job.kind))
    }

    async fn finish_dispatch(
        self: &Arc<Self>,
        mut job: Job,
        worker_id: WorkerId,
        now: DateTime<Utc>,
    ) -> Result<DispatchAttempt> {
        let job_id = job.id;
        let resume_from_step = (job.progress_step > 0).then_some(job.progress_step);

        job.status = JobStatus::Dispatched;
        job.assigned_worker = Some(worker_id);
        job.last_dispatched_at = Some(now);
        job.pause_requested = false;

        if let Err(e) = self.journal.append(&job).await {
            self.release_quietly(Some(worker_id)).await;
            return Err(e.into());
        }
        self.jobs.write().insert(job_id, job.clone());

        let spec = DispatchSpec {
            job_id,
            kind: job.kind,
            payload_ref: job.payload_ref.clone(),
            checkpoint_ref: job.checkpoint_ref.clone(),
            resume_from_step,
        };

        if let Err(e) = self.link.dispatch(worker_id, spec).await {
            warn!(job_id = job_id.to_string(), worker_id = worker_id.to_string();
                "dispatch delivery failed: {e}");

            // Undo the assignment and requeue through the bounded retry path.
            let requeued = job.retry_count < self.cfg.max_retries;
            if requeued {
                job.retry_count += 1;
                job.status = JobStatus::Queued;
            } else {
                job.status = JobStatus::Failed;
            }
            job.assigned_worker = None;

            self.journal.append(&job).await?;
            if requeued {
                self.queue.lock().push(&job.kind, job_id);
            }
            self.jobs.write().insert(job_id, job);
            self.release_quietly(Some(worker_id)).await;
            return Ok(DispatchAttempt::Skip);
        }

        debug!(job_id = job_id.to_string(), worker_id = worker_id.to_string();
            "job dispatched");
        self.arm_dispatch_timer(job_id);

        if let JobKind::TrainingChunk { round_id, chunk } = job.kind {
            let event = ChunkEvent::Dispatched {
                round_id,
                job_id,
                worker_id,
                chunk,
            };

            if self.chunk_tx.send(event).await.is_err() {
                warn!("round coordinator dropped its event channel");
            }
        }

        Ok(DispatchAttempt::Dispatched)
    }

    /// Picks the least-recently-dispatched in-flight training chunk on an
    /// eligible worker and asks it to pause.
    async fn preempt_for_inference(&self) -> Result<()> {
        let victim = {
            let jobs = self.jobs.read();
            jobs.values()
                .filter(|job| !job.kind.is_inference())
                .filter(|job| {
                    matches!(job.status, JobStatus::Dispatched | JobStatus::Running)
                })
                .filter(|job| !job.pause_requested)
                .filter(|job| {
                    job.assigned_worker.is_some_and(|worker_id| {
                        self.registry
                            .get(worker_id)
                            .is_some_and(|w| w.status == WorkerStatus::Busy)
                            && self.registry.account_admits(worker_id)
                    })
                })
                .min_by_key(|job| job.last_dispatched_at)
                .and_then(|job| job.assigned_worker.map(|worker| (job.id, worker)))
        };

        let Some((job_id, worker_id)) = victim else {
            debug!("inference starved but no preemptable chunk found");
            return Ok(());
        };

        {
            let gate = self.gate(job_id);
            let _guard = gate.lock().await;

            let Some(mut job) = self.jobs.read().get(&job_id).cloned() else {
                return Ok(());
            };
            if !matches!(job.status, JobStatus::Dispatched | JobStatus::Running) {
                return Ok(());
            }
            job.pause_requested = true;
            self.jobs.write().insert(job_id, job);
        }

        info!(job_id = job_id.to_string(), worker_id = worker_id.to_string();
            "preempting training chunk for inference");

        if let Err(e) = self.link.pause(worker_id, job_id).await {
            // The sweep will reclaim the worker if it is actually gone.
            warn!(worker_id = worker_id.to_string(); "pause delivery failed: {e}");
        }

        Ok(())
    }

    fn arm_dispatch_timer(self: &Arc<Self>, job_id: JobId) {
        let mut timers = self.timers.lock();

        if let Some(prev) = timers.remove(&job_id) {
            prev.abort();
        }

        let scheduler = Arc::clone(self);
        let timeout = self.cfg.dispatch_timeout;
        let task = tokio::spawn(async move {
            time::sleep(timeout).await;

            if let Err(e) = scheduler
                .fail(job_id, FailReason::DispatchTimeout, Utc::now())
                .await
            {
                warn!(job_id = job_id.to_string(); "dispatch timeout handling failed: {e}");
            }
        });

        timers.insert(job_id, task.abort_handle());
    }

    fn cancel_timer(&self, job_id: JobId) {
        if let Some(handle) = self.timers.lock().remove(&job_id) {
            handle.abort();
        }
    }

    async fn release_quietly(&self, worker: Option<WorkerId>) {
        let Some(worker_id) = worker else { return };

        match self.registry.release(worker_id).await {
            Ok(()) | Err(RegistryErr::UnknownWorker(_)) => {}
            Err(e) => warn!(worker_id = worker_id.to_string(); "worker release failed: {e}"),
        }
    }

    fn committed(&self, job_id: JobId) -> Result<Job> {
        self.jobs
            .read()
            .get(&job_id)
            .cloned()
            .ok_or(DispatchErr::UnknownJob(job_id))
    }

    fn gate(&self, job_id: JobId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.gates
                .lock()
                .entry(job_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}
