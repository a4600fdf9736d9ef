use std::{io, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use comms::specs::{
    job::{ChunkRange, DispatchSpec, FailReason, JobId, JobKind, RoundId},
    worker::{GpuClass, WorkerDescriptor, WorkerId},
};
use ledger::{Ledger, ProviderLimits, ProviderLimitsMap};
use parking_lot::Mutex;
use registry::{HealthConfig, Registry, WorkerStatus};
use scheduler::{ChunkEvent, CompletionOutcome, JobStatus, Scheduler, SchedulerConfig, WorkerLink};
use tokio::sync::mpsc;

#[derive(Default)]
struct MockLink {
    dispatches: Mutex<Vec<(WorkerId, DispatchSpec)>>,
    pauses: Mutex<Vec<(WorkerId, JobId)>>,
}

#[async_trait]
impl WorkerLink for MockLink {
    async fn dispatch(&self, worker_id: WorkerId, spec: DispatchSpec) -> io::Result<()> {
        self.dispatches.lock().push((worker_id, spec));
        Ok(())
    }

    async fn pause(&self, worker_id: WorkerId, job_id: JobId) -> io::Result<()> {
        self.pauses.lock().push((worker_id, job_id));
        Ok(())
    }

    async fn announce_checkpoint(
        &self,
        _worker_id: WorkerId,
        _round_id: RoundId,
        _checkpoint_ref: String,
    ) -> io::Result<()> {
        Ok(())
    }
}

struct Harness {
    registry: Arc<Registry>,
    #[allow(dead_code)]
    ledger: Arc<Ledger>,
    scheduler: Arc<Scheduler>,
    link: Arc<MockLink>,
    chunk_rx: mpsc::Receiver<ChunkEvent>,
    _dir: tempfile::TempDir,
}

fn t(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 8, 5, 12, 0, 0).unwrap() + chrono::Duration::seconds(secs)
}

fn limits_map() -> ProviderLimitsMap {
    ProviderLimitsMap::new(ProviderLimits {
        session_limit_seconds: 1000,
        weekly_limit_seconds: 10000,
        safety_margin_ratio: 0.3,
    })
}

fn descriptor(account: &str, addr: &str) -> WorkerDescriptor {
    WorkerDescriptor {
        provider: "colab".into(),
        account_id: account.into(),
        gpu_class: GpuClass::T4,
        capabilities: vec!["train".into()],
        callback_addr: addr.into(),
    }
}

fn chunk_kind(round_id: RoundId, start: u64, end: u64) -> JobKind {
    JobKind::TrainingChunk {
        round_id,
        chunk: ChunkRange::new(start, end),
    }
}

fn outcome(usage: u64) -> CompletionOutcome {
    CompletionOutcome {
        usage_snapshot_seconds: usage,
        sample_count: 32,
        result_ref: None,
        delta: Some(vec![0.0; 4]),
    }
}

async fn harness(cfg: SchedulerConfig) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (drain_tx, _drain_rx) = mpsc::channel(8);
    let (chunk_tx, chunk_rx) = mpsc::channel(64);

    let ledger = Arc::new(Ledger::open(dir.path(), drain_tx).await.unwrap());
    let registry = Arc::new(
        Registry::open(
            dir.path(),
            Arc::clone(&ledger),
            limits_map(),
            HealthConfig::default(),
        )
        .await
        .unwrap(),
    );
    let link = Arc::new(MockLink::default());
    let scheduler = Arc::new(
        Scheduler::open(
            dir.path(),
            Arc::clone(&registry),
            Arc::clone(&link) as Arc<dyn WorkerLink>,
            chunk_tx,
            cfg,
        )
        .await
        .unwrap(),
    );

    Harness {
        registry,
        ledger,
        scheduler,
        link,
        chunk_rx,
        _dir: dir,
    }
}

#[tokio::test]
async fn inference_preempts_training_and_resumes_from_progress() {
    let h = harness(SchedulerConfig::default()).await;

    h.registry.register(descriptor("a", "w0:9000"), t(0)).await.unwrap();
    h.registry.register(descriptor("b", "w1:9000"), t(0)).await.unwrap();

    let round_id = RoundId::new();

    // Two chunks fill the whole pool.
    let chunk1 = h
        .scheduler
        .submit(chunk_kind(round_id, 0, 50), "model://m".into(), None, None, t(1))
        .await
        .unwrap();
    h.scheduler.assign_pending(t(1)).await.unwrap();

    let chunk2 = h
        .scheduler
        .submit(chunk_kind(round_id, 50, 100), "model://m".into(), None, None, t(2))
        .await
        .unwrap();
    h.scheduler.assign_pending(t(2)).await.unwrap();

    assert_eq!(h.link.dispatches.lock().len(), 2);
    let chunk1_worker = h.link.dispatches.lock()[0].0;

    h.scheduler.on_running(chunk1, 5, t(3)).await.unwrap();
    h.scheduler.on_running(chunk2, 3, t(3)).await.unwrap();

    // Inference arrives with no idle worker: the least-recently-dispatched
    // chunk gets a cooperative pause.
    let inference = h
        .scheduler
        .submit(JobKind::Inference, "prompt://q".into(), None, None, t(4))
        .await
        .unwrap();
    h.scheduler.assign_pending(t(4)).await.unwrap();

    assert_eq!(h.link.pauses.lock().as_slice(), &[(chunk1_worker, chunk1)]);
    assert_eq!(h.scheduler.get(inference).unwrap().status, JobStatus::Queued);

    // The worker acknowledges with its progress marker.
    h.scheduler.on_paused(chunk1, 7, t(5)).await.unwrap();
    let paused = h.scheduler.get(chunk1).unwrap();
    assert_eq!(paused.status, JobStatus::Paused);
    assert_eq!(paused.progress_step, 7);

    h.scheduler.assign_pending(t(5)).await.unwrap();
    {
        let dispatches = h.link.dispatches.lock();
        let (worker, spec) = dispatches.last().unwrap();
        assert_eq!(spec.job_id, inference);
        assert_eq!(*worker, chunk1_worker);
    }
    assert_eq!(h.scheduler.get(inference).unwrap().status, JobStatus::Dispatched);

    // Inference finishes; the paused chunk resumes from its marker, not zero.
    h.scheduler.complete(inference, outcome(10), t(6)).await.unwrap();
    h.scheduler.assign_pending(t(7)).await.unwrap();

    let dispatches = h.link.dispatches.lock();
    let (_, spec) = dispatches.last().unwrap();
    assert_eq!(spec.job_id, chunk1);
    assert_eq!(spec.resume_from_step, Some(7));
    assert!(spec.resume_from_step.unwrap() >= 5);
}

#[tokio::test]
async fn retryable_failures_requeue_up_to_the_bound() {
    let cfg = SchedulerConfig {
        max_retries: 2,
        ..Default::default()
    };
    let mut h = harness(cfg).await;

    h.registry.register(descriptor("a", "w0:9000"), t(0)).await.unwrap();

    let round_id = RoundId::new();
    let job_id = h
        .scheduler
        .submit(chunk_kind(round_id, 0, 10), "model://m".into(), None, None, t(0))
        .await
        .unwrap();

    for attempt in 0..3 {
        h.scheduler.assign_pending(t(attempt)).await.unwrap();
        assert_eq!(h.scheduler.get(job_id).unwrap().status, JobStatus::Dispatched);
        h.scheduler
            .fail(job_id, FailReason::WorkerUnavailable, t(attempt))
            .await
            .unwrap();
    }

    let job = h.scheduler.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 2);

    // The terminal failure reached the round coordinator.
    let mut saw_failed = false;
    while let Ok(event) = h.chunk_rx.try_recv() {
        if let ChunkEvent::Failed { job_id: id, reason, .. } = event {
            assert_eq!(id, job_id);
            assert_eq!(reason, FailReason::WorkerUnavailable);
            saw_failed = true;
        }
    }
    assert!(saw_failed);
}

#[tokio::test]
async fn malformed_payload_fails_without_retry() {
    let h = harness(SchedulerConfig::default()).await;

    h.registry.register(descriptor("a", "w0:9000"), t(0)).await.unwrap();

    let job_id = h
        .scheduler
        .submit(JobKind::Inference, "prompt://bad".into(), None, None, t(0))
        .await
        .unwrap();
    h.scheduler.assign_pending(t(0)).await.unwrap();

    h.scheduler
        .fail(job_id, FailReason::MalformedPayload, t(1))
        .await
        .unwrap();

    let job = h.scheduler.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 0);

    // The worker is back for other work.
    assert_eq!(h.registry.list_available(None, true).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn unacknowledged_dispatch_times_out_and_requeues() {
    let cfg = SchedulerConfig {
        max_retries: 3,
        dispatch_timeout: Duration::from_secs(30),
    };
    let h = harness(cfg).await;

    h.registry.register(descriptor("a", "w0:9000"), t(0)).await.unwrap();

    let job_id = h
        .scheduler
        .submit(JobKind::Inference, "prompt://q".into(), None, None, t(0))
        .await
        .unwrap();
    h.scheduler.assign_pending(t(0)).await.unwrap();
    assert_eq!(h.scheduler.get(job_id).unwrap().status, JobStatus::Dispatched);

    tokio::time::sleep(Duration::from_secs(31)).await;
    for _ in 0..100 {
        if h.scheduler.get(job_id).unwrap().status == JobStatus::Queued {
            break;
        }
        tokio::task::yield_now().await;
    }

    let job = h.scheduler.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);
    assert_eq!(
        h.registry.get(h.link.dispatches.lock()[0].0).unwrap().status,
        WorkerStatus::Online
    );
}

#[tokio::test]
async fn expired_deadline_times_out_before_dispatch() {
    let h = harness(SchedulerConfig::default()).await;

    h.registry.register(descriptor("a", "w0:9000"), t(0)).await.unwrap();

    let job_id = h
        .scheduler
        .submit(JobKind::Inference, "prompt://q".into(), None, Some(t(-1)), t(0))
        .await
        .unwrap();
    h.scheduler.assign_pending(t(0)).await.unwrap();

    assert_eq!(h.scheduler.get(job_id).unwrap().status, JobStatus::TimedOut);
    assert!(h.link.dispatches.lock().is_empty());
}

#[tokio::test]
async fn offline_workers_job_is_reassigned() {
    let h = harness(SchedulerConfig::default()).await;

    // Register the doomed worker alone so the chunk must land on it.
    let silent = h.registry.register(descriptor("a", "w0:9000"), t(0)).await.unwrap();

    let round_id = RoundId::new();
    let job_id = h
        .scheduler
        .submit(chunk_kind(round_id, 0, 10), "model://m".into(), None, None, t(0))
        .await
        .unwrap();
    h.scheduler.assign_pending(t(0)).await.unwrap();
    assert_eq!(h.scheduler.get(job_id).unwrap().assigned_worker, Some(silent));

    let alive = h.registry.register(descriptor("b", "w1:9000"), t(0)).await.unwrap();

    // The healthy worker keeps heartbeating; the other misses three beats.
    h.registry.heartbeat(alive, 1, None, t(120)).await.unwrap();
    let report = h.registry.sweep(t(181)).await.unwrap();
    assert_eq!(report.offlined, vec![(silent, Some(job_id))]);

    h.scheduler.worker_offline(job_id, t(181)).await.unwrap();
    let job = h.scheduler.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.retry_count, 1);

    h.scheduler.assign_pending(t(182)).await.unwrap();
    let job = h.scheduler.get(job_id).unwrap();
    assert_eq!(job.status, JobStatus::Dispatched);
    assert_eq!(job.assigned_worker, Some(alive));
}
