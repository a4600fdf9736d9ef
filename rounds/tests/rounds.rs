use std::{io, path::Path, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use comms::specs::{
    job::{DatasetRef, DispatchSpec, JobId, RoundId, TrainingSpec},
    worker::{GpuClass, WorkerDescriptor, WorkerId},
};
use ledger::{Ledger, ProviderLimits, ProviderLimitsMap};
use parking_lot::Mutex;
use registry::{HealthConfig, Registry};
use rounds::{RoundConfig, RoundCoordinator, RoundHandle, TrainingJob, TrainingJobStatus};
use scheduler::{CompletionOutcome, JobStatus, Scheduler, SchedulerConfig, WorkerLink};
use store::Journal;
use tokio::sync::mpsc;

#[derive(Default)]
struct MockLink {
    dispatches: Mutex<Vec<(WorkerId, DispatchSpec)>>,
    pauses: Mutex<Vec<(WorkerId, JobId)>>,
    checkpoints: Mutex<Vec<(WorkerId, RoundId, String)>>,
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
        worker_id: WorkerId,
        round_id: RoundId,
        checkpoint_ref: String,
    ) -> io::Result<()> {
        self.checkpoints.lock().push((worker_id, round_id, checkpoint_ref));
        Ok(())
    }
}

struct Harness {
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    link: Arc<MockLink>,
    handle: RoundHandle,
    dir: tempfile::TempDir,
}

fn limits_map() -> ProviderLimitsMap {
    ProviderLimitsMap::new(ProviderLimits {
        session_limit_seconds: 100000,
        weekly_limit_seconds: 1000000,
        safety_margin_ratio: 0.1,
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

fn training_spec(total_steps: u64, hint: usize, rows: u64) -> TrainingSpec {
    TrainingSpec {
        dataset: DatasetRef {
            uri: "dataset://toy".into(),
            len: rows,
        },
        total_steps,
        worker_count_hint: hint,
    }
}

fn chunk_outcome(delta: Vec<f32>, samples: u64) -> CompletionOutcome {
    CompletionOutcome {
        usage_snapshot_seconds: 0,
        sample_count: samples,
        result_ref: None,
        delta: Some(delta),
    }
}

async fn harness(dir: tempfile::TempDir, cfg: RoundConfig) -> Harness {
    let (drain_tx, _drain_rx) = mpsc::channel(8);
    let (chunk_tx, chunk_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);

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
            SchedulerConfig::default(),
        )
        .await
        .unwrap(),
    );

    let mut coordinator = RoundCoordinator::open(
        dir.path(),
        Arc::clone(&scheduler),
        Arc::clone(&registry),
        Arc::clone(&link) as Arc<dyn WorkerLink>,
        event_tx.clone(),
        cfg,
    )
    .await
    .unwrap();

    scheduler.recover(Utc::now()).await.unwrap();
    coordinator.recover().await.unwrap();
    tokio::spawn(coordinator.run(event_rx, chunk_rx));

    Harness {
        registry,
        scheduler,
        link,
        handle: RoundHandle::new(event_tx),
        dir,
    }
}

async fn settle() {
    for _ in 0..200 {
        tokio::task::yield_now().await;
    }
}

async fn replay_training_jobs(dir: &Path) -> Vec<TrainingJob> {
    let journal: Journal<TrainingJob> = Journal::open(dir.join("training_jobs.jsonl"))
        .await
        .unwrap();
    journal.replay().await.unwrap().into_values().collect()
}

#[tokio::test(start_paused = true)]
async fn partial_results_aggregate_at_the_deadline() {
    let cfg = RoundConfig {
        round_deadline: Duration::from_secs(5),
        ..Default::default()
    };
    let h = harness(tempfile::tempdir().unwrap(), cfg).await;

    for (i, account) in ["a", "b", "c", "d"].iter().enumerate() {
        h.registry
            .register(descriptor(account, &format!("w{i}:9000")), Utc::now())
            .await
            .unwrap();
    }

    h.handle
        .submit_training(training_spec(1, 4, 100))
        .await
        .unwrap();
    settle().await;
    h.scheduler.assign_pending(Utc::now()).await.unwrap();
    settle().await;

    let dispatched: Vec<JobId> = h
        .link
        .dispatches
        .lock()
        .iter()
        .map(|(_, spec)| spec.job_id)
        .collect();
    assert_eq!(dispatched.len(), 4);

    // Three of four report before the deadline.
    for job_id in &dispatched[..3] {
        h.scheduler
            .complete(*job_id, chunk_outcome(vec![1.0, 2.0], 10), Utc::now())
            .await
            .unwrap();
    }
    settle().await;

    let lines = h.handle.status().await.unwrap();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].contributed, 3);
    assert_eq!(lines[0].expected, 4);
    assert_eq!(lines[0].status, "active");

    // The deadline caps the tail: aggregation runs over the subset.
    tokio::time::advance(Duration::from_secs(6)).await;
    settle().await;

    let lines = h.handle.status().await.unwrap();
    assert_eq!(lines[0].status, "completed");

    let jobs = replay_training_jobs(h.dir.path()).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].status, TrainingJobStatus::Completed);
    assert_eq!(jobs[0].current_step, 1);

    // The straggler was cancelled, not failed.
    let straggler = h.scheduler.get(dispatched[3]).unwrap();
    assert_eq!(straggler.status, JobStatus::TimedOut);

    // The merged checkpoint went out to the pool.
    assert!(!h.link.checkpoints.lock().is_empty());
}

#[tokio::test(start_paused = true)]
async fn full_results_advance_through_every_round() {
    let cfg = RoundConfig {
        round_deadline: Duration::from_secs(300),
        ..Default::default()
    };
    let h = harness(tempfile::tempdir().unwrap(), cfg).await;

    h.registry.register(descriptor("a", "w0:9000"), Utc::now()).await.unwrap();
    h.registry.register(descriptor("b", "w1:9000"), Utc::now()).await.unwrap();

    h.handle
        .submit_training(training_spec(2, 2, 10))
        .await
        .unwrap();
    settle().await;

    // Round one: both chunks complete without any deadline help.
    h.scheduler.assign_pending(Utc::now()).await.unwrap();
    settle().await;
    let first_wave: Vec<JobId> = h
        .link
        .dispatches
        .lock()
        .iter()
        .map(|(_, spec)| spec.job_id)
        .collect();
    assert_eq!(first_wave.len(), 2);

    for job_id in &first_wave {
        h.scheduler
            .complete(*job_id, chunk_outcome(vec![0.5; 8], 5), Utc::now())
            .await
            .unwrap();
    }
    settle().await;

    // Round two starts on its own and hands workers the new checkpoint.
    h.scheduler.assign_pending(Utc::now()).await.unwrap();
    settle().await;

    let second_wave: Vec<DispatchSpec> = h
        .link
        .dispatches
        .lock()
        .iter()
        .skip(2)
        .map(|(_, spec)| spec.clone())
        .collect();
    assert_eq!(second_wave.len(), 2);
    for spec in &second_wave {
        let checkpoint = spec.checkpoint_ref.as_deref().unwrap();
        assert!(checkpoint.contains("step-0"));
    }

    for spec in &second_wave {
        h.scheduler
            .complete(spec.job_id, chunk_outcome(vec![0.25; 8], 5), Utc::now())
            .await
            .unwrap();
    }
    settle().await;

    let jobs = replay_training_jobs(h.dir.path()).await;
    assert_eq!(jobs[0].status, TrainingJobStatus::Completed);
    assert_eq!(jobs[0].current_step, 2);
}

#[tokio::test(start_paused = true)]
async fn empty_rounds_back_off_then_fail_the_job() {
    let cfg = RoundConfig {
        round_deadline: Duration::from_secs(2),
        max_consecutive_failures: 2,
        retry_backoff_base: Duration::from_secs(1),
        retry_backoff_cap: Duration::from_secs(2),
    };
    let h = harness(tempfile::tempdir().unwrap(), cfg).await;

    // No workers at all: every round expires empty.
    h.handle
        .submit_training(training_spec(1, 2, 10))
        .await
        .unwrap();
    settle().await;

    let mut failed = false;
    for _ in 0..30 {
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        let jobs = replay_training_jobs(h.dir.path()).await;
        if jobs[0].status == TrainingJobStatus::Failed {
            failed = true;
            break;
        }
    }
    assert!(failed, "training job should fail after consecutive empty rounds");

    let lines = h.handle.status().await.unwrap();
    let failed_rounds = lines.iter().filter(|l| l.status == "failed").count();
    assert_eq!(failed_rounds, 2);
    assert_eq!(replay_training_jobs(h.dir.path()).await[0].consecutive_failures, 2);
}

#[tokio::test(start_paused = true)]
async fn restart_fails_stale_rounds_and_retries_the_job() {
    let dir = tempfile::tempdir().unwrap();
    let cfg = RoundConfig {
        round_deadline: Duration::from_secs(300),
        ..Default::default()
    };

    // First life: a round goes in flight and the process dies.
    let (drain_tx, _drain_rx) = mpsc::channel(8);
    let (chunk_tx, chunk_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);

    let ledger = Arc::new(Ledger::open(dir.path(), drain_tx).await.unwrap());
    let registry = Arc::new(
        Registry::open(dir.path(), Arc::clone(&ledger), limits_map(), HealthConfig::default())
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
            SchedulerConfig::default(),
        )
        .await
        .unwrap(),
    );
    let coordinator = RoundCoordinator::open(
        dir.path(),
        Arc::clone(&scheduler),
        Arc::clone(&registry),
        Arc::clone(&link) as Arc<dyn WorkerLink>,
        event_tx.clone(),
        cfg,
    )
    .await
    .unwrap();
    let run_task = tokio::spawn(coordinator.run(event_rx, chunk_rx));

    let handle = RoundHandle::new(event_tx);
    handle.submit_training(training_spec(3, 2, 10)).await.unwrap();
    settle().await;
    run_task.abort();

    // Second life: recovery fails the stale round and starts a fresh one.
    let h = harness(dir, cfg).await;
    settle().await;

    let lines = h.handle.status().await.unwrap();
    assert!(lines.iter().any(|l| l.status == "failed"));
    assert!(lines.iter().any(|l| l.status == "active"));

    let jobs = replay_training_jobs(h.dir.path()).await;
    assert_eq!(jobs[0].status, TrainingJobStatus::Active);
    assert_eq!(jobs[0].current_step, 0);
}
