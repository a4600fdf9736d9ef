use std::{sync::Arc, time::Duration};

use comms::{
    WireReceiver, WireSender,
    msg::{Command, Msg, Payload},
    specs::{
        job::{CompletionReport, InferenceSpec, JobId, TrainingSpec, DatasetRef},
        status::StatusReport,
        worker::{GpuClass, HeartbeatReport, WorkerDescriptor, WorkerId},
    },
};
use ledger::ProviderLimits;
use node::{Coordinator, CoordinatorConfig, server};
use tokio::{
    io::{self, DuplexStream, ReadHalf, WriteHalf},
    time::timeout,
};

const WAIT: Duration = Duration::from_secs(5);

struct Peer {
    rx: WireReceiver<ReadHalf<DuplexStream>>,
    tx: WireSender<WriteHalf<DuplexStream>>,
}

impl Peer {
    fn connect(app: &Arc<Coordinator>) -> Self {
        let (ours, theirs) = io::duplex(64 * 1024);

        let (srv_rx, srv_tx) = io::split(theirs);
        let app = Arc::clone(app);
        tokio::spawn(async move {
            let _ = server::serve(app, srv_rx, srv_tx).await;
        });

        let (rx, tx) = io::split(ours);
        let (rx, tx) = comms::channel(rx, tx);
        Self { rx, tx }
    }

    async fn send(&mut self, command: Command) {
        self.tx.send(&Msg::Control(command)).await.unwrap();
    }

    async fn send_delta(&mut self, job_id: JobId, delta: &[f32]) {
        let msg = Msg::Data(Payload::ChunkDelta { job_id, delta });
        self.tx.send(&msg).await.unwrap();
    }

    /// Receives the next control command, skipping anything else.
    async fn recv(&mut self) -> Command {
        loop {
            let msg: Msg = timeout(WAIT, self.rx.recv()).await.unwrap().unwrap();
            if let Msg::Control(command) = msg {
                return command;
            }
        }
    }
}

fn descriptor(account: &str) -> WorkerDescriptor {
    WorkerDescriptor {
        provider: "colab".into(),
        account_id: account.into(),
        gpu_class: GpuClass::T4,
        capabilities: vec!["train".into(), "infer".into()],
        callback_addr: format!("{account}.local:9000"),
    }
}

async fn start(limits: ProviderLimits) -> (Arc<Coordinator>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = CoordinatorConfig::single_provider(dir.path().to_path_buf(), limits);
    let (app, _schedule_rx) = Coordinator::start(&config).await.unwrap();
    (app, dir)
}

async fn register(app: &Arc<Coordinator>, account: &str) -> (Peer, WorkerId) {
    let mut peer = Peer::connect(app);
    peer.send(Command::Register(descriptor(account))).await;

    let Command::RegisterAck { worker_id } = peer.recv().await else {
        panic!("expected RegisterAck");
    };
    (peer, worker_id)
}

async fn status(client: &mut Peer) -> StatusReport {
    client.send(Command::Status).await;
    loop {
        if let Command::StatusReport(report) = client.recv().await {
            return report;
        }
    }
}

fn roomy_limits() -> ProviderLimits {
    ProviderLimits {
        session_limit_seconds: 100000,
        weekly_limit_seconds: 1000000,
        safety_margin_ratio: 0.1,
    }
}

#[tokio::test]
async fn inference_flows_from_submission_to_job_done() {
    let (app, _dir) = start(roomy_limits()).await;

    let (mut worker, worker_id) = register(&app, "a").await;

    let mut client = Peer::connect(&app);
    client
        .send(Command::SubmitInference(InferenceSpec {
            payload_ref: "prompt://hello".into(),
            deadline_seconds: Some(60),
        }))
        .await;

    let Command::JobAccepted { job_id } = client.recv().await else {
        panic!("expected JobAccepted");
    };

    // The pump hands the job to the only worker.
    let dispatched = worker.recv().await;
    let Command::Dispatch(spec) = dispatched else {
        panic!("expected Dispatch, got {dispatched:?}");
    };
    assert_eq!(spec.job_id, job_id);

    worker
        .send(Command::Completed(CompletionReport {
            job_id,
            usage_snapshot_seconds: 12,
            sample_count: 1,
            result_ref: Some("result://hello".into()),
        }))
        .await;

    let Command::JobDone { job_id: done_id, status: job_status, result_ref } = client.recv().await else {
        panic!("expected JobDone");
    };
    assert_eq!(done_id, job_id);
    assert_eq!(job_status, "completed");
    assert_eq!(result_ref.as_deref(), Some("result://hello"));

    // Usage reached the ledger through the completion snapshot.
    let report = status(&mut client).await;
    let account = &report.accounts[0];
    assert_eq!(account.session_used_seconds, 12);
    let worker_line = report.workers.iter().find(|w| w.id == worker_id).unwrap();
    assert_eq!(worker_line.status, "online");
}

#[tokio::test]
async fn over_margin_heartbeat_drains_the_account() {
    let (app, _dir) = start(ProviderLimits {
        session_limit_seconds: 100,
        weekly_limit_seconds: 1000,
        safety_margin_ratio: 0.3,
    })
    .await;

    let (mut worker, worker_id) = register(&app, "a").await;

    // 71s of usage crosses the 70s effective cap: fails closed and drains.
    worker
        .send(Command::Heartbeat(HeartbeatReport {
            worker_id,
            usage_snapshot_seconds: 71,
            current_job_id: None,
        }))
        .await;

    let mut client = Peer::connect(&app);
    for _ in 0..50 {
        let report = status(&mut client).await;
        let line = report.workers.iter().find(|w| w.id == worker_id).unwrap();
        if line.status == "draining" {
            assert_eq!(report.accounts[0].session_used_seconds, 70);
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("worker never started draining");
}

#[tokio::test]
async fn a_training_round_runs_end_to_end() {
    let (app, _dir) = start(roomy_limits()).await;

    let (mut worker_a, _) = register(&app, "a").await;
    let (mut worker_b, _) = register(&app, "b").await;

    let mut client = Peer::connect(&app);
    client
        .send(Command::SubmitTraining(TrainingSpec {
            dataset: DatasetRef {
                uri: "dataset://toy".into(),
                len: 10,
            },
            total_steps: 1,
            worker_count_hint: 2,
        }))
        .await;

    let Command::TrainingAccepted { .. } = client.recv().await else {
        panic!("expected TrainingAccepted");
    };

    // Both workers get one chunk each and report a delta.
    for worker in [&mut worker_a, &mut worker_b] {
        let Command::Dispatch(spec) = worker.recv().await else {
            panic!("expected Dispatch");
        };

        worker.send_delta(spec.job_id, &[1.0, 2.0, 3.0]).await;
        worker
            .send(Command::Completed(CompletionReport {
                job_id: spec.job_id,
                usage_snapshot_seconds: 5,
                sample_count: 5,
                result_ref: None,
            }))
            .await;
    }

    // The round aggregates, broadcasts, and the one-step job completes.
    for _ in 0..50 {
        let report = status(&mut client).await;
        if report.rounds.iter().any(|r| r.status == "completed") {
            let done = report.rounds.iter().find(|r| r.status == "completed").unwrap();
            assert_eq!(done.total_steps, 1);

            // Both workers hear about the merged checkpoint.
            let Command::CheckpointReady { checkpoint_ref, .. } = worker_a.recv().await else {
                panic!("expected CheckpointReady");
            };
            assert!(checkpoint_ref.contains("step-0"));
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("round never completed");
}
