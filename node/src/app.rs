use std::{collections::HashMap, io, sync::Arc};

use chrono::Utc;
use comms::{
    msg::Command,
    specs::{
        job::{JobId, JobKind},
        status::{AccountStatusLine, JobStatusLine, StatusReport, WorkerStatusLine},
    },
};
use ledger::Ledger;
use log::{error, warn};
use parking_lot::Mutex;
use registry::Registry;
use rounds::{RoundCoordinator, RoundHandle};
use scaling::{ActivationSchedule, PolicyEngine};
use scheduler::{Scheduler, WorkerLink};
use tokio::{sync::mpsc, task::JoinHandle, time};

use crate::{config::CoordinatorConfig, link::ChannelLink};

/// The assembled coordinator: every component wired up plus its background
/// loops (assignment pump, health sweep, drain handling).
pub struct Coordinator {
    pub ledger: Arc<Ledger>,
    pub registry: Arc<Registry>,
    pub scheduler: Arc<Scheduler>,
    pub rounds: RoundHandle,
    pub link: Arc<ChannelLink>,
    pub policy: Arc<PolicyEngine>,
    watchers: Mutex<HashMap<JobId, mpsc::Sender<Command>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Builds every component, replays persisted state, runs crash-only
    /// recovery and spawns the background loops.
    ///
    /// # Returns
    /// The running coordinator and the activation-schedule channel consumed
    /// by the external provisioning collaborator.
    pub async fn start(
        config: &CoordinatorConfig,
    ) -> io::Result<(Arc<Self>, mpsc::Receiver<ActivationSchedule>)> {
        let (drain_tx, mut drain_rx) = mpsc::channel(32);
        let (chunk_tx, chunk_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (schedule_tx, schedule_rx) = mpsc::channel(8);

        let ledger = Arc::new(
            Ledger::open(&config.state_dir, drain_tx)
                .await
                .map_err(io::Error::other)?,
        );
        let registry = Arc::new(
            Registry::open(
                &config.state_dir,
                Arc::clone(&ledger),
                config.limits.clone(),
                config.health_config(),
            )
            .await
            .map_err(io::Error::other)?,
        );
        let link = Arc::new(ChannelLink::new());
        let scheduler = Arc::new(
            Scheduler::open(
                &config.state_dir,
                Arc::clone(&registry),
                Arc::clone(&link) as Arc<dyn WorkerLink>,
                chunk_tx,
                config.scheduler_config(),
            )
            .await
            .map_err(io::Error::other)?,
        );
        let mut round_coordinator = RoundCoordinator::open(
            &config.state_dir,
            Arc::clone(&scheduler),
            Arc::clone(&registry),
            Arc::clone(&link) as Arc<dyn WorkerLink>,
            event_tx.clone(),
            config.round_config(),
        )
        .await
        .map_err(io::Error::other)?;

        scheduler
            .recover(Utc::now())
            .await
            .map_err(io::Error::other)?;
        round_coordinator.recover().await.map_err(io::Error::other)?;

        let policy = Arc::new(PolicyEngine::new(config.scaling_config(), schedule_tx));

        let app = Arc::new(Self {
            ledger,
            registry,
            scheduler,
            rounds: RoundHandle::new(event_tx),
            link,
            policy,
            watchers: Mutex::new(HashMap::new()),
            tasks: Mutex::new(Vec::new()),
        });

        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(async move {
            if let Err(e) = round_coordinator.run(event_rx, chunk_rx).await {
                error!("round coordinator stopped: {e}");
            }
        }));

        // Assignment pump: runs on every kick and on a slow safety interval.
        let pump = Arc::clone(&app);
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(time::Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = pump.scheduler.kicked() => {}
                    _ = interval.tick() => {}
                }

                if let Err(e) = pump.scheduler.assign_pending(Utc::now()).await {
                    error!("assignment pass failed: {e}");
                }
            }
        }));

        // Health monitor: offline sweeps, weekly quota rollover, failed-job
        // returns.
        let sweeper = Arc::clone(&app);
        let sweep_every = config.health_config().heartbeat_interval / 2;
        tasks.push(tokio::spawn(async move {
            let mut interval = time::interval(sweep_every.max(time::Duration::from_secs(1)));
            loop {
                interval.tick().await;
                let now = Utc::now();

                match sweeper.registry.sweep(now).await {
                    Ok(report) => {
                        for (worker_id, held) in report.offlined {
                            sweeper.link.detach(worker_id);
                            if let Some(job_id) = held
                                && let Err(e) = sweeper.scheduler.worker_offline(job_id, now).await
                            {
                                error!("failing job of offline worker failed: {e}");
                            }
                        }
                        for worker_id in report.evicted {
                            sweeper.link.detach(worker_id);
                        }
                    }
                    Err(e) => error!("registry sweep failed: {e}"),
                }

                if let Err(e) = sweeper.ledger.sweep_weekly(now).await {
                    error!("weekly quota sweep failed: {e}");
                }
            }
        }));

        // Auto-shutdown drains: finish the current job, take no new ones.
        let drainer = Arc::clone(&app);
        tasks.push(tokio::spawn(async move {
            while let Some(signal) = drain_rx.recv().await {
                if let Err(e) = drainer.registry.drain_account(&signal.account).await {
                    error!("draining account {} failed: {e}", signal.account);
                }
            }
        }));

        *app.tasks.lock() = tasks;
        Ok((app, schedule_rx))
    }

    /// Subscribes a client channel to a job's terminal notification.
    pub fn watch_job(&self, job_id: JobId, tx: mpsc::Sender<Command>) {
        self.watchers.lock().insert(job_id, tx);
    }

    /// Pushes `JobDone` to the watcher of a job that just reached a terminal
    /// state, if any.
    pub async fn notify_job_done(&self, job_id: JobId) {
        let Some(job) = self.scheduler.get(job_id) else {
            return;
        };
        if !job.status.is_terminal() {
            return;
        }

        let Some(tx) = self.watchers.lock().remove(&job_id) else {
            return;
        };

        let done = Command::JobDone {
            job_id,
            status: job.status.as_str().to_string(),
            result_ref: job.result_ref.clone(),
        };

        if tx.send(done).await.is_err() {
            warn!(job_id = job_id.to_string(); "job watcher hung up before completion");
        }
    }

    /// The read-only snapshot answered to `Status` queries.
    pub async fn status(&self) -> StatusReport {
        let workers = self
            .registry
            .snapshot()
            .into_iter()
            .map(|worker| {
                let remaining = self
                    .ledger
                    .remaining_session_seconds(&worker.account_key())
                    .unwrap_or(0);

                WorkerStatusLine {
                    id: worker.id,
                    provider: worker.provider,
                    account_id: worker.account_id,
                    status: worker.status.as_str().to_string(),
                    current_job_id: worker.current_job_id,
                    remaining_session_seconds: remaining,
                }
            })
            .collect();

        let accounts = self
            .ledger
            .snapshot()
            .into_iter()
            .map(|account| AccountStatusLine {
                provider: account.key.provider.clone(),
                account_id: account.key.account_id.clone(),
                session_used_seconds: account.session_used_seconds,
                session_cap_seconds: account.limits.session_cap_seconds(),
                weekly_used_seconds: account.weekly_used_seconds,
                weekly_cap_seconds: account.limits.weekly_cap_seconds(),
            })
            .collect();

        let jobs = self
            .scheduler
            .snapshot()
            .into_iter()
            .map(|job| JobStatusLine {
                id: job.id,
                kind: match job.kind {
                    JobKind::Inference => "inference".to_string(),
                    JobKind::TrainingChunk { .. } => "training_chunk".to_string(),
                },
                status: job.status.as_str().to_string(),
                assigned_worker: job.assigned_worker,
                retry_count: job.retry_count,
            })
            .collect();

        let rounds = self.rounds.status().await.unwrap_or_default();

        StatusReport {
            workers,
            accounts,
            jobs,
            rounds,
        }
    }

    /// Stops the background loops. State is already durable; recovery on the
    /// next start picks everything up (crash-only, no clean-shutdown path).
    pub fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}
