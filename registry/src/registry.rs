use std::{collections::HashMap, path::Path, sync::Arc};

use chrono::{DateTime, Utc};
use comms::specs::{
    job::JobId,
    worker::{WorkerDescriptor, WorkerId},
};
use ledger::{AccountKey, Ledger, ProviderLimitsMap, QuotaErr};
use log::{debug, info, warn};
use parking_lot::{Mutex, RwLock};
use store::Journal;

use crate::{HealthConfig, RegistryErr, Result, Worker, WorkerStatus};

/// Outcome of one health-monitor pass.
#[derive(Debug, Default)]
pub struct SweepReport {
    /// Workers newly marked offline, with the job each one was holding.
    pub offlined: Vec<(WorkerId, Option<JobId>)>,
    /// Workers evicted after the offline retention window.
    pub evicted: Vec<WorkerId>,
}

/// The worker registry: source of truth for which workers exist and whether
/// they are reachable.
///
/// Mutations for one worker are serialized through a per-worker write gate;
/// the committed map is readable synchronously and may be slightly stale.
pub struct Registry {
    workers: RwLock<HashMap<WorkerId, Worker>>,
    gates: Mutex<HashMap<WorkerId, Arc<tokio::sync::Mutex<()>>>>,
    journal: Journal<Worker>,
    ledger: Arc<Ledger>,
    limits: ProviderLimitsMap,
    cfg: HealthConfig,
}

impl Registry {
    /// Opens the registry, replaying any persisted workers.
    pub async fn open(
        state_dir: &Path,
        ledger: Arc<Ledger>,
        limits: ProviderLimitsMap,
        cfg: HealthConfig,
    ) -> Result<Self> {
        let journal = Journal::open(state_dir.join("workers.jsonl")).await?;
        let replayed = journal.replay().await?;

        let workers: HashMap<_, _> = replayed
            .into_values()
            .map(|worker: Worker| (worker.id, worker))
            .collect();

        if !workers.is_empty() {
            info!(count = workers.len(); "replayed workers");
        }

        Ok(Self {
            workers: RwLock::new(workers),
            gates: Mutex::new(HashMap::new()),
            journal,
            ledger,
            limits,
            cfg,
        })
    }

    /// Creates or revives a worker record and returns its id.
    ///
    /// A returning session (same provider, account and callback address)
    /// keeps its id; its liveness and usage baseline reset. The quota account
    /// is opened if absent, and a session begins on it if none is active.
    pub async fn register(
        &self,
        descriptor: WorkerDescriptor,
        now: DateTime<Utc>,
    ) -> Result<WorkerId> {
        let key = AccountKey::new(descriptor.provider.clone(), descriptor.account_id.clone());
        let limits = self.limits.for_provider(&descriptor.provider);
        self.ledger.open_account(key.clone(), limits, now).await?;

        let existing = self.workers.read().values().find_map(|worker| {
            (worker.provider == descriptor.provider
                && worker.account_id == descriptor.account_id
                && worker.callback_addr == descriptor.callback_addr)
                .then_some(worker.id)
        });

        let worker_id = match existing {
            Some(id) => {
                let gate = self.gate(id);
                let _guard = gate.lock().await;

                let mut worker = self.committed(id)?;
                worker.status = WorkerStatus::Online;
                worker.last_heartbeat_at = now;
                worker.last_usage_snapshot_seconds = 0;
                worker.current_job_id = None;
                worker.gpu_class = descriptor.gpu_class;
                worker.capabilities = descriptor.capabilities;

                self.journal.append(&worker).await?;
                self.workers.write().insert(id, worker);

                info!(worker_id = id.to_string(); "revived worker");
                id
            }
            None => {
                let id = WorkerId::new();
                let gate = self.gate(id);
                let _guard = gate.lock().await;

                let worker = Worker::new(id, descriptor, now);
                self.journal.append(&worker).await?;
                self.workers.write().insert(id, worker);

                info!(worker_id = id.to_string(), account = key.to_string(); "registered worker");
                id
            }
        };

        let session_active = self
            .ledger
            .get(&key)
            .is_some_and(|account| account.session_started_at.is_some());

        if !session_active {
            self.ledger.begin_session(&key, now).await?;
        }

        Ok(worker_id)
    }

    /// Processes a liveness push: refreshes the heartbeat timestamp and
    /// forwards the usage delta since the previous snapshot to the ledger.
    pub async fn heartbeat(
        &self,
        worker_id: WorkerId,
        usage_snapshot_seconds: u64,
        claimed_job: Option<JobId>,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (delta, key) = {
            let gate = self.gate(worker_id);
            let _guard = gate.lock().await;

            let mut worker = self.committed(worker_id)?;
            worker.last_heartbeat_at = now;

            if worker.status == WorkerStatus::Offline {
                worker.status = WorkerStatus::Online;
                info!(worker_id = worker_id.to_string(); "offline worker resumed heartbeating");
            }

            if claimed_job != worker.current_job_id {
                warn!(
                    worker_id = worker_id.to_string();
                    "heartbeat job claim {claimed_job:?} disagrees with assignment {:?}",
                    worker.current_job_id
                );
            }

            let delta = usage_snapshot_seconds.saturating_sub(worker.last_usage_snapshot_seconds);
            worker.last_usage_snapshot_seconds = usage_snapshot_seconds;

            let key = worker.account_key();
            self.journal.append(&worker).await?;
            self.workers.write().insert(worker_id, worker);
            (delta, key)
        };

        self.forward_usage(&key, delta, now).await
    }

    /// Forwards a completion-time usage snapshot through the same delta path
    /// as heartbeats, so nothing is double counted.
    pub async fn report_usage(
        &self,
        worker_id: WorkerId,
        usage_snapshot_seconds: u64,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let (delta, key) = {
            let gate = self.gate(worker_id);
            let _guard = gate.lock().await;

            let mut worker = self.committed(worker_id)?;
            worker.last_heartbeat_at = now;
            let delta = usage_snapshot_seconds.saturating_sub(worker.last_usage_snapshot_seconds);
            worker.last_usage_snapshot_seconds = usage_snapshot_seconds;

            let key = worker.account_key();
            self.journal.append(&worker).await?;
            self.workers.write().insert(worker_id, worker);
            (delta, key)
        };

        self.forward_usage(&key, delta, now).await
    }

    /// Health-monitor pass.
    ///
    /// Workers silent beyond the missed-heartbeat threshold go `Offline` and
    /// give back their held job for the scheduler to fail as retryable;
    /// workers offline beyond the retention window are evicted.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<SweepReport> {
        let offline_after = chrono::Duration::from_std(self.cfg.offline_after())
            .unwrap_or(chrono::Duration::MAX);
        let retention = chrono::Duration::from_std(self.cfg.offline_retention)
            .unwrap_or(chrono::Duration::MAX);

        let ids: Vec<WorkerId> = self.workers.read().keys().copied().collect();
        let mut report = SweepReport::default();

        for id in ids {
            let gate = self.gate(id);
            let _guard = gate.lock().await;

            let Some(mut worker) = self.workers.read().get(&id).cloned() else {
                continue;
            };
            let silent_for = now - worker.last_heartbeat_at;

            if worker.status != WorkerStatus::Offline && silent_for > offline_after {
                let held = worker.current_job_id.take();
                worker.status = WorkerStatus::Offline;

                self.journal.append(&worker).await?;
                self.workers.write().insert(id, worker);

                warn!(worker_id = id.to_string(); "worker went silent, marked offline");
                report.offlined.push((id, held));
            } else if worker.status == WorkerStatus::Offline
                && silent_for > offline_after + retention
            {
                self.workers.write().remove(&id);
                debug!(worker_id = id.to_string(); "evicted offline worker");
                report.evicted.push(id);
            }
        }

        if !report.evicted.is_empty() {
            let live: Vec<Worker> = self.workers.read().values().cloned().collect();
            self.journal.compact(live.iter()).await?;
        }

        Ok(report)
    }

    /// Dispatchable workers, least-loaded first.
    ///
    /// Ordered by remaining session capacity descending; workers whose
    /// account is at the quota safety margin are excluded unless asked for.
    pub fn list_available(&self, provider: Option<&str>, exclude_near_quota: bool) -> Vec<Worker> {
        let mut available: Vec<Worker> = self
            .workers
            .read()
            .values()
            .filter(|worker| worker.is_dispatchable())
            .filter(|worker| provider.is_none_or(|p| worker.provider == p))
            .filter(|worker| !exclude_near_quota || self.ledger.admits(&worker.account_key()))
            .cloned()
            .collect();

        available.sort_by_key(|worker| {
            std::cmp::Reverse(
                self.ledger
                    .remaining_session_seconds(&worker.account_key())
                    .unwrap_or(0),
            )
        });

        available
    }

    /// Assigns a job to a worker, enforcing exclusivity and the quota gate.
    pub async fn assign(&self, worker_id: WorkerId, job_id: JobId) -> Result<()> {
        let gate = self.gate(worker_id);
        let _guard = gate.lock().await;

        let mut worker = self.committed(worker_id)?;

        if let Some(held) = worker.current_job_id {
            return Err(RegistryErr::WorkerBusy { worker_id, held });
        }
        if worker.status != WorkerStatus::Online {
            return Err(RegistryErr::NotDispatchable {
                worker_id,
                status: worker.status.as_str(),
            });
        }

        let key = worker.account_key();
        if !self.ledger.admits(&key) {
            return Err(RegistryErr::QuotaBlocked(key));
        }

        worker.status = WorkerStatus::Busy;
        worker.current_job_id = Some(job_id);

        self.journal.append(&worker).await?;
        self.workers.write().insert(worker_id, worker);
        Ok(())
    }

    /// Returns a worker to the pool after its job reached a terminal or
    /// paused state. Draining and offline workers keep their status.
    pub async fn release(&self, worker_id: WorkerId) -> Result<()> {
        let gate = self.gate(worker_id);
        let _guard = gate.lock().await;

        let mut worker = self.committed(worker_id)?;
        worker.current_job_id = None;
        worker.status = match worker.status {
            WorkerStatus::Draining => WorkerStatus::Draining,
            WorkerStatus::Offline => WorkerStatus::Offline,
            _ => WorkerStatus::Online,
        };

        self.journal.append(&worker).await?;
        self.workers.write().insert(worker_id, worker);
        Ok(())
    }

    /// Flips every non-offline worker of an account to `Draining`.
    ///
    /// # Returns
    /// The affected worker ids.
    pub async fn drain_account(&self, key: &AccountKey) -> Result<Vec<WorkerId>> {
        let ids: Vec<WorkerId> = self
            .workers
            .read()
            .values()
            .filter(|worker| worker.account_key() == *key)
            .filter(|worker| worker.status != WorkerStatus::Offline)
            .map(|worker| worker.id)
            .collect();

        for &id in &ids {
            let gate = self.gate(id);
            let _guard = gate.lock().await;

            let Some(mut worker) = self.workers.read().get(&id).cloned() else {
                continue;
            };
            worker.status = WorkerStatus::Draining;

            self.journal.append(&worker).await?;
            self.workers.write().insert(id, worker);
        }

        if !ids.is_empty() {
            info!(account = key.to_string(), count = ids.len(); "draining account workers");
        }

        Ok(ids)
    }

    /// A point-in-time copy of one worker.
    pub fn get(&self, worker_id: WorkerId) -> Option<Worker> {
        self.workers.read().get(&worker_id).cloned()
    }

    /// Whether the worker's account is still under its quota safety margin.
    pub fn account_admits(&self, worker_id: WorkerId) -> bool {
        let key = self
            .workers
            .read()
            .get(&worker_id)
            .map(Worker::account_key);

        key.is_some_and(|key| self.ledger.admits(&key))
    }

    /// A point-in-time copy of every worker, for status and scaling.
    pub fn snapshot(&self) -> Vec<Worker> {
        self.workers.read().values().cloned().collect()
    }

    async fn forward_usage(&self, key: &AccountKey, delta: u64, now: DateTime<Utc>) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }

        match self.ledger.record_usage(key, delta, now).await {
            Ok(()) => Ok(()),
            // The ledger already signalled the drain; the heartbeat itself
            // succeeded.
            Err(QuotaErr::Exceeded { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn committed(&self, worker_id: WorkerId) -> Result<Worker> {
        self.workers
            .read()
            .get(&worker_id)
            .cloned()
            .ok_or(RegistryErr::UnknownWorker(worker_id))
    }

    fn gate(&self, worker_id: WorkerId) -> Arc<tokio::sync::Mutex<()>> {
        Arc::clone(
            self.gates
                .lock()
                .entry(worker_id)
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
        )
    }
}
