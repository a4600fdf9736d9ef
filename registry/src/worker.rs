use std::{fmt, time::Duration};

use chrono::{DateTime, Utc};
use comms::specs::{
    job::JobId,
    worker::{GpuClass, WorkerDescriptor, WorkerId},
};
use ledger::AccountKey;
use serde::{Deserialize, Serialize};
use store::Record;

/// Liveness and dispatch state of one remote session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Online,
    Busy,
    /// Finishing its current job; accepts no new work.
    Draining,
    Offline,
}

impl WorkerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Draining => "draining",
            Self::Offline => "offline",
        }
    }
}

impl fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One registered worker session.
///
/// Owned exclusively by the registry; everyone else sees clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub provider: String,
    pub account_id: String,
    pub gpu_class: GpuClass,
    pub capabilities: Vec<String>,
    pub callback_addr: String,
    pub status: WorkerStatus,
    pub last_heartbeat_at: DateTime<Utc>,
    /// The worker's last self-reported session usage; deltas between
    /// snapshots are what flows into the ledger.
    pub last_usage_snapshot_seconds: u64,
    pub current_job_id: Option<JobId>,
    pub registered_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(id: WorkerId, descriptor: WorkerDescriptor, now: DateTime<Utc>) -> Self {
        Self {
            id,
            provider: descriptor.provider,
            account_id: descriptor.account_id,
            gpu_class: descriptor.gpu_class,
            capabilities: descriptor.capabilities,
            callback_addr: descriptor.callback_addr,
            status: WorkerStatus::Online,
            last_heartbeat_at: now,
            last_usage_snapshot_seconds: 0,
            current_job_id: None,
            registered_at: now,
        }
    }

    pub fn account_key(&self) -> AccountKey {
        AccountKey::new(self.provider.clone(), self.account_id.clone())
    }

    /// Whether this worker can take a new job right now.
    pub fn is_dispatchable(&self) -> bool {
        self.status == WorkerStatus::Online && self.current_job_id.is_none()
    }
}

impl Record for Worker {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Health monitor thresholds, from configuration.
#[derive(Debug, Clone, Copy)]
pub struct HealthConfig {
    /// Expected heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a worker is `Offline`.
    pub missed_heartbeats: u32,
    /// How long an `Offline` worker is kept before eviction.
    pub offline_retention: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(60),
            missed_heartbeats: 3,
            offline_retention: Duration::from_secs(3600),
        }
    }
}

impl HealthConfig {
    /// Silence beyond this marks a worker `Offline`.
    pub fn offline_after(&self) -> Duration {
        self.heartbeat_interval * self.missed_heartbeats
    }
}
