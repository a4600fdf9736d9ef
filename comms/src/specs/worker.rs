use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::specs::job::JobId;

/// Unique identifier of a registered worker session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkerId(pub Uuid);

impl WorkerId {
    /// Creates a new time-ordered worker id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for WorkerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The accelerator class a remote session was provisioned with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuClass {
    T4,
    P100,
    V100,
    A100,
    Tpu,
    Cpu,
    Other(String),
}

/// Everything a remote session reports about itself at registration time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerDescriptor {
    pub provider: String,
    pub account_id: String,
    pub gpu_class: GpuClass,
    pub capabilities: Vec<String>,
    pub callback_addr: String,
}

/// Periodic liveness push from a worker.
///
/// `usage_snapshot_seconds` is the worker's own monotonic count of seconds
/// consumed in the current session, so the coordinator derives deltas rather
/// than trusting increments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatReport {
    pub worker_id: WorkerId,
    pub usage_snapshot_seconds: u64,
    pub current_job_id: Option<JobId>,
}
