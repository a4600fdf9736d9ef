//! Read-only status snapshot returned to the external dashboard.

use serde::{Deserialize, Serialize};

use crate::specs::{
    job::{JobId, RoundId, TrainingJobId},
    worker::WorkerId,
};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerStatusLine {
    pub id: WorkerId,
    pub provider: String,
    pub account_id: String,
    pub status: String,
    pub current_job_id: Option<JobId>,
    pub remaining_session_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountStatusLine {
    pub provider: String,
    pub account_id: String,
    pub session_used_seconds: u64,
    pub session_cap_seconds: u64,
    pub weekly_used_seconds: u64,
    pub weekly_cap_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStatusLine {
    pub id: JobId,
    pub kind: String,
    pub status: String,
    pub assigned_worker: Option<WorkerId>,
    pub retry_count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundStatusLine {
    pub id: RoundId,
    pub training_job_id: TrainingJobId,
    pub status: String,
    pub current_step: u64,
    pub total_steps: u64,
    pub contributed: usize,
    pub expected: usize,
}

/// The full snapshot answered to a `Status` query.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StatusReport {
    pub workers: Vec<WorkerStatusLine>,
    pub accounts: Vec<AccountStatusLine>,
    pub jobs: Vec<JobStatusLine>,
    pub rounds: Vec<RoundStatusLine>,
}
