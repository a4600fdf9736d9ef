use chrono::{DateTime, Utc};
use comms::specs::job::{JobId, JobKind};
use comms::specs::worker::WorkerId;
use serde::{Deserialize, Serialize};
use store::Record;

/// Lifecycle of a dispatchable job.
///
/// `Paused` is a cooperative, resumable state reserved for training chunks
/// preempted by inference; `Completed`, `Failed` and `TimedOut` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Dispatched,
    Running,
    Paused,
    Completed,
    Failed,
    TimedOut,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::TimedOut)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TimedOut => "timed_out",
        }
    }
}

/// One unit of dispatchable work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub kind: JobKind,
    pub payload_ref: String,
    /// Latest merged checkpoint to hand the worker at dispatch time.
    pub checkpoint_ref: Option<String>,
    pub assigned_worker: Option<WorkerId>,
    pub status: JobStatus,
    /// Lower is more urgent; inference outranks training unconditionally.
    pub priority: u8,
    pub deadline: Option<DateTime<Utc>>,
    pub retry_count: u32,
    /// Last reported progress marker; resumed chunks restart from here.
    pub progress_step: u64,
    pub pause_requested: bool,
    /// Where the worker left the result, for completed inference.
    pub result_ref: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub last_dispatched_at: Option<DateTime<Utc>>,
}

impl Job {
    pub fn new(
        kind: JobKind,
        payload_ref: String,
        checkpoint_ref: Option<String>,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        let priority = if kind.is_inference() { 0 } else { 1 };

        Self {
            id: JobId::new(),
            kind,
            payload_ref,
            checkpoint_ref,
            assigned_worker: None,
            status: JobStatus::Queued,
            priority,
            deadline,
            retry_count: 0,
            progress_step: 0,
            pause_requested: false,
            result_ref: None,
            submitted_at: now,
            last_dispatched_at: None,
        }
    }
}

impl Record for Job {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// What a worker reports when a job finishes.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub usage_snapshot_seconds: u64,
    pub sample_count: u64,
    pub result_ref: Option<String>,
    /// Model delta for training chunks; `None` for inference.
    pub delta: Option<Vec<f32>>,
}
