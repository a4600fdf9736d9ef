use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier of a dispatchable job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Creates a new time-ordered job id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of one synchronized training round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundId(pub Uuid);

impl RoundId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RoundId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a multi-round training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TrainingJobId(pub Uuid);

impl TrainingJobId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for TrainingJobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TrainingJobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Half-open range of dataset rows assigned to one chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkRange {
    pub start: u64,
    pub end: u64,
}

impl ChunkRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    /// Number of rows covered by this chunk.
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }
}

impl fmt::Display for ChunkRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// The two kinds of work the pool runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Inference,
    TrainingChunk { round_id: RoundId, chunk: ChunkRange },
}

impl JobKind {
    pub fn is_inference(&self) -> bool {
        matches!(self, Self::Inference)
    }
}

/// Everything a worker needs to start (or resume) a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSpec {
    pub job_id: JobId,
    pub kind: JobKind,
    pub payload_ref: String,
    /// The latest merged checkpoint; a worker that missed the broadcast
    /// pulls it from here before starting the chunk.
    pub checkpoint_ref: Option<String>,
    /// For resumed training chunks: the progress marker to restart from.
    pub resume_from_step: Option<u64>,
}

/// Why a job failed, split by whether a retry can help.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    WorkerUnavailable,
    DispatchTimeout,
    MalformedPayload,
    Execution(String),
}

impl FailReason {
    /// Whether a requeue can plausibly succeed.
    ///
    /// Execution failures come from the worker runtime itself and are treated
    /// as terminal: the same payload on another worker would fail the same way.
    pub fn retryable(&self) -> bool {
        matches!(self, Self::WorkerUnavailable | Self::DispatchTimeout)
    }
}

impl fmt::Display for FailReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::WorkerUnavailable => write!(f, "worker unavailable"),
            Self::DispatchTimeout => write!(f, "dispatch timeout"),
            Self::MalformedPayload => write!(f, "malformed payload"),
            Self::Execution(msg) => write!(f, "execution failed: {msg}"),
        }
    }
}

/// Worker-side completion callback.
///
/// For training chunks the model delta arrives in a separate data frame keyed
/// by the same job id, so the orders of the two frames do not matter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionReport {
    pub job_id: JobId,
    pub usage_snapshot_seconds: u64,
    pub sample_count: u64,
    pub result_ref: Option<String>,
}

/// An inference request as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceSpec {
    pub payload_ref: String,
    pub deadline_seconds: Option<u64>,
}

/// Location and size of a training dataset.
///
/// `len` is the row count; chunk ranges are expressed over it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetRef {
    pub uri: String,
    pub len: u64,
}

/// A federated training job as submitted by a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingSpec {
    pub dataset: DatasetRef,
    pub total_steps: u64,
    pub worker_count_hint: usize,
}
