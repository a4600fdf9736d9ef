use std::collections::HashMap;

use chrono::{DateTime, Utc};
use comms::specs::{
    job::{ChunkRange, DatasetRef, RoundId, TrainingJobId},
    worker::WorkerId,
};
use serde::{Deserialize, Serialize};
use store::Record;

/// Lifecycle of one synchronized round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundStatus {
    Active,
    Aggregating,
    Completed,
    Failed,
}

impl RoundStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Aggregating => "aggregating",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// One synchronized step of a training job across the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingRound {
    pub id: RoundId,
    pub training_job_id: TrainingJobId,
    pub total_steps: u64,
    /// The step this round computes; completed rounds advance the job past it.
    pub current_step: u64,
    pub chunk_assignments: HashMap<WorkerId, ChunkRange>,
    pub started_at: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub status: RoundStatus,
}

impl Record for TrainingRound {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Immutable record of one successful aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregationResult {
    pub round_id: RoundId,
    pub contributing_worker_ids: Vec<WorkerId>,
    pub merged_checkpoint_ref: String,
    pub timestamp: DateTime<Utc>,
}

impl Record for AggregationResult {
    fn key(&self) -> String {
        self.round_id.to_string()
    }
}

/// Lifecycle of a whole multi-round training job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingJobStatus {
    Active,
    Completed,
    Failed,
}

/// A federated training job as the coordinator tracks it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    pub id: TrainingJobId,
    pub dataset: DatasetRef,
    pub total_steps: u64,
    pub current_step: u64,
    pub worker_count_hint: usize,
    pub status: TrainingJobStatus,
    /// Latest merged checkpoint, if any round has completed.
    pub checkpoint_ref: Option<String>,
    pub consecutive_failures: u32,
    pub submitted_at: DateTime<Utc>,
}

impl TrainingJob {
    pub fn new(
        dataset: DatasetRef,
        total_steps: u64,
        worker_count_hint: usize,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: TrainingJobId::new(),
            dataset,
            total_steps,
            current_step: 0,
            worker_count_hint: worker_count_hint.max(1),
            status: TrainingJobStatus::Active,
            checkpoint_ref: None,
            consecutive_failures: 0,
            submitted_at: now,
        }
    }
}

impl Record for TrainingJob {
    fn key(&self) -> String {
        self.id.to_string()
    }
}

/// Splits `rows` dataset rows into at most `parts` contiguous chunks.
///
/// Remainder rows are spread over the leading chunks; a dataset smaller than
/// `parts` yields fewer, non-empty chunks.
pub fn partition(rows: u64, parts: usize) -> Vec<ChunkRange> {
    let parts = (parts.max(1) as u64).min(rows.max(1));
    let base = rows / parts;
    let remainder = rows % parts;

    let mut chunks = Vec::with_capacity(parts as usize);
    let mut start = 0;

    for i in 0..parts {
        let len = base + u64::from(i < remainder);
        if len == 0 {
            break;
        }

        chunks.push(ChunkRange::new(start, start + len));
        start += len;
    }

    chunks
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_splits_evenly() {
        let chunks = partition(100, 4);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() == 25));
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[3].end, 100);
    }

    #[test]
    fn partition_spreads_the_remainder() {
        let chunks = partition(10, 3);
        let lens: Vec<u64> = chunks.iter().map(ChunkRange::len).collect();
        assert_eq!(lens, vec![4, 3, 3]);

        // Contiguous and complete.
        assert_eq!(chunks[0].start, 0);
        assert_eq!(chunks[0].end, chunks[1].start);
        assert_eq!(chunks[1].end, chunks[2].start);
        assert_eq!(chunks[2].end, 10);
    }

    #[test]
    fn partition_never_yields_empty_chunks() {
        let chunks = partition(2, 5);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn partition_handles_a_single_worker() {
        let chunks = partition(64, 1);
        assert_eq!(chunks, vec![ChunkRange::new(0, 64)]);
    }
}
