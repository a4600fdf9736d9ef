use std::collections::VecDeque;

use comms::specs::job::{JobId, JobKind};

/// Two-class priority queue: inference always drains before training chunks,
/// FIFO within each class.
#[derive(Debug, Default)]
pub(crate) struct JobQueues {
    inference: VecDeque<JobId>,
    training: VecDeque<JobId>,
}

impl JobQueues {
    pub(crate) fn push(&mut self, kind: &JobKind, job_id: JobId) {
        match kind {
            JobKind::Inference => self.inference.push_back(job_id),
            JobKind::TrainingChunk { .. } => self.training.push_back(job_id),
        }
    }

    /// Puts a job back at the head of its class, keeping its turn.
    pub(crate) fn push_front(&mut self, kind: &JobKind, job_id: JobId) {
        match kind {
            JobKind::Inference => self.inference.push_front(job_id),
            JobKind::TrainingChunk { .. } => self.training.push_front(job_id),
        }
    }

    pub(crate) fn pop(&mut self) -> Option<JobId> {
        self.inference.pop_front().or_else(|| self.training.pop_front())
    }

    pub(crate) fn remove(&mut self, job_id: JobId) -> bool {
        let before = self.inference.len() + self.training.len();
        self.inference.retain(|&id| id != job_id);
        self.training.retain(|&id| id != job_id);
        before != self.inference.len() + self.training.len()
    }

    pub(crate) fn len(&self) -> usize {
        self.inference.len() + self.training.len()
    }
}
