use serde::{Deserialize, Serialize};

use crate::domain::JobState;
use crate::store::WorkerEntry;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead: usize,
}

impl QueueCounts {
    pub fn add(&mut self, state: JobState, n: usize) {
        let slot = match state {
            JobState::Pending => &mut self.pending,
            JobState::Processing => &mut self.processing,
            JobState::Completed => &mut self.completed,
            JobState::Failed => &mut self.failed,
            JobState::Dead => &mut self.dead,
        };
        *slot += n;
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.completed + self.failed + self.dead
    }
}

/// `status` の出力
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub counts: QueueCounts,
    pub active_workers: usize,

    /// Registry rows, live or not.
    pub workers: Vec<WorkerEntry>,
}
