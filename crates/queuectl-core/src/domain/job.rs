//! Job record: the persisted row plus its transition helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{JobId, WorkerId};
use super::payload::JobPayload;
use super::state::JobState;

/// A job as stored.
///
/// Design:
/// - The store is the single source of truth; workers only hold a copy of the
///   job they are executing, and drop it once the outcome is recorded.
/// - State transitions happen through the methods below so that
///   `state == Processing` and `locked_by.is_some()` always move together.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub payload: JobPayload,
    pub state: JobState,

    /// Earliest time the job may be claimed.
    pub run_at: DateTime<Utc>,

    /// Execution attempts made so far (including the current one while processing).
    pub attempts: u32,

    /// Per-job retry ceiling. `None` means the configured default applies.
    pub max_retries: Option<u32>,

    pub locked_by: Option<WorkerId>,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(
        id: JobId,
        payload: JobPayload,
        run_at: Option<DateTime<Utc>>,
        max_retries: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            payload,
            state: JobState::Pending,
            run_at: run_at.unwrap_or(now),
            attempts: 0,
            max_retries,
            locked_by: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn command(&self) -> &str {
        self.payload.command()
    }

    /// Retry ceiling after applying the configured default.
    pub fn effective_max_retries(&self, default: u32) -> u32 {
        self.max_retries.unwrap_or(default)
    }

    pub fn is_locked_by(&self, worker: &WorkerId) -> bool {
        self.state == JobState::Processing && self.locked_by.as_ref() == Some(worker)
    }

    /// Mark as claimed by `worker`. Only the claimer calls this.
    pub(crate) fn start_attempt(&mut self, worker: WorkerId, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.locked_by = Some(worker);
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_completed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Completed;
        self.locked_by = None;
        self.updated_at = now;
    }

    /// Put the job back in the backlog, eligible again at `next_run_at`.
    pub fn schedule_retry(&mut self, next_run_at: DateTime<Utc>, error: String, now: DateTime<Utc>) {
        self.state = JobState::Pending;
        self.run_at = next_run_at;
        self.locked_by = None;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// Move to the dead-letter queue.
    pub fn mark_dead(&mut self, error: String, now: DateTime<Utc>) {
        self.state = JobState::Dead;
        self.locked_by = None;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// `Processing` iff `locked_by` is set.
    pub fn lock_invariant_holds(&self) -> bool {
        (self.state == JobState::Processing) == self.locked_by.is_some()
    }
}

/// Filter for listing jobs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub state: Option<JobState>,
}

impl JobFilter {
    pub fn all() -> Self {
        Self { state: None }
    }

    pub fn state(state: JobState) -> Self {
        Self { state: Some(state) }
    }
}
