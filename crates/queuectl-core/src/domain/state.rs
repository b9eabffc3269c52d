//! Job state machine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Job state.
///
/// State transitions:
/// - Pending -> Processing (only through the atomic claim)
/// - Processing -> Completed
/// - Processing -> Pending (retry scheduled with a future `run_at`)
/// - Processing -> Dead (retry budget exhausted)
/// - Dead -> Pending (explicit DLQ retry)
///
/// `Failed` exists for reporting and filtering; the engine never persists it as
/// a resting state because a retryable failure is re-marked `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
    Dead,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Pending,
        JobState::Processing,
        JobState::Completed,
        JobState::Failed,
        JobState::Dead,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Processing => "processing",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Dead => "dead",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown job state `{0}` (expected pending|processing|completed|failed|dead)")]
pub struct ParseStateError(pub String);

impl FromStr for JobState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(JobState::Pending),
            "processing" => Ok(JobState::Processing),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            "dead" => Ok(JobState::Dead),
            _ => Err(ParseStateError(s.to_string())),
        }
    }
}
