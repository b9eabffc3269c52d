//! Decision model: what happens to a job after a failed attempt.
//!
//! The decider is a pure function of (job, outcome, config, now). Applying the
//! decision to the store is the worker loop's job.

use chrono::{DateTime, Utc};
use std::time::Duration;

use super::job::JobRecord;
use super::outcome::ExecutionOutcome;
use crate::config::QueueConfig;
use crate::queue::RetryPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Back to `pending`, eligible again at `next_run_at`.
    Retry {
        delay: Duration,
        next_run_at: DateTime<Utc>,
        error: String,
    },

    /// Retry budget exhausted: move to the dead-letter queue.
    MarkDead { error: String },
}

pub trait Decider: Send + Sync {
    fn decide(&self, job: &JobRecord, outcome: &ExecutionOutcome, now: DateTime<Utc>) -> Decision;
}

/// Attempt-based retry:
/// - retry while `attempts <= max_retries_effective`
/// - dead once `attempts > max_retries_effective`
///
/// So `max_retries = 2` allows three executions in total, and
/// `max_retries = 0` dead-letters on the first failure.
#[derive(Debug, Clone)]
pub struct DefaultDecider {
    retry_policy: RetryPolicy,
    default_max_retries: u32,
}

impl DefaultDecider {
    pub fn new(retry_policy: RetryPolicy, default_max_retries: u32) -> Self {
        Self {
            retry_policy,
            default_max_retries,
        }
    }

    pub fn from_config(config: &QueueConfig) -> Self {
        Self::new(RetryPolicy::from_config(config), config.max_retries)
    }
}

impl Decider for DefaultDecider {
    fn decide(&self, job: &JobRecord, outcome: &ExecutionOutcome, now: DateTime<Utc>) -> Decision {
        let error = outcome.error_text();
        let max_retries = job.effective_max_retries(self.default_max_retries);

        if job.attempts > max_retries {
            return Decision::MarkDead { error };
        }

        let delay = self.retry_policy.next_delay(job.attempts);
        let next_run_at = chrono::Duration::from_std(delay)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        Decision::Retry {
            delay,
            next_run_at,
            error,
        }
    }
}
