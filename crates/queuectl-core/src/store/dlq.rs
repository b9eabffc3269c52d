//! Dead-letter queue: `dead` jobs, listed most recent first, revivable by id.

use chrono::{DateTime, Utc};
use rusqlite::params;

use super::{JOB_COLUMNS, SqliteStore, StoreError, ms, read_job_row};
use crate::domain::{JobId, JobRecord};

impl SqliteStore {
    pub fn dlq_list(&self) -> Result<Vec<JobRecord>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE state = 'dead' \
             ORDER BY updated_at_ms DESC, id DESC"
        ))?;
        let rows = stmt.query_map([], read_job_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Move a dead job back to `pending` with a fresh retry budget.
    ///
    /// Returns `false` when `id` does not name a dead job. A single
    /// conditional statement, so concurrent retries of one id revive it once.
    pub fn dlq_retry(&mut self, id: &JobId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let now_ms = ms(now);
        let changed = self.conn.execute(
            "UPDATE jobs \
             SET state = 'pending', run_at_ms = ?2, attempts = 0, locked_by = NULL, last_error = NULL, updated_at_ms = ?2 \
             WHERE id = ?1 AND state = 'dead'",
            params![id.to_string(), now_ms],
        )?;
        Ok(changed == 1)
    }
}
