//! Worker registry.
//!
//! One row per running worker. The row is both the liveness record
//! (heartbeat) and the stop signal: a worker whose row disappears shuts down
//! after its current job.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::Serialize;

use super::{SqliteStore, StoreError, from_ms, is_constraint_violation, ms};
use crate::domain::WorkerId;

/// Slack added on top of three missed polls before a worker counts as gone.
const LIVENESS_GRACE_MS: i64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerEntry {
    pub id: WorkerId,
    pub pid: Option<u32>,
    pub poll_interval_ms: u64,
    pub started_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
}

impl WorkerEntry {
    pub fn new(id: WorkerId, pid: Option<u32>, poll_interval_ms: u64, now: DateTime<Utc>) -> Self {
        Self {
            id,
            pid,
            poll_interval_ms,
            started_at: now,
            heartbeat_at: now,
        }
    }

    /// Heartbeats are due once per poll interval; three missed ones mean dead.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        ms(now) - ms(self.heartbeat_at) <= liveness_window_ms(self.poll_interval_ms)
    }
}

fn liveness_window_ms(poll_interval_ms: u64) -> i64 {
    i64::try_from(poll_interval_ms)
        .unwrap_or(i64::MAX)
        .saturating_mul(3)
        .saturating_add(LIVENESS_GRACE_MS)
}

fn read_worker_row(row: &rusqlite::Row<'_>) -> Result<WorkerEntry, rusqlite::Error> {
    let poll: i64 = row.get(2)?;
    Ok(WorkerEntry {
        id: WorkerId::new(row.get::<_, String>(0)?),
        pid: row.get(1)?,
        poll_interval_ms: u64::try_from(poll).unwrap_or(0),
        started_at: from_ms(3, row.get(3)?)?,
        heartbeat_at: from_ms(4, row.get(4)?)?,
    })
}

impl SqliteStore {
    pub fn register_worker(&mut self, entry: &WorkerEntry) -> Result<(), StoreError> {
        let inserted = self.conn.execute(
            "INSERT INTO workers(id, pid, poll_interval_ms, started_at_ms, heartbeat_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                entry.id.as_str(),
                entry.pid,
                i64::try_from(entry.poll_interval_ms).unwrap_or(i64::MAX),
                ms(entry.started_at),
                ms(entry.heartbeat_at),
            ],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(StoreError::Conflict(format!(
                "worker {} is already registered",
                entry.id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    /// Record the OS pid of a pre-registered worker and refresh its heartbeat.
    /// Returns `false` when the row is gone (stopped before it started).
    pub fn attach_worker(
        &mut self,
        id: &WorkerId,
        pid: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE workers SET pid = ?2, heartbeat_at_ms = ?3 WHERE id = ?1",
            params![id.as_str(), pid, ms(now)],
        )?;
        Ok(changed == 1)
    }

    /// Returns `false` when the row is gone, which is the stop signal.
    pub fn heartbeat(&mut self, id: &WorkerId, now: DateTime<Utc>) -> Result<bool, StoreError> {
        let changed = self.conn.execute(
            "UPDATE workers SET heartbeat_at_ms = ?2 WHERE id = ?1",
            params![id.as_str(), ms(now)],
        )?;
        Ok(changed == 1)
    }

    pub fn deregister_worker(&mut self, id: &WorkerId) -> Result<bool, StoreError> {
        let changed = self
            .conn
            .execute("DELETE FROM workers WHERE id = ?1", params![id.as_str()])?;
        Ok(changed == 1)
    }

    /// Remove every registered worker, returning what was removed.
    pub fn clear_workers(&mut self) -> Result<Vec<WorkerEntry>, StoreError> {
        let tx = self.conn.transaction()?;
        let removed = {
            let mut stmt = tx.prepare(
                "SELECT id, pid, poll_interval_ms, started_at_ms, heartbeat_at_ms \
                 FROM workers ORDER BY started_at_ms ASC, id ASC",
            )?;
            let rows = stmt.query_map([], read_worker_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        tx.execute("DELETE FROM workers", [])?;
        tx.commit()?;
        Ok(removed)
    }

    pub fn list_workers(&self) -> Result<Vec<WorkerEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, pid, poll_interval_ms, started_at_ms, heartbeat_at_ms \
             FROM workers ORDER BY started_at_ms ASC, id ASC",
        )?;
        let rows = stmt.query_map([], read_worker_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Drop rows whose heartbeat is outside the liveness window (crashed
    /// processes). Returns the number removed.
    pub fn prune_stale_workers(&mut self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut removed = 0;
        for worker in self.list_workers()? {
            if !worker.is_live(now) && self.deregister_worker(&worker.id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
