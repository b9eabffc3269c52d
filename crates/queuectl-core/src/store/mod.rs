//! SQLite-backed store: the single source of truth for jobs, configuration and
//! the worker registry.
//!
//! Every worker process opens its own connection to the same database file.
//! Cross-process coordination happens only through conditional updates inside
//! `BEGIN IMMEDIATE` transactions; there are no in-process locks in the claim
//! path.

mod claim;
mod config;
mod dlq;
mod error;
mod workers;

pub use claim::Settlement;
pub use error::StoreError;
pub use workers::WorkerEntry;

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, ErrorCode, OptionalExtension, Transaction, TransactionBehavior, params};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::{JobFilter, JobId, JobPayload, JobRecord, JobState, WorkerId};
use crate::observability::QueueCounts;

const DB_FILE: &str = "queue.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const JOB_COLUMNS: &str = "id, payload, state, run_at_ms, attempts, max_retries, locked_by, last_error, created_at_ms, updated_at_ms";

#[derive(Debug)]
pub struct SqliteStore {
    conn: Connection,
    home: PathBuf,
}

impl SqliteStore {
    /// Open (or create) the store under `home`.
    pub fn open(home: impl AsRef<Path>) -> Result<Self, StoreError> {
        let home = home.as_ref().to_path_buf();
        std::fs::create_dir_all(&home)?;

        let conn = Connection::open(home.join(DB_FILE))?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        // WAL lets status/list readers run while a worker holds the write lock.
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))?;
        conn.execute_batch("PRAGMA synchronous = NORMAL;")?;

        install_schema(&conn)?;
        Ok(Self { conn, home })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Insert a new job. Only `pending` jobs can be created.
    pub fn create(&mut self, job: &JobRecord) -> Result<(), StoreError> {
        if job.state == JobState::Processing || !job.lock_invariant_holds() {
            return Err(StoreError::InvalidTransition {
                id: job.id.to_string(),
                from: JobState::Pending,
                to: job.state,
            });
        }

        let payload = encode_payload(&job.payload)?;
        let inserted = self.conn.execute(
            "INSERT INTO jobs(id, payload, state, run_at_ms, attempts, max_retries, locked_by, last_error, created_at_ms, updated_at_ms) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7, ?8, ?9)",
            params![
                job.id.to_string(),
                payload,
                job.state.as_str(),
                ms(job.run_at),
                job.attempts,
                job.max_retries,
                job.last_error,
                ms(job.created_at),
                ms(job.updated_at),
            ],
        );

        match inserted {
            Ok(_) => Ok(()),
            Err(err) if is_constraint_violation(&err) => Err(StoreError::Conflict(format!(
                "job {} already exists",
                job.id
            ))),
            Err(err) => Err(err.into()),
        }
    }

    pub fn read(&self, id: &JobId) -> Result<JobRecord, StoreError> {
        self.find(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    pub fn find(&self, id: &JobId) -> Result<Option<JobRecord>, StoreError> {
        Ok(select_job(&self.conn, id)?)
    }

    /// Read-modify-write one job atomically.
    ///
    /// The mutation may refuse by returning an error, in which case nothing is
    /// written. Results that break the lock invariant, or that move a job into
    /// `processing` (reserved for the claimer), are rejected.
    pub fn update<F>(&mut self, id: &JobId, mutation: F) -> Result<JobRecord, StoreError>
    where
        F: FnOnce(&mut JobRecord) -> Result<(), StoreError>,
    {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut job = select_job(&tx, id)?.ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let before = job.state;

        mutation(&mut job)?;

        let enters_processing = job.state == JobState::Processing && before != JobState::Processing;
        if job.id != *id || enters_processing || !job.lock_invariant_holds() {
            return Err(StoreError::InvalidTransition {
                id: id.to_string(),
                from: before,
                to: job.state,
            });
        }

        write_job(&tx, &job)?;
        tx.commit()?;
        Ok(job)
    }

    /// List jobs in queue order (oldest first).
    pub fn query(
        &self,
        filter: JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, StoreError> {
        let limit = to_sqlite_i64(limit);
        let offset = to_sqlite_i64(offset);

        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM jobs \
             WHERE (?1 IS NULL OR state = ?1) \
             ORDER BY created_at_ms ASC, id ASC \
             LIMIT ?2 OFFSET ?3"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(
            params![filter.state.map(JobState::as_str), limit, offset],
            read_job_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn counts_by_state(&self) -> Result<QueueCounts, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT state, COUNT(1) FROM jobs GROUP BY state")?;
        let mut rows = stmt.query([])?;

        let mut counts = QueueCounts::default();
        while let Some(row) = rows.next()? {
            let state: String = row.get(0)?;
            let n = row.get::<_, i64>(1)?.max(0) as usize;
            match state.parse::<JobState>() {
                Ok(state) => counts.add(state, n),
                Err(_) => {
                    return Err(StoreError::Sql(rusqlite::Error::InvalidColumnType(
                        0,
                        "state".to_string(),
                        Type::Text,
                    )));
                }
            }
        }
        Ok(counts)
    }
}

fn install_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS jobs (
          id TEXT PRIMARY KEY,
          payload TEXT NOT NULL,
          state TEXT NOT NULL
            CHECK(state IN ('pending', 'processing', 'completed', 'failed', 'dead')),
          run_at_ms INTEGER NOT NULL,
          attempts INTEGER NOT NULL DEFAULT 0 CHECK(attempts >= 0),
          max_retries INTEGER CHECK(max_retries IS NULL OR max_retries >= 0),
          locked_by TEXT,
          last_error TEXT,
          created_at_ms INTEGER NOT NULL,
          updated_at_ms INTEGER NOT NULL,
          CHECK((state = 'processing') = (locked_by IS NOT NULL))
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_claim
          ON jobs(state, run_at_ms, id);

        CREATE INDEX IF NOT EXISTS idx_jobs_state_updated
          ON jobs(state, updated_at_ms);

        CREATE TABLE IF NOT EXISTS config (
          key TEXT PRIMARY KEY,
          value TEXT NOT NULL,
          updated_at_ms INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS workers (
          id TEXT PRIMARY KEY,
          pid INTEGER,
          poll_interval_ms INTEGER NOT NULL,
          started_at_ms INTEGER NOT NULL,
          heartbeat_at_ms INTEGER NOT NULL
        );
        "#,
    )?;
    Ok(())
}

fn select_job(conn: &Connection, id: &JobId) -> Result<Option<JobRecord>, rusqlite::Error> {
    conn.query_row(
        &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
        params![id.to_string()],
        read_job_row,
    )
    .optional()
}

fn write_job(tx: &Transaction<'_>, job: &JobRecord) -> Result<(), StoreError> {
    let payload = encode_payload(&job.payload)?;
    tx.execute(
        "UPDATE jobs \
         SET payload=?2, state=?3, run_at_ms=?4, attempts=?5, max_retries=?6, locked_by=?7, last_error=?8, updated_at_ms=?9 \
         WHERE id=?1",
        params![
            job.id.to_string(),
            payload,
            job.state.as_str(),
            ms(job.run_at),
            job.attempts,
            job.max_retries,
            job.locked_by.as_ref().map(WorkerId::as_str),
            job.last_error,
            ms(job.updated_at),
        ],
    )?;
    Ok(())
}

fn read_job_row(row: &rusqlite::Row<'_>) -> Result<JobRecord, rusqlite::Error> {
    let id: String = row.get(0)?;
    let payload: String = row.get(1)?;
    let state: String = row.get(2)?;

    Ok(JobRecord {
        id: id.parse().map_err(|e| conversion_error(0, e))?,
        payload: serde_json::from_str(&payload).map_err(|e| conversion_error(1, e))?,
        state: state.parse().map_err(|e| conversion_error(2, e))?,
        run_at: from_ms(3, row.get(3)?)?,
        attempts: row.get(4)?,
        max_retries: row.get(5)?,
        locked_by: row.get::<_, Option<String>>(6)?.map(WorkerId::new),
        last_error: row.get(7)?,
        created_at: from_ms(8, row.get(8)?)?,
        updated_at: from_ms(9, row.get(9)?)?,
    })
}

fn encode_payload(payload: &JobPayload) -> Result<String, StoreError> {
    serde_json::to_string(payload).map_err(|e| StoreError::Sql(conversion_error(1, e)))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

pub(crate) fn ms(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

pub(crate) fn from_ms(idx: usize, value: i64) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::from_timestamp_millis(value)
        .ok_or(rusqlite::Error::IntegralValueOutOfRange(idx, value))
}

fn to_sqlite_i64(value: usize) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(err.sqlite_error_code(), Some(ErrorCode::ConstraintViolation))
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err.sqlite_error_code(),
        Some(ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
    )
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;
    use tempfile::TempDir;
    use ulid::Ulid;

    pub(crate) fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    pub(crate) fn open_temp() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteStore::open(dir.path()).unwrap();
        (dir, store)
    }

    pub(crate) fn pending_job(command: &str, run_at: DateTime<Utc>) -> JobRecord {
        JobRecord::new(
            JobId::from_ulid(Ulid::new()),
            JobPayload::RawCommand(command.to_string()),
            Some(run_at),
            None,
            t0(),
        )
    }

    #[test]
    fn create_then_read_round_trips() {
        let (_dir, mut store) = open_temp();
        let mut job = pending_job("echo hi", t0());
        job.max_retries = Some(2);
        store.create(&job).unwrap();

        assert_eq!(store.read(&job.id).unwrap(), job);
    }

    #[test]
    fn structured_payload_is_kept_verbatim() {
        let (_dir, mut store) = open_temp();
        let mut job = pending_job("x", t0());
        job.payload = JobPayload::parse(r#"{"command":"echo hi","owner":"ops","n":[1,2]}"#).unwrap();
        store.create(&job).unwrap();

        let back = store.read(&job.id).unwrap();
        assert_eq!(back.payload, job.payload);
        assert_eq!(back.command(), "echo hi");
    }

    #[test]
    fn duplicate_id_is_a_conflict() {
        let (_dir, mut store) = open_temp();
        let job = pending_job("true", t0());
        store.create(&job).unwrap();
        assert!(store.create(&job).unwrap_err().is_conflict());
    }

    #[test]
    fn creating_a_processing_job_is_rejected() {
        let (_dir, mut store) = open_temp();
        let mut job = pending_job("true", t0());
        job.start_attempt(WorkerId::new("w"), t0());
        assert!(matches!(
            store.create(&job),
            Err(StoreError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn read_unknown_is_not_found() {
        let (_dir, store) = open_temp();
        let id = JobId::from_ulid(Ulid::new());
        assert!(matches!(store.read(&id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn update_applies_mutation() {
        let (_dir, mut store) = open_temp();
        let job = pending_job("true", t0());
        store.create(&job).unwrap();

        let updated = store
            .update(&job.id, |j| {
                j.max_retries = Some(7);
                Ok(())
            })
            .unwrap();
        assert_eq!(updated.max_retries, Some(7));
        assert_eq!(store.read(&job.id).unwrap().max_retries, Some(7));
    }

    #[test]
    fn update_cannot_bypass_the_claimer() {
        let (_dir, mut store) = open_temp();
        let job = pending_job("true", t0());
        store.create(&job).unwrap();

        let err = store
            .update(&job.id, |j| {
                j.start_attempt(WorkerId::new("sneaky"), t0());
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: JobState::Pending,
                to: JobState::Processing,
                ..
            }
        ));
        assert_eq!(store.read(&job.id).unwrap().state, JobState::Pending);
    }

    #[test]
    fn update_rejects_lock_invariant_violation() {
        let (_dir, mut store) = open_temp();
        let job = pending_job("true", t0());
        store.create(&job).unwrap();

        let err = store
            .update(&job.id, |j| {
                j.locked_by = Some(WorkerId::new("ghost"));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[test]
    fn refused_mutation_writes_nothing() {
        let (_dir, mut store) = open_temp();
        let job = pending_job("true", t0());
        store.create(&job).unwrap();

        let err = store
            .update(&job.id, |j| {
                j.attempts = 99;
                Err(StoreError::Conflict("nope".into()))
            })
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.read(&job.id).unwrap().attempts, 0);
    }

    #[test]
    fn update_unknown_is_not_found() {
        let (_dir, mut store) = open_temp();
        let id = JobId::from_ulid(Ulid::new());
        assert!(matches!(
            store.update(&id, |_| Ok(())),
            Err(StoreError::NotFound(_))
        ));
    }

    #[rstest]
    #[case(None, 10, 0, 3)]
    #[case(Some(JobState::Pending), 10, 0, 2)]
    #[case(Some(JobState::Completed), 10, 0, 1)]
    #[case(None, 2, 0, 2)]
    #[case(None, 10, 2, 1)]
    fn query_filters_and_pages(
        #[case] state: Option<JobState>,
        #[case] limit: usize,
        #[case] offset: usize,
        #[case] expected: usize,
    ) {
        let (_dir, mut store) = open_temp();
        for _ in 0..3 {
            store.create(&pending_job("true", t0())).unwrap();
        }
        let first = store.query(JobFilter::all(), 1, 0).unwrap().remove(0);
        store
            .update(&first.id, |j| {
                j.mark_completed(t0());
                Ok(())
            })
            .unwrap();

        let rows = store.query(JobFilter { state }, limit, offset).unwrap();
        assert_eq!(rows.len(), expected);
    }

    #[test]
    fn counts_by_state_groups_rows() {
        let (_dir, mut store) = open_temp();
        let a = pending_job("true", t0());
        let b = pending_job("true", t0());
        store.create(&a).unwrap();
        store.create(&b).unwrap();
        store
            .update(&b.id, |j| {
                j.mark_dead("boom".into(), t0());
                Ok(())
            })
            .unwrap();

        let counts = store.counts_by_state().unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.dead, 1);
        assert_eq!(counts.processing, 0);
        assert_eq!(counts.total(), 2);
    }

    #[test]
    fn reopening_keeps_data() {
        let dir = TempDir::new().unwrap();
        let job = pending_job("true", t0());
        {
            let mut store = SqliteStore::open(dir.path()).unwrap();
            store.create(&job).unwrap();
        }
        let store = SqliteStore::open(dir.path()).unwrap();
        assert_eq!(store.read(&job.id).unwrap().id, job.id);
    }
}
