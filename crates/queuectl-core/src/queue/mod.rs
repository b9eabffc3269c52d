//! Queue module: the engine's public operations over the SQLite store.
//!
//! `JobQueue` is what the CLI and the worker loop talk to. The store is
//! synchronous, so every call hops onto the blocking pool (`spawn_blocking`)
//! and never holds the connection across an `.await`.

mod retry;

pub use retry::RetryPolicy;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::config::{ConfigError, ConfigKey, QueueConfig};
use crate::domain::{
    Decider, DefaultDecider, EnqueueRequest, ExecutionOutcome, JobFilter, JobId, JobRecord,
    WorkerId,
};
use crate::error::QueueError;
use crate::observability::StatusReport;
use crate::ports::{Clock, IdGenerator, SystemClock, UlidGenerator};
use crate::store::{Settlement, SqliteStore, StoreError, WorkerEntry};

/// Default page size for `list_jobs`.
pub const DEFAULT_LIST_LIMIT: usize = 50;

/// Error text recorded when the reaper releases an orphaned job.
pub const LEASE_EXPIRED: &str = "lease expired";

#[derive(Clone)]
pub struct JobQueue {
    store: Arc<Mutex<SqliteStore>>,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    home: PathBuf,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue").field("home", &self.home).finish()
    }
}

impl JobQueue {
    /// Open the queue stored under `home` with the system clock.
    pub fn open(home: impl AsRef<Path>) -> Result<Self, QueueError> {
        Self::open_with_clock(home, Arc::new(SystemClock))
    }

    pub fn open_with_clock(home: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self, QueueError> {
        let store = SqliteStore::open(home.as_ref())?;
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&clock)));
        Ok(Self {
            home: store.home().to_path_buf(),
            store: Arc::new(Mutex::new(store)),
            clock,
            ids,
        })
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    async fn with_store<T, F>(&self, op: &'static str, f: F) -> Result<T, QueueError>
    where
        T: Send + 'static,
        F: FnOnce(&mut SqliteStore) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            let mut guard = store
                .lock()
                .map_err(|_| QueueError::Task(format!("{op}: store mutex poisoned")))?;
            f(&mut *guard).map_err(QueueError::from)
        })
        .await
        .map_err(|e| QueueError::Task(format!("{op} failed: {e}")))?
    }

    // ---- jobs ----

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<JobRecord, QueueError> {
        let now = self.now();
        let job = JobRecord::new(
            self.ids.generate_job_id(),
            request.payload,
            request.run_at,
            request.max_retries,
            now,
        );

        let stored = job.clone();
        self.with_store("enqueue", move |store| store.create(&stored))
            .await?;

        info!(
            job_id = %job.id,
            run_at = %job.run_at,
            max_retries = ?job.max_retries,
            "job enqueued"
        );
        Ok(job)
    }

    pub async fn get_job(&self, id: JobId) -> Result<JobRecord, QueueError> {
        self.with_store("get_job", move |store| store.read(&id)).await
    }

    pub async fn list_jobs(
        &self,
        filter: JobFilter,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<JobRecord>, QueueError> {
        self.with_store("list_jobs", move |store| store.query(filter, limit, offset))
            .await
    }

    pub async fn status(&self) -> Result<StatusReport, QueueError> {
        let now = self.now();
        self.with_store("status", move |store| {
            let counts = store.counts_by_state()?;
            let workers = store.list_workers()?;
            let active_workers = workers.iter().filter(|w| w.is_live(now)).count();
            Ok(StatusReport {
                counts,
                active_workers,
                workers,
            })
        })
        .await
    }

    // ---- DLQ ----

    pub async fn dlq_list(&self) -> Result<Vec<JobRecord>, QueueError> {
        self.with_store("dlq_list", |store| store.dlq_list()).await
    }

    /// `false` when `id` is unknown or the job is not dead.
    pub async fn dlq_retry(&self, id: JobId) -> Result<bool, QueueError> {
        let now = self.now();
        let revived = self
            .with_store("dlq_retry", move |store| store.dlq_retry(&id, now))
            .await?;
        if revived {
            info!(job_id = %id, "dead job re-enqueued");
        }
        Ok(revived)
    }

    // ---- config ----

    /// Stored value, or the built-in default for a recognized key.
    pub async fn config_get(&self, key: &str) -> Result<Option<String>, QueueError> {
        let key = checked_key(key)?;
        let lookup = key.clone();
        let stored = self
            .with_store("config_get", move |store| store.config_get(&lookup))
            .await?;
        Ok(stored.or_else(|| {
            key.parse::<ConfigKey>()
                .ok()
                .map(|k| k.default_value().to_string())
        }))
    }

    /// Recognized keys are validated and normalized; unknown keys are stored
    /// verbatim.
    pub async fn config_set(&self, key: &str, value: &str) -> Result<(), QueueError> {
        let key = checked_key(key)?;
        let value = match key.parse::<ConfigKey>() {
            Ok(known) => known.validate(value)?,
            Err(_) => value.to_string(),
        };
        let now = self.now();
        let (k, v) = (key.clone(), value.clone());
        self.with_store("config_set", move |store| store.config_set(&k, &v, now))
            .await?;
        info!(key = %key, value = %value, "config updated");
        Ok(())
    }

    pub async fn config(&self) -> Result<QueueConfig, QueueError> {
        self.with_store("config", |store| store.load_config()).await
    }

    // ---- worker side ----

    pub async fn claim_next(&self, worker: &WorkerId) -> Result<Option<JobRecord>, QueueError> {
        let now = self.now();
        let worker = worker.clone();
        self.with_store("claim_next", move |store| store.claim_next(&worker, now))
            .await
    }

    /// Feed an attempt's outcome back into the store.
    ///
    /// Success completes the job. A failure goes through the retry policy
    /// built from the current config: reschedule with backoff, or dead-letter.
    /// Returns the job as stored afterwards.
    pub async fn record_outcome(
        &self,
        job: &JobRecord,
        worker: &WorkerId,
        outcome: &ExecutionOutcome,
    ) -> Result<JobRecord, QueueError> {
        let now = self.now();
        let (id, worker) = (job.id, worker.clone());
        let (job, outcome) = (job.clone(), outcome.clone());

        self.with_store("record_outcome", move |store| {
            let settlement = if outcome.is_success() {
                Settlement::Completed
            } else {
                let decider = DefaultDecider::from_config(&store.load_config()?);
                decider.decide(&job, &outcome, now).into()
            };
            store.settle(&id, &worker, settlement, now)
        })
        .await
    }

    /// Release `processing` jobs whose worker stopped heartbeating `lease` ago.
    /// Each one counts as a failed attempt.
    pub async fn reap_orphans(&self, lease: Duration) -> Result<Vec<JobRecord>, QueueError> {
        let now = self.now();
        let reaped = self
            .with_store("reap_orphans", move |store| {
                let decider = DefaultDecider::from_config(&store.load_config()?);
                let expired = ExecutionOutcome::failure(LEASE_EXPIRED);
                store.reap_orphans(lease, now, |job| decider.decide(job, &expired, now).into())
            })
            .await?;
        for job in &reaped {
            info!(job_id = %job.id, state = %job.state, attempts = job.attempts, "orphaned job released");
        }
        Ok(reaped)
    }

    // ---- registry ----

    pub async fn register_worker(&self, entry: WorkerEntry) -> Result<(), QueueError> {
        self.with_store("register_worker", move |store| store.register_worker(&entry))
            .await
    }

    pub async fn attach_worker(&self, id: &WorkerId, pid: u32) -> Result<bool, QueueError> {
        let now = self.now();
        let id = id.clone();
        self.with_store("attach_worker", move |store| store.attach_worker(&id, pid, now))
            .await
    }

    pub async fn heartbeat(&self, id: &WorkerId) -> Result<bool, QueueError> {
        let now = self.now();
        let id = id.clone();
        self.with_store("heartbeat", move |store| store.heartbeat(&id, now))
            .await
    }

    pub async fn deregister_worker(&self, id: &WorkerId) -> Result<bool, QueueError> {
        let id = id.clone();
        let removed = self
            .with_store("deregister_worker", move |store| store.deregister_worker(&id))
            .await?;
        debug!(removed, "worker deregistered");
        Ok(removed)
    }

    pub async fn clear_workers(&self) -> Result<Vec<WorkerEntry>, QueueError> {
        self.with_store("clear_workers", |store| store.clear_workers())
            .await
    }

    pub async fn prune_stale_workers(&self) -> Result<usize, QueueError> {
        let now = self.now();
        self.with_store("prune_stale_workers", move |store| store.prune_stale_workers(now))
            .await
    }
}

fn checked_key(key: &str) -> Result<String, QueueError> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::EmptyKey.into());
    }
    Ok(key.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{JobPayload, JobState};
    use crate::ports::FixedClock;
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    fn open() -> (TempDir, FixedClock, JobQueue) {
        let dir = TempDir::new().unwrap();
        let clock = FixedClock::new(t0());
        let queue = JobQueue::open_with_clock(dir.path(), Arc::new(clock.clone())).unwrap();
        (dir, clock, queue)
    }

    fn command(cmd: &str) -> EnqueueRequest {
        EnqueueRequest::new(JobPayload::RawCommand(cmd.into()))
    }

    #[tokio::test]
    async fn enqueue_creates_pending_job_due_now() {
        let (_dir, _clock, queue) = open();
        let job = queue
            .enqueue(EnqueueRequest::from_input(r#"{"command":"echo hi"}"#, None, None).unwrap())
            .await
            .unwrap();

        assert!(job.id.to_string().starts_with("job-"));
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.run_at, t0());
        assert_eq!(job.attempts, 0);

        let listed = queue.list_jobs(JobFilter::all(), DEFAULT_LIST_LIMIT, 0).await.unwrap();
        assert_eq!(listed, vec![job]);
    }

    #[tokio::test]
    async fn config_get_falls_back_to_defaults() {
        let (_dir, _clock, queue) = open();
        assert_eq!(queue.config_get("poll_interval_ms").await.unwrap().as_deref(), Some("500"));

        queue.config_set("poll_interval_ms", "250").await.unwrap();
        assert_eq!(queue.config_get("poll_interval_ms").await.unwrap().as_deref(), Some("250"));
        assert_eq!(queue.config().await.unwrap().poll_interval_ms, 250);
    }

    #[tokio::test]
    async fn config_rejects_bad_values_and_keeps_unknown_keys() {
        let (_dir, _clock, queue) = open();
        assert!(matches!(
            queue.config_set("max_retries", "-2").await,
            Err(QueueError::Validation(_))
        ));
        assert!(matches!(queue.config_get("  ").await, Err(QueueError::Validation(_))));

        assert_eq!(queue.config_get("team").await.unwrap(), None);
        queue.config_set("team", "Ops Team").await.unwrap();
        assert_eq!(queue.config_get("team").await.unwrap().as_deref(), Some("Ops Team"));
    }

    #[tokio::test]
    async fn failing_job_walks_the_retry_ladder_into_the_dlq() {
        let (_dir, clock, queue) = open();
        let worker = WorkerId::new("w1");
        let job = queue.enqueue(command("false").with_max_retries(2)).await.unwrap();

        let mut run_ats = Vec::new();
        for attempt in 1..=3 {
            let claimed = queue.claim_next(&worker).await.unwrap().unwrap();
            assert_eq!(claimed.attempts, attempt);

            let after = queue
                .record_outcome(&claimed, &worker, &ExecutionOutcome::exited(1, ""))
                .await
                .unwrap();
            if attempt < 3 {
                assert_eq!(after.state, JobState::Pending);
                run_ats.push(after.run_at);
                clock.set(after.run_at);
            } else {
                assert_eq!(after.state, JobState::Dead);
                assert_eq!(after.last_error.as_deref(), Some("exit code 1"));
            }
        }

        assert_eq!(run_ats, vec![t0() + chrono::Duration::seconds(1), t0() + chrono::Duration::seconds(3)]);
        let dead = queue.dlq_list().await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, job.id);
        assert_eq!(dead[0].attempts, 3);
    }

    #[tokio::test]
    async fn success_completes_with_one_attempt() {
        let (_dir, _clock, queue) = open();
        let worker = WorkerId::new("w1");
        queue.enqueue(command("true")).await.unwrap();

        let claimed = queue.claim_next(&worker).await.unwrap().unwrap();
        let done = queue
            .record_outcome(&claimed, &worker, &ExecutionOutcome::success())
            .await
            .unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.attempts, 1);

        let status = queue.status().await.unwrap();
        assert_eq!(status.counts.completed, 1);
        assert_eq!(status.active_workers, 0);
    }

    #[tokio::test]
    async fn dlq_retry_round_trip() {
        let (_dir, _clock, queue) = open();
        queue.config_set("max_retries", "0").await.unwrap();
        let worker = WorkerId::new("w1");
        let job = queue.enqueue(command("false")).await.unwrap();

        let claimed = queue.claim_next(&worker).await.unwrap().unwrap();
        let dead = queue
            .record_outcome(&claimed, &worker, &ExecutionOutcome::exited(2, "nope"))
            .await
            .unwrap();
        assert_eq!(dead.state, JobState::Dead);
        assert_eq!(dead.attempts, 1);

        assert!(queue.dlq_retry(job.id).await.unwrap());
        let revived = queue.get_job(job.id).await.unwrap();
        assert_eq!(revived.state, JobState::Pending);
        assert_eq!(revived.attempts, 0);
        assert_eq!(revived.last_error, None);

        assert!(!queue.dlq_retry(job.id).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_job_is_not_found() {
        let (_dir, _clock, queue) = open();
        let id: JobId = "job-01ARZ3NDEKTSV4RRFFQ69G5FAV".parse().unwrap();
        assert!(matches!(queue.get_job(id).await, Err(QueueError::NotFound(_))));
        assert!(!queue.dlq_retry(id).await.unwrap());
    }

    #[tokio::test]
    async fn reaper_counts_lease_expiry_as_a_failed_attempt() {
        let (_dir, clock, queue) = open();
        let ghost = WorkerId::new("ghost");
        queue.enqueue(command("sleep 100")).await.unwrap();
        queue.claim_next(&ghost).await.unwrap().unwrap();

        clock.advance(chrono::Duration::seconds(30));
        let reaped = queue.reap_orphans(Duration::from_secs(10)).await.unwrap();
        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].state, JobState::Pending);
        assert_eq!(reaped[0].last_error.as_deref(), Some(LEASE_EXPIRED));
        assert_eq!(reaped[0].locked_by, None);
    }
}
