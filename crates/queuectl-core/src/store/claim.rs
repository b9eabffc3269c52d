//! Claiming and settling jobs.
//!
//! 方針:
//! - claim は `BEGIN IMMEDIATE` + 条件付き UPDATE (`WHERE state='pending'`) で行う
//! - UPDATE が 1 行に当たらなければ負け。次の候補を試す
//! - 結果の記録は `state='processing' AND locked_by=<自分>` のときだけ許す

use chrono::{DateTime, Utc};
use rusqlite::{TransactionBehavior, params};
use tracing::debug;

use super::{JOB_COLUMNS, SqliteStore, StoreError, is_busy, ms, read_job_row};
use crate::domain::{Decision, JobId, JobRecord, JobState, WorkerId};

/// Rounds of "pick a candidate, try to take it" before giving up for this poll.
const MAX_CLAIM_ROUNDS: usize = 8;

/// How a processing job leaves `processing`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Settlement {
    Completed,
    Retry {
        next_run_at: DateTime<Utc>,
        error: String,
    },
    Dead {
        error: String,
    },
}

impl From<Decision> for Settlement {
    fn from(decision: Decision) -> Self {
        match decision {
            Decision::Retry {
                next_run_at, error, ..
            } => Settlement::Retry { next_run_at, error },
            Decision::MarkDead { error } => Settlement::Dead { error },
        }
    }
}

impl Settlement {
    fn apply(self, job: &mut JobRecord, now: DateTime<Utc>) {
        match self {
            Settlement::Completed => job.mark_completed(now),
            Settlement::Retry { next_run_at, error } => job.schedule_retry(next_run_at, error, now),
            Settlement::Dead { error } => job.mark_dead(error, now),
        }
    }
}

impl SqliteStore {
    /// Atomically take the oldest eligible pending job for `worker`.
    ///
    /// Eligible means `state = pending` and `run_at <= now`, ordered by
    /// `(run_at, id)`. Returns `None` when nothing is eligible. Claims are
    /// exclusive across every connection to the same database.
    pub fn claim_next(
        &mut self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StoreError> {
        for round in 0..MAX_CLAIM_ROUNDS {
            match self.try_claim(worker, now) {
                Ok(claimed) => return Ok(claimed),
                Err(StoreError::Conflict(reason)) => {
                    debug!(worker = %worker, round, reason = %reason, "claim lost, retrying");
                }
                Err(StoreError::Sql(err)) if is_busy(&err) => {
                    debug!(worker = %worker, round, "database busy during claim");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(None)
    }

    fn try_claim(
        &mut self,
        worker: &WorkerId,
        now: DateTime<Utc>,
    ) -> Result<Option<JobRecord>, StoreError> {
        let now_ms = ms(now);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let candidate: Option<String> = {
            let mut stmt = tx.prepare(
                "SELECT id FROM jobs \
                 WHERE state = 'pending' AND run_at_ms <= ?1 \
                 ORDER BY run_at_ms ASC, id ASC \
                 LIMIT 1",
            )?;
            let mut rows = stmt.query(params![now_ms])?;
            match rows.next()? {
                Some(row) => Some(row.get(0)?),
                None => None,
            }
        };

        let Some(id) = candidate else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE jobs \
             SET state = 'processing', locked_by = ?2, attempts = attempts + 1, updated_at_ms = ?3 \
             WHERE id = ?1 AND state = 'pending' AND run_at_ms <= ?3",
            params![id, worker.as_str(), now_ms],
        )?;
        if changed != 1 {
            return Err(StoreError::Conflict(format!("job {id} was claimed elsewhere")));
        }

        let job = tx.query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            params![id],
            read_job_row,
        )?;
        tx.commit()?;
        Ok(Some(job))
    }

    /// Record the outcome of an attempt.
    ///
    /// Only the worker holding the lock may settle the job. Anything else
    /// (job no longer processing, lock held by another worker) is a conflict
    /// and leaves the row untouched.
    pub fn settle(
        &mut self,
        id: &JobId,
        worker: &WorkerId,
        settlement: Settlement,
        now: DateTime<Utc>,
    ) -> Result<JobRecord, StoreError> {
        self.update(id, |job| {
            if !job.is_locked_by(worker) {
                return Err(StoreError::Conflict(format!(
                    "job {} is {} and not held by {}",
                    job.id, job.state, worker
                )));
            }
            settlement.apply(job, now);
            Ok(())
        })
    }

    /// Release jobs stuck in `processing` whose owner has not heartbeated
    /// within `lease`.
    ///
    /// `decide` picks what happens to each orphan; it sees the job as it was
    /// when found. Returns the settled jobs.
    pub fn reap_orphans<F>(
        &mut self,
        lease: std::time::Duration,
        now: DateTime<Utc>,
        mut decide: F,
    ) -> Result<Vec<JobRecord>, StoreError>
    where
        F: FnMut(&JobRecord) -> Settlement,
    {
        let lease_ms = i64::try_from(lease.as_millis()).unwrap_or(i64::MAX);
        let cutoff = ms(now).saturating_sub(lease_ms);

        let orphans: Vec<JobRecord> = {
            let mut stmt = self.conn.prepare(&format!(
                "SELECT {JOB_COLUMNS} FROM jobs j \
                 WHERE j.state = 'processing' \
                   AND j.updated_at_ms <= ?1 \
                   AND NOT EXISTS ( \
                     SELECT 1 FROM workers w \
                     WHERE w.id = j.locked_by AND w.heartbeat_at_ms > ?1 \
                   ) \
                 ORDER BY j.updated_at_ms ASC, j.id ASC"
            ))?;
            let rows = stmt.query_map(params![cutoff], read_job_row)?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut reaped = Vec::with_capacity(orphans.len());
        for orphan in orphans {
            let Some(owner) = orphan.locked_by.clone() else {
                continue;
            };
            let settlement = decide(&orphan);
            match self.settle(&orphan.id, &owner, settlement, now) {
                Ok(job) => reaped.push(job),
                // Owner finished it meanwhile.
                Err(StoreError::Conflict(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(reaped)
    }
}

#[cfg(test)]
mod tests {
    use super::super::tests::{open_temp, pending_job, t0};
    use super::*;
    use crate::store::WorkerEntry;
    use chrono::Duration;
    use std::collections::HashSet;
    use std::sync::{Arc, Barrier};

    fn lock_holder(store: &SqliteStore, id: &JobId) -> Option<WorkerId> {
        store.read(id).unwrap().locked_by
    }

    #[test]
    fn claims_oldest_eligible_first() {
        let (_dir, mut store) = open_temp();
        let later = pending_job("later", t0() - Duration::seconds(1));
        let earlier = pending_job("earlier", t0() - Duration::seconds(10));
        let future = pending_job("future", t0() + Duration::seconds(60));
        store.create(&later).unwrap();
        store.create(&earlier).unwrap();
        store.create(&future).unwrap();

        let w = WorkerId::new("w1");
        let first = store.claim_next(&w, t0()).unwrap().unwrap();
        assert_eq!(first.id, earlier.id);
        assert_eq!(first.state, JobState::Processing);
        assert_eq!(first.attempts, 1);
        assert_eq!(first.locked_by.as_ref(), Some(&w));

        let second = store.claim_next(&w, t0()).unwrap().unwrap();
        assert_eq!(second.id, later.id);

        assert!(store.claim_next(&w, t0()).unwrap().is_none());
    }

    #[test]
    fn future_job_becomes_eligible_at_run_at() {
        let (_dir, mut store) = open_temp();
        let at = t0() + Duration::seconds(30);
        let job = pending_job("true", at);
        store.create(&job).unwrap();

        let w = WorkerId::new("w1");
        assert!(store.claim_next(&w, t0()).unwrap().is_none());
        assert_eq!(store.claim_next(&w, at).unwrap().unwrap().id, job.id);
    }

    #[test]
    fn settle_completes_and_releases_lock() {
        let (_dir, mut store) = open_temp();
        let job = pending_job("true", t0());
        store.create(&job).unwrap();
        let w = WorkerId::new("w1");
        store.claim_next(&w, t0()).unwrap().unwrap();

        let done = store
            .settle(&job.id, &w, Settlement::Completed, t0())
            .unwrap();
        assert_eq!(done.state, JobState::Completed);
        assert_eq!(done.locked_by, None);
        assert!(lock_holder(&store, &job.id).is_none());
    }

    #[test]
    fn settle_retry_keeps_attempts_and_reschedules() {
        let (_dir, mut store) = open_temp();
        let job = pending_job("false", t0());
        store.create(&job).unwrap();
        let w = WorkerId::new("w1");
        store.claim_next(&w, t0()).unwrap().unwrap();

        let next = t0() + Duration::seconds(1);
        let retried = store
            .settle(
                &job.id,
                &w,
                Settlement::Retry {
                    next_run_at: next,
                    error: "exit code 1".into(),
                },
                t0(),
            )
            .unwrap();
        assert_eq!(retried.state, JobState::Pending);
        assert_eq!(retried.attempts, 1);
        assert_eq!(retried.run_at, next);
        assert_eq!(retried.last_error.as_deref(), Some("exit code 1"));

        assert!(store.claim_next(&w, t0()).unwrap().is_none());
        let again = store.claim_next(&w, next).unwrap().unwrap();
        assert_eq!(again.attempts, 2);
    }

    #[test]
    fn settle_by_non_owner_is_conflict() {
        let (_dir, mut store) = open_temp();
        let job = pending_job("true", t0());
        store.create(&job).unwrap();
        store.claim_next(&WorkerId::new("owner"), t0()).unwrap().unwrap();

        let err = store
            .settle(&job.id, &WorkerId::new("intruder"), Settlement::Completed, t0())
            .unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(store.read(&job.id).unwrap().state, JobState::Processing);
    }

    #[test]
    fn settle_twice_is_conflict() {
        let (_dir, mut store) = open_temp();
        let job = pending_job("true", t0());
        store.create(&job).unwrap();
        let w = WorkerId::new("w1");
        store.claim_next(&w, t0()).unwrap().unwrap();
        store.settle(&job.id, &w, Settlement::Completed, t0()).unwrap();

        assert!(store
            .settle(&job.id, &w, Settlement::Completed, t0())
            .unwrap_err()
            .is_conflict());
    }

    #[test]
    fn concurrent_connections_never_share_a_job() {
        const JOBS: usize = 40;
        const WORKERS: usize = 4;

        let (dir, mut store) = open_temp();
        for i in 0..JOBS {
            store.create(&pending_job(&format!("job {i}"), t0())).unwrap();
        }

        let barrier = Arc::new(Barrier::new(WORKERS));
        let handles: Vec<_> = (0..WORKERS)
            .map(|n| {
                let home = dir.path().to_path_buf();
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    let mut store = SqliteStore::open(home).unwrap();
                    let worker = WorkerId::new(format!("w{n}"));
                    barrier.wait();
                    let mut mine = Vec::new();
                    let mut idle_rounds = 0;
                    while idle_rounds < 3 {
                        match store.claim_next(&worker, t0()).unwrap() {
                            Some(job) => {
                                idle_rounds = 0;
                                store
                                    .settle(&job.id, &worker, Settlement::Completed, t0())
                                    .unwrap();
                                mine.push(job.id);
                            }
                            None => idle_rounds += 1,
                        }
                    }
                    mine
                })
            })
            .collect();

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.join().unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(total, JOBS);
        assert_eq!(store.counts_by_state().unwrap().completed, JOBS);
    }

    #[test]
    fn reaper_releases_jobs_of_silent_workers() {
        let (_dir, mut store) = open_temp();
        store.create(&pending_job("sleep 100", t0())).unwrap();
        store.create(&pending_job("sleep 100", t0())).unwrap();

        let gone = WorkerId::new("gone");
        let alive = WorkerId::new("alive");
        let gone_job = store.claim_next(&gone, t0()).unwrap().unwrap();
        let alive_job = store.claim_next(&alive, t0()).unwrap().unwrap();
        assert_eq!(gone_job.locked_by.as_ref(), Some(&gone));

        let later = t0() + Duration::seconds(120);
        store
            .register_worker(&WorkerEntry::new(alive.clone(), None, 500, later))
            .unwrap();

        let reaped = store
            .reap_orphans(std::time::Duration::from_secs(60), later, |_| {
                Settlement::Retry {
                    next_run_at: later,
                    error: "lease expired".into(),
                }
            })
            .unwrap();

        assert_eq!(reaped.len(), 1);
        assert_eq!(reaped[0].id, gone_job.id);
        assert_eq!(reaped[0].state, JobState::Pending);
        assert_eq!(reaped[0].last_error.as_deref(), Some("lease expired"));
        assert_eq!(
            lock_holder(&store, &alive_job.id).as_ref(),
            Some(&alive)
        );
    }

    #[test]
    fn reaper_leaves_fresh_claims_alone() {
        let (_dir, mut store) = open_temp();
        store.create(&pending_job("true", t0())).unwrap();
        store.claim_next(&WorkerId::new("w"), t0()).unwrap().unwrap();

        let reaped = store
            .reap_orphans(std::time::Duration::from_secs(60), t0() + Duration::seconds(10), |_| {
                Settlement::Dead {
                    error: "lease expired".into(),
                }
            })
            .unwrap();
        assert!(reaped.is_empty());
    }
}
