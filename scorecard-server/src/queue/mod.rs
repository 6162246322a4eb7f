//! Durable at-least-once job queue on SQLite.
//!
//! One logical queue per pipeline stage. Jobs are claimed oldest-first,
//! retried with exponential backoff up to a per-stage attempt budget, and
//! either completed, marked dead, or — for the Review stage — copied into
//! the dead-letter store before being marked dead. Completed and dead jobs
//! are pruned by age and count; dead-letter records never are.

pub mod backoff;
pub mod job;
pub mod worker;

use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::warn;

use crate::db::{now_ts, Database};
use crate::dead_letter;
pub use job::{JobPayload, ReviewTrigger};

/// How long completed jobs are kept for operator visibility.
const COMPLETED_RETENTION: Duration = Duration::from_secs(3600);

/// Completed jobs kept per queue regardless of age.
const COMPLETED_KEEP_COUNT: i64 = 200;

/// How long dead jobs are kept before pruning (their dead-letter copies,
/// where applicable, are permanent).
const DEAD_RETENTION: Duration = Duration::from_secs(7 * 24 * 3600);

/// A claim older than this is considered abandoned and re-delivered.
pub const STALL_WINDOW: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueName {
    Review,
    Score,
    Portfolio,
    Notification,
}

impl QueueName {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::Review => "review",
            QueueName::Score => "score",
            QueueName::Portfolio => "portfolio",
            QueueName::Notification => "notification",
        }
    }

    pub fn all() -> [QueueName; 4] {
        [
            QueueName::Review,
            QueueName::Score,
            QueueName::Portfolio,
            QueueName::Notification,
        ]
    }

    /// Attempt budget per stage. Review and Score tolerate more transient
    /// failure (external APIs, LLM) than Portfolio and Notification.
    pub fn max_attempts(&self) -> u32 {
        match self {
            QueueName::Review | QueueName::Score => 5,
            QueueName::Portfolio | QueueName::Notification => 3,
        }
    }

    pub fn for_payload(payload: &JobPayload) -> QueueName {
        match payload {
            JobPayload::Review { .. } => QueueName::Review,
            JobPayload::Score { .. } => QueueName::Score,
            JobPayload::Portfolio { .. } => QueueName::Portfolio,
            JobPayload::Notification { .. } => QueueName::Notification,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: i64,
    pub queue: QueueName,
    pub payload: JobPayload,
    /// Attempts so far, not counting the one that just claimed it.
    pub attempts: u32,
    pub max_attempts: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Requeued with backoff; retries remain.
    Retried { attempt: u32 },
    /// Budget exhausted; job is dead (and dead-lettered if Review).
    Dead,
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct QueueCounts {
    pub queued: u64,
    pub active: u64,
    pub completed: u64,
    /// Jobs that exhausted their retry budget.
    pub dead: u64,
}

fn ts_after(delta: Duration) -> String {
    (Utc::now() + chrono::Duration::from_std(delta).unwrap_or(chrono::Duration::zero()))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_before(delta: Duration) -> String {
    (Utc::now() - chrono::Duration::from_std(delta).unwrap_or(chrono::Duration::zero()))
        .to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Validate and enqueue a job on its stage queue, runnable immediately.
pub fn enqueue(db: &Database, payload: &JobPayload) -> Result<i64> {
    payload.validate()?;
    let queue = QueueName::for_payload(payload);
    let body = serde_json::to_string(payload)?;
    db.with_conn(|conn| {
        conn.execute(
            "INSERT INTO jobs (queue, payload, max_attempts, run_at, created_at)
             VALUES (?1, ?2, ?3, ?4, ?4)",
            params![queue.as_str(), body, queue.max_attempts(), now_ts()],
        )
        .context("enqueue job")?;
        Ok(conn.last_insert_rowid())
    })
}

/// Claim the oldest runnable job on a queue, if any.
pub fn claim(db: &Database, queue: QueueName, worker_tag: &str) -> Result<Option<ClaimedJob>> {
    db.with_conn(|conn| {
        let now = now_ts();
        let row: Option<(i64, String, u32, u32)> = conn
            .query_row(
                "SELECT id, payload, attempts, max_attempts FROM jobs
                 WHERE queue = ?1 AND status = 'queued' AND run_at <= ?2
                 ORDER BY id LIMIT 1",
                params![queue.as_str(), now],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()
            .context("select runnable job")?;

        let Some((id, body, attempts, max_attempts)) = row else {
            return Ok(None);
        };

        conn.execute(
            "UPDATE jobs SET status = 'active', claimed_by = ?1, claimed_at = ?2
             WHERE id = ?3 AND status = 'queued'",
            params![worker_tag, now, id],
        )
        .context("claim job")?;

        let payload: JobPayload = serde_json::from_str(&body).context("parse job payload")?;
        Ok(Some(ClaimedJob {
            id,
            queue,
            payload,
            attempts,
            max_attempts,
        }))
    })
}

pub fn complete(db: &Database, job_id: i64) -> Result<()> {
    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'completed', attempts = attempts + 1,
                 finished_at = ?1, claimed_by = NULL, claimed_at = NULL
             WHERE id = ?2",
            params![now_ts(), job_id],
        )
        .context("complete job")?;
        Ok(())
    })
}

/// Record a failed attempt: reschedule with backoff while budget remains,
/// otherwise mark dead (copying Review jobs to the dead-letter store first).
pub fn fail(db: &Database, job: &ClaimedJob, error: &str) -> Result<FailOutcome> {
    let attempt = job.attempts + 1;

    if attempt < job.max_attempts {
        let run_at = ts_after(backoff::retry_delay(attempt));
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET status = 'queued', attempts = ?1, run_at = ?2,
                     last_error = ?3, claimed_by = NULL, claimed_at = NULL
                 WHERE id = ?4",
                params![attempt, run_at, error, job.id],
            )
            .context("requeue failed job")?;
            Ok(())
        })?;
        return Ok(FailOutcome::Retried { attempt });
    }

    // Budget exhausted. Review-stage jobs carry a student submission that
    // would otherwise be silently stuck, so they go to the audit trail.
    if job.queue == QueueName::Review {
        let payload = serde_json::to_value(&job.payload)?;
        dead_letter::append(
            db,
            job.queue.as_str(),
            &payload,
            error,
            None,
            job.payload.submission_id(),
            job.payload.pr_number(),
        )?;
    }

    db.with_conn(|conn| {
        conn.execute(
            "UPDATE jobs SET status = 'dead', attempts = ?1, last_error = ?2,
                 finished_at = ?3, claimed_by = NULL, claimed_at = NULL
             WHERE id = ?4",
            params![attempt, error, now_ts(), job.id],
        )
        .context("mark job dead")?;
        Ok(())
    })?;
    Ok(FailOutcome::Dead)
}

/// Requeue active jobs whose claim is older than the stall window.
/// Returns the number of jobs re-delivered.
pub fn sweep_stalled(db: &Database, stall_window: Duration) -> Result<u64> {
    let cutoff = ts_before(stall_window);
    let swept = db.with_conn(|conn| {
        let n = conn
            .execute(
                "UPDATE jobs SET status = 'queued', claimed_by = NULL, claimed_at = NULL,
                     run_at = ?1
                 WHERE status = 'active' AND claimed_at < ?2",
                params![now_ts(), cutoff],
            )
            .context("sweep stalled jobs")?;
        Ok(n as u64)
    })?;
    if swept > 0 {
        warn!("re-delivered {} stalled job(s)", swept);
    }
    Ok(swept)
}

/// Prune completed jobs by age and count, and dead jobs by age.
pub fn prune(db: &Database) -> Result<()> {
    let completed_cutoff = ts_before(COMPLETED_RETENTION);
    let dead_cutoff = ts_before(DEAD_RETENTION);
    db.with_conn(|conn| {
        conn.execute(
            "DELETE FROM jobs WHERE status = 'completed' AND finished_at < ?1",
            params![completed_cutoff],
        )?;
        for queue in QueueName::all() {
            conn.execute(
                "DELETE FROM jobs WHERE status = 'completed' AND queue = ?1 AND id NOT IN (
                     SELECT id FROM jobs WHERE status = 'completed' AND queue = ?1
                     ORDER BY id DESC LIMIT ?2
                 )",
                params![queue.as_str(), COMPLETED_KEEP_COUNT],
            )?;
        }
        conn.execute(
            "DELETE FROM jobs WHERE status = 'dead' AND finished_at < ?1",
            params![dead_cutoff],
        )?;
        Ok(())
    })
}

/// Per-status job counts for one queue, for /health.
pub fn counts(db: &Database, queue: QueueName) -> Result<QueueCounts> {
    db.with_conn(|conn| {
        let mut stmt = conn.prepare(
            "SELECT status, COUNT(*) FROM jobs WHERE queue = ?1 GROUP BY status",
        )?;
        let rows = stmt.query_map(params![queue.as_str()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = QueueCounts::default();
        for row in rows {
            let (status, n) = row?;
            let n = n as u64;
            match status.as_str() {
                "queued" => counts.queued = n,
                "active" => counts.active = n,
                "completed" => counts.completed = n,
                "dead" => counts.dead = n,
                _ => {}
            }
        }
        Ok(counts)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::review_payload;

    fn db() -> Database {
        Database::new_in_memory().unwrap()
    }

    #[test]
    fn enqueue_rejects_invalid_payloads() {
        let db = db();
        assert!(enqueue(&db, &review_payload("", 7)).is_err());
        assert_eq!(counts(&db, QueueName::Review).unwrap().queued, 0);
    }

    #[test]
    fn claim_returns_oldest_runnable_job() {
        let db = db();
        enqueue(&db, &review_payload("sub-1", 1)).unwrap();
        enqueue(&db, &review_payload("sub-2", 2)).unwrap();

        let job = claim(&db, QueueName::Review, "w1").unwrap().unwrap();
        assert_eq!(job.payload.submission_id(), Some("sub-1"));

        let job2 = claim(&db, QueueName::Review, "w1").unwrap().unwrap();
        assert_eq!(job2.payload.submission_id(), Some("sub-2"));

        assert!(claim(&db, QueueName::Review, "w1").unwrap().is_none());
    }

    #[test]
    fn complete_moves_job_out_of_active() {
        let db = db();
        enqueue(&db, &review_payload("sub-1", 1)).unwrap();
        let job = claim(&db, QueueName::Review, "w1").unwrap().unwrap();
        complete(&db, job.id).unwrap();
        let c = counts(&db, QueueName::Review).unwrap();
        assert_eq!(c.completed, 1);
        assert_eq!(c.active, 0);
    }

    #[test]
    fn failed_job_is_rescheduled_with_backoff() {
        let db = db();
        enqueue(&db, &review_payload("sub-1", 1)).unwrap();
        let job = claim(&db, QueueName::Review, "w1").unwrap().unwrap();

        let outcome = fail(&db, &job, "api timeout").unwrap();
        assert_eq!(outcome, FailOutcome::Retried { attempt: 1 });

        // Not runnable yet: run_at is in the future.
        assert!(claim(&db, QueueName::Review, "w1").unwrap().is_none());
        assert_eq!(counts(&db, QueueName::Review).unwrap().queued, 1);
    }

    #[test]
    fn exhausted_review_job_is_dead_lettered() {
        let db = db();
        enqueue(&db, &review_payload("sub-1", 7)).unwrap();

        let mut outcome = FailOutcome::Retried { attempt: 0 };
        for _ in 0..QueueName::Review.max_attempts() {
            // Force runnable regardless of backoff.
            db.with_conn(|conn| {
                conn.execute("UPDATE jobs SET run_at = '2000-01-01T00:00:00.000Z'", [])?;
                Ok(())
            })
            .unwrap();
            let job = claim(&db, QueueName::Review, "w1").unwrap().unwrap();
            outcome = fail(&db, &job, "permanent failure").unwrap();
        }

        assert_eq!(outcome, FailOutcome::Dead);
        assert_eq!(counts(&db, QueueName::Review).unwrap().dead, 1);

        let records = crate::dead_letter::list_for_submission(&db, "sub-1").unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].queue, "review");
        assert_eq!(records[0].pr_number, Some(7));
    }

    #[test]
    fn exhausted_notification_job_is_not_dead_lettered() {
        let db = db();
        let payload = JobPayload::Notification {
            event: crate::events::DomainEvent::CompanySignup {
                company_name: "acme".into(),
                admin_user_id: "u1".into(),
            },
        };
        enqueue(&db, &payload).unwrap();

        for _ in 0..QueueName::Notification.max_attempts() {
            db.with_conn(|conn| {
                conn.execute("UPDATE jobs SET run_at = '2000-01-01T00:00:00.000Z'", [])?;
                Ok(())
            })
            .unwrap();
            let job = claim(&db, QueueName::Notification, "w1").unwrap().unwrap();
            fail(&db, &job, "smtp down").unwrap();
        }

        assert_eq!(counts(&db, QueueName::Notification).unwrap().dead, 1);
        assert_eq!(crate::dead_letter::count(&db).unwrap(), 0);
    }

    #[test]
    fn stalled_active_jobs_are_redelivered() {
        let db = db();
        enqueue(&db, &review_payload("sub-1", 1)).unwrap();
        let job = claim(&db, QueueName::Review, "w1").unwrap().unwrap();

        // Nothing to sweep while the claim is fresh.
        assert_eq!(sweep_stalled(&db, STALL_WINDOW).unwrap(), 0);

        // Backdate the claim past the stall window.
        db.with_conn(|conn| {
            conn.execute(
                "UPDATE jobs SET claimed_at = '2000-01-01T00:00:00.000Z' WHERE id = ?1",
                params![job.id],
            )?;
            Ok(())
        })
        .unwrap();

        assert_eq!(sweep_stalled(&db, STALL_WINDOW).unwrap(), 1);
        assert!(claim(&db, QueueName::Review, "w2").unwrap().is_some());
    }

    #[test]
    fn prune_drops_old_completed_jobs_only() {
        let db = db();
        enqueue(&db, &review_payload("sub-1", 1)).unwrap();
        let job = claim(&db, QueueName::Review, "w1").unwrap().unwrap();
        complete(&db, job.id).unwrap();

        // Fresh completed job survives.
        prune(&db).unwrap();
        assert_eq!(counts(&db, QueueName::Review).unwrap().completed, 1);

        db.with_conn(|conn| {
            conn.execute("UPDATE jobs SET finished_at = '2000-01-01T00:00:00.000Z'", [])?;
            Ok(())
        })
        .unwrap();
        prune(&db).unwrap();
        assert_eq!(counts(&db, QueueName::Review).unwrap().completed, 0);
    }
}
