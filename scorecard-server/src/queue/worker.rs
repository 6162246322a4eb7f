//! Worker pools over the durable queue.
//!
//! Each stage runs a small fixed number of workers that poll their queue,
//! execute the stage handler, and record the outcome. A worker never dies
//! on a job error; the queue's retry machinery owns failure handling.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{error, info, warn};

use super::{claim, complete, fail, prune, sweep_stalled, ClaimedJob, FailOutcome, QueueName,
    STALL_WINDOW};
use crate::db::Store;
use crate::metrics::Metrics;

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60);

/// A stage handler. Must be idempotent: the broker is at-least-once and a
/// stalled claim is re-delivered to another worker.
#[async_trait]
pub trait JobHandler: Send + Sync + 'static {
    async fn handle(&self, job: &ClaimedJob) -> Result<()>;
}

/// Spawn `concurrency` workers for one stage queue.
pub fn spawn_stage_workers(
    db: Store,
    metrics: Arc<Metrics>,
    queue: QueueName,
    concurrency: usize,
    handler: Arc<dyn JobHandler>,
) -> Vec<JoinHandle<()>> {
    (0..concurrency)
        .map(|i| {
            let db = db.clone();
            let metrics = metrics.clone();
            let handler = handler.clone();
            let tag = format!("{}-{}", queue.as_str(), i);
            tokio::spawn(async move {
                info!(worker = %tag, "worker started");
                let mut ticker = interval(POLL_INTERVAL);
                loop {
                    ticker.tick().await;
                    // Drain everything runnable before sleeping again.
                    loop {
                        match next_job(&db, queue, &tag).await {
                            Ok(Some(job)) => {
                                run_one(&db, &metrics, &handler, job).await;
                            }
                            Ok(None) => break,
                            Err(e) => {
                                error!(worker = %tag, "claim failed: {:#}", e);
                                break;
                            }
                        }
                    }
                }
            })
        })
        .collect()
}

async fn next_job(db: &Store, queue: QueueName, tag: &str) -> Result<Option<ClaimedJob>> {
    let tag = tag.to_string();
    db.run(move |d| claim(d, queue, &tag)).await
}

async fn run_one(
    db: &Store,
    metrics: &Arc<Metrics>,
    handler: &Arc<dyn JobHandler>,
    job: ClaimedJob,
) {
    let stage = metrics.stage(job.queue);
    let started = Instant::now();
    match handler.handle(&job).await {
        Ok(()) => {
            stage.duration.observe(started.elapsed());
            stage.completed.inc();
            let id = job.id;
            if let Err(e) = db.run(move |d| complete(d, id)).await {
                error!("failed to mark job {} completed: {:#}", id, e);
            }
        }
        Err(e) => {
            stage.duration.observe(started.elapsed());
            stage.failed.inc();
            let reason = format!("{:#}", e);
            warn!(
                queue = job.queue.as_str(),
                job_id = job.id,
                attempt = job.attempts + 1,
                "job failed: {}",
                reason
            );
            let job_clone = job.clone();
            match db.run(move |d| fail(d, &job_clone, &reason)).await {
                Ok(FailOutcome::Dead) => {
                    stage.dead.inc();
                    error!(
                        queue = job.queue.as_str(),
                        job_id = job.id,
                        "job exhausted its retry budget"
                    );
                }
                Ok(FailOutcome::Retried { attempt }) => {
                    info!(
                        queue = job.queue.as_str(),
                        job_id = job.id,
                        attempt, "job rescheduled"
                    );
                }
                Err(e) => error!("failed to record job failure: {:#}", e),
            }
        }
    }
}

/// Spawn the shared maintenance loop: stalled-claim re-delivery and
/// retention pruning.
pub fn spawn_maintenance(db: Store) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(MAINTENANCE_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = db.run(|d| sweep_stalled(d, STALL_WINDOW)).await {
                error!("stall sweep failed: {:#}", e);
            }
            if let Err(e) = db.run(prune).await {
                error!("queue prune failed: {:#}", e);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::job::review_payload;
    use crate::queue::{counts, enqueue};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct CountingHandler {
        calls: AtomicU32,
        fail_first: bool,
    }

    #[async_trait]
    impl JobHandler for CountingHandler {
        async fn handle(&self, _job: &ClaimedJob) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && n == 0 {
                anyhow::bail!("transient failure");
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn worker_completes_queued_jobs() {
        let db = Store::new(crate::db::Database::new_in_memory().unwrap());
        let metrics = Arc::new(Metrics::new());
        db.run(|d| enqueue(d, &review_payload("sub-1", 1)))
            .await
            .unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: false,
        });
        let handles =
            spawn_stage_workers(db.clone(), metrics.clone(), QueueName::Review, 1, handler.clone());

        // Wait for the worker to drain the queue.
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let c = db.run(|d| counts(d, QueueName::Review)).await.unwrap();
            if c.completed == 1 {
                break;
            }
        }
        for h in handles {
            h.abort();
        }

        assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
        assert_eq!(metrics.review.completed.get(), 1);
    }

    #[tokio::test]
    async fn failed_job_is_left_for_retry() {
        let db = Store::new(crate::db::Database::new_in_memory().unwrap());
        let metrics = Arc::new(Metrics::new());
        db.run(|d| enqueue(d, &review_payload("sub-1", 1)))
            .await
            .unwrap();

        let handler = Arc::new(CountingHandler {
            calls: AtomicU32::new(0),
            fail_first: true,
        });
        let handles =
            spawn_stage_workers(db.clone(), metrics.clone(), QueueName::Review, 1, handler.clone());

        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            if metrics.review.failed.get() == 1 {
                break;
            }
        }
        for h in handles {
            h.abort();
        }

        // One failed attempt, job requeued with backoff (not yet runnable).
        let c = db.run(|d| counts(d, QueueName::Review)).await.unwrap();
        assert_eq!(c.queued, 1);
        assert_eq!(metrics.review.failed.get(), 1);
        assert_eq!(metrics.review.dead.get(), 0);
    }
}
