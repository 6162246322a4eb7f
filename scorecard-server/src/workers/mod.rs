//! Stage workers: one handler per pipeline stage, dispatched from the
//! shared queue worker pool.

pub mod notification;
pub mod portfolio;
pub mod review;
pub mod score;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use tokio::task::JoinHandle;

use crate::queue::worker::{spawn_maintenance, spawn_stage_workers, JobHandler};
use crate::queue::{ClaimedJob, JobPayload, QueueName};
use crate::AppState;

pub struct PipelineHandler {
    state: Arc<AppState>,
}

#[async_trait]
impl JobHandler for PipelineHandler {
    async fn handle(&self, job: &ClaimedJob) -> Result<()> {
        match &job.payload {
            JobPayload::Review {
                submission_id,
                repo_owner,
                repo_name,
                pr_number,
                installation_id,
                ci_conclusion,
                ..
            } => {
                review::handle(
                    &self.state,
                    submission_id,
                    repo_owner,
                    repo_name,
                    *pr_number,
                    *installation_id,
                    ci_conclusion.as_deref(),
                )
                .await
            }
            JobPayload::Score { submission_id } => score::handle(&self.state, submission_id).await,
            JobPayload::Portfolio { submission_id } => {
                portfolio::handle(&self.state, submission_id).await
            }
            JobPayload::Notification { event } => notification::handle(&self.state, event).await,
        }
    }
}

/// Spawn every stage's worker pool plus the queue maintenance loop.
pub fn spawn_all(state: Arc<AppState>) -> Vec<JoinHandle<()>> {
    let handler: Arc<dyn JobHandler> = Arc::new(PipelineHandler {
        state: state.clone(),
    });
    let concurrency = state.config.concurrency;

    let mut handles = Vec::new();
    for (queue, workers) in [
        (QueueName::Review, concurrency.review),
        (QueueName::Score, concurrency.score),
        (QueueName::Portfolio, concurrency.portfolio),
        (QueueName::Notification, concurrency.notification),
    ] {
        handles.extend(spawn_stage_workers(
            state.db.clone(),
            state.metrics.clone(),
            queue,
            workers,
            handler.clone(),
        ));
    }
    handles.push(spawn_maintenance(state.db.clone()));
    handles
}
