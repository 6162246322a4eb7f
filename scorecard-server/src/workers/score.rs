//! Score stage: finalize the submission status once a score exists, raise
//! the domain event, and chain the Portfolio stage.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::db::SubmissionStatus;
use crate::events::DomainEvent;
use crate::queue::{self, JobPayload};
use crate::AppState;

pub async fn handle(state: &Arc<AppState>, submission_id: &str) -> Result<()> {
    let id = submission_id.to_string();
    let submission = state
        .db
        .run(move |d| d.find_submission(&id))
        .await?
        .with_context(|| format!("submission {} not found", submission_id))?;

    let id = submission_id.to_string();
    let Some(score) = state.db.run(move |d| d.get_score(&id)).await? else {
        // The review stage chains this job only after the score upsert, so
        // a missing row is a transient ordering problem worth retrying.
        bail!("score for submission {} not persisted yet", submission_id);
    };

    let id = submission_id.to_string();
    state
        .db
        .run(move |d| d.set_submission_status(&id, SubmissionStatus::Reviewed))
        .await?;

    state.bus.publish(DomainEvent::ScoreReady {
        submission_id: submission.id.clone(),
        user_id: submission.user_id.clone(),
        total: score.total,
        badge: score.badge.as_str().to_string(),
    });

    let payload = JobPayload::Portfolio {
        submission_id: submission.id.clone(),
    };
    state
        .db
        .run(move |d| queue::enqueue(d, &payload))
        .await
        .context("failed to enqueue portfolio job")?;

    info!(
        submission_id,
        total = score.total,
        "submission finalized as reviewed"
    );
    Ok(())
}
