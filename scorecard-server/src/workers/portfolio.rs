//! Portfolio stage: build the shareable artifact for a reviewed
//! submission and raise the domain event.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::info;
use uuid::Uuid;

use crate::db::{PortfolioRecord, SubmissionStatus};
use crate::events::DomainEvent;
use crate::AppState;

pub async fn handle(state: &Arc<AppState>, submission_id: &str) -> Result<()> {
    let id = submission_id.to_string();
    let submission = state
        .db
        .run(move |d| d.find_submission(&id))
        .await?
        .with_context(|| format!("submission {} not found", submission_id))?;

    let id = submission_id.to_string();
    let score = state
        .db
        .run(move |d| d.get_score(&id))
        .await?
        .with_context(|| format!("no score for submission {}", submission_id))?;

    // Keep the share token stable across re-deliveries.
    let id = submission_id.to_string();
    let existing = state.db.run(move |d| d.get_portfolio(&id)).await?;
    let share_token = existing
        .map(|p| p.share_token)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let record = PortfolioRecord {
        submission_id: submission.id.clone(),
        share_token: share_token.clone(),
        summary: score.summary.clone(),
        total: score.total,
        badge: score.badge.as_str().to_string(),
    };
    state
        .db
        .run(move |d| d.upsert_portfolio(&record))
        .await
        .context("failed to upsert portfolio")?;

    let id = submission_id.to_string();
    state
        .db
        .run(move |d| d.set_submission_status(&id, SubmissionStatus::PortfolioReady))
        .await?;

    state.bus.publish(DomainEvent::PortfolioReady {
        submission_id: submission.id.clone(),
        user_id: submission.user_id.clone(),
        share_token,
    });

    info!(submission_id, "portfolio artifact ready");
    Ok(())
}
