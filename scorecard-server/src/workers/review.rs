//! The PR review worker: a strict ordered pipeline for one job.
//!
//! Credential, metadata and diff fetches are fatal for the attempt (the
//! queue retries them); analyzers, CI and the LLM degrade instead of
//! failing. If anything goes wrong after static analysis has succeeded, a
//! static-only partial review is persisted best-effort before the error is
//! re-thrown, so a later retry or an operator never starts from zero.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::time::timeout;
use tracing::{info, warn};

use crate::db::SubmissionStatus;
use crate::queue::{self, JobPayload};
use crate::AppState;
use scorecard_core::analysis::{run_analyzers, BoundedFile, CiReport, CiStatus, PrMetadata,
    StaticReport};
use scorecard_core::llm::LlmReview;
use scorecard_core::review::{bound_files, create_user_prompt, get_system_prompt};
use scorecard_core::score::{compute_breakdown, ScoreBreakdown};

const CREDENTIAL_TIMEOUT: Duration = Duration::from_secs(10);
const API_TIMEOUT: Duration = Duration::from_secs(15);
/// Covers the LLM client's full internal retry schedule.
const LLM_TIMEOUT: Duration = Duration::from_secs(240);

pub async fn handle(
    state: &Arc<AppState>,
    submission_id: &str,
    repo_owner: &str,
    repo_name: &str,
    pr_number: u64,
    installation_id: u64,
    ci_conclusion: Option<&str>,
) -> Result<()> {
    info!(
        submission_id,
        repo = format!("{}/{}", repo_owner, repo_name),
        pr_number,
        "review starting"
    );

    // Step 1: installation credential. Nothing downstream is possible
    // without it.
    timeout(
        CREDENTIAL_TIMEOUT,
        state.github.get_installation_token(installation_id),
    )
    .await
    .context("installation credential exchange timed out")?
    .context("installation credential exchange failed")?;

    // Step 2: PR metadata.
    let meta = timeout(
        API_TIMEOUT,
        state
            .github
            .get_pr_metadata(installation_id, repo_owner, repo_name, pr_number),
    )
    .await
    .context("PR metadata fetch timed out")?
    .context("PR metadata fetch failed")?;

    // Step 3: bounded diff.
    let raw_files = timeout(
        API_TIMEOUT,
        state
            .github
            .get_pr_files(installation_id, repo_owner, repo_name, pr_number),
    )
    .await
    .context("PR diff fetch timed out")?
    .context("PR diff fetch failed")?;
    let files = bound_files(raw_files);

    // Step 4: static analyzers. Failures inside degrade to empty results.
    let report = run_analyzers(&files, &meta);
    for name in &report.failed_analyzers {
        warn!(submission_id, analyzer = %name, "analyzer degraded to empty result");
    }

    {
        let id = submission_id.to_string();
        if let Err(e) = state
            .db
            .run(move |d| d.set_submission_status(&id, SubmissionStatus::UnderReview))
            .await
        {
            warn!("failed to mark submission under review: {:#}", e);
        }
    }

    // Steps 5–10. From here on the static report exists, so any failure
    // persists a partial review before propagating.
    match score_phase(
        state,
        submission_id,
        repo_owner,
        repo_name,
        pr_number,
        installation_id,
        ci_conclusion,
        &meta,
        &files,
        &report,
    )
    .await
    {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(
                submission_id,
                "review failed after static analysis; persisting partial review"
            );
            persist_partial_review(state, submission_id, pr_number, &report).await;
            Err(e)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn score_phase(
    state: &Arc<AppState>,
    submission_id: &str,
    repo_owner: &str,
    repo_name: &str,
    pr_number: u64,
    installation_id: u64,
    ci_conclusion: Option<&str>,
    meta: &PrMetadata,
    files: &[BoundedFile],
    report: &StaticReport,
) -> Result<()> {
    // Step 5: CI status. Missing data is not an error.
    let mut ci = match timeout(
        API_TIMEOUT,
        state
            .github
            .get_ci_report(installation_id, repo_owner, repo_name, &meta.head_sha),
    )
    .await
    {
        Ok(Ok(ci)) => ci,
        Ok(Err(e)) => {
            warn!(submission_id, "CI fetch failed, treating as unknown: {:#}", e);
            unknown_ci()
        }
        Err(_) => {
            warn!(submission_id, "CI fetch timed out, treating as unknown");
            unknown_ci()
        }
    };
    if let Some(conclusion) = ci_conclusion {
        // The triggering webhook already knows how the run ended.
        ci.status = normalize_conclusion(conclusion);
    }

    // Step 6: bounded prompt.
    let system_prompt = get_system_prompt();
    let user_prompt = create_user_prompt(meta, files, report, &ci);

    // Step 7: LLM with bounded retries, neutral fallback on exhaustion. A
    // degraded review is preferable to no review.
    let llm_review = match timeout(LLM_TIMEOUT, state.llm.review(&system_prompt, &user_prompt)).await
    {
        Ok(Ok(review)) => review,
        Ok(Err(e)) => {
            warn!(submission_id, "LLM exhausted retries, using neutral fallback: {:#}", e);
            LlmReview::neutral_fallback()
        }
        Err(_) => {
            warn!(submission_id, "LLM call timed out, using neutral fallback");
            LlmReview::neutral_fallback()
        }
    };

    // Step 8: scoring fusion.
    let breakdown = compute_breakdown(&llm_review, report, &ci);

    // Step 9: persist review (append) and score (upsert).
    {
        let id = submission_id.to_string();
        let llm_value = serde_json::to_value(&llm_review)?;
        let report_value = serde_json::to_value(report)?;
        let suggestions = breakdown.suggestions.clone();
        let fallback = llm_review.fallback;
        let breakdown_clone = breakdown.clone();
        state
            .db
            .run(move |d| {
                d.insert_pr_review(
                    &id,
                    pr_number,
                    Some(&llm_value),
                    &report_value,
                    &suggestions,
                    fallback,
                )?;
                d.upsert_score(&id, &breakdown_clone)
            })
            .await
            .context("failed to persist review and score")?;
    }

    info!(
        submission_id,
        total = breakdown.total,
        badge = breakdown.badge.as_str(),
        fallback = llm_review.fallback,
        "review scored"
    );

    // Step 10: chain the Score stage, then best-effort the PR comment.
    {
        let payload = JobPayload::Score {
            submission_id: submission_id.to_string(),
        };
        state
            .db
            .run(move |d| queue::enqueue(d, &payload))
            .await
            .context("failed to enqueue score job")?;
    }

    let comment = build_comment(&breakdown);
    match timeout(
        API_TIMEOUT,
        state
            .github
            .upsert_review_comment(installation_id, repo_owner, repo_name, pr_number, &comment),
    )
    .await
    {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => warn!(submission_id, "review comment failed: {:#}", e),
        Err(_) => warn!(submission_id, "review comment timed out"),
    }

    Ok(())
}

fn unknown_ci() -> CiReport {
    CiReport {
        status: CiStatus::Unknown,
        tests_passed: 0,
        tests_failed: 0,
        duration_secs: 0,
    }
}

pub(crate) fn normalize_conclusion(conclusion: &str) -> CiStatus {
    match conclusion {
        "success" => CiStatus::Success,
        "failure" | "timed_out" => CiStatus::Failure,
        "cancelled" => CiStatus::Cancelled,
        _ => CiStatus::Unknown,
    }
}

async fn persist_partial_review(
    state: &Arc<AppState>,
    submission_id: &str,
    pr_number: u64,
    report: &StaticReport,
) {
    let id = submission_id.to_string();
    let report_value = match serde_json::to_value(report) {
        Ok(v) => v,
        Err(e) => {
            warn!("could not serialize static report for partial review: {}", e);
            return;
        }
    };
    let result = state
        .db
        .run(move |d| d.insert_pr_review(&id, pr_number, None, &report_value, &[], false))
        .await;
    if let Err(e) = result {
        warn!(submission_id, "failed to persist partial review: {:#}", e);
    }
}

/// Markdown summary posted back onto the PR.
pub fn build_comment(breakdown: &ScoreBreakdown) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let _ = writeln!(
        out,
        "## Review score: {}/100 ({})",
        breakdown.total,
        breakdown.badge.as_str()
    );
    if breakdown.fallback {
        let _ = writeln!(
            out,
            "\n_Automated review was unavailable; this score uses neutral defaults plus static analysis._"
        );
    }
    if !breakdown.summary.is_empty() {
        let _ = writeln!(out, "\n{}", breakdown.summary);
    }
    if !breakdown.evidence.is_empty() {
        let _ = writeln!(out, "\n**Signals**");
        for line in &breakdown.evidence {
            let _ = writeln!(out, "- {}", line);
        }
    }
    if !breakdown.suggestions.is_empty() {
        let _ = writeln!(out, "\n**Suggested next steps**");
        for suggestion in &breakdown.suggestions {
            let _ = writeln!(out, "- {}", suggestion);
        }
    }
    out
}
