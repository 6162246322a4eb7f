//! Webhook ingress: signature verification, event classification,
//! submission correlation and Review-job enqueue.
//!
//! The sender always gets 200 once the payload is structurally accepted —
//! processing failures are the pipeline's to recover, never reflected in
//! the HTTP status, so the source host's retry logic is never triggered.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::{self, Next},
    response::{Json, Response},
    routing::post,
    Router,
};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::Submission;
use crate::events::DomainEvent;
use crate::queue::{self, JobPayload, ReviewTrigger};
use crate::{dead_letter, AppState, CorrelationId};

#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    pub action: Option<String>,
    pub pull_request: Option<PullRequestInfo>,
    pub repository: Option<Repository>,
    pub sender: Option<Account>,
    pub installation: Option<InstallationRef>,
    pub workflow_run: Option<CiRun>,
    pub check_suite: Option<CiRun>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PullRequestInfo {
    pub number: u64,
    pub user: Account,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Repository {
    pub name: String,
    pub full_name: String,
    pub html_url: String,
    pub owner: Account,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Account {
    pub id: u64,
    pub login: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct InstallationRef {
    pub id: u64,
    pub account: Option<Account>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CiRun {
    pub conclusion: Option<String>,
    #[serde(default)]
    pub pull_requests: Vec<PrRef>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PrRef {
    pub number: u64,
}

#[derive(Serialize)]
pub struct WebhookResponse {
    pub message: String,
}

type HmacSha256 = Hmac<Sha256>;

/// Verify a `sha256=<hex>` signature over the exact raw payload bytes.
/// Comparison is constant-time via `Mac::verify_slice`.
pub fn verify_webhook_signature(secret: &str, payload: &[u8], signature: &str) -> bool {
    let Some(signature_hex) = signature.strip_prefix("sha256=") else {
        return false;
    };

    let signature_bytes = match hex::decode(signature_hex) {
        Ok(bytes) => bytes,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return false,
    };

    mac.update(payload);
    mac.verify_slice(&signature_bytes).is_ok()
}

async fn signature_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    state.metrics.webhooks_received.inc();
    let correlation_id = CorrelationId(Uuid::new_v4().to_string());

    let (parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;

    let Some(signature) = parts
        .headers
        .get("x-hub-signature-256")
        .and_then(|h| h.to_str().ok())
    else {
        warn!("webhook rejected: signature missing");
        state.metrics.webhooks_rejected.inc();
        return Err(StatusCode::UNAUTHORIZED);
    };

    if !verify_webhook_signature(&state.config.github_webhook_secret, &bytes, signature) {
        error!("webhook rejected: signature invalid");
        state.metrics.webhooks_rejected.inc();
        return Err(StatusCode::UNAUTHORIZED);
    }

    let mut new_request = Request::from_parts(parts, axum::body::Body::from(bytes));
    new_request.extensions_mut().insert(correlation_id);
    Ok(next.run(new_request).await)
}

pub async fn github_webhook_handler(
    State(state): State<Arc<AppState>>,
    request: Request,
) -> Result<Json<WebhookResponse>, StatusCode> {
    let correlation_id = request
        .extensions()
        .get::<CorrelationId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();

    let event_type = request
        .headers()
        .get("x-github-event")
        .and_then(|h| h.to_str().ok())
        .unwrap_or("unknown")
        .to_string();

    let (_parts, body) = request.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?;
    let payload: WebhookPayload =
        serde_json::from_slice(&bytes).map_err(|_| StatusCode::BAD_REQUEST)?;

    info!(event = %event_type, correlation_id = %correlation_id, "webhook accepted");

    // Everything past this point is fire-and-acknowledge: correlation or
    // enqueue problems are logged and dead-lettered, never surfaced to the
    // sender.
    let message = process_event(&state, &event_type, payload).await;
    Ok(Json(WebhookResponse { message }))
}

/// Classify and process one verified webhook event. Infallible by
/// contract; the returned string is only for the acknowledgment body.
pub async fn process_event(
    state: &Arc<AppState>,
    event_type: &str,
    payload: WebhookPayload,
) -> String {
    match event_type {
        "pull_request" => match payload.action.as_deref() {
            Some("opened") | Some("reopened") | Some("synchronize") => {
                handle_pr_event(state, payload).await
            }
            other => {
                info!("ignoring pull_request action {:?}", other);
                "ignored".to_string()
            }
        },
        "workflow_run" | "check_suite" => {
            if payload.action.as_deref() == Some("completed") {
                handle_ci_event(state, payload).await
            } else {
                "ignored".to_string()
            }
        }
        "installation" => handle_installation_event(state, payload).await,
        other => {
            info!("ignoring event type {}", other);
            "ignored".to_string()
        }
    }
}

/// Pick the submission a PR event belongs to.
///
/// Prefers the candidate whose owner matches the PR author's platform id;
/// with several candidates and no exact match the newest is used with a
/// warning rather than failing the event.
pub fn resolve_submission(candidates: Vec<Submission>, author_id: u64) -> Option<Submission> {
    if candidates.is_empty() {
        return None;
    }

    if let Some(exact) = candidates
        .iter()
        .find(|s| s.platform_user_id == Some(author_id))
    {
        if candidates.len() > 1 {
            warn!(
                submission_id = %exact.id,
                "repository has {} submissions; picked exact owner match",
                candidates.len()
            );
        }
        return Some(exact.clone());
    }

    if candidates.len() > 1 {
        warn!(
            "repository has {} submissions and none match author {}; using newest",
            candidates.len(),
            author_id
        );
    } else {
        warn!(
            submission_id = %candidates[0].id,
            "submission owner does not match PR author {}; proceeding",
            author_id
        );
    }
    candidates.into_iter().next()
}

async fn handle_pr_event(state: &Arc<AppState>, payload: WebhookPayload) -> String {
    let (Some(pr), Some(repo), Some(installation)) = (
        payload.pull_request,
        payload.repository,
        payload.installation,
    ) else {
        warn!("pull_request event missing pr/repository/installation; ignoring");
        return "ignored".to_string();
    };

    let repo_url = repo.html_url.clone();
    let candidates = match state
        .db
        .run(move |d| d.find_submissions_by_repo(&repo_url))
        .await
    {
        Ok(c) => c,
        Err(e) => {
            error!("submission lookup failed: {:#}", e);
            return "accepted".to_string();
        }
    };

    let Some(submission) = resolve_submission(candidates, pr.user.id) else {
        info!(
            repo = %repo.full_name,
            pr_number = pr.number,
            "no submission matches this repository; acknowledged without processing"
        );
        return "no matching submission".to_string();
    };

    if submission.pr_number.is_none() {
        let id = submission.id.clone();
        let number = pr.number;
        match state.db.run(move |d| d.attach_pr_number(&id, number)).await {
            Ok(true) => info!(submission_id = %submission.id, pr_number = number, "attached PR"),
            Ok(false) => {}
            Err(e) => error!("failed to attach PR number: {:#}", e),
        }
    }

    let job = JobPayload::Review {
        submission_id: submission.id.clone(),
        repo_owner: repo.owner.login,
        repo_name: repo.name,
        pr_number: pr.number,
        installation_id: installation.id,
        trigger: ReviewTrigger::PrEvent,
        ci_conclusion: None,
    };
    enqueue_or_dead_letter(state, job).await;
    "review queued".to_string()
}

async fn handle_ci_event(state: &Arc<AppState>, payload: WebhookPayload) -> String {
    let run = payload.workflow_run.or(payload.check_suite);
    let (Some(run), Some(repo), Some(installation)) =
        (run, payload.repository, payload.installation)
    else {
        return "ignored".to_string();
    };

    if run.pull_requests.is_empty() {
        info!(repo = %repo.full_name, "CI run has no associated PRs; acknowledged");
        return "no associated prs".to_string();
    }

    for pr_ref in &run.pull_requests {
        let repo_url = repo.html_url.clone();
        let number = pr_ref.number;
        let found = state
            .db
            .run(move |d| d.find_submission_by_repo_and_pr(&repo_url, number))
            .await;
        match found {
            Ok(Some(submission)) => {
                let job = JobPayload::Review {
                    submission_id: submission.id,
                    repo_owner: repo.owner.login.clone(),
                    repo_name: repo.name.clone(),
                    pr_number: pr_ref.number,
                    installation_id: installation.id,
                    trigger: ReviewTrigger::CiEvent,
                    ci_conclusion: run.conclusion.clone(),
                };
                enqueue_or_dead_letter(state, job).await;
                return "review queued".to_string();
            }
            Ok(None) => {}
            Err(e) => error!("submission lookup failed: {:#}", e),
        }
    }

    info!(repo = %repo.full_name, "CI run matched no submission; acknowledged");
    "no matching submission".to_string()
}

async fn handle_installation_event(state: &Arc<AppState>, payload: WebhookPayload) -> String {
    let Some(installation) = payload.installation else {
        return "ignored".to_string();
    };

    match payload.action.as_deref() {
        Some("created") => {
            let account = installation
                .account
                .or(payload.sender)
                .unwrap_or(Account {
                    id: 0,
                    login: String::new(),
                });
            let installation_id = installation.id;
            let account_id = account.id;
            let login = account.login.clone();
            let result = state
                .db
                .run(move |d| d.upsert_installation(installation_id, account_id, &login, None))
                .await;
            if let Err(e) = result {
                error!("failed to record installation: {:#}", e);
            } else {
                info!(installation_id, account = %account.login, "app installed");
                state.bus.publish(DomainEvent::GithubAppInstalled {
                    installation_id,
                    account_login: account.login,
                    user_id: None,
                });
            }
            "installation recorded".to_string()
        }
        Some("deleted") => {
            let installation_id = installation.id;
            if let Err(e) = state
                .db
                .run(move |d| d.remove_installation(installation_id))
                .await
            {
                error!("failed to clear installation: {:#}", e);
            } else {
                info!(installation_id, "app uninstalled; linkage cleared");
            }
            "installation cleared".to_string()
        }
        _ => "ignored".to_string(),
    }
}

/// Enqueue, and if the broker refuses, record the loss in the dead-letter
/// store instead of surfacing anything to the webhook sender.
async fn enqueue_or_dead_letter(state: &Arc<AppState>, job: JobPayload) {
    let job_for_enqueue = job.clone();
    let result = state
        .db
        .run(move |d| queue::enqueue(d, &job_for_enqueue))
        .await;
    if let Err(e) = result {
        error!("failed to enqueue review job: {:#}", e);
        let raw = serde_json::to_value(&job).unwrap_or_default();
        let submission_id = job.submission_id().map(String::from);
        let pr_number = job.pr_number();
        let dl = state
            .db
            .run(move |d| {
                dead_letter::append(
                    d,
                    "review",
                    &raw,
                    "enqueue from webhook ingress failed",
                    None,
                    submission_id.as_deref(),
                    pr_number,
                )
            })
            .await;
        if let Err(e) = dl {
            error!("failed to dead-letter dropped webhook job: {:#}", e);
        }
    }
}

pub fn webhook_router(state: Arc<AppState>) -> Router<Arc<AppState>> {
    Router::new()
        .route("/webhooks/github", post(github_webhook_handler))
        .layer(middleware::from_fn_with_state(state, signature_middleware))
}
