//! Operator and user-facing HTTP surface outside the webhook:
//! manual PR discovery, score computation, dead-letter inspection,
//! installation linking, health and metrics.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::discovery::{discover_pr, DiscoveryBudgets, DiscoveryOutcome, GitHubPrSource};
use crate::queue::{self, JobPayload, QueueName, ReviewTrigger};
use crate::{dead_letter, webhook, AppState};
use scorecard_core::analysis::{CiReport, StaticReport};
use scorecard_core::llm::parse_llm_review;
use scorecard_core::score::{compute_breakdown, LegacyScores};

/// Bearer-token gate for the operator/API endpoints. Endpoints are
/// disabled entirely when no token is configured.
fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), Response> {
    let Some(expected) = state.config.api_auth_token.as_deref() else {
        return Err(StatusCode::FORBIDDEN.into_response());
    };
    let provided = headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));
    if provided != Some(expected) {
        return Err(StatusCode::FORBIDDEN.into_response());
    }
    Ok(())
}

fn caller_user_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-user-id")
        .and_then(|h| h.to_str().ok())
        .map(String::from)
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Response {
    let mut queues = serde_json::Map::new();
    for queue in QueueName::all() {
        match state.db.run(move |d| queue::counts(d, queue)).await {
            Ok(counts) => {
                queues.insert(
                    queue.as_str().to_string(),
                    serde_json::to_value(counts).unwrap_or_default(),
                );
            }
            Err(e) => {
                warn!("health check cannot reach broker: {:#}", e);
                return (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(json!({"status": "degraded", "broker": "unreachable"})),
                )
                    .into_response();
            }
        }
    }

    Json(json!({
        "status": "healthy",
        "service": "scorecard",
        "queues": queues,
    }))
    .into_response()
}

pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    state.metrics.render()
}

/// Manual PR discovery: synchronous cascading search with the tighter
/// manual budgets. Owner-only.
pub async fn fetch_pr_handler(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }

    let id = submission_id.clone();
    let submission = match state.db.run(move |d| d.find_submission(&id)).await {
        Ok(Some(s)) => s,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"code": "submission_not_found"})),
            )
                .into_response()
        }
        Err(e) => {
            warn!("submission lookup failed: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    if caller_user_id(&headers).as_deref() != Some(submission.user_id.as_str()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"code": "not_submission_owner"})),
        )
            .into_response();
    }

    if let Some(pr_number) = submission.pr_number {
        return Json(json!({"pr_number": pr_number, "already_attached": true})).into_response();
    }

    let user = submission.user_id.clone();
    let installation_id = match state
        .db
        .run(move |d| d.installation_for_user(&user))
        .await
    {
        Ok(Some(id)) => id,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"code": "installation_missing"})),
            )
                .into_response()
        }
        Err(e) => {
            warn!("installation lookup failed: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    let Some((repo_owner, repo_name)) = split_repo(&submission.repo_url) else {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({"code": "repo_url_invalid"})),
        )
            .into_response();
    };

    let source = GitHubPrSource {
        client: state.github.clone(),
        installation_id,
    };
    let outcome = discover_pr(&source, &repo_owner, &repo_name, &DiscoveryBudgets::manual()).await;

    match outcome {
        DiscoveryOutcome::Found { pr_number, .. } => {
            let id = submission.id.clone();
            if let Err(e) = state
                .db
                .run(move |d| d.attach_pr_number(&id, pr_number))
                .await
            {
                warn!("failed to attach discovered PR: {:#}", e);
            }

            let job = JobPayload::Review {
                submission_id: submission.id.clone(),
                repo_owner,
                repo_name,
                pr_number,
                installation_id,
                trigger: ReviewTrigger::Manual,
                ci_conclusion: None,
            };
            let enqueue = state.db.run(move |d| queue::enqueue(d, &job)).await;
            if let Err(e) = enqueue {
                warn!("failed to enqueue review after manual discovery: {:#}", e);
            }

            info!(submission_id = %submission.id, pr_number, "manual discovery attached PR");
            Json(json!({"pr_number": pr_number, "already_attached": false})).into_response()
        }
        DiscoveryOutcome::Exhausted => (
            StatusCode::NOT_FOUND,
            Json(json!({"code": "pr_not_found"})),
        )
            .into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct ComputeScoreRequest {
    pub llm: serde_json::Value,
    #[serde(default)]
    pub static_report: StaticReport,
    pub ci: Option<CiReport>,
    pub submission_id: Option<String>,
}

/// Internal score computation: fuse a raw LLM output object with a static
/// report, optionally persisting when a submission id is supplied.
pub async fn compute_score_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<ComputeScoreRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }

    let llm_review = match parse_llm_review(&request.llm) {
        Ok(review) => review,
        Err(e) => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({"code": "llm_output_invalid", "detail": e.to_string()})),
            )
                .into_response()
        }
    };

    let ci = request.ci.unwrap_or_else(CiReport::no_workflows);
    let breakdown = compute_breakdown(&llm_review, &request.static_report, &ci);
    let legacy = LegacyScores::project(&breakdown.categories, &request.static_report);

    if let Some(submission_id) = request.submission_id {
        let breakdown_clone = breakdown.clone();
        let result = state
            .db
            .run(move |d| d.upsert_score(&submission_id, &breakdown_clone))
            .await;
        if let Err(e) = result {
            warn!("failed to persist computed score: {:#}", e);
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    Json(json!({"breakdown": breakdown, "legacy": legacy})).into_response()
}

/// Read-only dead-letter inspection for operator triage.
pub async fn dead_letters_handler(
    State(state): State<Arc<AppState>>,
    Path(submission_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }

    match state
        .db
        .run(move |d| dead_letter::list_for_submission(d, &submission_id))
        .await
    {
        Ok(records) => Json(json!({"dead_letters": records})).into_response(),
        Err(e) => {
            warn!("dead-letter lookup failed: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LinkRequest {
    pub user_id: String,
}

/// Mint a one-shot state token for the installation-linking flow.
pub async fn installation_link_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<LinkRequest>,
) -> Response {
    if let Err(resp) = authorize(&state, &headers) {
        return resp;
    }

    let token = Uuid::new_v4().to_string();
    state.install_states.prune_expired().await;
    state
        .install_states
        .insert(token.clone(), request.user_id)
        .await;
    Json(json!({"state": token})).into_response()
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    pub state: String,
    pub installation_id: u64,
}

/// Redemption endpoint the source host redirects back to after install.
pub async fn installation_callback_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
) -> Response {
    let Some(user_id) = state.install_states.take(&query.state).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"code": "state_invalid_or_expired"})),
        )
            .into_response();
    };

    let installation_id = query.installation_id;
    let user = user_id.clone();
    let result = state
        .db
        .run(move |d| {
            d.upsert_installation(installation_id, 0, "", Some(&user))?;
            d.link_installation_user(installation_id, &user)
        })
        .await;
    match result {
        Ok(()) => {
            info!(installation_id, user_id = %user_id, "installation linked to user");
            Json(json!({"linked": true})).into_response()
        }
        Err(e) => {
            warn!("failed to link installation: {:#}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

fn split_repo(repo_url: &str) -> Option<(String, String)> {
    let slug = crate::db::normalize_repo_url(repo_url);
    let (owner, name) = slug.split_once('/')?;
    if owner.is_empty() || name.is_empty() {
        return None;
    }
    Some((owner.to_string(), name.to_string()))
}

/// The full application router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/api/submissions/{id}/fetch-pr", post(fetch_pr_handler))
        .route("/api/scores/compute", post(compute_score_handler))
        .route("/api/dead-letters/{submission_id}", get(dead_letters_handler))
        .route("/api/installations/link", post(installation_link_handler))
        .route(
            "/api/installations/callback",
            get(installation_callback_handler),
        )
        .merge(webhook::webhook_router(state.clone()))
        .with_state(state)
}
