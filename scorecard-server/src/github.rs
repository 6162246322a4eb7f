//! GitHub App gateway: installation-token auth and the handful of REST
//! calls the review pipeline needs.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use crate::metrics::Metrics;
use scorecard_core::analysis::{CiReport, CiStatus, PrMetadata};

/// Marker prefix embedded in the review comment so re-runs update in place.
const COMMENT_MARKER_PREFIX: &str = "<!-- scorecard(";

#[derive(Clone)]
pub struct GitHubClient {
    client: Client,
    api_base: String,
    app_id: u64,
    private_key: String,
    token_cache: Arc<RwLock<HashMap<u64, (String, SystemTime)>>>,
    metrics: Option<Arc<Metrics>>,
}

#[derive(Debug, Serialize)]
struct GitHubAppClaims {
    iss: u64,
    iat: u64,
    exp: u64,
}

#[derive(Debug, Deserialize)]
struct InstallationTokenResponse {
    token: String,
    expires_at: String,
}

#[derive(Debug, Deserialize)]
struct UserResponse {
    id: u64,
    login: String,
}

#[derive(Debug, Deserialize)]
struct PullRequestResponse {
    number: u64,
    title: String,
    body: Option<String>,
    user: UserResponse,
    additions: u64,
    deletions: u64,
    changed_files: u64,
    commits: u64,
    head: RefResponse,
}

#[derive(Debug, Deserialize)]
struct RefResponse {
    sha: String,
}

#[derive(Debug, Deserialize)]
struct PrFileResponse {
    filename: String,
    changes: u64,
    patch: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PrCommitResponse {
    commit: CommitDetail,
}

#[derive(Debug, Deserialize)]
struct CommitDetail {
    message: String,
}

#[derive(Debug, Deserialize)]
struct CheckRunsResponse {
    total_count: u64,
    check_runs: Vec<CheckRun>,
}

#[derive(Debug, Deserialize)]
struct CheckRun {
    status: String,
    conclusion: Option<String>,
    started_at: Option<String>,
    completed_at: Option<String>,
}

#[derive(Debug, Serialize)]
struct CreateCommentRequest {
    body: String,
}

#[derive(Debug, Deserialize)]
pub struct Comment {
    pub id: u64,
    pub body: String,
}

/// An open PR as seen by cascading discovery.
#[derive(Debug, Clone)]
pub struct OpenPr {
    pub number: u64,
    pub author_id: u64,
    pub author_login: String,
    pub created_at: DateTime<Utc>,
}

impl GitHubClient {
    pub fn new(app_id: u64, private_key: String, api_base: String) -> Self {
        let client = Client::builder()
            .user_agent(concat!("scorecard-server/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_base,
            app_id,
            private_key,
            token_cache: Arc::new(RwLock::new(HashMap::new())),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn generate_jwt(&self) -> Result<String> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("Failed to get current time")?
            .as_secs();

        let claims = GitHubAppClaims {
            iss: self.app_id,
            iat: now - 60,  // Issued 60 seconds ago to account for clock skew
            exp: now + 600, // Expires in 10 minutes
        };

        let header = Header::new(Algorithm::RS256);
        let encoding_key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .context("Failed to parse private key")?;

        encode(&header, &claims, &encoding_key).context("Failed to encode JWT")
    }

    /// Send a request, record latency, and turn non-success statuses into
    /// errors with the response body attached.
    async fn execute(&self, request: RequestBuilder, operation: &str) -> Result<Response> {
        let started = Instant::now();
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", operation))?;
        if let Some(metrics) = &self.metrics {
            metrics.github_latency.observe(started.elapsed());
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            error!("GitHub API error in {}: {} - {}", operation, status, error_text);
            return Err(anyhow!(
                "GitHub API error in {}: {} - {}",
                operation,
                status,
                error_text
            ));
        }
        Ok(response)
    }

    /// Exchange the app JWT for an installation token, with caching.
    pub async fn get_installation_token(&self, installation_id: u64) -> Result<String> {
        // Reuse the cached token while it has at least 5 minutes left.
        {
            let cache = self.token_cache.read().await;
            if let Some((token, expires_at)) = cache.get(&installation_id) {
                if expires_at
                    .duration_since(SystemTime::now())
                    .unwrap_or_default()
                    .as_secs()
                    > 300
                {
                    return Ok(token.clone());
                }
            }
        }

        let jwt = self.generate_jwt()?;
        let url = self.url(&format!("/app/installations/{}/access_tokens", installation_id));

        info!("Requesting new installation access token");

        let response = self
            .execute(
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", jwt))
                    .header("Accept", "application/vnd.github.v3+json"),
                "installation token",
            )
            .await?;

        let token_response: InstallationTokenResponse = response
            .json()
            .await
            .context("Failed to parse installation token response")?;

        let expires_at = DateTime::parse_from_rfc3339(&token_response.expires_at)
            .context("Failed to parse token expiration")?
            .with_timezone(&Utc);
        let expires_at_system =
            UNIX_EPOCH + Duration::from_secs(expires_at.timestamp().max(0) as u64);

        {
            let mut cache = self.token_cache.write().await;
            cache.insert(
                installation_id,
                (token_response.token.clone(), expires_at_system),
            );
        }

        info!("Successfully obtained installation access token");
        Ok(token_response.token)
    }

    async fn get_json<T: serde::de::DeserializeOwned>(
        &self,
        installation_id: u64,
        path: &str,
        operation: &str,
    ) -> Result<T> {
        let token = self.get_installation_token(installation_id).await?;
        let response = self
            .execute(
                self.client
                    .get(self.url(path))
                    .header("Authorization", format!("Bearer {}", token))
                    .header("Accept", "application/vnd.github.v3+json"),
                operation,
            )
            .await?;
        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", operation))
    }

    /// Fetch PR metadata, including the commit messages that feed the
    /// git-hygiene metrics.
    pub async fn get_pr_metadata(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
    ) -> Result<PrMetadata> {
        let pr: PullRequestResponse = self
            .get_json(
                installation_id,
                &format!("/repos/{}/{}/pulls/{}", repo_owner, repo_name, pr_number),
                "pull request",
            )
            .await?;

        let commits: Vec<PrCommitResponse> = self
            .get_json(
                installation_id,
                &format!(
                    "/repos/{}/{}/pulls/{}/commits?per_page=100",
                    repo_owner, repo_name, pr_number
                ),
                "pull request commits",
            )
            .await
            .unwrap_or_default();

        info!(
            "Fetched PR #{} ({} commits, +{} -{})",
            pr.number, pr.commits, pr.additions, pr.deletions
        );

        Ok(PrMetadata {
            number: pr.number,
            title: pr.title,
            body: pr.body,
            author_login: pr.user.login,
            author_id: pr.user.id,
            additions: pr.additions,
            deletions: pr.deletions,
            changed_files: pr.changed_files,
            commit_count: pr.commits,
            commit_messages: commits
                .into_iter()
                .map(|c| c.commit.message.lines().next().unwrap_or_default().to_string())
                .collect(),
            head_sha: pr.head.sha,
        })
    }

    /// Changed files with patches: `(path, patch, changed_lines)` tuples
    /// ready for diff bounding. Files without a textual patch (binary,
    /// too large) are skipped.
    pub async fn get_pr_files(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
    ) -> Result<Vec<(String, String, usize)>> {
        let mut files = Vec::new();
        let mut page = 1;
        let per_page = 100;

        loop {
            let batch: Vec<PrFileResponse> = self
                .get_json(
                    installation_id,
                    &format!(
                        "/repos/{}/{}/pulls/{}/files?page={}&per_page={}",
                        repo_owner, repo_name, pr_number, page, per_page
                    ),
                    "pull request files",
                )
                .await?;
            let batch_len = batch.len();

            for file in batch {
                if let Some(patch) = file.patch {
                    files.push((file.filename, patch, file.changes as usize));
                }
            }

            if batch_len < per_page {
                break;
            }
            page += 1;
        }

        info!("Collected {} changed files with patches", files.len());
        Ok(files)
    }

    /// Open PRs for a repository, most recently created first.
    pub async fn list_open_prs(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
    ) -> Result<Vec<OpenPr>> {
        #[derive(Deserialize)]
        struct OpenPrResponse {
            number: u64,
            user: UserResponse,
            created_at: String,
        }

        let prs: Vec<OpenPrResponse> = self
            .get_json(
                installation_id,
                &format!(
                    "/repos/{}/{}/pulls?state=open&sort=created&direction=desc&per_page=30",
                    repo_owner, repo_name
                ),
                "open pull requests",
            )
            .await?;

        prs.into_iter()
            .map(|pr| {
                Ok(OpenPr {
                    number: pr.number,
                    author_id: pr.user.id,
                    author_login: pr.user.login,
                    created_at: DateTime::parse_from_rfc3339(&pr.created_at)
                        .context("Failed to parse PR creation time")?
                        .with_timezone(&Utc),
                })
            })
            .collect()
    }

    /// CI status for a head commit, reduced to the report the scoring
    /// engine consumes. Missing check runs yield `NoWorkflows`.
    pub async fn get_ci_report(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        head_sha: &str,
    ) -> Result<CiReport> {
        let runs: CheckRunsResponse = self
            .get_json(
                installation_id,
                &format!(
                    "/repos/{}/{}/commits/{}/check-runs?per_page=100",
                    repo_owner, repo_name, head_sha
                ),
                "check runs",
            )
            .await?;

        if runs.total_count == 0 {
            return Ok(CiReport::no_workflows());
        }

        let mut passed = 0u32;
        let mut failed = 0u32;
        let mut any_cancelled = false;
        let mut earliest_start: Option<DateTime<Utc>> = None;
        let mut latest_end: Option<DateTime<Utc>> = None;

        for run in &runs.check_runs {
            match run.conclusion.as_deref() {
                Some("success") => passed += 1,
                Some("failure") | Some("timed_out") => failed += 1,
                Some("cancelled") => any_cancelled = true,
                _ => {}
            }
            if let Some(t) = run.started_at.as_deref().and_then(parse_time) {
                earliest_start = Some(earliest_start.map_or(t, |e| e.min(t)));
            }
            if let Some(t) = run.completed_at.as_deref().and_then(parse_time) {
                latest_end = Some(latest_end.map_or(t, |e| e.max(t)));
            }
        }

        let status = if failed > 0 {
            CiStatus::Failure
        } else if any_cancelled {
            CiStatus::Cancelled
        } else if passed > 0 && runs.check_runs.iter().all(|r| r.status == "completed") {
            CiStatus::Success
        } else {
            CiStatus::Unknown
        };

        let duration_secs = match (earliest_start, latest_end) {
            (Some(start), Some(end)) if end > start => (end - start).num_seconds() as u64,
            _ => 0,
        };

        Ok(CiReport {
            status,
            tests_passed: passed,
            tests_failed: failed,
            duration_secs,
        })
    }

    pub async fn post_pr_comment(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
        comment_body: &str,
    ) -> Result<Comment> {
        let token = self.get_installation_token(installation_id).await?;
        let url = self.url(&format!(
            "/repos/{}/{}/issues/{}/comments",
            repo_owner, repo_name, pr_number
        ));

        info!(
            "Posting comment to PR #{} in {}/{}",
            pr_number, repo_owner, repo_name
        );

        let response = self
            .execute(
                self.client
                    .post(&url)
                    .header("Authorization", format!("Bearer {}", token))
                    .header("Accept", "application/vnd.github.v3+json")
                    .json(&CreateCommentRequest {
                        body: comment_body.to_string(),
                    }),
                "create comment",
            )
            .await?;

        let comment: Comment = response
            .json()
            .await
            .context("Failed to parse comment response")?;
        info!("Successfully posted comment with ID: {}", comment.id);
        Ok(comment)
    }

    async fn update_comment(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        comment_id: u64,
        comment_body: &str,
    ) -> Result<()> {
        let token = self.get_installation_token(installation_id).await?;
        let url = self.url(&format!(
            "/repos/{}/{}/issues/comments/{}",
            repo_owner, repo_name, comment_id
        ));

        self.execute(
            self.client
                .patch(&url)
                .header("Authorization", format!("Bearer {}", token))
                .header("Accept", "application/vnd.github.v3+json")
                .json(&CreateCommentRequest {
                    body: comment_body.to_string(),
                }),
            "update comment",
        )
        .await?;
        Ok(())
    }

    /// Post the review summary, updating an existing marker comment in
    /// place instead of stacking a new comment per re-run.
    pub async fn upsert_review_comment(
        &self,
        installation_id: u64,
        repo_owner: &str,
        repo_name: &str,
        pr_number: u64,
        content: &str,
    ) -> Result<u64> {
        let marker = format!("{}{}) -->", COMMENT_MARKER_PREFIX, env!("CARGO_PKG_VERSION"));
        let full_comment = format!("{}\n\n{}", marker, content);

        let comments: Vec<Comment> = self
            .get_json(
                installation_id,
                &format!(
                    "/repos/{}/{}/issues/{}/comments?per_page=100",
                    repo_owner, repo_name, pr_number
                ),
                "list comments",
            )
            .await?;

        for comment in comments {
            if comment.body.starts_with(COMMENT_MARKER_PREFIX) {
                info!("Updating existing review comment {}", comment.id);
                self.update_comment(
                    installation_id,
                    repo_owner,
                    repo_name,
                    comment.id,
                    &full_comment,
                )
                .await?;
                return Ok(comment.id);
            }
        }

        info!("No existing review comment found, creating a new one");
        let comment = self
            .post_pr_comment(installation_id, repo_owner, repo_name, pr_number, &full_comment)
            .await?;
        Ok(comment.id)
    }
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| {
            warn!("unparseable timestamp from API: {} ({})", s, e);
            e
        })
        .ok()
}
