use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;

/// Worker concurrency per pipeline stage.
#[derive(Debug, Clone, Copy)]
pub struct StageConcurrency {
    pub review: usize,
    pub score: usize,
    pub portfolio: usize,
    pub notification: usize,
}

#[derive(Clone)]
pub struct Config {
    pub github_app_id: u64,
    pub github_private_key: String,
    pub github_webhook_secret: String,
    /// Overridable for tests; defaults to the public API.
    pub github_api_base: String,
    pub llm_api_key: String,
    pub llm_api_base: String,
    pub llm_model: String,
    pub port: u16,
    /// Directory for persistent state (SQLite database).
    /// Defaults to current working directory.
    pub state_dir: PathBuf,
    /// Global switch for outbound email; per-user preferences gate below it.
    pub email_enabled: bool,
    /// Bearer token for the operator/API endpoints. If not set, those
    /// endpoints are disabled (403 Forbidden).
    pub api_auth_token: Option<String>,
    pub concurrency: StageConcurrency,
}

fn usize_var(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(v) => v
            .parse::<usize>()
            .with_context(|| format!("{} must be a valid number", name)),
        Err(_) => Ok(default),
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let github_app_id = env::var("GITHUB_APP_ID")
            .context("GITHUB_APP_ID environment variable is required")?
            .parse::<u64>()
            .context("GITHUB_APP_ID must be a valid number")?;

        let github_private_key = env::var("GITHUB_PRIVATE_KEY")
            .context("GITHUB_PRIVATE_KEY environment variable is required")?
            .replace("\\n", "\n");

        let github_webhook_secret = env::var("GITHUB_WEBHOOK_SECRET")
            .context("GITHUB_WEBHOOK_SECRET environment variable is required")?;

        let github_api_base =
            env::var("GITHUB_API_BASE").unwrap_or_else(|_| "https://api.github.com".to_string());

        let llm_api_key =
            env::var("LLM_API_KEY").context("LLM_API_KEY environment variable is required")?;

        let llm_api_base =
            env::var("LLM_API_BASE").unwrap_or_else(|_| "https://api.openai.com/v1".to_string());

        let llm_model = env::var("LLM_MODEL").unwrap_or_else(|_| "gpt-4o-mini".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .context("PORT must be a valid number")?;

        let state_dir = env::var("STATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("."));

        let email_enabled = env::var("EMAIL_ENABLED")
            .unwrap_or_else(|_| "false".to_string())
            .parse::<bool>()
            .unwrap_or(false);

        let api_auth_token = parse_auth_token(env::var("API_AUTH_TOKEN").ok());

        let concurrency = StageConcurrency {
            review: usize_var("REVIEW_CONCURRENCY", 2)?,
            score: usize_var("SCORE_CONCURRENCY", 2)?,
            portfolio: usize_var("PORTFOLIO_CONCURRENCY", 1)?,
            notification: usize_var("NOTIFICATION_CONCURRENCY", 2)?,
        };

        Ok(Config {
            github_app_id,
            github_private_key,
            github_webhook_secret,
            github_api_base,
            llm_api_key,
            llm_api_base,
            llm_model,
            port,
            state_dir,
            email_enabled,
            api_auth_token,
            concurrency,
        })
    }
}

/// Parse an operator bearer token from an optional string value.
///
/// Returns None if the value is missing, empty, or contains only whitespace,
/// so an empty token can never allow unauthenticated access.
pub fn parse_auth_token(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.trim().is_empty())
}
