//! LLM inference gateway for the review call.
//!
//! Chat-completion request with a JSON response format, bounded retries
//! with exponential backoff. A response that fails to parse or validate
//! counts as a failed attempt; after the budget is spent the caller falls
//! back to the neutral review rather than failing the job.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics::Metrics;
use crate::queue::backoff::exponential_delay;
use scorecard_core::llm::{parse_llm_review, LlmReview};

/// Attempts before giving up and letting the caller fall back.
pub const MAX_LLM_ATTEMPTS: u32 = 3;

const RETRY_BASE: Duration = Duration::from_secs(2);
const RETRY_CAP: Duration = Duration::from_secs(20);

/// Per-request timeout; the review worker wraps the whole retried call in
/// its own step timeout as well.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Clone)]
pub struct LlmClient {
    client: reqwest::Client,
    api_base: String,
    api_key: String,
    model: String,
    metrics: Option<Arc<Metrics>>,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: ResponseFormat,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    content: String,
}

impl LlmClient {
    pub fn new(api_base: String, api_key: String, model: String) -> Self {
        let client = reqwest::Client::builder()
            .user_agent(concat!("scorecard-server/", env!("CARGO_PKG_VERSION")))
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("Failed to create HTTP client");

        Self {
            client,
            api_base,
            api_key,
            model,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    async fn request_once(&self, system: &str, user: &str) -> Result<LlmReview> {
        let body = ChatCompletionRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: system,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_object",
            },
        };

        let started = Instant::now();
        let response = self
            .client
            .post(format!("{}/chat/completions", self.api_base))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .context("Failed to send LLM request")?;
        if let Some(metrics) = &self.metrics {
            metrics.llm_latency.observe(started.elapsed());
        }

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(anyhow!("LLM API error: {} - {}", status, error_text));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .context("Failed to parse LLM response envelope")?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| anyhow!("LLM response contained no choices"))?;

        let raw: serde_json::Value = serde_json::from_str(content)
            .context("LLM response content is not valid JSON")?;
        parse_llm_review(&raw).map_err(|e| anyhow!("LLM response failed validation: {}", e))
    }

    /// Run the review call with bounded retries. Every attempt must yield
    /// a response that parses and validates; anything else is retried.
    pub async fn review(&self, system: &str, user: &str) -> Result<LlmReview> {
        let mut last_error = None;

        for attempt in 1..=MAX_LLM_ATTEMPTS {
            match self.request_once(system, user).await {
                Ok(review) => {
                    info!("LLM review succeeded on attempt {}", attempt);
                    return Ok(review);
                }
                Err(e) => {
                    warn!("LLM attempt {}/{} failed: {:#}", attempt, MAX_LLM_ATTEMPTS, e);
                    last_error = Some(e);
                    if attempt < MAX_LLM_ATTEMPTS {
                        tokio::time::sleep(exponential_delay(RETRY_BASE, attempt, RETRY_CAP)).await;
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| anyhow!("LLM review failed")))
    }
}
