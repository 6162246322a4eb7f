//! Wire contract for the LLM review response.
//!
//! The model is asked for ten 0–10 category scores, a short summary and a
//! suggestion list. Parsing is strict: every category must be present,
//! numeric and in range, otherwise the caller retries and eventually falls
//! back to [`LlmReview::neutral_fallback`].

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::score::CategoryScores;

/// Mid-scale score used for every category when the LLM is unavailable.
pub const NEUTRAL_SCORE: f64 = 5.0;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmReview {
    pub scores: CategoryScores,
    pub summary: String,
    pub suggestions: Vec<String>,
    /// True when this review is the neutral fallback rather than model output.
    pub fallback: bool,
}

impl LlmReview {
    pub fn neutral_fallback() -> Self {
        Self {
            scores: CategoryScores::uniform(NEUTRAL_SCORE),
            summary: "Automated review was unavailable; neutral scores were applied.".to_string(),
            suggestions: Vec::new(),
            fallback: true,
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum LlmParseError {
    #[error("response is not a JSON object")]
    NotAnObject,
    #[error("missing category field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` is not a number")]
    NotANumber(&'static str),
    #[error("field `{0}` is out of range: {1}")]
    OutOfRange(&'static str, f64),
}

/// Category fields as they appear on the wire, in prompt order.
pub const CATEGORY_FIELDS: [&str; 10] = [
    "codeQuality",
    "testing",
    "documentation",
    "security",
    "devopsExecution",
    "bugRisk",
    "deliverySpeed",
    "collaboration",
    "gitMaturity",
    "architecture",
];

fn numeric_field(obj: &serde_json::Value, name: &'static str) -> Result<f64, LlmParseError> {
    let value = obj.get(name).ok_or(LlmParseError::MissingField(name))?;
    let n = value.as_f64().ok_or(LlmParseError::NotANumber(name))?;
    if !(0.0..=10.0).contains(&n) {
        return Err(LlmParseError::OutOfRange(name, n));
    }
    Ok(n)
}

/// Parse and range-validate a raw LLM response object.
pub fn parse_llm_review(raw: &serde_json::Value) -> Result<LlmReview, LlmParseError> {
    if !raw.is_object() {
        return Err(LlmParseError::NotAnObject);
    }

    let scores = CategoryScores {
        code_quality: numeric_field(raw, "codeQuality")?,
        testing: numeric_field(raw, "testing")?,
        documentation: numeric_field(raw, "documentation")?,
        security: numeric_field(raw, "security")?,
        devops: numeric_field(raw, "devopsExecution")?,
        bug_risk: numeric_field(raw, "bugRisk")?,
        delivery_speed: numeric_field(raw, "deliverySpeed")?,
        collaboration: numeric_field(raw, "collaboration")?,
        git_maturity: numeric_field(raw, "gitMaturity")?,
        architecture: numeric_field(raw, "architecture")?,
    };

    let summary = raw
        .get("summary")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();

    let suggestions = raw
        .get("suggestions")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(String::from)
                .collect()
        })
        .unwrap_or_default();

    Ok(LlmReview {
        scores,
        summary,
        suggestions,
        fallback: false,
    })
}
