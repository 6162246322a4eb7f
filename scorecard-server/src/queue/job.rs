//! Stage job payloads.
//!
//! One tagged union per pipeline stage, validated at enqueue time so a
//! malformed payload fails loudly at the call site instead of inside a
//! worker three retries later.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

use crate::events::DomainEvent;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewTrigger {
    /// PR opened/reopened/synchronized webhook.
    PrEvent,
    /// CI run completed webhook.
    CiEvent,
    /// Manual fetch-PR endpoint.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "snake_case")]
pub enum JobPayload {
    Review {
        submission_id: String,
        repo_owner: String,
        repo_name: String,
        pr_number: u64,
        installation_id: u64,
        trigger: ReviewTrigger,
        /// Conclusion carried by a CI-completed webhook, if that is what
        /// triggered this review.
        ci_conclusion: Option<String>,
    },
    Score {
        submission_id: String,
    },
    Portfolio {
        submission_id: String,
    },
    Notification {
        event: DomainEvent,
    },
}

impl JobPayload {
    pub fn submission_id(&self) -> Option<&str> {
        match self {
            JobPayload::Review { submission_id, .. }
            | JobPayload::Score { submission_id }
            | JobPayload::Portfolio { submission_id } => Some(submission_id),
            JobPayload::Notification { .. } => None,
        }
    }

    pub fn pr_number(&self) -> Option<u64> {
        match self {
            JobPayload::Review { pr_number, .. } => Some(*pr_number),
            _ => None,
        }
    }

    /// Reject structurally invalid payloads before they reach the broker.
    pub fn validate(&self) -> Result<()> {
        match self {
            JobPayload::Review {
                submission_id,
                repo_owner,
                repo_name,
                pr_number,
                installation_id,
                ..
            } => {
                if submission_id.is_empty() {
                    bail!("review job requires a submission id");
                }
                if repo_owner.is_empty() || repo_name.is_empty() {
                    bail!("review job requires a repository owner and name");
                }
                if *pr_number == 0 {
                    bail!("review job requires a PR number");
                }
                if *installation_id == 0 {
                    bail!("review job requires an installation id");
                }
            }
            JobPayload::Score { submission_id } | JobPayload::Portfolio { submission_id } => {
                if submission_id.is_empty() {
                    bail!("job requires a submission id");
                }
            }
            JobPayload::Notification { event } => {
                if event.user_id().is_none() {
                    // Installed-without-linkage is the one event allowed to
                    // have no target user; the worker resolves it.
                    if !matches!(event, DomainEvent::GithubAppInstalled { .. }) {
                        bail!("notification job has no target user");
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
pub fn review_payload(submission_id: &str, pr_number: u64) -> JobPayload {
    JobPayload::Review {
        submission_id: submission_id.to_string(),
        repo_owner: "student".to_string(),
        repo_name: "shop".to_string(),
        pr_number,
        installation_id: 55,
        trigger: ReviewTrigger::PrEvent,
        ci_conclusion: None,
    }
}
