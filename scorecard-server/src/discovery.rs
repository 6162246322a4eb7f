//! Cascading PR discovery.
//!
//! Locates the PR a student opened after registering a submission:
//! a bounded primary polling phase, then an automatic diagnostic phase
//! with a shorter interval and a larger budget. Exhaustion is a normal
//! outcome ("not found yet"), never an error — the submission stays
//! eligible for manual retry. Every attempt and transition is logged with
//! repository, attempt count and elapsed time, because "I submitted and
//! nothing happened" is the most common support request this system gets.

use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::github::{GitHubClient, OpenPr};

/// Where the pipeline gets its open-PR list from. Trait-shaped so the
/// state machine is testable without the network.
#[async_trait]
pub trait PullRequestSource: Send + Sync {
    async fn list_open_prs(&self, repo_owner: &str, repo_name: &str) -> Result<Vec<OpenPr>>;
}

pub struct GitHubPrSource {
    pub client: GitHubClient,
    pub installation_id: u64,
}

#[async_trait]
impl PullRequestSource for GitHubPrSource {
    async fn list_open_prs(&self, repo_owner: &str, repo_name: &str) -> Result<Vec<OpenPr>> {
        self.client
            .list_open_prs(self.installation_id, repo_owner, repo_name)
            .await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    Primary,
    Diagnostic,
}

impl SearchPhase {
    fn as_str(&self) -> &'static str {
        match self {
            SearchPhase::Primary => "primary",
            SearchPhase::Diagnostic => "diagnostic",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SearchBudget {
    pub interval: Duration,
    pub max_attempts: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy)]
pub struct DiscoveryBudgets {
    pub primary: SearchBudget,
    pub diagnostic: SearchBudget,
}

impl DiscoveryBudgets {
    /// Budgets for the automatic path (submit-for-review).
    pub fn automatic() -> Self {
        Self {
            primary: SearchBudget {
                interval: Duration::from_secs(3),
                max_attempts: 5,
                timeout: Duration::from_secs(20),
            },
            diagnostic: SearchBudget {
                interval: Duration::from_secs(2),
                max_attempts: 15,
                timeout: Duration::from_secs(45),
            },
        }
    }

    /// Tighter budgets for the synchronous manual endpoint.
    pub fn manual() -> Self {
        Self {
            primary: SearchBudget {
                interval: Duration::from_secs(2),
                max_attempts: 3,
                timeout: Duration::from_secs(10),
            },
            diagnostic: SearchBudget {
                interval: Duration::from_secs(2),
                max_attempts: 6,
                timeout: Duration::from_secs(15),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    Found {
        pr_number: u64,
        phase: SearchPhase,
    },
    /// Both phases exhausted. Not an error: the PR may simply not exist
    /// yet.
    Exhausted,
}

/// Run the two-phase state machine to completion.
pub async fn discover_pr(
    source: &dyn PullRequestSource,
    repo_owner: &str,
    repo_name: &str,
    budgets: &DiscoveryBudgets,
) -> DiscoveryOutcome {
    for (phase, budget) in [
        (SearchPhase::Primary, budgets.primary),
        (SearchPhase::Diagnostic, budgets.diagnostic),
    ] {
        if let Some(pr_number) = run_phase(source, repo_owner, repo_name, phase, &budget).await {
            return DiscoveryOutcome::Found { pr_number, phase };
        }
    }

    info!(
        repo = format!("{}/{}", repo_owner, repo_name),
        "discovery exhausted both phases; reporting not-found-yet"
    );
    DiscoveryOutcome::Exhausted
}

/// One polling phase. Returns the selected PR number, or None when the
/// attempt budget or wall-clock budget runs out.
async fn run_phase(
    source: &dyn PullRequestSource,
    repo_owner: &str,
    repo_name: &str,
    phase: SearchPhase,
    budget: &SearchBudget,
) -> Option<u64> {
    let started = Instant::now();
    info!(
        repo = format!("{}/{}", repo_owner, repo_name),
        phase = phase.as_str(),
        max_attempts = budget.max_attempts,
        timeout_secs = budget.timeout.as_secs(),
        "discovery phase starting"
    );

    for attempt in 1..=budget.max_attempts {
        if started.elapsed() >= budget.timeout {
            info!(
                repo = format!("{}/{}", repo_owner, repo_name),
                phase = phase.as_str(),
                attempt,
                elapsed_secs = started.elapsed().as_secs(),
                "discovery phase hit its wall-clock budget"
            );
            return None;
        }

        match source.list_open_prs(repo_owner, repo_name).await {
            // Most recently created open PR wins.
            Ok(prs) if !prs.is_empty() => {
                let Some(selected) = prs.iter().max_by_key(|pr| pr.created_at) else {
                    continue;
                };
                info!(
                    repo = format!("{}/{}", repo_owner, repo_name),
                    phase = phase.as_str(),
                    attempt,
                    elapsed_secs = started.elapsed().as_secs(),
                    pr_number = selected.number,
                    author = %selected.author_login,
                    "discovery found an open PR"
                );
                return Some(selected.number);
            }
            Ok(_) => {
                info!(
                    repo = format!("{}/{}", repo_owner, repo_name),
                    phase = phase.as_str(),
                    attempt,
                    elapsed_secs = started.elapsed().as_secs(),
                    "no open PRs yet"
                );
            }
            Err(e) => {
                warn!(
                    repo = format!("{}/{}", repo_owner, repo_name),
                    phase = phase.as_str(),
                    attempt,
                    "open-PR poll failed: {:#}",
                    e
                );
            }
        }

        if attempt < budget.max_attempts {
            tokio::time::sleep(budget.interval).await;
        }
    }

    info!(
        repo = format!("{}/{}", repo_owner, repo_name),
        phase = phase.as_str(),
        elapsed_secs = started.elapsed().as_secs(),
        "discovery phase exhausted its attempt budget"
    );
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedSource {
        /// Attempt number (1-indexed) on which PRs appear; 0 = never.
        found_on_attempt: u32,
        calls: AtomicU32,
        prs: Vec<OpenPr>,
    }

    impl ScriptedSource {
        fn never() -> Self {
            Self {
                found_on_attempt: 0,
                calls: AtomicU32::new(0),
                prs: vec![],
            }
        }

        fn found_after(attempts: u32, prs: Vec<OpenPr>) -> Self {
            Self {
                found_on_attempt: attempts,
                calls: AtomicU32::new(0),
                prs,
            }
        }
    }

    #[async_trait]
    impl PullRequestSource for ScriptedSource {
        async fn list_open_prs(&self, _owner: &str, _repo: &str) -> Result<Vec<OpenPr>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.found_on_attempt != 0 && call >= self.found_on_attempt {
                Ok(self.prs.clone())
            } else {
                Ok(vec![])
            }
        }
    }

    fn pr(number: u64, created_secs: i64) -> OpenPr {
        OpenPr {
            number,
            author_id: 42,
            author_login: "student".into(),
            created_at: Utc.timestamp_opt(created_secs, 0).unwrap(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn finds_pr_in_primary_phase() {
        let source = ScriptedSource::found_after(1, vec![pr(7, 100)]);
        let outcome =
            discover_pr(&source, "student", "shop", &DiscoveryBudgets::automatic()).await;
        assert_eq!(
            outcome,
            DiscoveryOutcome::Found {
                pr_number: 7,
                phase: SearchPhase::Primary
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn most_recently_created_pr_wins() {
        let source = ScriptedSource::found_after(1, vec![pr(3, 100), pr(9, 500), pr(5, 300)]);
        let outcome =
            discover_pr(&source, "student", "shop", &DiscoveryBudgets::automatic()).await;
        assert!(matches!(outcome, DiscoveryOutcome::Found { pr_number: 9, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn falls_through_to_diagnostic_phase() {
        // Primary exhausts its 5 attempts; the 7th call overall succeeds,
        // which lands inside the diagnostic phase.
        let source = ScriptedSource::found_after(7, vec![pr(4, 100)]);
        let outcome =
            discover_pr(&source, "student", "shop", &DiscoveryBudgets::automatic()).await;
        assert_eq!(
            outcome,
            DiscoveryOutcome::Found {
                pr_number: 4,
                phase: SearchPhase::Diagnostic
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_when_no_pr_ever_appears() {
        let source = ScriptedSource::never();
        let started = tokio::time::Instant::now();
        let budgets = DiscoveryBudgets::automatic();
        let outcome = discover_pr(&source, "student", "shop", &budgets).await;
        assert_eq!(outcome, DiscoveryOutcome::Exhausted);

        // Terminates within the sum of both phases' wall-clock budgets.
        let elapsed = started.elapsed();
        assert!(elapsed <= budgets.primary.timeout + budgets.diagnostic.timeout);

        // Every budgeted attempt was actually made.
        let expected = budgets.primary.max_attempts + budgets.diagnostic.max_attempts;
        let calls = source.calls.load(Ordering::SeqCst);
        assert!(calls <= expected);
        assert!(calls >= budgets.primary.max_attempts);
    }

    #[tokio::test(start_paused = true)]
    async fn poll_errors_do_not_abort_the_phase() {
        struct FlakyThenFound {
            calls: AtomicU32,
        }

        #[async_trait]
        impl PullRequestSource for FlakyThenFound {
            async fn list_open_prs(&self, _o: &str, _r: &str) -> Result<Vec<OpenPr>> {
                let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                if call == 1 {
                    anyhow::bail!("rate limited");
                }
                Ok(vec![pr(11, 100)])
            }
        }

        let source = FlakyThenFound {
            calls: AtomicU32::new(0),
        };
        let outcome =
            discover_pr(&source, "student", "shop", &DiscoveryBudgets::manual()).await;
        assert!(matches!(outcome, DiscoveryOutcome::Found { pr_number: 11, .. }));
    }
}
