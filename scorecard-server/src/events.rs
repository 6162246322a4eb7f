//! Process-local domain-event bus.
//!
//! Components publish events synchronously at the point where the
//! triggering action completed; a single listener turns every event into a
//! Notification-stage job. Publishing can never block or fail the
//! publisher — a closed channel is logged and the event dropped, and
//! everything after the listener is covered by the queue's own retry
//! machinery.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::db::Store;
use crate::queue::{self, JobPayload};
use crate::{dead_letter, metrics::Metrics};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    ScoreReady {
        submission_id: String,
        user_id: String,
        total: u8,
        badge: String,
    },
    PortfolioReady {
        submission_id: String,
        user_id: String,
        share_token: String,
    },
    InterviewRequested {
        user_id: String,
        company_name: String,
    },
    InterviewAccepted {
        user_id: String,
        company_name: String,
    },
    InterviewRejected {
        user_id: String,
        company_name: String,
    },
    GithubAppInstalled {
        installation_id: u64,
        account_login: String,
        user_id: Option<String>,
    },
    CompanySignup {
        company_name: String,
        admin_user_id: String,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::ScoreReady { .. } => "score_ready",
            DomainEvent::PortfolioReady { .. } => "portfolio_ready",
            DomainEvent::InterviewRequested { .. } => "interview_requested",
            DomainEvent::InterviewAccepted { .. } => "interview_accepted",
            DomainEvent::InterviewRejected { .. } => "interview_rejected",
            DomainEvent::GithubAppInstalled { .. } => "github_app_installed",
            DomainEvent::CompanySignup { .. } => "company_signup",
        }
    }

    /// The user this event notifies, when one is known.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            DomainEvent::ScoreReady { user_id, .. }
            | DomainEvent::PortfolioReady { user_id, .. }
            | DomainEvent::InterviewRequested { user_id, .. }
            | DomainEvent::InterviewAccepted { user_id, .. }
            | DomainEvent::InterviewRejected { user_id, .. } => Some(user_id),
            DomainEvent::GithubAppInstalled { user_id, .. } => user_id.as_deref(),
            DomainEvent::CompanySignup { admin_user_id, .. } => Some(admin_user_id),
        }
    }

    /// Deterministic notification id, so re-delivered Notification jobs
    /// upsert rather than duplicate.
    pub fn notification_id(&self) -> String {
        match self {
            DomainEvent::ScoreReady { submission_id, .. } => {
                format!("score_ready:{}", submission_id)
            }
            DomainEvent::PortfolioReady { submission_id, .. } => {
                format!("portfolio_ready:{}", submission_id)
            }
            DomainEvent::InterviewRequested { user_id, company_name } => {
                format!("interview_requested:{}:{}", user_id, company_name)
            }
            DomainEvent::InterviewAccepted { user_id, company_name } => {
                format!("interview_accepted:{}:{}", user_id, company_name)
            }
            DomainEvent::InterviewRejected { user_id, company_name } => {
                format!("interview_rejected:{}:{}", user_id, company_name)
            }
            DomainEvent::GithubAppInstalled { installation_id, .. } => {
                format!("github_app_installed:{}", installation_id)
            }
            DomainEvent::CompanySignup { company_name, .. } => {
                format!("company_signup:{}", company_name)
            }
        }
    }
}

#[derive(Clone)]
pub struct EventBus {
    tx: mpsc::UnboundedSender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DomainEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Publish an event. Never blocks and never fails the caller.
    pub fn publish(&self, event: DomainEvent) {
        if let Err(e) = self.tx.send(event) {
            error!("event bus is closed, dropping event: {}", e);
        }
    }
}

/// Run the single listener that turns domain events into Notification jobs.
///
/// Enqueue failures are logged and recorded in the dead-letter store so a
/// fire-and-forget publish can never be silently lost.
pub fn start_listener(
    db: Store,
    metrics: Arc<Metrics>,
    mut rx: mpsc::UnboundedReceiver<DomainEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("event listener started");
        while let Some(event) = rx.recv().await {
            let event_type = event.event_type();
            metrics.events_published.inc();
            let payload = JobPayload::Notification { event: event.clone() };
            let enqueue_db = db.clone();
            let result = enqueue_db
                .run(move |d| queue::enqueue(d, &payload))
                .await;
            if let Err(e) = result {
                warn!("failed to enqueue notification job for {}: {:#}", event_type, e);
                let raw = serde_json::to_value(&event).unwrap_or_default();
                let dl = db
                    .run(move |d| {
                        dead_letter::append(
                            d,
                            "notification",
                            &raw,
                            "enqueue from event listener failed",
                            None,
                            None,
                            None,
                        )
                    })
                    .await;
                if let Err(e) = dl {
                    error!("failed to dead-letter dropped event: {:#}", e);
                }
            }
        }
        info!("event listener stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_types_are_stable() {
        let event = DomainEvent::ScoreReady {
            submission_id: "s".into(),
            user_id: "u".into(),
            total: 80,
            badge: "green".into(),
        };
        assert_eq!(event.event_type(), "score_ready");
        assert_eq!(event.user_id(), Some("u"));
        assert_eq!(event.notification_id(), "score_ready:s");
    }

    #[test]
    fn events_round_trip_through_json() {
        let event = DomainEvent::GithubAppInstalled {
            installation_id: 9,
            account_login: "student".into(),
            user_id: None,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }

    #[tokio::test]
    async fn listener_enqueues_notification_jobs() {
        let db = Store::new(crate::db::Database::new_in_memory().unwrap());
        let metrics = Arc::new(Metrics::new());
        let (bus, rx) = EventBus::new();
        let handle = start_listener(db.clone(), metrics, rx);

        bus.publish(DomainEvent::CompanySignup {
            company_name: "acme".into(),
            admin_user_id: "u-9".into(),
        });
        drop(bus);
        handle.await.unwrap();

        let counts = db
            .run(|d| queue::counts(d, crate::queue::QueueName::Notification))
            .await
            .unwrap();
        assert_eq!(counts.queued, 1);
    }
}
