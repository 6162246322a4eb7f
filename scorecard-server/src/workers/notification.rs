//! Notification stage: turn a domain event into a persisted in-app
//! notification and, preferences permitting, an email.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::email::EmailMessage;
use crate::events::DomainEvent;
use crate::AppState;

pub async fn handle(state: &Arc<AppState>, event: &DomainEvent) -> Result<()> {
    let Some(user_id) = resolve_user(state, event).await? else {
        info!(
            event_type = event.event_type(),
            "no user to notify for this event; dropping"
        );
        return Ok(());
    };

    let notification_id = event.notification_id();
    let (subject, body) = render(event);

    {
        let id = notification_id.clone();
        let user = user_id.clone();
        let event_type = event.event_type().to_string();
        let body = body.clone();
        state
            .db
            .run(move |d| d.insert_notification(&id, &user, &event_type, &body))
            .await
            .context("failed to persist notification")?;
    }

    // Email gating: global switch, then the per-user per-event preference
    // (missing preference means send), then idempotency on re-delivery.
    if !state.config.email_enabled {
        return Ok(());
    }

    let pref = {
        let user = user_id.clone();
        let event_type = event.event_type().to_string();
        state
            .db
            .run(move |d| d.notification_preference(&user, &event_type))
            .await?
    };
    if !pref {
        info!(user_id = %user_id, event_type = event.event_type(), "email disabled by preference");
        return Ok(());
    }

    let already_sent = {
        let id = notification_id.clone();
        state
            .db
            .run(move |d| d.notification_email_sent(&id))
            .await?
    };
    if already_sent {
        return Ok(());
    }

    let message = EmailMessage {
        user_id: user_id.clone(),
        subject,
        body,
    };
    match state.email.send(&message).await {
        Ok(()) => {
            let id = notification_id.clone();
            state.db.run(move |d| d.mark_email_sent(&id)).await?;
        }
        Err(e) => {
            // Let the queue retry the whole job; the insert above is
            // idempotent by id.
            warn!(user_id = %user_id, "email send failed: {:#}", e);
            return Err(e.context("email send failed"));
        }
    }

    Ok(())
}

/// Find the user a notification should target. Installation events may
/// predate the linkage; those resolve through the installations table and
/// drop silently if still unlinked.
async fn resolve_user(state: &Arc<AppState>, event: &DomainEvent) -> Result<Option<String>> {
    if let Some(user_id) = event.user_id() {
        return Ok(Some(user_id.to_string()));
    }
    if let DomainEvent::GithubAppInstalled { installation_id, .. } = event {
        let installation_id = *installation_id;
        return state
            .db
            .run(move |d| d.installation_user(installation_id))
            .await;
    }
    Ok(None)
}

/// Subject and body per event type.
fn render(event: &DomainEvent) -> (String, String) {
    match event {
        DomainEvent::ScoreReady { total, badge, .. } => (
            "Your project review is ready".to_string(),
            format!("Your submission scored {}/100 ({}).", total, badge),
        ),
        DomainEvent::PortfolioReady { share_token, .. } => (
            "Your portfolio page is live".to_string(),
            format!("Your reviewed project is shareable at /p/{}.", share_token),
        ),
        DomainEvent::InterviewRequested { company_name, .. } => (
            format!("{} wants to interview you", company_name),
            format!("{} requested an interview based on your portfolio.", company_name),
        ),
        DomainEvent::InterviewAccepted { company_name, .. } => (
            "Interview confirmed".to_string(),
            format!("Your interview with {} is confirmed.", company_name),
        ),
        DomainEvent::InterviewRejected { company_name, .. } => (
            "Interview update".to_string(),
            format!("{} decided not to move forward this time.", company_name),
        ),
        DomainEvent::GithubAppInstalled { account_login, .. } => (
            "GitHub app connected".to_string(),
            format!("The review app is now installed for {}.", account_login),
        ),
        DomainEvent::CompanySignup { company_name, .. } => (
            "Welcome aboard".to_string(),
            format!("{} is now registered.", company_name),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_state;

    fn score_ready() -> DomainEvent {
        DomainEvent::ScoreReady {
            submission_id: "sub-1".into(),
            user_id: "user-1".into(),
            total: 80,
            badge: "green".into(),
        }
    }

    #[tokio::test]
    async fn persists_notification_and_sends_email_by_default() {
        let state = test_state().await;
        handle(&state, &score_ready()).await.unwrap();

        let count = state
            .db
            .run(|d| d.count_notifications("user-1"))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let sent = state
            .db
            .run(|d| d.notification_email_sent("score_ready:sub-1"))
            .await
            .unwrap();
        assert!(sent, "missing preference defaults to send");
    }

    #[tokio::test]
    async fn redelivery_keeps_one_notification_row() {
        let state = test_state().await;
        handle(&state, &score_ready()).await.unwrap();
        handle(&state, &score_ready()).await.unwrap();

        let count = state
            .db
            .run(|d| d.count_notifications("user-1"))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn preference_opt_out_skips_email_but_keeps_notification() {
        let state = test_state().await;
        state
            .db
            .run(|d| d.set_notification_preference("user-1", "score_ready", false))
            .await
            .unwrap();

        handle(&state, &score_ready()).await.unwrap();

        let count = state
            .db
            .run(|d| d.count_notifications("user-1"))
            .await
            .unwrap();
        assert_eq!(count, 1);

        let sent = state
            .db
            .run(|d| d.notification_email_sent("score_ready:sub-1"))
            .await
            .unwrap();
        assert!(!sent);
    }

    #[tokio::test]
    async fn unlinked_installation_event_is_dropped_quietly() {
        let state = test_state().await;
        let event = DomainEvent::GithubAppInstalled {
            installation_id: 5,
            account_login: "student".into(),
            user_id: None,
        };
        handle(&state, &event).await.unwrap();

        let count = state
            .db
            .run(|d| d.count_notifications("user-1"))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn linked_installation_event_notifies_the_linked_user() {
        let state = test_state().await;
        state
            .db
            .run(|d| d.upsert_installation(5, 7, "student", Some("user-1")))
            .await
            .unwrap();

        let event = DomainEvent::GithubAppInstalled {
            installation_id: 5,
            account_login: "student".into(),
            user_id: None,
        };
        handle(&state, &event).await.unwrap();

        let count = state
            .db
            .run(|d| d.count_notifications("user-1"))
            .await
            .unwrap();
        assert_eq!(count, 1);
    }
}
