//! End-to-end pipeline test over the real queue, worker pools and event
//! bus, with an in-memory database. The Review stage needs the network, so
//! the chain is driven from the Score stage: Score → Portfolio →
//! PortfolioReady event → Notification.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use scorecard_core::llm::LlmReview;
use scorecard_core::score::compute_breakdown;
use scorecard_core::{CiReport, StaticReport};
use scorecard_server::config::{Config, StageConcurrency};
use scorecard_server::db::{Database, Store, SubmissionStatus};
use scorecard_server::email::LogEmailSender;
use scorecard_server::events::{start_listener, EventBus};
use scorecard_server::metrics::Metrics;
use scorecard_server::queue::{self, JobPayload, QueueName};
use scorecard_server::workers::spawn_all;
use scorecard_server::AppState;

fn test_config() -> Config {
    Config {
        github_app_id: 1,
        github_private_key: "unused".to_string(),
        github_webhook_secret: "test-secret".to_string(),
        github_api_base: "http://127.0.0.1:0".to_string(),
        llm_api_key: "unused".to_string(),
        llm_api_base: "http://127.0.0.1:0".to_string(),
        llm_model: "test-model".to_string(),
        port: 0,
        state_dir: PathBuf::from("."),
        email_enabled: true,
        api_auth_token: Some("operator-token".to_string()),
        concurrency: StageConcurrency {
            review: 1,
            score: 1,
            portfolio: 1,
            notification: 1,
        },
    }
}

async fn pipeline_state() -> Arc<AppState> {
    let db = Store::new(Database::new_in_memory().expect("in-memory db"));
    let metrics = Arc::new(Metrics::new());
    let (bus, rx) = EventBus::new();
    start_listener(db.clone(), metrics.clone(), rx);
    Arc::new(AppState::new(
        test_config(),
        db,
        bus,
        metrics,
        Arc::new(LogEmailSender),
    ))
}

#[tokio::test]
async fn score_stage_cascades_to_portfolio_and_notification() {
    let state = pipeline_state().await;

    state
        .db
        .run(|d| {
            d.create_submission(
                "sub-1",
                "user-1",
                "proj-1",
                "https://github.com/student/shop",
                Some(7),
            )
        })
        .await
        .unwrap();
    state
        .db
        .run(|d| d.attach_pr_number("sub-1", 42))
        .await
        .unwrap();

    let breakdown = compute_breakdown(
        &LlmReview::neutral_fallback(),
        &StaticReport::default(),
        &CiReport::no_workflows(),
    );
    let expected_total = breakdown.total;
    let expected_badge = breakdown.badge.as_str().to_string();
    state
        .db
        .run(move |d| d.upsert_score("sub-1", &breakdown))
        .await
        .unwrap();

    let handles = spawn_all(state.clone());

    state
        .db
        .run(|d| {
            queue::enqueue(
                d,
                &JobPayload::Score {
                    submission_id: "sub-1".to_string(),
                },
            )
        })
        .await
        .unwrap();

    // Score worker finalizes the submission, chains Portfolio, the
    // Portfolio worker raises PortfolioReady, the listener enqueues the
    // Notification job, and the Notification worker persists rows. Give
    // the 1s pollers time to walk the whole chain.
    let mut done = false;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_millis(250)).await;
        let notifications = state
            .db
            .run(|d| d.count_notifications("user-1"))
            .await
            .unwrap();
        if notifications >= 2 {
            done = true;
            break;
        }
    }
    for handle in handles {
        handle.abort();
    }
    assert!(done, "pipeline did not cascade to notifications in time");

    let submission = state
        .db
        .run(|d| d.find_submission("sub-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(submission.status, SubmissionStatus::PortfolioReady);

    let portfolio = state
        .db
        .run(|d| d.get_portfolio("sub-1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(portfolio.total, expected_total);
    assert_eq!(portfolio.badge, expected_badge);

    // ScoreReady and PortfolioReady both notified user-1, emails sent per
    // the default preference.
    let score_email = state
        .db
        .run(|d| d.notification_email_sent("score_ready:sub-1"))
        .await
        .unwrap();
    assert!(score_email);

    let score_jobs = state
        .db
        .run(|d| queue::counts(d, QueueName::Score))
        .await
        .unwrap();
    assert_eq!(score_jobs.completed, 1);
    assert_eq!(score_jobs.queued, 0);

    let notification_jobs = state
        .db
        .run(|d| queue::counts(d, QueueName::Notification))
        .await
        .unwrap();
    assert_eq!(notification_jobs.completed, 2);
}

#[tokio::test]
async fn webhook_for_unknown_repo_leaves_every_queue_empty() {
    use scorecard_server::webhook::{process_event, Account, InstallationRef, PullRequestInfo,
        Repository, WebhookPayload};

    let state = pipeline_state().await;
    let payload = WebhookPayload {
        action: Some("opened".to_string()),
        pull_request: Some(PullRequestInfo {
            number: 42,
            user: Account {
                id: 7,
                login: "student".to_string(),
            },
        }),
        repository: Some(Repository {
            name: "mystery".to_string(),
            full_name: "nobody/mystery".to_string(),
            html_url: "https://github.com/nobody/mystery".to_string(),
            owner: Account {
                id: 1,
                login: "nobody".to_string(),
            },
        }),
        sender: None,
        installation: Some(InstallationRef {
            id: 55,
            account: None,
        }),
        workflow_run: None,
        check_suite: None,
    };

    let message = process_event(&state, "pull_request", payload).await;
    assert_eq!(message, "no matching submission");

    for queue in QueueName::all() {
        let counts = state
            .db
            .run(move |d| queue::counts(d, queue))
            .await
            .unwrap();
        assert_eq!(counts.queued, 0, "queue {} not empty", queue.as_str());
    }
}
