pub mod api;
pub mod config;
pub mod db;
pub mod dead_letter;
pub mod discovery;
pub mod email;
pub mod events;
pub mod github;
pub mod llm;
pub mod metrics;
pub mod queue;
pub mod ttl_cache;
pub mod webhook;
pub mod workers;

use std::sync::Arc;
use std::time::Duration;

use config::Config;
use db::Store;
use email::EmailSender;
use events::EventBus;
use github::GitHubClient;
use llm::LlmClient;
use metrics::Metrics;
use ttl_cache::TtlCache;

/// Request-scoped id propagated from webhook ingress into logs.
#[derive(Debug, Clone, Default)]
pub struct CorrelationId(pub String);

/// How long an installation-link state token stays redeemable.
pub const INSTALL_STATE_TTL: Duration = Duration::from_secs(10 * 60);

pub struct AppState {
    pub config: Config,
    pub db: Store,
    pub github: GitHubClient,
    pub llm: LlmClient,
    pub bus: EventBus,
    pub metrics: Arc<Metrics>,
    pub email: Arc<dyn EmailSender>,
    /// One-shot CSRF state tokens for the installation-linking flow.
    pub install_states: TtlCache<String, String>,
}

impl AppState {
    pub fn new(
        config: Config,
        db: Store,
        bus: EventBus,
        metrics: Arc<Metrics>,
        email: Arc<dyn EmailSender>,
    ) -> Self {
        let github = GitHubClient::new(
            config.github_app_id,
            config.github_private_key.clone(),
            config.github_api_base.clone(),
        )
        .with_metrics(metrics.clone());
        let llm = LlmClient::new(
            config.llm_api_base.clone(),
            config.llm_api_key.clone(),
            config.llm_model.clone(),
        )
        .with_metrics(metrics.clone());

        Self {
            config,
            db,
            github,
            llm,
            bus,
            metrics,
            email,
            install_states: TtlCache::new(INSTALL_STATE_TTL),
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::config::StageConcurrency;
    use crate::email::LogEmailSender;
    use std::path::PathBuf;

    pub fn test_config() -> Config {
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

    /// An AppState over an in-memory database with the event listener
    /// running. Gateways point at unroutable addresses; tests that reach
    /// them are wrong by construction.
    pub async fn test_state() -> Arc<AppState> {
        let db = Store::new(crate::db::Database::new_in_memory().expect("in-memory db"));
        let metrics = Arc::new(Metrics::new());
        let (bus, rx) = EventBus::new();
        events::start_listener(db.clone(), metrics.clone(), rx);
        Arc::new(AppState::new(
            test_config(),
            db,
            bus,
            metrics,
            Arc::new(LogEmailSender),
        ))
    }
}
