use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::info;

use scorecard_server::api::build_router;
use scorecard_server::config::Config;
use scorecard_server::db::{Database, Store};
use scorecard_server::email::LogEmailSender;
use scorecard_server::events::{start_listener, EventBus};
use scorecard_server::metrics::Metrics;
use scorecard_server::workers::spawn_all;
use scorecard_server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    let db_path = config.state_dir.join("scorecard.db");
    info!("Opening database at {:?}", db_path);
    let db = Store::new(
        tokio::task::spawn_blocking(move || Database::new(&db_path))
            .await
            .context("spawn_blocking panicked")?
            .context("Failed to open database")?,
    );

    let metrics = Arc::new(Metrics::new());
    let (bus, event_rx) = EventBus::new();

    let state = Arc::new(AppState::new(
        config.clone(),
        db.clone(),
        bus,
        metrics.clone(),
        Arc::new(LogEmailSender),
    ));

    start_listener(db.clone(), metrics.clone(), event_rx);
    let worker_handles = spawn_all(state.clone());
    info!(
        "Pipeline workers started ({} tasks including maintenance)",
        worker_handles.len()
    );

    let app = build_router(state).layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("scorecard-server listening on {}", addr);

    axum::serve(listener, app)
        .await
        .context("Server error")?;
    Ok(())
}
