use anyhow::Result;
use axum::Router;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, Level};

use reviewd_server::api::api_router;
use reviewd_server::client::ReviewClient;
use reviewd_server::config::Config;
use reviewd_server::github::GitHubClient;
use reviewd_server::openai::OpenAiClient;
use reviewd_server::queue::JobQueue;
use reviewd_server::store::ReviewStore;
use reviewd_server::webhook::webhook_router;
use reviewd_server::worker::worker_loop;
use reviewd_server::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::INFO).init();

    info!("Starting reviewd");

    let config =
        Config::from_env().expect("Failed to load configuration from environment variables");

    let github = GitHubClient::new(
        config.github_app_id,
        config.github_private_key,
        config.fetch_timeout,
        config.fetch_max_retries,
    )?;

    let openai = OpenAiClient::new(config.openai_api_key, config.llm_timeout)?;
    let review_client = ReviewClient::new(
        Arc::new(openai),
        config.openai_model,
        config.rate_limit_capacity,
        config.rate_limit_refill_per_sec,
        config.rate_limit_max_wait,
        config.cache_ttl,
    );

    info!("Using review database: {}", config.database_path.display());
    let store = ReviewStore::open(&config.database_path)?;

    let app_state = Arc::new(AppState {
        webhook_secret: config.github_webhook_secret,
        queue: Arc::new(JobQueue::new(config.retry)),
        store,
        github,
        review_client: Arc::new(review_client),
    });

    for worker_id in 0..config.worker_count {
        let worker_state = app_state.clone();
        tokio::spawn(async move {
            worker_loop(worker_state, worker_id).await;
        });
    }
    info!("Started {} review workers", config.worker_count);

    let app = Router::new()
        .merge(api_router())
        .merge(webhook_router(app_state.clone()))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive()),
        )
        .with_state(app_state);

    let listener = TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    info!("Server listening on port {}", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
