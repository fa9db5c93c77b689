pub mod config;
pub mod error;
pub mod github;
pub mod metrics;
pub mod poller;
pub mod progress;
pub mod routes;
pub mod store;
pub mod types;

use axum::{
    routing::{get, post},
    Json, Router,
};
use config::AppConfig;
use github::{CodeHost, GitHubClient};
use poller::RepositoryPoller;
use progress::ProgressTracker;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use store::Store;
use tower_http::cors::CorsLayer;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

#[derive(Serialize)]
pub struct HealthResponse {
    status: &'static str,
    service: &'static str,
    version: &'static str,
}

/// Shared application state accessible to all request handlers.
pub struct AppState {
    /// Application configuration loaded from environment variables.
    pub config: AppConfig,
    pub store: Store,
    pub host: Arc<dyn CodeHost>,
    /// Background collector of language snapshots.
    pub poller: Arc<RepositoryPoller>,
    pub progress: ProgressTracker,
}

impl AppState {
    /// Opens the database and builds the GitHub client from `config`.
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let store = Store::connect(&config.database_url, config.database_max_connections).await?;
        let host = GitHubClient::new(config.github_token.clone(), config.github_timeout())?;
        Ok(Self::with_host(config, store, Arc::new(host)))
    }

    pub fn with_host(config: AppConfig, store: Store, host: Arc<dyn CodeHost>) -> Self {
        let poller = Arc::new(RepositoryPoller::new(
            store.clone(),
            Arc::clone(&host),
            config.metrics_retention(),
        ));
        let progress = ProgressTracker::new(
            Arc::clone(&host),
            config.max_commit_pages,
            config.commit_fetch_delay(),
            config.commit_cache_capacity,
        );

        Self {
            config,
            store,
            host,
            poller,
            progress,
        }
    }
}

pub fn create_app(state: Arc<AppState>) -> Router {
    let static_dir = Path::new(&state.config.static_dir);
    let serve_dir =
        ServeDir::new(static_dir).not_found_service(ServeFile::new(static_dir.join("index.html")));

    Router::new()
        .route("/api/health", get(health_check))
        .route(
            "/api/teams",
            get(routes::list_teams).post(routes::create_team),
        )
        .route(
            "/api/teams/{id}",
            get(routes::get_team)
                .put(routes::rename_team)
                .delete(routes::delete_team),
        )
        .route(
            "/api/repos",
            get(routes::list_repositories).post(routes::create_repository),
        )
        .route(
            "/api/repos/{id}",
            get(routes::get_repository).delete(routes::delete_repository),
        )
        .route("/api/metrics", get(routes::list_metrics))
        .route("/api/metrics/chart/{team_id}", get(routes::get_team_chart))
        .route(
            "/api/progress/repository/{owner}/{repo}",
            get(routes::get_repository_progress),
        )
        .route(
            "/api/progress/team/{team_id}",
            get(routes::get_team_progress),
        )
        .route("/api/progress/compare", post(routes::compare_progress))
        .route("/api/github/poll", post(routes::trigger_poll))
        .route(
            "/api/github/languages/{owner}/{repo}",
            get(routes::get_languages),
        )
        .route("/api/stream", get(routes::stream_updates))
        .route("/api/stats", get(routes::get_stats))
        .fallback_service(serve_dir)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: "hackshon-backend",
        version: env!("CARGO_PKG_VERSION"),
    })
}
