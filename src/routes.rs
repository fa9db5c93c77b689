//! HTTP handlers for the dashboard JSON API.

use crate::error::{ApiResult, AppError};
use crate::metrics::{self, ChartData};
use crate::poller::PollOutcome;
use crate::progress::{
    ProgressComparison, ProgressWindow, RepositoryProgress, DEFAULT_INTERVAL_MINUTES,
};
use crate::store::MetricFilter;
use crate::types::{
    LanguageBytes, Metric, NewRepository, RepoId, Repository, StoreStats, Team,
    TeamWithRepositories,
};
use crate::AppState;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use futures::stream::{self, Stream};
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

// Teams

#[derive(Debug, Deserialize)]
pub struct TeamPayload {
    pub name: Option<String>,
}

fn required_name(payload: TeamPayload) -> ApiResult<String> {
    payload
        .name
        .map(|name| name.trim().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| AppError::Validation("Team name is required".to_string()))
}

pub async fn list_teams(State(state): State<Arc<AppState>>) -> ApiResult<Json<Vec<Team>>> {
    Ok(Json(state.store.teams().await?))
}

pub async fn get_team(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<TeamWithRepositories>> {
    state
        .store
        .team_with_repositories(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Team not found".to_string()))
}

pub async fn create_team(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TeamPayload>,
) -> ApiResult<(StatusCode, Json<Team>)> {
    let name = required_name(payload)?;
    let team = state
        .store
        .create_team(&name)
        .await
        .map_err(|e| AppError::from_write(e, || format!("Team '{}' already exists", name)))?;

    tracing::info!(team_id = team.id, name = %team.name, "Created team");
    Ok((StatusCode::CREATED, Json(team)))
}

pub async fn rename_team(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
    Json(payload): Json<TeamPayload>,
) -> ApiResult<Json<Team>> {
    let name = required_name(payload)?;
    state
        .store
        .rename_team(id, &name)
        .await
        .map_err(|e| AppError::from_write(e, || format!("Team '{}' already exists", name)))?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Team not found".to_string()))
}

pub async fn delete_team(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.delete_team(id).await? {
        return Err(AppError::NotFound("Team not found".to_string()));
    }
    tracing::info!(team_id = id, "Deleted team");
    Ok(Json(json!({ "message": "Team deleted successfully" })))
}

// Repositories

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryQuery {
    pub team_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRepositoryRequest {
    pub team_id: Option<i64>,
    pub owner: Option<String>,
    pub name: Option<String>,
    pub url: Option<String>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub async fn list_repositories(
    Query(query): Query<RepositoryQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Repository>>> {
    let repositories = match query.team_id {
        Some(team_id) => state.store.repositories_for_team(team_id).await?,
        None => state.store.repositories().await?,
    };
    Ok(Json(repositories))
}

pub async fn get_repository(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Repository>> {
    state
        .store
        .repository(id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound("Repository not found".to_string()))
}

/// Registers a repository after confirming it exists on GitHub and is public.
pub async fn create_repository(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateRepositoryRequest>,
) -> ApiResult<(StatusCode, Json<Repository>)> {
    let (Some(team_id), Some(owner), Some(name)) = (
        request.team_id,
        non_empty(request.owner),
        non_empty(request.name),
    ) else {
        return Err(AppError::Validation(
            "teamId, owner, and name are required".to_string(),
        ));
    };

    if state.store.team(team_id).await?.is_none() {
        return Err(AppError::NotFound("Team not found".to_string()));
    }

    let repo_id = RepoId::new(&owner, &name);
    let info = state.host.repository(&repo_id).await?;
    if info.private {
        return Err(AppError::Validation(
            "Private repositories are not supported".to_string(),
        ));
    }
    tracing::info!(repo = %repo_id, "Repository verified");

    let url = non_empty(request.url).unwrap_or_else(|| format!("https://github.com/{}", repo_id));
    let repository = state
        .store
        .create_repository(&NewRepository {
            team_id,
            owner,
            name,
            url,
        })
        .await
        .map_err(|e| AppError::from_write(e, || format!("Repository {} is already registered", repo_id)))?;

    if state.config.poll_on_repository_create {
        let poller = Arc::clone(&state.poller);
        tokio::spawn(async move {
            poller.poll_now().await;
        });
    }

    Ok((StatusCode::CREATED, Json(repository)))
}

pub async fn delete_repository(
    Path(id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<serde_json::Value>> {
    if !state.store.delete_repository(id).await? {
        return Err(AppError::NotFound("Repository not found".to_string()));
    }
    Ok(Json(json!({ "message": "Repository deleted successfully" })))
}

// Metrics

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsQuery {
    pub team_id: Option<i64>,
    pub repository_id: Option<i64>,
    pub limit: Option<u32>,
}

pub async fn list_metrics(
    Query(query): Query<MetricsQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Vec<Metric>>> {
    let filter = MetricFilter {
        team_id: query.team_id,
        repository_id: query.repository_id,
        limit: query.limit,
    };
    Ok(Json(state.store.metrics(filter).await?))
}

pub async fn get_team_chart(
    Path(team_id): Path<i64>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ChartData>> {
    Ok(Json(metrics::build_chart(&state.store, team_id).await?))
}

pub async fn get_stats(State(state): State<Arc<AppState>>) -> ApiResult<Json<StoreStats>> {
    Ok(Json(state.store.stats().await?))
}

/// Pushes every team's chart on connect and again after each poll cycle.
pub async fn stream_updates(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let updates = state.poller.subscribe();

    let events = stream::unfold(
        (state, updates, true),
        |(state, mut updates, first)| async move {
            if !first {
                match updates.recv().await {
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Chart stream subscriber lagging")
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
            let event = chart_event(&state).await;
            Some((Ok(event), (state, updates, false)))
        },
    );

    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn chart_event(state: &AppState) -> Event {
    let charts = metrics::all_charts(&state.store)
        .await
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to load charts for stream: {}", e);
            Vec::new()
        });

    Event::default()
        .event("update")
        .id(Utc::now().timestamp_millis().to_string())
        .json_data(&charts)
        .unwrap_or_else(|e| Event::default().event("error").data(e.to_string()))
}

// GitHub

pub async fn trigger_poll(State(state): State<Arc<AppState>>) -> Response {
    match state.poller.poll_now().await {
        PollOutcome::Completed(summary) => Json(summary).into_response(),
        PollOutcome::Queued => {
            (StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))).into_response()
        }
        PollOutcome::Aborted => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "Poll cycle failed" })),
        )
            .into_response(),
    }
}

pub async fn get_languages(
    Path(repo_id): Path<RepoId>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<LanguageBytes>> {
    Ok(Json(state.host.languages(&repo_id).await?))
}

// Progress

#[derive(Debug, Deserialize)]
pub struct ProgressQuery {
    pub since: Option<String>,
    pub until: Option<String>,
    pub interval: Option<u32>,
}

fn parse_timestamp(name: &str, value: &str) -> ApiResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|_| {
            AppError::Validation(format!(
                "Invalid {} date format. Use ISO 8601 format (e.g., 2025-10-04T10:00:00Z)",
                name
            ))
        })
}

fn progress_window(
    since: Option<&str>,
    until: Option<&str>,
    interval: Option<u32>,
) -> ApiResult<ProgressWindow> {
    let since = since
        .ok_or_else(|| {
            AppError::Validation("since parameter is required (ISO 8601 format)".to_string())
        })
        .and_then(|since| parse_timestamp("since", since))?;
    let until = until.map(|until| parse_timestamp("until", until)).transpose()?;

    ProgressWindow::new(
        since,
        until,
        interval.unwrap_or(DEFAULT_INTERVAL_MINUTES),
        Utc::now(),
    )
}

pub async fn get_repository_progress(
    Path(repo_id): Path<RepoId>,
    Query(query): Query<ProgressQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<RepositoryProgress>> {
    let window = progress_window(
        query.since.as_deref(),
        query.until.as_deref(),
        query.interval,
    )?;
    Ok(Json(state.progress.history(&repo_id, &window).await?))
}

pub async fn get_team_progress(
    Path(team_id): Path<i64>,
    Query(query): Query<ProgressQuery>,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<ProgressComparison>> {
    let window = progress_window(
        query.since.as_deref(),
        query.until.as_deref(),
        query.interval,
    )?;
    Ok(Json(
        state
            .progress
            .team_history(&state.store, team_id, &window)
            .await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct CompareTarget {
    pub owner: Option<String>,
    pub repo: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompareRequest {
    #[serde(default)]
    pub repositories: Vec<CompareTarget>,
    pub since: Option<String>,
    pub until: Option<String>,
    pub interval_minutes: Option<u32>,
}

pub async fn compare_progress(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CompareRequest>,
) -> ApiResult<Json<ProgressComparison>> {
    if request.repositories.is_empty() {
        return Err(AppError::Validation(
            "repositories array is required".to_string(),
        ));
    }
    let window = progress_window(
        request.since.as_deref(),
        request.until.as_deref(),
        request.interval_minutes,
    )?;

    let targets: Vec<RepoId> = request
        .repositories
        .into_iter()
        .filter_map(|target| match (non_empty(target.owner), non_empty(target.repo)) {
            (Some(owner), Some(repo)) => Some(RepoId::new(owner, repo)),
            _ => None,
        })
        .collect();

    Ok(Json(ProgressComparison {
        team: None,
        period: window.period(Utc::now()),
        interval_minutes: window.interval_minutes,
        repositories: state.progress.compare(&targets, &window).await,
    }))
}
