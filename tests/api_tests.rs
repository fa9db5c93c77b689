use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use hackshon::{
    config::AppConfig,
    create_app,
    error::HostError,
    github::{CodeHost, CommitDelta, CommitSummary, CommitWindow, RepositoryInfo},
    store::Store,
    types::{LanguageBytes, RepoId},
    AppState,
};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tower::ServiceExt; // for `oneshot`

/// Canned GitHub: every repository listed in `languages` exists and is public
/// unless it is also named in `private`.
#[derive(Default)]
struct StubHost {
    languages: HashMap<RepoId, LanguageBytes>,
    private: Vec<RepoId>,
    commits: HashMap<RepoId, Vec<CommitSummary>>,
    deltas: HashMap<String, CommitDelta>,
}

impl StubHost {
    fn repo(mut self, owner: &str, name: &str, languages: &[(&str, u64)]) -> Self {
        self.languages.insert(
            RepoId::new(owner, name),
            languages
                .iter()
                .map(|(lang, bytes)| (lang.to_string(), *bytes))
                .collect(),
        );
        self
    }

    fn commit(mut self, owner: &str, name: &str, sha: &str, date: &str, delta: (u64, u64)) -> Self {
        // Newest first, like the real endpoint.
        self.commits.entry(RepoId::new(owner, name)).or_default().insert(
            0,
            CommitSummary {
                sha: sha.to_string(),
                date: Some(date.parse::<DateTime<Utc>>().unwrap()),
                author: "Mona".to_string(),
                message: format!("commit {}", sha),
            },
        );
        self.deltas.insert(
            sha.to_string(),
            CommitDelta {
                additions: delta.0,
                deletions: delta.1,
            },
        );
        self
    }
}

#[async_trait]
impl CodeHost for StubHost {
    async fn repository(&self, repo: &RepoId) -> Result<RepositoryInfo, HostError> {
        if !self.languages.contains_key(repo) {
            return Err(HostError::NotFound(repo.to_string()));
        }
        Ok(RepositoryInfo {
            full_name: repo.to_string(),
            html_url: format!("https://github.com/{}", repo),
            private: self.private.contains(repo),
        })
    }

    async fn languages(&self, repo: &RepoId) -> Result<LanguageBytes, HostError> {
        self.languages
            .get(repo)
            .cloned()
            .ok_or_else(|| HostError::NotFound(repo.to_string()))
    }

    async fn list_commits(
        &self,
        repo: &RepoId,
        _window: &CommitWindow,
        page: u32,
    ) -> Result<Vec<CommitSummary>, HostError> {
        let commits = self
            .commits
            .get(repo)
            .ok_or_else(|| HostError::NotFound(repo.to_string()))?;
        Ok(if page == 1 { commits.clone() } else { Vec::new() })
    }

    async fn commit_delta(&self, _repo: &RepoId, sha: &str) -> Result<CommitDelta, HostError> {
        Ok(self.deltas.get(sha).copied().unwrap_or_default())
    }
}

async fn test_app(host: StubHost) -> Router {
    let mut config = AppConfig::with_database("sqlite::memory:");
    config.poll_on_repository_create = false;
    config.commit_fetch_delay_ms = 0;

    let store = Store::in_memory().await.expect("Failed to open store");
    let state = Arc::new(AppState::with_host(config, store, Arc::new(host)));
    create_app(state)
}

async fn send(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string())),
        None => request.body(Body::empty()),
    }
    .unwrap();

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body_bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let body_json = if body_bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body_bytes).unwrap_or(Value::Null)
    };
    (status, body_json)
}

async fn create_team(app: &Router, name: &str) -> i64 {
    let (status, team) = send(app, Method::POST, "/api/teams", Some(json!({ "name": name }))).await;
    assert_eq!(status, StatusCode::CREATED);
    team["id"].as_i64().unwrap()
}

async fn add_repository(app: &Router, team_id: i64, owner: &str, name: &str) -> (StatusCode, Value) {
    send(
        app,
        Method::POST,
        "/api/repos",
        Some(json!({ "teamId": team_id, "owner": owner, "name": name })),
    )
    .await
}

#[tokio::test]
async fn test_health_check() {
    let app = test_app(StubHost::default()).await;

    let (status, body) = send(&app, Method::GET, "/api/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["service"], "hackshon-backend");
}

#[tokio::test]
async fn test_team_lifecycle() {
    let app = test_app(StubHost::default()).await;

    let id = create_team(&app, "Alpha").await;

    let (status, body) = send(&app, Method::POST, "/api/teams", Some(json!({ "name": "Alpha" }))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already exists"));

    let (status, body) = send(&app, Method::POST, "/api/teams", Some(json!({ "name": "  " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Team name is required");

    let uri = format!("/api/teams/{}", id);
    let (status, body) = send(&app, Method::PUT, &uri, Some(json!({ "name": "Alpha Prime" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["name"], "Alpha Prime");

    let (status, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["repositories"], json!([]));
    assert!(body["createdAt"].is_string());

    let (status, _) = send(&app, Method::DELETE, &uri, None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, Method::GET, &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "Team not found");
}

#[tokio::test]
async fn test_repository_registration_is_verified() {
    let mut host = StubHost::default()
        .repo("octocat", "Hello-World", &[("C", 1000)])
        .repo("octocat", "secret", &[("Rust", 10)]);
    host.private.push(RepoId::new("octocat", "secret"));
    let app = test_app(host).await;
    let team_id = create_team(&app, "Alpha").await;

    let (status, repo) = add_repository(&app, team_id, "octocat", "Hello-World").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(repo["teamId"], team_id);
    assert_eq!(repo["url"], "https://github.com/octocat/Hello-World");

    let (status, _) = add_repository(&app, team_id, "octocat", "Hello-World").await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = add_repository(&app, team_id, "octocat", "secret").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Private repositories are not supported");

    let (status, _) = add_repository(&app, team_id, "octocat", "missing").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = add_repository(&app, 999, "octocat", "Hello-World").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/repos",
        Some(json!({ "owner": "octocat" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "teamId, owner, and name are required");

    let (status, repos) = send(
        &app,
        Method::GET,
        &format!("/api/repos?teamId={}", team_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(repos.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_poll_then_chart() {
    let host = StubHost::default().repo("octocat", "Hello-World", &[("C", 5000), ("Shell", 500)]);
    let app = test_app(host).await;
    let team_id = create_team(&app, "Alpha").await;
    let (status, _) = add_repository(&app, team_id, "octocat", "Hello-World").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, summary) = send(&app, Method::POST, "/api/github/poll", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(summary["repositories"], 1);
    assert_eq!(summary["updated"], 1);
    assert_eq!(summary["removed"], 0);

    let (status, chart) = send(
        &app,
        Method::GET,
        &format!("/api/metrics/chart/{}", team_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(chart["teamName"], "Alpha");
    let series = chart["series"].as_array().unwrap();
    assert_eq!(series.len(), 1);
    assert_eq!(series[0]["total"]["bytes"], 5500);
    assert_eq!(series[0]["languages"]["C"]["lines"], 100);

    let (status, metrics) = send(
        &app,
        Method::GET,
        &format!("/api/metrics?teamId={}&limit=1", team_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(metrics.as_array().unwrap().len(), 1);

    let (_, stats) = send(&app, Method::GET, "/api/stats", None).await;
    assert_eq!(stats["teams"], 1);
    assert_eq!(stats["repositories"], 1);
    assert_eq!(stats["metrics"], 2);

    let (status, _) = send(&app, Method::GET, "/api/metrics/chart/999", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_languages_passthrough() {
    let app = test_app(StubHost::default().repo("octocat", "Hello-World", &[("C", 42)])).await;

    let (status, body) = send(&app, Method::GET, "/api/github/languages/octocat/Hello-World", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "C": 42 }));

    let (status, body) = send(&app, Method::GET, "/api/github/languages/octocat/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].is_string());
}

#[tokio::test]
async fn test_repository_progress() {
    let host = StubHost::default()
        .repo("hack", "app", &[("TS", 100)])
        .commit("hack", "app", "c1", "2025-10-04T10:01:00Z", (10, 2))
        .commit("hack", "app", "c2", "2025-10-04T10:12:00Z", (5, 0));
    let app = test_app(host).await;

    let (status, body) = send(
        &app,
        Method::GET,
        "/api/progress/repository/hack/app?since=2025-10-04T10:00:00Z&until=2025-10-04T10:30:00Z&interval=10",
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["repository"], "hack/app");
    assert_eq!(body["intervalMinutes"], 10);
    assert_eq!(body["summary"]["totalCommits"], 2);
    assert_eq!(body["summary"]["finalCodeSize"], 13);
    assert_eq!(body["commits"][0]["sha"], "c1");

    let series = body["timeSeries"].as_array().unwrap();
    assert_eq!(series.len(), 4);
    assert_eq!(series[1]["netCodeSize"], 8);
    assert_eq!(series[2]["commitCount"], 1);
    assert_eq!(series[3]["commitCount"], 0);
    assert_eq!(series[3]["netCodeSize"], 13);
}

#[tokio::test]
async fn test_progress_validation() {
    let app = test_app(StubHost::default()).await;

    let (status, body) = send(&app, Method::GET, "/api/progress/repository/hack/app", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "since parameter is required (ISO 8601 format)");

    let (status, _) = send(
        &app,
        Method::GET,
        "/api/progress/repository/hack/app?since=2025-10-04T10:00:00Z&until=2025-10-04T09:00:00Z",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/progress/compare",
        Some(json!({ "repositories": [], "since": "2025-10-04T10:00:00Z" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "repositories array is required");
}

#[tokio::test]
async fn test_team_progress_reports_partial_failures() {
    let host = StubHost::default()
        .repo("hack", "app", &[("TS", 100)])
        .repo("hack", "empty", &[("TS", 1)])
        .commit("hack", "app", "c1", "2025-10-04T10:01:00Z", (10, 0));
    let app = test_app(host).await;
    let team_id = create_team(&app, "Alpha").await;
    add_repository(&app, team_id, "hack", "app").await;
    // Registered, but the commit list is unavailable.
    add_repository(&app, team_id, "hack", "empty").await;

    let (status, body) = send(
        &app,
        Method::GET,
        &format!(
            "/api/progress/team/{}?since=2025-10-04T10:00:00Z&until=2025-10-04T11:00:00Z",
            team_id
        ),
        None,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["team"]["name"], "Alpha");
    let repositories = body["repositories"].as_array().unwrap();
    assert_eq!(repositories.len(), 2);
    assert_eq!(repositories[0]["summary"]["totalAdditions"], 10);
    assert_eq!(repositories[1]["repository"], "hack/empty");
    assert!(repositories[1]["error"].is_string());

    let (status, body) = send(
        &app,
        Method::POST,
        "/api/progress/compare",
        Some(json!({
            "repositories": [{ "owner": "hack", "repo": "app" }, { "owner": "hack" }],
            "since": "2025-10-04T10:00:00Z",
            "until": "2025-10-04T11:00:00Z",
            "intervalMinutes": 15
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.get("team").is_none());
    assert_eq!(body["intervalMinutes"], 15);
    assert_eq!(body["repositories"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn test_stream_sends_charts_on_connect() {
    let app = test_app(StubHost::default()).await;
    create_team(&app, "Alpha").await;

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/stream")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["content-type"].to_str().unwrap(),
        "text/event-stream"
    );

    let mut frames = response.into_body().into_data_stream();
    let first = frames.next().await.unwrap().unwrap();
    let text = String::from_utf8(first.to_vec()).unwrap();
    assert!(text.contains("event: update"));
    assert!(text.contains("\"teamName\":\"Alpha\""));
}
