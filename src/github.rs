//! Thin client over the GitHub REST endpoints the dashboard consumes.
//!
//! Everything the rest of the crate needs from GitHub goes through the
//! [`CodeHost`] trait so pollers and history reconstruction can run against a
//! fake in tests.

use crate::error::HostError;
use crate::types::{LanguageBytes, RepoId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use octocrab::Octocrab;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

/// Commits requested per list page; the API maximum.
pub const COMMITS_PER_PAGE: u8 = 100;

/// Visibility information used to verify a repository before registering it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RepositoryInfo {
    pub full_name: String,
    pub html_url: String,
    #[serde(default)]
    pub private: bool,
}

/// One entry of the commit list endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitSummary {
    pub sha: String,
    /// Author date, falling back to the committer date.
    pub date: Option<DateTime<Utc>>,
    pub author: String,
    /// First line of the commit message.
    pub message: String,
}

/// Line additions and deletions of a single commit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct CommitDelta {
    #[serde(default)]
    pub additions: u64,
    #[serde(default)]
    pub deletions: u64,
}

/// Commit list time window, inclusive on both ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitWindow {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
}

#[async_trait]
pub trait CodeHost: Send + Sync {
    async fn repository(&self, repo: &RepoId) -> Result<RepositoryInfo, HostError>;

    async fn languages(&self, repo: &RepoId) -> Result<LanguageBytes, HostError>;

    /// One page (1-based) of commits in the window, newest first.
    async fn list_commits(
        &self,
        repo: &RepoId,
        window: &CommitWindow,
        page: u32,
    ) -> Result<Vec<CommitSummary>, HostError>;

    async fn commit_delta(&self, repo: &RepoId, sha: &str) -> Result<CommitDelta, HostError>;
}

#[derive(Deserialize)]
struct RawCommit {
    sha: String,
    commit: RawCommitDetail,
}

#[derive(Deserialize)]
struct RawCommitDetail {
    author: Option<RawSignature>,
    committer: Option<RawSignature>,
    #[serde(default)]
    message: String,
}

#[derive(Deserialize)]
struct RawSignature {
    name: Option<String>,
    date: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawCommitWithStats {
    stats: Option<CommitDelta>,
}

#[derive(Serialize)]
struct ListCommitsParams {
    since: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    until: Option<String>,
    per_page: u8,
    page: u32,
}

impl From<RawCommit> for CommitSummary {
    fn from(raw: RawCommit) -> Self {
        let RawCommitDetail {
            author,
            committer,
            message,
        } = raw.commit;

        let date = author
            .as_ref()
            .and_then(|sig| sig.date)
            .or_else(|| committer.as_ref().and_then(|sig| sig.date));
        let author = author
            .and_then(|sig| sig.name)
            .unwrap_or_else(|| "Unknown".to_string());

        Self {
            sha: raw.sha,
            date,
            author,
            message: message.lines().next().unwrap_or_default().to_string(),
        }
    }
}

#[derive(Clone)]
pub struct GitHubClient {
    octocrab: Octocrab,
    timeout: Duration,
}

impl GitHubClient {
    pub fn new(token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let mut builder = Octocrab::builder();
        if let Some(token) = token {
            builder = builder.personal_token(token);
        } else {
            tracing::warn!("No GITHUB_TOKEN configured; using unauthenticated rate limits");
        }

        Ok(Self {
            octocrab: builder.build()?,
            timeout,
        })
    }

    /// Runs one request under the configured timeout.
    async fn bounded<T, F>(&self, request: F) -> Result<T, HostError>
    where
        F: Future<Output = octocrab::Result<T>>,
    {
        match tokio::time::timeout(self.timeout, request).await {
            Ok(result) => result.map_err(HostError::from_octocrab),
            Err(_) => Err(HostError::Timeout(self.timeout)),
        }
    }
}

#[async_trait]
impl CodeHost for GitHubClient {
    async fn repository(&self, repo: &RepoId) -> Result<RepositoryInfo, HostError> {
        let route = format!("/repos/{}/{}", repo.owner, repo.repo);
        self.bounded(self.octocrab.get(route, None::<&()>)).await
    }

    async fn languages(&self, repo: &RepoId) -> Result<LanguageBytes, HostError> {
        let route = format!("/repos/{}/{}/languages", repo.owner, repo.repo);
        let languages: LanguageBytes = self.bounded(self.octocrab.get(route, None::<&()>)).await?;
        tracing::debug!(repo = %repo, languages = languages.len(), "Fetched language bytes");
        Ok(languages)
    }

    async fn list_commits(
        &self,
        repo: &RepoId,
        window: &CommitWindow,
        page: u32,
    ) -> Result<Vec<CommitSummary>, HostError> {
        let route = format!("/repos/{}/{}/commits", repo.owner, repo.repo);
        let params = ListCommitsParams {
            since: window.since.to_rfc3339(),
            until: window.until.map(|until| until.to_rfc3339()),
            per_page: COMMITS_PER_PAGE,
            page,
        };

        let raw: Vec<RawCommit> = self.bounded(self.octocrab.get(route, Some(&params))).await?;
        Ok(raw.into_iter().map(CommitSummary::from).collect())
    }

    async fn commit_delta(&self, repo: &RepoId, sha: &str) -> Result<CommitDelta, HostError> {
        let route = format!("/repos/{}/{}/commits/{}", repo.owner, repo.repo, sha);
        let raw: RawCommitWithStats = self.bounded(self.octocrab.get(route, None::<&()>)).await?;
        Ok(raw.stats.unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory stand-in for GitHub.

    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct FakeHost {
        pub languages: HashMap<RepoId, LanguageBytes>,
        pub failing_languages: HashSet<RepoId>,
        pub private: HashSet<RepoId>,
        /// Newest first, like the real endpoint.
        pub commits: HashMap<RepoId, Vec<CommitSummary>>,
        pub deltas: HashMap<String, CommitDelta>,
        pub failing_commits: HashSet<String>,
        /// Artificial latency of every languages call.
        pub language_delay: Duration,
        pub language_calls: Mutex<Vec<RepoId>>,
        pub delta_calls: Mutex<usize>,
    }

    impl FakeHost {
        pub fn with_languages(mut self, repo: RepoId, languages: &[(&str, u64)]) -> Self {
            self.languages.insert(
                repo,
                languages
                    .iter()
                    .map(|(name, bytes)| (name.to_string(), *bytes))
                    .collect(),
            );
            self
        }

        pub fn failing(mut self, repo: RepoId) -> Self {
            self.failing_languages.insert(repo);
            self
        }

        pub fn language_calls(&self) -> Vec<RepoId> {
            self.language_calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CodeHost for FakeHost {
        async fn repository(&self, repo: &RepoId) -> Result<RepositoryInfo, HostError> {
            if !self.languages.contains_key(repo) && !self.commits.contains_key(repo) {
                return Err(HostError::NotFound(repo.to_string()));
            }
            Ok(RepositoryInfo {
                full_name: repo.to_string(),
                html_url: format!("https://github.com/{}", repo),
                private: self.private.contains(repo),
            })
        }

        async fn languages(&self, repo: &RepoId) -> Result<LanguageBytes, HostError> {
            self.language_calls.lock().unwrap().push(repo.clone());
            if !self.language_delay.is_zero() {
                tokio::time::sleep(self.language_delay).await;
            }
            if self.failing_languages.contains(repo) {
                return Err(HostError::Upstream("boom".to_string()));
            }
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
            let per_page = usize::from(COMMITS_PER_PAGE);
            let start = (page as usize - 1) * per_page;
            Ok(commits.iter().skip(start).take(per_page).cloned().collect())
        }

        async fn commit_delta(&self, _repo: &RepoId, sha: &str) -> Result<CommitDelta, HostError> {
            *self.delta_calls.lock().unwrap() += 1;
            if self.failing_commits.contains(sha) {
                return Err(HostError::Upstream(format!("no stats for {}", sha)));
            }
            Ok(self.deltas.get(sha).copied().unwrap_or_default())
        }
    }
}
