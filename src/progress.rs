//! Commit-history progress reconstruction.
//!
//! This module implements `ProgressTracker`, which rebuilds how a repository's
//! code size grew over a time window. It handles:
//! 1. Paging through the commit list up to a fixed ceiling.
//! 2. Fetching per-commit line stats through a rate-limited stream, with an
//!    in-memory cache since a commit's stats never change.
//! 3. Accumulating additions and deletions oldest-first.
//! 4. Resampling the cumulative curve onto a fixed minute grid.

use crate::error::{AppError, HostError};
use crate::github::{CodeHost, CommitDelta, CommitSummary, CommitWindow, COMMITS_PER_PAGE};
use crate::store::Store;
use crate::types::{RepoId, Team};
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use moka::future::Cache;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration as StdDuration;

pub const DEFAULT_INTERVAL_MINUTES: u32 = 5;

/// Requests producing a grid larger than this are rejected.
pub const MAX_SERIES_POINTS: i64 = 20_000;

/// A commit with its own stats and the running totals up to and including it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitStat {
    pub sha: String,
    pub date: DateTime<Utc>,
    pub author: String,
    pub message: String,
    pub additions: u64,
    pub deletions: u64,
    pub total_changes: u64,
    pub cumulative_additions: u64,
    pub cumulative_deletions: u64,
    pub net_code_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeSeriesPoint {
    pub timestamp: DateTime<Utc>,
    pub cumulative_additions: u64,
    pub cumulative_deletions: u64,
    pub net_code_size: i64,
    /// Commits after the previous grid point and at or before this one.
    pub commit_count: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSummary {
    pub total_commits: usize,
    pub total_additions: u64,
    pub total_deletions: u64,
    pub final_code_size: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryProgress {
    pub repository: String,
    pub period: Period,
    pub interval_minutes: u32,
    pub commits: Vec<CommitStat>,
    pub time_series: Vec<TimeSeriesPoint>,
    pub summary: ProgressSummary,
}

/// Result for one repository inside a multi-repository request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum RepositoryProgressEntry {
    Ok(RepositoryProgress),
    Failed { repository: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressComparison {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub team: Option<Team>,
    pub period: Period,
    pub interval_minutes: u32,
    pub repositories: Vec<RepositoryProgressEntry>,
}

/// Validated query window for a history request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressWindow {
    pub since: DateTime<Utc>,
    pub until: Option<DateTime<Utc>>,
    pub interval_minutes: u32,
}

impl ProgressWindow {
    pub fn new(
        since: DateTime<Utc>,
        until: Option<DateTime<Utc>>,
        interval_minutes: u32,
        now: DateTime<Utc>,
    ) -> Result<Self, AppError> {
        if interval_minutes == 0 {
            return Err(AppError::Validation(
                "interval must be at least 1 minute".to_string(),
            ));
        }
        if until.is_some_and(|until| until < since) {
            return Err(AppError::Validation(
                "until must not be earlier than since".to_string(),
            ));
        }

        let end = until.unwrap_or(now).max(since);
        let points = (end - since).num_minutes() / i64::from(interval_minutes) + 2;
        if points > MAX_SERIES_POINTS {
            return Err(AppError::Validation(format!(
                "interval of {} minutes is too small for this window (more than {} points)",
                interval_minutes, MAX_SERIES_POINTS
            )));
        }

        Ok(Self {
            since,
            until,
            interval_minutes,
        })
    }

    pub fn period(&self, now: DateTime<Utc>) -> Period {
        Period {
            start: self.since,
            end: self.until.unwrap_or(now),
        }
    }
}

/// Turns commits with their stats into running totals, in the given order.
pub fn accumulate(commits: Vec<(CommitSummary, DateTime<Utc>, CommitDelta)>) -> Vec<CommitStat> {
    let mut cumulative_additions = 0u64;
    let mut cumulative_deletions = 0u64;

    commits
        .into_iter()
        .map(|(commit, date, delta)| {
            cumulative_additions += delta.additions;
            cumulative_deletions += delta.deletions;
            CommitStat {
                sha: commit.sha,
                date,
                author: commit.author,
                message: commit.message,
                additions: delta.additions,
                deletions: delta.deletions,
                total_changes: delta.additions + delta.deletions,
                cumulative_additions,
                cumulative_deletions,
                net_code_size: net(cumulative_additions, cumulative_deletions),
            }
        })
        .collect()
}

fn net(additions: u64, deletions: u64) -> i64 {
    i64::try_from(additions).unwrap_or(i64::MAX) - i64::try_from(deletions).unwrap_or(i64::MAX)
}

fn floor_to(timestamp: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let step = step.num_seconds().max(1);
    let seconds = timestamp.timestamp();
    DateTime::from_timestamp(seconds - seconds.rem_euclid(step), 0).unwrap_or(timestamp)
}

fn ceil_to(timestamp: DateTime<Utc>, step: Duration) -> DateTime<Utc> {
    let floor = floor_to(timestamp, step);
    if floor < timestamp {
        floor + step
    } else {
        floor
    }
}

/// Samples cumulative totals on a fixed grid.
///
/// The grid starts at the first commit floored to an interval boundary and
/// ends at the first boundary at or after both the last commit and `horizon`.
/// Each point reports the totals of the last commit at or before it.
/// `commits` must be ordered by date.
pub fn resample(
    commits: &[CommitStat],
    interval_minutes: u32,
    horizon: Option<DateTime<Utc>>,
) -> Vec<TimeSeriesPoint> {
    let (Some(first), Some(last)) = (commits.first(), commits.last()) else {
        return Vec::new();
    };

    let step = Duration::minutes(i64::from(interval_minutes.max(1)));
    let start = floor_to(first.date, step);
    let end = ceil_to(horizon.map_or(last.date, |h| h.max(last.date)), step);

    let mut points = Vec::new();
    let mut remaining = commits.iter().peekable();
    let mut current: Option<&CommitStat> = None;
    let mut at = start;

    while at <= end {
        let mut commit_count = 0;
        while let Some(commit) = remaining.next_if(|c| c.date <= at) {
            current = Some(commit);
            commit_count += 1;
        }

        let (cumulative_additions, cumulative_deletions) = current
            .map(|c| (c.cumulative_additions, c.cumulative_deletions))
            .unwrap_or_default();

        points.push(TimeSeriesPoint {
            timestamp: at,
            cumulative_additions,
            cumulative_deletions,
            net_code_size: net(cumulative_additions, cumulative_deletions),
            commit_count,
        });

        at += step;
    }

    points
}

pub fn summarize(commits: &[CommitStat]) -> ProgressSummary {
    commits
        .last()
        .map(|last| ProgressSummary {
            total_commits: commits.len(),
            total_additions: last.cumulative_additions,
            total_deletions: last.cumulative_deletions,
            final_code_size: last.net_code_size,
        })
        .unwrap_or_default()
}

#[derive(Clone)]
pub struct ProgressTracker {
    host: Arc<dyn CodeHost>,
    cache: Cache<String, CommitDelta>,
    limiter: Option<Arc<DefaultDirectRateLimiter>>,
    max_pages: u32,
}

impl ProgressTracker {
    /// `fetch_delay` is the minimum spacing between per-commit requests; zero disables it.
    pub fn new(
        host: Arc<dyn CodeHost>,
        max_pages: u32,
        fetch_delay: StdDuration,
        cache_capacity: u64,
    ) -> Self {
        let limiter = Quota::with_period(fetch_delay).map(|quota| Arc::new(RateLimiter::direct(quota)));
        let cache = Cache::builder().max_capacity(cache_capacity).build();

        Self {
            host,
            cache,
            limiter,
            max_pages: max_pages.max(1),
        }
    }

    /// Rebuilds the progress history of one repository.
    pub async fn history(
        &self,
        repo_id: &RepoId,
        window: &ProgressWindow,
    ) -> Result<RepositoryProgress, HostError> {
        let now = Utc::now();
        tracing::info!(
            repo = %repo_id,
            since = %window.since,
            interval = window.interval_minutes,
            "Fetching commit history"
        );

        let commits = self.list_commits(repo_id, window).await?;
        tracing::info!(repo = %repo_id, commits = commits.len(), "Found commits");

        let stats = accumulate(self.fetch_deltas(repo_id, commits).await);
        tracing::info!(repo = %repo_id, processed = stats.len(), "Processed commits with stats");

        let horizon = window.until.map_or(now, |until| until.min(now));
        let time_series = resample(&stats, window.interval_minutes, Some(horizon));
        let summary = summarize(&stats);

        Ok(RepositoryProgress {
            repository: repo_id.to_string(),
            period: window.period(now),
            interval_minutes: window.interval_minutes,
            commits: stats,
            time_series,
            summary,
        })
    }

    /// Histories for several repositories; a failure is recorded per entry
    /// and never aborts the others.
    pub async fn compare(
        &self,
        repositories: &[RepoId],
        window: &ProgressWindow,
    ) -> Vec<RepositoryProgressEntry> {
        let mut entries = Vec::with_capacity(repositories.len());
        for repo_id in repositories {
            match self.history(repo_id, window).await {
                Ok(progress) => entries.push(RepositoryProgressEntry::Ok(progress)),
                Err(e) => {
                    tracing::error!(repo = %repo_id, "Error fetching progress: {}", e);
                    entries.push(RepositoryProgressEntry::Failed {
                        repository: repo_id.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }
        entries
    }

    /// Progress of every repository owned by a team.
    pub async fn team_history(
        &self,
        store: &Store,
        team_id: i64,
        window: &ProgressWindow,
    ) -> Result<ProgressComparison, AppError> {
        let team = store
            .team(team_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Team not found".to_string()))?;

        let repo_ids: Vec<RepoId> = store
            .repositories_for_team(team_id)
            .await?
            .iter()
            .map(|repo| repo.repo_id())
            .collect();

        Ok(ProgressComparison {
            team: Some(team),
            period: window.period(Utc::now()),
            interval_minutes: window.interval_minutes,
            repositories: self.compare(&repo_ids, window).await,
        })
    }

    /// Pages through the commit list and returns the commits oldest first.
    async fn list_commits(
        &self,
        repo_id: &RepoId,
        window: &ProgressWindow,
    ) -> Result<Vec<(CommitSummary, DateTime<Utc>)>, HostError> {
        let commit_window = CommitWindow {
            since: window.since,
            until: window.until,
        };
        let mut commits = Vec::new();

        for page in 1..=self.max_pages {
            let batch = self.host.list_commits(repo_id, &commit_window, page).await?;
            let full_page = batch.len() >= usize::from(COMMITS_PER_PAGE);
            commits.extend(batch);

            if !full_page {
                break;
            }
            if page == self.max_pages {
                tracing::warn!(
                    "Hit max_commit_pages ({}) for repo {} before the end of the window. Data may be incomplete.",
                    self.max_pages,
                    repo_id
                );
            }
        }

        // The API lists newest first.
        commits.reverse();

        let mut dated: Vec<(CommitSummary, DateTime<Utc>)> = commits
            .into_iter()
            .filter_map(|commit| match commit.date {
                Some(date) => Some((commit, date)),
                None => {
                    tracing::warn!(repo = %repo_id, sha = %commit.sha, "Skipping commit without a date");
                    None
                }
            })
            .collect();
        dated.sort_by_key(|(_, date)| *date);

        Ok(dated)
    }

    /// Fetches stats commit by commit. Commits whose stats cannot be fetched are dropped.
    async fn fetch_deltas(
        &self,
        repo_id: &RepoId,
        commits: Vec<(CommitSummary, DateTime<Utc>)>,
    ) -> Vec<(CommitSummary, DateTime<Utc>, CommitDelta)> {
        stream::iter(commits)
            .then(|(commit, date)| async move {
                match self.commit_delta(repo_id, &commit.sha).await {
                    Ok(delta) => Some((commit, date, delta)),
                    Err(e) => {
                        tracing::error!(repo = %repo_id, sha = %commit.sha, "Error fetching commit details: {}", e);
                        None
                    }
                }
            })
            .filter_map(|entry| async move { entry })
            .collect()
            .await
    }

    async fn commit_delta(&self, repo_id: &RepoId, sha: &str) -> Result<CommitDelta, HostError> {
        let key = format!("{}@{}", repo_id, sha);
        if let Some(delta) = self.cache.get(&key).await {
            return Ok(delta);
        }

        if let Some(limiter) = &self.limiter {
            limiter.until_ready().await;
        }

        let delta = self.host.commit_delta(repo_id, sha).await?;
        self.cache.insert(key, delta).await;
        Ok(delta)
    }
}
