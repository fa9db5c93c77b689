//! Canonical records shared by the store, the poller and the HTTP layer.
//!
//! Storage rows are mapped into these shapes at the store boundary; nothing
//! outside `store` sees column names.

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Language name to cumulative byte count, as reported by the code host.
pub type LanguageBytes = BTreeMap<String, u64>;

/// A unique identifier for a GitHub repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RepoId {
    /// The owner of the repository (e.g., "octocat").
    pub owner: String,
    /// The name of the repository (e.g., "Hello-World").
    pub repo: String,
}

impl RepoId {
    pub fn new(owner: impl Into<String>, repo: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            repo: repo.into(),
        }
    }
}

impl fmt::Display for RepoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.repo)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Team {
    pub id: i64,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamWithRepositories {
    #[serde(flatten)]
    pub team: Team,
    pub repositories: Vec<Repository>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Repository {
    pub id: i64,
    pub team_id: i64,
    pub owner: String,
    pub name: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
}

impl Repository {
    pub fn repo_id(&self) -> RepoId {
        RepoId::new(&self.owner, &self.name)
    }
}

/// Input for registering a repository under a team.
#[derive(Clone, Debug)]
pub struct NewRepository {
    pub team_id: i64,
    pub owner: String,
    pub name: String,
    pub url: String,
}

/// One language row of a snapshot. Immutable once written.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metric {
    pub id: i64,
    pub repository_id: i64,
    pub language: String,
    pub bytes: u64,
    pub lines: u64,
    pub timestamp: DateTime<Utc>,
}

/// Row counts across the store.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub teams: u64,
    pub repositories: u64,
    pub metrics: u64,
}

const BYTES_PER_LINE: u64 = 50;

/// Crude line estimate for a byte count: `round(bytes / 50)`, halves rounding up.
pub fn estimate_lines(bytes: u64) -> u64 {
    bytes.saturating_add(BYTES_PER_LINE / 2) / BYTES_PER_LINE
}

/// Drops seconds and sub-second precision.
pub fn truncate_to_minute(timestamp: DateTime<Utc>) -> DateTime<Utc> {
    timestamp
        .duration_trunc(TimeDelta::minutes(1))
        .unwrap_or(timestamp)
}
