//! Relational store for teams, repositories and language metrics.
//!
//! The store owns the only shared mutable state in the service. It is opened
//! once at startup, handed down explicitly, and closed on shutdown.

use crate::types::{
    estimate_lines, truncate_to_minute, LanguageBytes, Metric, NewRepository, Repository,
    StoreStats, Team, TeamWithRepositories,
};
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;
use tracing::info;

/// What to do when a snapshot for the same repository and minute already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupPolicy {
    /// Leave the existing snapshot alone and write nothing.
    SkipExisting,
    /// Write the rows regardless; sums in that bucket grow.
    Append,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistOutcome {
    Inserted(usize),
    AlreadyRecorded,
    /// The repository was deleted between enumeration and persistence.
    RepositoryGone,
}

/// Row selection for the raw metrics listing.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricFilter {
    pub team_id: Option<i64>,
    pub repository_id: Option<i64>,
    pub limit: Option<u32>,
}

#[derive(FromRow)]
struct TeamRow {
    id: i64,
    name: String,
    created_at: i64,
}

#[derive(FromRow)]
struct RepositoryRow {
    id: i64,
    team_id: i64,
    owner: String,
    name: String,
    url: String,
    created_at: i64,
}

#[derive(FromRow)]
struct MetricRow {
    id: i64,
    repository_id: i64,
    language: String,
    bytes: i64,
    lines: i64,
    recorded_at: i64,
}

fn from_unix(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}

fn to_sql_count(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl From<TeamRow> for Team {
    fn from(row: TeamRow) -> Self {
        Team {
            id: row.id,
            name: row.name,
            created_at: from_unix(row.created_at),
        }
    }
}

impl From<RepositoryRow> for Repository {
    fn from(row: RepositoryRow) -> Self {
        Repository {
            id: row.id,
            team_id: row.team_id,
            owner: row.owner,
            name: row.name,
            url: row.url,
            created_at: from_unix(row.created_at),
        }
    }
}

impl From<MetricRow> for Metric {
    fn from(row: MetricRow) -> Self {
        Metric {
            id: row.id,
            repository_id: row.repository_id,
            language: row.language,
            bytes: u64::try_from(row.bytes).unwrap_or_default(),
            lines: u64::try_from(row.lines).unwrap_or_default(),
            timestamp: from_unix(row.recorded_at),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens the database, creating it if needed, and applies migrations.
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let in_memory = database_url.contains(":memory:");
        let mut pool_options = SqlitePoolOptions::new();
        if in_memory {
            // Each connection to `:memory:` is a separate database.
            pool_options = pool_options
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
        } else {
            pool_options = pool_options.max_connections(max_connections.max(1));
        }

        let pool = pool_options.connect_with(options).await?;

        info!("Running database migrations...");
        sqlx::migrate!("./migrations").run(&pool).await?;
        info!("Database ready at {}", database_url);

        Ok(Self { pool })
    }

    /// Fresh in-memory store; used by tests.
    pub async fn in_memory() -> anyhow::Result<Self> {
        Self::connect("sqlite::memory:", 1).await
    }

    /// Close database connections gracefully.
    pub async fn close(&self) {
        info!("Shutting down database connections...");
        self.pool.close().await;
    }

    // Teams

    pub async fn teams(&self) -> Result<Vec<Team>, sqlx::Error> {
        let rows = sqlx::query_as::<_, TeamRow>(
            "SELECT id, name, created_at FROM teams ORDER BY created_at DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Team::from).collect())
    }

    pub async fn team(&self, id: i64) -> Result<Option<Team>, sqlx::Error> {
        let row = sqlx::query_as::<_, TeamRow>("SELECT id, name, created_at FROM teams WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(Team::from))
    }

    pub async fn team_with_repositories(
        &self,
        id: i64,
    ) -> Result<Option<TeamWithRepositories>, sqlx::Error> {
        let Some(team) = self.team(id).await? else {
            return Ok(None);
        };
        let repositories = self.repositories_for_team(id).await?;
        Ok(Some(TeamWithRepositories { team, repositories }))
    }

    pub async fn create_team(&self, name: &str) -> Result<Team, sqlx::Error> {
        let row = sqlx::query_as::<_, TeamRow>(
            "INSERT INTO teams (name, created_at) VALUES (?1, ?2) RETURNING id, name, created_at",
        )
        .bind(name)
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    pub async fn rename_team(&self, id: i64, name: &str) -> Result<Option<Team>, sqlx::Error> {
        let row = sqlx::query_as::<_, TeamRow>(
            "UPDATE teams SET name = ?1 WHERE id = ?2 RETURNING id, name, created_at",
        )
        .bind(name)
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Team::from))
    }

    /// Deletes a team together with its repositories and their metrics.
    pub async fn delete_team(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM teams WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // Repositories

    pub async fn repositories(&self) -> Result<Vec<Repository>, sqlx::Error> {
        let rows = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, team_id, owner, name, url, created_at FROM repositories ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Repository::from).collect())
    }

    pub async fn repositories_for_team(&self, team_id: i64) -> Result<Vec<Repository>, sqlx::Error> {
        let rows = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, team_id, owner, name, url, created_at FROM repositories WHERE team_id = ?1 ORDER BY id",
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Repository::from).collect())
    }

    pub async fn repository(&self, id: i64) -> Result<Option<Repository>, sqlx::Error> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            "SELECT id, team_id, owner, name, url, created_at FROM repositories WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Repository::from))
    }

    pub async fn create_repository(&self, new: &NewRepository) -> Result<Repository, sqlx::Error> {
        let row = sqlx::query_as::<_, RepositoryRow>(
            r#"
            INSERT INTO repositories (team_id, owner, name, url, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            RETURNING id, team_id, owner, name, url, created_at
            "#,
        )
        .bind(new.team_id)
        .bind(&new.owner)
        .bind(&new.name)
        .bind(&new.url)
        .bind(Utc::now().timestamp())
        .fetch_one(&self.pool)
        .await?;
        Ok(row.into())
    }

    /// Deletes a repository together with its metrics.
    pub async fn delete_repository(&self, id: i64) -> Result<bool, sqlx::Error> {
        let result = sqlx::query("DELETE FROM repositories WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // Metrics

    /// Writes one snapshot: a row per language, all stamped with the same
    /// minute. Either every row lands or none does.
    pub async fn persist_snapshot(
        &self,
        repository_id: i64,
        languages: &LanguageBytes,
        timestamp: DateTime<Utc>,
        policy: DedupPolicy,
    ) -> Result<PersistOutcome, sqlx::Error> {
        let recorded_at = truncate_to_minute(timestamp).timestamp();
        let mut tx = self.pool.begin().await?;

        let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM repositories WHERE id = ?1")
            .bind(repository_id)
            .fetch_optional(&mut *tx)
            .await?;
        if exists.is_none() {
            tx.rollback().await?;
            return Ok(PersistOutcome::RepositoryGone);
        }

        if policy == DedupPolicy::SkipExisting {
            let existing: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM metrics WHERE repository_id = ?1 AND recorded_at = ?2",
            )
            .bind(repository_id)
            .bind(recorded_at)
            .fetch_one(&mut *tx)
            .await?;
            if existing > 0 {
                tx.rollback().await?;
                return Ok(PersistOutcome::AlreadyRecorded);
            }
        }

        for (language, bytes) in languages {
            sqlx::query(
                "INSERT INTO metrics (repository_id, language, bytes, lines, recorded_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            )
            .bind(repository_id)
            .bind(language)
            .bind(to_sql_count(*bytes))
            .bind(to_sql_count(estimate_lines(*bytes)))
            .bind(recorded_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(PersistOutcome::Inserted(languages.len()))
    }

    /// Raw metric rows, newest first.
    pub async fn metrics(&self, filter: MetricFilter) -> Result<Vec<Metric>, sqlx::Error> {
        let limit = filter.limit.map_or(-1, i64::from);
        let rows = match (filter.repository_id, filter.team_id) {
            (Some(repository_id), _) => {
                sqlx::query_as::<_, MetricRow>(
                    r#"
                    SELECT id, repository_id, language, bytes, lines, recorded_at
                    FROM metrics
                    WHERE repository_id = ?1
                    ORDER BY recorded_at DESC, id DESC
                    LIMIT ?2
                    "#,
                )
                .bind(repository_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, Some(team_id)) => {
                sqlx::query_as::<_, MetricRow>(
                    r#"
                    SELECT m.id, m.repository_id, m.language, m.bytes, m.lines, m.recorded_at
                    FROM metrics m
                    JOIN repositories r ON m.repository_id = r.id
                    WHERE r.team_id = ?1
                    ORDER BY m.recorded_at DESC, m.id DESC
                    LIMIT ?2
                    "#,
                )
                .bind(team_id)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            (None, None) => {
                sqlx::query_as::<_, MetricRow>(
                    r#"
                    SELECT id, repository_id, language, bytes, lines, recorded_at
                    FROM metrics
                    ORDER BY recorded_at DESC, id DESC
                    LIMIT ?1
                    "#,
                )
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(rows.into_iter().map(Metric::from).collect())
    }

    /// Every metric row of every repository owned by the team, oldest first.
    pub async fn metrics_for_team(&self, team_id: i64) -> Result<Vec<Metric>, sqlx::Error> {
        let rows = sqlx::query_as::<_, MetricRow>(
            r#"
            SELECT m.id, m.repository_id, m.language, m.bytes, m.lines, m.recorded_at
            FROM metrics m
            JOIN repositories r ON m.repository_id = r.id
            WHERE r.team_id = ?1
            ORDER BY m.recorded_at ASC, m.id ASC
            "#,
        )
        .bind(team_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Metric::from).collect())
    }

    /// Removes metric rows recorded before `cutoff`. Returns the number removed.
    pub async fn prune_metrics_before(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let result = sqlx::query("DELETE FROM metrics WHERE recorded_at < ?1")
            .bind(cutoff.timestamp())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn stats(&self) -> Result<StoreStats, sqlx::Error> {
        let (teams, repositories, metrics): (i64, i64, i64) = sqlx::query_as(
            r#"
            SELECT
                (SELECT COUNT(*) FROM teams),
                (SELECT COUNT(*) FROM repositories),
                (SELECT COUNT(*) FROM metrics)
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(StoreStats {
            teams: teams.unsigned_abs(),
            repositories: repositories.unsigned_abs(),
            metrics: metrics.unsigned_abs(),
        })
    }
}
