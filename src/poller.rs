//! Periodic language snapshot collection.
//!
//! `RepositoryPoller` walks every registered repository, fetches its language
//! bytes and persists one snapshot per repository. At most one cycle runs at a
//! time: a trigger that arrives mid-cycle is folded into a single re-run that
//! starts as soon as the current cycle ends. Cycles run on their own task, so
//! a caller that stops waiting does not stop the cycle.

use crate::github::CodeHost;
use crate::store::{DedupPolicy, PersistOutcome, Store};
use crate::types::Repository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration as StdDuration;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

/// Counters for one finished cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollSummary {
    pub repositories: usize,
    pub updated: usize,
    pub already_recorded: usize,
    pub empty: usize,
    /// Repositories deleted while the cycle was running.
    pub removed: usize,
    pub failed: usize,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetricsEvent {
    Updated(PollSummary),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Completed(PollSummary),
    /// Another cycle was running; it will run once more after finishing.
    Queued,
    /// The cycle task died before reporting.
    Aborted,
}

#[derive(Default)]
struct CycleState {
    running: bool,
    rerun_requested: bool,
}

#[derive(Debug)]
enum RepoResult {
    Updated,
    AlreadyRecorded,
    Empty,
    Removed,
}

/// Owns the "cycle running" flag for one cycle task. Dropping it without
/// `release` (panic, task abort) clears the flag.
struct CycleGuard {
    poller: Arc<RepositoryPoller>,
    armed: bool,
}

impl CycleGuard {
    fn release(&mut self) {
        self.armed = false;
    }
}

impl Drop for CycleGuard {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.poller.state.lock().unwrap_or_else(PoisonError::into_inner);
            state.running = false;
            state.rerun_requested = false;
        }
    }
}

pub struct RepositoryPoller {
    store: Store,
    host: Arc<dyn CodeHost>,
    events: broadcast::Sender<MetricsEvent>,
    retention: Option<chrono::Duration>,
    state: Mutex<CycleState>,
}

impl RepositoryPoller {
    pub fn new(
        store: Store,
        host: Arc<dyn CodeHost>,
        retention: Option<chrono::Duration>,
    ) -> Self {
        let (events, _rx) = broadcast::channel(16);
        Self {
            store,
            host,
            events,
            retention,
            state: Mutex::new(CycleState::default()),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MetricsEvent> {
        self.events.subscribe()
    }

    /// Starts the scheduled loop. The first tick fires immediately.
    pub fn start(self: &Arc<Self>, period: StdDuration) -> JoinHandle<()> {
        let poller = Arc::clone(self);

        tokio::spawn(async move {
            tracing::info!(
                "GitHub polling started with {}s interval",
                period.as_secs()
            );
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                interval.tick().await;
                poller.poll_now().await;
            }
        })
    }

    /// Runs a cycle now, or queues one re-run if a cycle is in flight.
    ///
    /// Resolves with the summary of the first cycle; queued re-runs continue
    /// on the cycle task.
    pub async fn poll_now(self: &Arc<Self>) -> PollOutcome {
        if !self.try_begin() {
            tracing::info!("Poll already in progress; queued one more cycle");
            return PollOutcome::Queued;
        }

        let guard = CycleGuard {
            poller: Arc::clone(self),
            armed: true,
        };
        let (first_tx, first_rx) = oneshot::channel();
        tokio::spawn(Self::drive(guard, first_tx));

        match first_rx.await {
            Ok(summary) => PollOutcome::Completed(summary),
            Err(_) => {
                tracing::error!("Poll cycle task ended without a summary");
                PollOutcome::Aborted
            }
        }
    }

    async fn drive(mut guard: CycleGuard, first: oneshot::Sender<PollSummary>) {
        let poller = Arc::clone(&guard.poller);
        let mut first = Some(first);

        loop {
            let summary = poller.run_cycle().await;
            let rerun = poller.finish_or_rerun();
            if !rerun {
                guard.release();
            }
            if let Some(tx) = first.take() {
                if tx.send(summary).is_err() {
                    tracing::debug!("Poll requester stopped waiting");
                }
            }
            if !rerun {
                return;
            }
            tracing::info!("Running queued poll cycle");
        }
    }

    fn try_begin(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.running {
            state.rerun_requested = true;
            false
        } else {
            state.running = true;
            true
        }
    }

    /// Returns true when a queued re-run must start; otherwise releases the guard.
    fn finish_or_rerun(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.rerun_requested {
            state.rerun_requested = false;
            true
        } else {
            state.running = false;
            false
        }
    }

    async fn run_cycle(&self) -> PollSummary {
        tracing::info!("Starting repository polling...");
        let mut summary = PollSummary {
            started_at: Some(Utc::now()),
            ..Default::default()
        };

        match self.store.repositories().await {
            Ok(repositories) => {
                summary.repositories = repositories.len();
                for repo in &repositories {
                    match self.poll_repository(repo).await {
                        Ok(RepoResult::Updated) => summary.updated += 1,
                        Ok(RepoResult::AlreadyRecorded) => summary.already_recorded += 1,
                        Ok(RepoResult::Empty) => summary.empty += 1,
                        Ok(RepoResult::Removed) => summary.removed += 1,
                        Err(e) => {
                            summary.failed += 1;
                            tracing::error!(repo = %repo.repo_id(), "Error polling repository: {}", e);
                        }
                    }
                }
            }
            Err(e) => tracing::error!("Failed to enumerate repositories: {}", e),
        }

        summary.finished_at = Some(Utc::now());

        if self.events.send(MetricsEvent::Updated(summary.clone())).is_err() {
            tracing::debug!("No subscribers for metrics update");
        }

        self.prune_expired().await;

        tracing::info!(
            repositories = summary.repositories,
            updated = summary.updated,
            failed = summary.failed,
            "Repository polling completed"
        );
        summary
    }

    async fn poll_repository(&self, repo: &Repository) -> anyhow::Result<RepoResult> {
        let repo_id = repo.repo_id();
        let languages = self.host.languages(&repo_id).await?;

        if languages.is_empty() {
            tracing::info!(repo = %repo_id, "No languages found");
            return Ok(RepoResult::Empty);
        }

        let outcome = self
            .store
            .persist_snapshot(repo.id, &languages, Utc::now(), DedupPolicy::SkipExisting)
            .await?;

        Ok(match outcome {
            PersistOutcome::Inserted(rows) => {
                tracing::info!(repo = %repo_id, rows, "Updated metrics");
                RepoResult::Updated
            }
            PersistOutcome::AlreadyRecorded => {
                tracing::info!(repo = %repo_id, "Snapshot for this minute already recorded");
                RepoResult::AlreadyRecorded
            }
            PersistOutcome::RepositoryGone => {
                tracing::info!(repo = %repo_id, "Repository deleted during poll");
                RepoResult::Removed
            }
        })
    }

    async fn prune_expired(&self) {
        let Some(retention) = self.retention else {
            return;
        };
        match self.store.prune_metrics_before(Utc::now() - retention).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!(removed, "Pruned expired metrics"),
            Err(e) => tracing::warn!("Failed to prune expired metrics: {}", e),
        }
    }
}
