use crate::error::{ApiResult, AppError};
use crate::store::Store;
use crate::types::{truncate_to_minute, Metric};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Default, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct Totals {
    pub bytes: u64,
    pub lines: u64,
}

impl Totals {
    fn add(&mut self, metric: &Metric) {
        self.bytes += metric.bytes;
        self.lines += metric.lines;
    }
}

/// One chart point: every metric row of a team that fell into the same minute.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
pub struct ChartBucket {
    pub timestamp: DateTime<Utc>,
    pub languages: BTreeMap<String, Totals>,
    pub total: Totals,
}

/// The public response structure for a team's language chart.
#[derive(Debug, Serialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ChartData {
    pub team_id: i64,
    pub team_name: String,
    /// Buckets in strictly ascending timestamp order.
    pub series: Vec<ChartBucket>,
}

/// Groups metric rows into minute buckets and sums bytes and lines per
/// language and overall.
pub fn aggregate(metrics: &[Metric]) -> Vec<ChartBucket> {
    let mut buckets: BTreeMap<DateTime<Utc>, ChartBucket> = BTreeMap::new();

    for metric in metrics {
        let timestamp = truncate_to_minute(metric.timestamp);
        let bucket = buckets.entry(timestamp).or_insert_with(|| ChartBucket {
            timestamp,
            languages: BTreeMap::new(),
            total: Totals::default(),
        });

        bucket
            .languages
            .entry(metric.language.clone())
            .or_default()
            .add(metric);
        bucket.total.add(metric);
    }

    buckets.into_values().collect()
}

/// Builds the chart for a team from every metric its repositories recorded.
pub async fn build_chart(store: &Store, team_id: i64) -> ApiResult<ChartData> {
    let team = store
        .team(team_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Team not found".to_string()))?;

    let metrics = store.metrics_for_team(team_id).await?;
    tracing::debug!(team_id, rows = metrics.len(), "Aggregating chart");

    Ok(ChartData {
        team_id: team.id,
        team_name: team.name,
        series: aggregate(&metrics),
    })
}

/// Charts for every team; teams that fail to load are left out.
pub async fn all_charts(store: &Store) -> ApiResult<Vec<ChartData>> {
    let mut charts = Vec::new();
    for team in store.teams().await? {
        match build_chart(store, team.id).await {
            Ok(chart) => charts.push(chart),
            Err(e) => tracing::warn!(team_id = team.id, "Failed to build chart: {}", e),
        }
    }
    Ok(charts)
}
