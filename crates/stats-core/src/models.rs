use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::month::{Month, Window};

// ── Observations ──────────────────────────────────────────────────────────────

/// Visit and download counts for one month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counts {
    pub visits: u64,
    pub downloads: u64,
}

impl Counts {
    pub fn new(visits: u64, downloads: u64) -> Self {
        Self { visits, downloads }
    }

    pub fn add(&mut self, other: Counts) {
        self.visits += other.visits;
        self.downloads += other.downloads;
    }

    pub fn is_zero(&self) -> bool {
        self.visits == 0 && self.downloads == 0
    }
}

/// One row of a monthly series as it appears in persisted records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyMetric {
    pub month: Month,
    pub visits: u64,
    pub downloads: u64,
}

/// A single per-entity-per-month observation yielded by a metric source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub entity_id: String,
    pub month: Month,
    pub visit_count: u64,
    /// `None` is read as zero downloads.
    #[serde(default)]
    pub download_count: Option<u64>,
}

impl MetricRecord {
    pub fn counts(&self) -> Counts {
        Counts::new(self.visit_count, self.download_count.unwrap_or(0))
    }
}

// ── MonthlySeries ─────────────────────────────────────────────────────────────

/// Month-keyed counts for one entity (or for the global aggregate).
///
/// Keys are unique; iteration is always chronological. Totals are derived by
/// summing every month on request and are never stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MonthlySeries {
    months: BTreeMap<Month, Counts>,
}

impl MonthlySeries {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a series from persisted rows. Rows sharing a month are summed.
    pub fn from_metrics(metrics: impl IntoIterator<Item = MonthlyMetric>) -> Self {
        let mut series = Self::new();
        for metric in metrics {
            series.add(metric.month, Counts::new(metric.visits, metric.downloads));
        }
        series
    }

    /// Add `counts` to whatever is stored for `month`.
    pub fn add(&mut self, month: Month, counts: Counts) {
        self.months.entry(month).or_default().add(counts);
    }

    pub fn get(&self, month: Month) -> Counts {
        self.months.get(&month).copied().unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.months.is_empty()
    }

    pub fn len(&self) -> usize {
        self.months.len()
    }

    /// Chronological iterator over `(month, counts)`.
    pub fn iter(&self) -> impl Iterator<Item = (Month, Counts)> + '_ {
        self.months.iter().map(|(m, c)| (*m, *c))
    }

    pub fn first_month(&self) -> Option<Month> {
        self.months.keys().next().copied()
    }

    pub fn last_month(&self) -> Option<Month> {
        self.months.keys().next_back().copied()
    }

    /// Full resum over every month.
    pub fn totals(&self) -> Counts {
        let mut totals = Counts::default();
        for counts in self.months.values() {
            totals.add(*counts);
        }
        totals
    }

    /// Sum of the months falling inside `window`, both ends inclusive.
    pub fn window_sum(&self, window: &Window) -> Counts {
        let mut totals = Counts::default();
        if window.start > window.end {
            return totals;
        }
        for counts in self.months.range(window.start..=window.end).map(|(_, c)| c) {
            totals.add(*counts);
        }
        totals
    }

    /// Rows in ascending month order.
    pub fn to_metrics(&self) -> Vec<MonthlyMetric> {
        self.iter()
            .map(|(month, counts)| MonthlyMetric {
                month,
                visits: counts.visits,
                downloads: counts.downloads,
            })
            .collect()
    }
}

// ── UsageState ────────────────────────────────────────────────────────────────

/// Merged numeric state: every per-entity series, the global series, and the
/// ledger of months already folded in.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UsageState {
    pub global: MonthlySeries,
    pub entities: BTreeMap<String, MonthlySeries>,
    pub processed_months: BTreeSet<Month>,
}

impl UsageState {
    /// Latest month already incorporated, from either the global series or
    /// the ledger (a month may be processed yet have no observations).
    pub fn high_water_mark(&self) -> Option<Month> {
        let series = self.global.last_month();
        let ledger = self.processed_months.iter().next_back().copied();
        series.max(ledger)
    }

    /// Returns the first month where the global series differs from the sum
    /// of the per-entity series, or `None` when they agree everywhere.
    pub fn find_global_mismatch(&self) -> Option<Month> {
        let mut summed = MonthlySeries::new();
        for series in self.entities.values() {
            for (month, counts) in series.iter() {
                summed.add(month, counts);
            }
        }
        let months: BTreeSet<Month> = summed
            .iter()
            .map(|(m, _)| m)
            .chain(self.global.iter().map(|(m, _)| m))
            .collect();
        months
            .into_iter()
            .find(|m| summed.get(*m) != self.global.get(*m))
    }
}

// ── Metadata ──────────────────────────────────────────────────────────────────

/// Display metadata resolved for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityMetadata {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub organization: String,
    pub organization_id: String,
    /// Public page of the entity, when the resolver knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

// ── Output records ────────────────────────────────────────────────────────────

/// Persisted global series with its totals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStatsRecord {
    pub total_visits: u64,
    pub total_downloads: u64,
    pub total_entities: usize,
    pub start_month: Month,
    pub last_update_timestamp: DateTime<Utc>,
    pub monthly_series: Vec<MonthlyMetric>,
    /// Ledger of months already merged.
    #[serde(default)]
    pub processed_months: Vec<Month>,
}

/// Persisted per-entity series, keyed by entity id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntitySeriesRecord {
    pub last_update_timestamp: DateTime<Utc>,
    pub entities: BTreeMap<String, Vec<MonthlyMetric>>,
}

/// One row of a leaderboard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingEntry {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub organization: String,
    pub organization_id: String,
    pub value: u64,
    pub previous_value: u64,
    pub trend_percent: f64,
    /// 1-based position within its own list.
    pub rank: usize,
}

/// The visits and downloads lists of one period.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricRankings {
    pub visits: Vec<RankingEntry>,
    pub downloads: Vec<RankingEntry>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerPeriod {
    pub week: MetricRankings,
    pub month: MetricRankings,
    pub year: MetricRankings,
    pub all_time: MetricRankings,
}

/// Full leaderboard snapshot, recomputed from scratch each cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RankingSnapshot {
    pub last_update_timestamp: DateTime<Utc>,
    pub per_period: PerPeriod,
}

/// One entry of the entity directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectoryEntry {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub organization: String,
    pub organization_id: String,
    /// Public page supplied by the resolver, kept so later runs can reuse it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

impl From<&EntityMetadata> for DirectoryEntry {
    fn from(meta: &EntityMetadata) -> Self {
        Self {
            id: meta.id.clone(),
            title: meta.title.clone(),
            slug: meta.slug.clone(),
            organization: meta.organization.clone(),
            organization_id: meta.organization_id.clone(),
            url: meta.url.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDirectoryRecord {
    pub last_update_timestamp: DateTime<Utc>,
    pub entries: Vec<DirectoryEntry>,
}

/// Detail page data for one ranked entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityDetailRecord {
    pub id: String,
    pub title: String,
    pub slug: String,
    pub organization: String,
    pub organization_id: String,
    pub url: String,
    pub total_visits: u64,
    pub total_downloads: u64,
    pub monthly_series: Vec<MonthlyMetric>,
    pub first_month: Option<Month>,
    pub last_month: Option<Month>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> Month {
        s.parse().unwrap()
    }

    #[test]
    fn test_series_iterates_chronologically() {
        let mut series = MonthlySeries::new();
        series.add(m("2024-03"), Counts::new(3, 0));
        series.add(m("2023-11"), Counts::new(1, 0));
        series.add(m("2024-01"), Counts::new(2, 0));

        let months: Vec<String> = series.iter().map(|(mo, _)| mo.to_string()).collect();
        assert_eq!(months, vec!["2023-11", "2024-01", "2024-03"]);
        assert_eq!(series.first_month(), Some(m("2023-11")));
        assert_eq!(series.last_month(), Some(m("2024-03")));
    }

    #[test]
    fn test_series_totals_resum() {
        let series = MonthlySeries::from_metrics(vec![
            MonthlyMetric { month: m("2024-01"), visits: 10, downloads: 1 },
            MonthlyMetric { month: m("2024-02"), visits: 20, downloads: 2 },
        ]);
        assert_eq!(series.totals(), Counts::new(30, 3));
    }

    #[test]
    fn test_from_metrics_sums_duplicate_months() {
        let series = MonthlySeries::from_metrics(vec![
            MonthlyMetric { month: m("2024-01"), visits: 10, downloads: 1 },
            MonthlyMetric { month: m("2024-01"), visits: 5, downloads: 0 },
        ]);
        assert_eq!(series.len(), 1);
        assert_eq!(series.get(m("2024-01")), Counts::new(15, 1));
    }

    #[test]
    fn test_window_sum_inclusive() {
        let series = MonthlySeries::from_metrics(vec![
            MonthlyMetric { month: m("2024-01"), visits: 10, downloads: 0 },
            MonthlyMetric { month: m("2024-02"), visits: 20, downloads: 0 },
            MonthlyMetric { month: m("2024-03"), visits: 30, downloads: 0 },
        ]);
        let window = Window::new(m("2024-02"), m("2024-03"));
        assert_eq!(series.window_sum(&window).visits, 50);
        let inverted = Window::new(m("2024-03"), m("2024-02"));
        assert_eq!(series.window_sum(&inverted), Counts::default());
    }

    #[test]
    fn test_record_null_downloads_read_as_zero() {
        let record: MetricRecord = serde_json::from_str(
            r#"{"entity_id":"a","month":"2024-01","visit_count":4,"download_count":null}"#,
        )
        .unwrap();
        assert_eq!(record.counts(), Counts::new(4, 0));
    }

    #[test]
    fn test_high_water_mark_uses_ledger() {
        let mut state = UsageState::default();
        state.global.add(m("2024-01"), Counts::new(1, 1));
        state.processed_months.insert(m("2024-01"));
        state.processed_months.insert(m("2024-02"));
        assert_eq!(state.high_water_mark(), Some(m("2024-02")));
    }

    #[test]
    fn test_find_global_mismatch() {
        let mut state = UsageState::default();
        let mut series = MonthlySeries::new();
        series.add(m("2024-01"), Counts::new(5, 1));
        state.entities.insert("a".to_string(), series);
        state.global.add(m("2024-01"), Counts::new(5, 1));
        assert_eq!(state.find_global_mismatch(), None);

        state.global.add(m("2024-02"), Counts::new(1, 0));
        assert_eq!(state.find_global_mismatch(), Some(m("2024-02")));
    }

    #[test]
    fn test_ranking_snapshot_field_names() {
        let snapshot = RankingSnapshot {
            last_update_timestamp: DateTime::parse_from_rfc3339("2024-03-01T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
            per_period: PerPeriod::default(),
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert!(json.get("lastUpdateTimestamp").is_some());
        let per_period = json.get("perPeriod").unwrap();
        for key in ["week", "month", "year", "allTime"] {
            let lists = per_period.get(key).unwrap();
            assert!(lists.get("visits").is_some());
            assert!(lists.get("downloads").is_some());
        }
    }
}
