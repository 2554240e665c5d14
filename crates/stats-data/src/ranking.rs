//! Ranking engine.
//!
//! Builds the four-period, two-metric leaderboard snapshot from the merged
//! per-entity series. The snapshot is recomputed from scratch on every run:
//! the period windows overlap irregularly, and each series holds at most a
//! few hundred months, so a full resum per window stays cheap.

use chrono::{DateTime, Utc};
use stats_core::formatting::trend_percent;
use stats_core::models::{
    Counts, EntityMetadata, MetricRankings, MonthlySeries, PerPeriod, RankingEntry,
    RankingSnapshot,
};
use stats_core::month::{Month, Window};
use tracing::debug;

/// Default length of every ranking list.
pub const DEFAULT_TOP_N: usize = 100;

// ── Period / Metric ───────────────────────────────────────────────────────────

/// Trailing window ending at the anchor month.
///
/// Source data is monthly, so `Week` covers the latest single month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Period {
    Week,
    Month,
    Year,
    AllTime,
}

/// Current window plus the comparable previous window used for the trend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindows {
    pub current: Window,
    /// `None` for all-time, whose trend is always zero.
    pub previous: Option<Window>,
}

impl Period {
    pub fn as_str(&self) -> &'static str {
        match self {
            Period::Week => "week",
            Period::Month => "month",
            Period::Year => "year",
            Period::AllTime => "allTime",
        }
    }

    /// Windows relative to `anchor`; `start` is the first month of the
    /// global series.
    pub fn windows(&self, anchor: Month, start: Month) -> PeriodWindows {
        match self {
            Period::Week => PeriodWindows {
                current: Window::single(anchor),
                previous: Some(Window::single(anchor.minus(1))),
            },
            Period::Month => PeriodWindows {
                current: Window::new(anchor.minus(1), anchor),
                previous: Some(Window::single(anchor.minus(2))),
            },
            Period::Year => PeriodWindows {
                current: Window::new(anchor.minus(12), anchor),
                previous: Some(Window::new(anchor.minus(24), anchor.minus(13))),
            },
            Period::AllTime => PeriodWindows {
                current: Window::new(start, anchor),
                previous: None,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Metric {
    Visits,
    Downloads,
}

impl Metric {
    pub fn pick(&self, counts: Counts) -> u64 {
        match self {
            Metric::Visits => counts.visits,
            Metric::Downloads => counts.downloads,
        }
    }
}

// ── Candidates ────────────────────────────────────────────────────────────────

/// An entity eligible for ranking: it has both a series and display metadata.
#[derive(Debug, Clone, Copy)]
pub struct RankingCandidate<'a> {
    pub metadata: &'a EntityMetadata,
    pub series: &'a MonthlySeries,
}

/// Windowed sums of one candidate for one period.
struct WindowedRow<'a> {
    metadata: &'a EntityMetadata,
    current: Counts,
    previous: Counts,
}

// ── RankingEngine ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct RankingEngine {
    top_n: usize,
    start_month: Month,
}

impl RankingEngine {
    /// `start_month` is the left edge of the all-time window.
    pub fn new(top_n: usize, start_month: Month) -> Self {
        Self { top_n, start_month }
    }

    /// Rank `candidates` for every period and metric.
    ///
    /// Ties keep the order of `candidates`.
    pub fn rank(
        &self,
        candidates: &[RankingCandidate<'_>],
        anchor: Month,
        generated_at: DateTime<Utc>,
    ) -> RankingSnapshot {
        debug!(
            candidates = candidates.len(),
            anchor = %anchor,
            top_n = self.top_n,
            "computing rankings"
        );

        RankingSnapshot {
            last_update_timestamp: generated_at,
            per_period: PerPeriod {
                week: self.rank_period(candidates, Period::Week, anchor),
                month: self.rank_period(candidates, Period::Month, anchor),
                year: self.rank_period(candidates, Period::Year, anchor),
                all_time: self.rank_period(candidates, Period::AllTime, anchor),
            },
        }
    }

    /// Both metric lists of a single period.
    pub fn rank_period(
        &self,
        candidates: &[RankingCandidate<'_>],
        period: Period,
        anchor: Month,
    ) -> MetricRankings {
        let windows = period.windows(anchor, self.start_month);
        debug!(
            period = period.as_str(),
            current = %format!("{}..{}", windows.current.start, windows.current.end),
            "ranking window"
        );
        let rows: Vec<WindowedRow<'_>> = candidates
            .iter()
            .map(|c| WindowedRow {
                metadata: c.metadata,
                current: c.series.window_sum(&windows.current),
                previous: windows
                    .previous
                    .map(|w| c.series.window_sum(&w))
                    .unwrap_or_default(),
            })
            .collect();

        MetricRankings {
            visits: self.top_list(&rows, Metric::Visits),
            downloads: self.top_list(&rows, Metric::Downloads),
        }
    }

    fn top_list(&self, rows: &[WindowedRow<'_>], metric: Metric) -> Vec<RankingEntry> {
        let mut order: Vec<&WindowedRow<'_>> = rows.iter().collect();
        // `sort_by` is stable: equal values keep input order.
        order.sort_by(|a, b| metric.pick(b.current).cmp(&metric.pick(a.current)));
        order.truncate(self.top_n);

        order
            .into_iter()
            .enumerate()
            .map(|(i, row)| {
                let value = metric.pick(row.current);
                let previous_value = metric.pick(row.previous);
                RankingEntry {
                    id: row.metadata.id.clone(),
                    title: row.metadata.title.clone(),
                    slug: row.metadata.slug.clone(),
                    organization: row.metadata.organization.clone(),
                    organization_id: row.metadata.organization_id.clone(),
                    value,
                    previous_value,
                    trend_percent: trend_percent(value, previous_value),
                    rank: i + 1,
                }
            })
            .collect()
    }
}

impl Default for RankingEngine {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_N, Month::MIN)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
