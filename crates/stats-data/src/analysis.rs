//! In-memory aggregation cycle.
//!
//! Turns a merged [`UsageState`] and the entity directory into every output
//! record of a run. Nothing here touches the filesystem; callers persist the
//! returned [`CycleOutputs`] once the whole cycle has completed.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use stats_core::models::{
    EntityDetailRecord, EntitySeriesRecord, GlobalStatsRecord, MetricRecord, RankingSnapshot,
    UsageState,
};
use stats_core::month::Month;
use tracing::{debug, info};

use crate::directory::EntityDirectory;
use crate::ranking::{RankingCandidate, RankingEngine};
use crate::store::CycleOutputs;

/// Public page prefix used when a resolver did not supply an entity URL.
pub const DEFAULT_ENTITY_URL_BASE: &str = "https://www.data.gouv.fr/fr/datasets/";

// ── Configuration ─────────────────────────────────────────────────────────────

/// Parameters of one output build.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    pub anchor: Month,
    /// Left edge of the all-time window and `startMonth` of the global record.
    pub start_month: Month,
    pub top_n: usize,
    pub url_base: String,
}

// ── Batch helpers ─────────────────────────────────────────────────────────────

/// Keep only the records of the `limit` entities with the most visits in
/// the batch. Used to run the pipeline on a small sample.
pub fn limit_to_top_entities(records: &[MetricRecord], limit: usize) -> Vec<MetricRecord> {
    let mut visits: HashMap<&str, u64> = HashMap::new();
    for record in records {
        *visits.entry(record.entity_id.as_str()).or_default() += record.visit_count;
    }
    let mut ranked: Vec<(&str, u64)> = visits.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
    let kept: BTreeSet<&str> = ranked.into_iter().take(limit).map(|(id, _)| id).collect();

    records
        .iter()
        .filter(|r| kept.contains(r.entity_id.as_str()))
        .cloned()
        .collect()
}

/// Ids observed in `records` that the directory does not know yet.
pub fn entities_missing_metadata(
    records: &[MetricRecord],
    directory: &EntityDirectory,
) -> Vec<String> {
    let ids: BTreeSet<&str> = records
        .iter()
        .map(|r| r.entity_id.as_str())
        .filter(|id| !directory.contains(id))
        .collect();
    ids.into_iter().map(str::to_string).collect()
}

/// Entities that have both a series and display metadata, in id order.
///
/// Returns the candidates and the number of entities left out for lack of
/// metadata.
pub fn ranking_candidates<'a>(
    state: &'a UsageState,
    directory: &'a EntityDirectory,
) -> (Vec<RankingCandidate<'a>>, usize) {
    let mut excluded = 0usize;
    let candidates: Vec<RankingCandidate<'a>> = state
        .entities
        .iter()
        .filter_map(|(id, series)| match directory.get(id) {
            Some(metadata) => Some(RankingCandidate { metadata, series }),
            None => {
                excluded += 1;
                None
            }
        })
        .collect();
    (candidates, excluded)
}

// ── Records ───────────────────────────────────────────────────────────────────

pub fn build_global_record(
    state: &UsageState,
    start_month: Month,
    generated_at: DateTime<Utc>,
) -> GlobalStatsRecord {
    let totals = state.global.totals();
    GlobalStatsRecord {
        total_visits: totals.visits,
        total_downloads: totals.downloads,
        total_entities: state.entities.len(),
        start_month: state.global.first_month().unwrap_or(start_month),
        last_update_timestamp: generated_at,
        monthly_series: state.global.to_metrics(),
        processed_months: state.processed_months.iter().copied().collect(),
    }
}

pub fn build_entity_series_record(
    state: &UsageState,
    generated_at: DateTime<Utc>,
) -> EntitySeriesRecord {
    EntitySeriesRecord {
        last_update_timestamp: generated_at,
        entities: state
            .entities
            .iter()
            .map(|(id, series)| (id.clone(), series.to_metrics()))
            .collect(),
    }
}

/// Detail records for every entity listed in any ranking.
pub fn build_details(
    state: &UsageState,
    directory: &EntityDirectory,
    snapshot: &RankingSnapshot,
    url_base: &str,
) -> Vec<EntityDetailRecord> {
    let periods = &snapshot.per_period;
    let ids: BTreeSet<&str> = [&periods.week, &periods.month, &periods.year, &periods.all_time]
        .into_iter()
        .flat_map(|lists| lists.visits.iter().chain(lists.downloads.iter()))
        .map(|entry| entry.id.as_str())
        .collect();

    ids.into_iter()
        .filter_map(|id| {
            let series = state.entities.get(id)?;
            let meta = directory.get(id)?;
            let totals = series.totals();
            Some(EntityDetailRecord {
                id: meta.id.clone(),
                title: meta.title.clone(),
                slug: meta.slug.clone(),
                organization: meta.organization.clone(),
                organization_id: meta.organization_id.clone(),
                url: meta
                    .url
                    .clone()
                    .unwrap_or_else(|| format!("{url_base}{}/", meta.slug)),
                total_visits: totals.visits,
                total_downloads: totals.downloads,
                monthly_series: series.to_metrics(),
                first_month: series.first_month(),
                last_month: series.last_month(),
            })
        })
        .collect()
}

/// Build every output record of a cycle from merged state.
pub fn build_outputs(
    state: &UsageState,
    directory: &EntityDirectory,
    config: &AnalysisConfig,
    generated_at: DateTime<Utc>,
) -> CycleOutputs {
    let start_month = state.global.first_month().unwrap_or(config.start_month);

    let (candidates, excluded) = ranking_candidates(state, directory);
    if excluded > 0 {
        debug!(excluded, "entities without metadata left out of rankings");
    }

    let engine = RankingEngine::new(config.top_n, start_month);
    let rankings = engine.rank(&candidates, config.anchor, generated_at);
    let details = build_details(state, directory, &rankings, &config.url_base);

    info!(
        entities = state.entities.len(),
        ranked = candidates.len(),
        details = details.len(),
        "outputs built"
    );

    CycleOutputs {
        global: build_global_record(state, start_month, generated_at),
        entity_series: build_entity_series_record(state, generated_at),
        rankings,
        directory: directory.to_record(generated_at),
        details,
    }
}
