//! Monthly merge engine.
//!
//! Folds a batch of newly observed monthly records into the per-entity and
//! global series. Every call builds a fresh [`UsageState`]; the input state is
//! never mutated, so a failed merge leaves nothing half-applied.
//!
//! Combination is additive: a month observed across several source pages is
//! summed. Merging a month that is already part of persisted state would
//! therefore double it, which is why [`MonthlyMerger::merge`] checks the
//! processed-months ledger and rejects such months. [`merge_series`] itself
//! has no such guard.

use std::collections::{BTreeMap, BTreeSet};

use stats_core::error::{Result, StatsError};
use stats_core::models::{Counts, MetricRecord, MonthlySeries, UsageState};
use stats_core::month::{months_after, Month};
use tracing::debug;

// ── Folding ───────────────────────────────────────────────────────────────────

/// Sum `(month, counts)` observations into a fresh series.
pub fn fold_series(observations: impl IntoIterator<Item = (Month, Counts)>) -> MonthlySeries {
    let mut series = MonthlySeries::new();
    for (month, counts) in observations {
        series.add(month, counts);
    }
    series
}

/// Group records by entity and fold each entity's observations.
pub fn fold_records(records: &[MetricRecord]) -> BTreeMap<String, MonthlySeries> {
    let mut grouped: BTreeMap<String, Vec<(Month, Counts)>> = BTreeMap::new();
    for record in records {
        grouped
            .entry(record.entity_id.clone())
            .or_default()
            .push((record.month, record.counts()));
    }
    grouped
        .into_iter()
        .map(|(id, observations)| (id, fold_series(observations)))
        .collect()
}

/// Additive combination: every month of the result holds the existing value
/// plus the added value.
pub fn merge_series(existing: &MonthlySeries, additions: &MonthlySeries) -> MonthlySeries {
    fold_series(existing.iter().chain(additions.iter()))
}

// ── MergeOutcome ──────────────────────────────────────────────────────────────

/// Counters describing one merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// Months folded in, ascending.
    pub months: Vec<Month>,
    pub records: usize,
    /// Entities with at least one record in the batch.
    pub entities_touched: usize,
    /// Entities seen for the first time.
    pub new_entities: usize,
    /// Sum of every record in the batch.
    pub batch_totals: Counts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// There were no new months to merge; state is unchanged.
    NoOp,
    Merged { state: UsageState, report: MergeReport },
}

// ── MonthlyMerger ─────────────────────────────────────────────────────────────

/// Stateless entry points of the merge engine.
pub struct MonthlyMerger;

impl MonthlyMerger {
    /// Months strictly after the state's high-water-mark through `anchor`.
    ///
    /// Empty state starts at `start`. An up-to-date state yields no months.
    pub fn months_to_fetch(state: &UsageState, start: Month, anchor: Month) -> Vec<Month> {
        months_after(state.high_water_mark(), start, anchor)
    }

    /// Merge `records` covering exactly `months` into a fresh copy of `state`.
    ///
    /// Fails with [`StatsError::MonthAlreadyMerged`] when a month is already
    /// in the ledger, and with [`StatsError::RecordOutsideBatch`] when a
    /// record's month was not declared in `months`.
    pub fn merge(
        state: &UsageState,
        months: &[Month],
        records: &[MetricRecord],
    ) -> Result<MergeOutcome> {
        let batch: BTreeSet<Month> = months.iter().copied().collect();
        if batch.is_empty() {
            debug!("no new months to merge");
            return Ok(MergeOutcome::NoOp);
        }

        if let Some(month) = batch.iter().find(|m| state.processed_months.contains(*m)) {
            return Err(StatsError::MonthAlreadyMerged(*month));
        }
        if let Some(record) = records.iter().find(|r| !batch.contains(&r.month)) {
            return Err(StatsError::RecordOutsideBatch {
                entity_id: record.entity_id.clone(),
                month: record.month,
            });
        }

        let additions = fold_records(records);
        let global_additions = fold_series(records.iter().map(|r| (r.month, r.counts())));

        let mut entities = state.entities.clone();
        let mut new_entities = 0usize;
        for (id, added) in &additions {
            let merged = match state.entities.get(id) {
                Some(existing) => merge_series(existing, added),
                None => {
                    new_entities += 1;
                    added.clone()
                }
            };
            entities.insert(id.clone(), merged);
        }

        let mut processed_months = state.processed_months.clone();
        processed_months.extend(batch.iter().copied());

        let report = MergeReport {
            months: batch.into_iter().collect(),
            records: records.len(),
            entities_touched: additions.len(),
            new_entities,
            batch_totals: global_additions.totals(),
        };

        debug!(
            months = report.months.len(),
            records = report.records,
            entities_touched = report.entities_touched,
            new_entities = report.new_entities,
            "merged monthly batch"
        );

        Ok(MergeOutcome::Merged {
            state: UsageState {
                global: merge_series(&state.global, &global_additions),
                entities,
                processed_months,
            },
            report,
        })
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
