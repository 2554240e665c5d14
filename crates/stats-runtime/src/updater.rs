//! Update cycle.
//!
//! One run loads persisted state, fetches the months after its high-water
//! mark, merges them, resolves metadata for newly observed entities, rebuilds
//! rankings and detail records, and finally writes everything. Nothing is
//! written until the whole cycle has succeeded in memory, and a run with no
//! new months writes nothing at all.

use chrono::Utc;
use stats_core::error::Result;
use stats_core::formatting::format_count;
use stats_core::models::Counts;
use stats_core::month::Month;
use stats_data::analysis::{
    build_outputs, entities_missing_metadata, limit_to_top_entities, AnalysisConfig,
    DEFAULT_ENTITY_URL_BASE,
};
use stats_data::merge::{MergeOutcome, MonthlyMerger};
use stats_data::ranking::DEFAULT_TOP_N;
use stats_data::store::{LoadedState, StateStore};
use tracing::{debug, info, warn};

use crate::fetcher::{records_per_month, ThrottledFetcher};
use crate::source::{MetadataResolver, MetricSource};

// ── Public types ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct UpdateConfig {
    /// Last month to fetch, inclusive.
    pub anchor: Month,
    /// First month fetched into an empty state.
    pub start_month: Month,
    pub top_n: usize,
    /// Keep only the most visited entities of the batch.
    pub limit_entities: Option<usize>,
    /// Run the full cycle but skip writing.
    pub dry_run: bool,
    pub url_base: String,
}

impl UpdateConfig {
    pub fn new(anchor: Month, start_month: Month) -> Self {
        Self {
            anchor,
            start_month,
            top_n: DEFAULT_TOP_N,
            limit_entities: None,
            dry_run: false,
            url_base: DEFAULT_ENTITY_URL_BASE.to_string(),
        }
    }
}

/// Summary of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    pub anchor: Option<Month>,
    /// Months merged by this run; empty when the state was up to date.
    pub months: Vec<Month>,
    pub records: usize,
    pub new_entities: usize,
    pub resolved: usize,
    pub not_found: usize,
    /// Global totals after the run.
    pub totals: Counts,
    pub entities: usize,
    pub details: usize,
    /// `false` for no-op and dry runs.
    pub written: bool,
}

impl UpdateReport {
    pub fn is_up_to_date(&self) -> bool {
        self.months.is_empty()
    }
}

/// Loaded state and the months a run still has to fetch.
///
/// Split from [`Updater::complete`] so callers can open a source scoped to
/// exactly these months.
#[derive(Debug, Clone)]
pub struct PendingUpdate {
    loaded: LoadedState,
    months: Vec<Month>,
}

impl PendingUpdate {
    pub fn months(&self) -> &[Month] {
        &self.months
    }

    pub fn is_up_to_date(&self) -> bool {
        self.months.is_empty()
    }
}

// ── Updater ───────────────────────────────────────────────────────────────────

pub struct Updater {
    store: StateStore,
    fetcher: ThrottledFetcher,
    config: UpdateConfig,
}

impl Updater {
    pub fn new(store: StateStore, fetcher: ThrottledFetcher, config: UpdateConfig) -> Self {
        Self {
            store,
            fetcher,
            config,
        }
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Load state and work out which months to fetch.
    pub fn prepare(&self) -> Result<PendingUpdate> {
        let loaded = self.store.load()?;
        let months =
            MonthlyMerger::months_to_fetch(&loaded.usage, self.config.start_month, self.config.anchor);

        match (months.first(), months.last()) {
            (Some(first), Some(last)) => info!(
                "{} month(s) to fetch: {first} to {last}",
                months.len()
            ),
            _ => info!(
                high_water_mark = ?loaded.usage.high_water_mark().map(|m| m.to_string()),
                anchor = %self.config.anchor,
                "state is up to date"
            ),
        }

        Ok(PendingUpdate { loaded, months })
    }

    /// Run the rest of the cycle for a prepared update.
    pub fn complete(
        &mut self,
        pending: PendingUpdate,
        source: &mut dyn MetricSource,
        resolver: &mut dyn MetadataResolver,
    ) -> Result<UpdateReport> {
        let PendingUpdate { loaded, months } = pending;
        let mut report = UpdateReport {
            anchor: Some(self.config.anchor),
            totals: loaded.usage.global.totals(),
            entities: loaded.usage.entities.len(),
            ..UpdateReport::default()
        };
        if months.is_empty() {
            return Ok(report);
        }

        let mut records = self.fetcher.fetch_months(source, &months)?;
        if let Some(limit) = self.config.limit_entities {
            records = limit_to_top_entities(&records, limit);
            info!(limit, records = records.len(), "batch limited to top entities");
        }
        debug!(per_month = ?records_per_month(&records), "batch fetched");

        let (state, merge) = match MonthlyMerger::merge(&loaded.usage, &months, &records)? {
            MergeOutcome::Merged { state, report } => (state, report),
            MergeOutcome::NoOp => return Ok(report),
        };
        if let Some(month) = state.find_global_mismatch() {
            warn!(%month, "global series differs from the sum of entity series");
        }

        let missing = entities_missing_metadata(&records, &loaded.directory);
        let resolved = self.fetcher.resolve_all(resolver, &missing)?;
        let (directory, directory_report) = loaded.directory.merged(resolved.resolved);
        debug!(
            added = directory_report.added,
            updated = directory_report.updated,
            "directory merged"
        );

        let analysis = AnalysisConfig {
            anchor: self.config.anchor,
            start_month: loaded.start_month.unwrap_or(self.config.start_month),
            top_n: self.config.top_n,
            url_base: self.config.url_base.clone(),
        };
        let outputs = build_outputs(&state, &directory, &analysis, Utc::now());

        if self.config.dry_run {
            info!("dry run: nothing written");
        } else {
            self.store.write(&outputs)?;
            info!("state written to {}", self.store.dir().display());
        }

        report.months = merge.months;
        report.records = merge.records;
        report.new_entities = merge.new_entities;
        report.resolved = directory_report.added + directory_report.updated;
        report.not_found = resolved.not_found.len();
        report.totals = state.global.totals();
        report.entities = state.entities.len();
        report.details = outputs.details.len();
        report.written = !self.config.dry_run;

        info!(
            "merged {} records, {} new entities, {} visits total",
            format_count(report.records as u64),
            format_count(report.new_entities as u64),
            format_count(report.totals.visits)
        );
        Ok(report)
    }

    /// [`Updater::prepare`] followed by [`Updater::complete`].
    pub fn run(
        &mut self,
        source: &mut dyn MetricSource,
        resolver: &mut dyn MetadataResolver,
    ) -> Result<UpdateReport> {
        let pending = self.prepare()?;
        self.complete(pending, source, resolver)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use stats_core::error::StatsError;
    use stats_core::models::{EntityMetadata, MetricRecord};
    use stats_data::store::{DIRECTORY_FILE, GLOBAL_FILE, RANKINGS_FILE};
    use tempfile::TempDir;

    use crate::source::{CatalogResolver, DumpMetricSource, MetricPage};

    fn m(s: &str) -> Month {
        s.parse().unwrap()
    }

    fn rec(id: &str, month: &str, visits: u64, downloads: u64) -> MetricRecord {
        MetricRecord {
            entity_id: id.to_string(),
            month: m(month),
            visit_count: visits,
            download_count: Some(downloads),
        }
    }

    fn meta(id: &str, title: &str) -> EntityMetadata {
        EntityMetadata {
            id: id.to_string(),
            title: title.to_string(),
            slug: id.to_string(),
            organization: "Org".to_string(),
            organization_id: "org".to_string(),
            url: None,
        }
    }

    fn updater(store: StateStore, anchor: &str) -> Updater {
        Updater::new(
            store,
            ThrottledFetcher::new(Duration::ZERO, 3),
            UpdateConfig::new(m(anchor), m("2024-01")),
        )
    }

    fn resolver() -> CatalogResolver {
        CatalogResolver::from_metadata(vec![meta("a", "Agriculture"), meta("b", "Budget")])
    }

    fn batch() -> Vec<MetricRecord> {
        vec![
            rec("a", "2024-01", 10, 1),
            rec("b", "2024-01", 20, 2),
            rec("a", "2024-02", 30, 3),
            rec("c", "2024-02", 5, 0),
        ]
    }

    /// Counts requested months; panics on months it should never see.
    struct Recording {
        inner: DumpMetricSource,
        months: Vec<Month>,
    }

    impl MetricSource for Recording {
        fn fetch_page(&mut self, month: Month, page: u32) -> Result<MetricPage> {
            if page == 0 {
                self.months.push(month);
            }
            self.inner.fetch_page(month, page)
        }
    }

    #[test]
    fn test_first_run_from_start_month() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let mut up = updater(store.clone(), "2024-02");
        let mut source = DumpMetricSource::from_records(batch(), 2);

        let report = up.run(&mut source, &mut resolver()).unwrap();
        assert_eq!(report.months, vec![m("2024-01"), m("2024-02")]);
        assert_eq!(report.records, 4);
        assert_eq!(report.new_entities, 3);
        assert_eq!(report.resolved, 2);
        assert_eq!(report.not_found, 1);
        assert_eq!(report.totals, Counts::new(65, 6));
        assert!(report.written);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.usage.entities.len(), 3);
        assert_eq!(loaded.directory.len(), 2);
        assert_eq!(loaded.usage.find_global_mismatch(), None);
        assert!(tmp.path().join(GLOBAL_FILE).exists());
        assert!(tmp.path().join(RANKINGS_FILE).exists());
        assert!(tmp.path().join(DIRECTORY_FILE).exists());
    }

    #[test]
    fn test_second_run_fetches_only_new_months() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let mut source = DumpMetricSource::from_records(batch(), 10);
        updater(store.clone(), "2024-02")
            .run(&mut source, &mut resolver())
            .unwrap();

        let mut next = batch();
        next.push(rec("b", "2024-03", 7, 1));
        let mut recording = Recording {
            inner: DumpMetricSource::from_records(next, 10),
            months: vec![],
        };
        let report = updater(store.clone(), "2024-03")
            .run(&mut recording, &mut resolver())
            .unwrap();

        assert_eq!(recording.months, vec![m("2024-03")]);
        assert_eq!(report.months, vec![m("2024-03")]);
        assert_eq!(report.new_entities, 0);
        // b is already in the directory; nothing to resolve.
        assert_eq!(report.resolved, 0);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.usage.global.get(m("2024-01")), Counts::new(30, 3));
        assert_eq!(loaded.usage.global.get(m("2024-03")), Counts::new(7, 1));
        assert_eq!(loaded.usage.find_global_mismatch(), None);
    }

    #[test]
    fn test_up_to_date_run_writes_nothing() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let mut source = DumpMetricSource::from_records(batch(), 10);
        updater(store.clone(), "2024-02")
            .run(&mut source, &mut resolver())
            .unwrap();
        let before = std::fs::read_to_string(tmp.path().join(GLOBAL_FILE)).unwrap();

        let mut recording = Recording {
            inner: DumpMetricSource::from_records(batch(), 10),
            months: vec![],
        };
        let report = updater(store, "2024-02")
            .run(&mut recording, &mut resolver())
            .unwrap();

        assert!(report.is_up_to_date());
        assert!(!report.written);
        assert_eq!(report.totals, Counts::new(65, 6));
        assert!(recording.months.is_empty());
        let after = std::fs::read_to_string(tmp.path().join(GLOBAL_FILE)).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_dry_run_leaves_store_empty() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let mut up = updater(store.clone(), "2024-02");
        up.config.dry_run = true;
        let mut source = DumpMetricSource::from_records(batch(), 10);

        let report = up.run(&mut source, &mut resolver()).unwrap();
        assert_eq!(report.records, 4);
        assert!(!report.written);
        assert!(!tmp.path().join(GLOBAL_FILE).exists());
        assert_eq!(store.load().unwrap(), LoadedState::default());
    }

    #[test]
    fn test_limit_entities() {
        let tmp = TempDir::new().unwrap();
        let mut up = updater(StateStore::new(tmp.path()), "2024-02");
        up.config.limit_entities = Some(1);
        let mut source = DumpMetricSource::from_records(batch(), 10);

        let report = up.run(&mut source, &mut resolver()).unwrap();
        // a has 40 visits, more than b (20) and c (5).
        assert_eq!(report.entities, 1);
        assert_eq!(report.records, 2);
        assert_eq!(report.totals, Counts::new(40, 4));
    }

    #[test]
    fn test_source_failure_leaves_previous_state() {
        struct Down;
        impl MetricSource for Down {
            fn fetch_page(&mut self, _month: Month, _page: u32) -> Result<MetricPage> {
                Err(StatsError::Source("503".to_string()))
            }
        }

        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let mut source = DumpMetricSource::from_records(batch(), 10);
        updater(store.clone(), "2024-02")
            .run(&mut source, &mut resolver())
            .unwrap();
        let before = store.load().unwrap();

        let err = updater(store.clone(), "2024-03")
            .run(&mut Down, &mut resolver())
            .unwrap_err();
        assert!(matches!(err, StatsError::Source(_)));
        assert_eq!(store.load().unwrap(), before);
    }

    #[test]
    fn test_resolver_url_survives_later_runs() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let mut with_url = meta("a", "Agriculture");
        with_url.url = Some("https://custom.example/a".to_string());
        let mut catalog = CatalogResolver::from_metadata(vec![with_url, meta("b", "Budget")]);

        let mut source = DumpMetricSource::from_records(batch(), 10);
        updater(store.clone(), "2024-02")
            .run(&mut source, &mut catalog)
            .unwrap();
        let first = store.load_detail("a").unwrap().unwrap();
        assert_eq!(first.url, "https://custom.example/a");

        // The second run resolves nothing: "a" is already in the directory.
        let mut next = batch();
        next.push(rec("a", "2024-03", 4, 0));
        let mut source = DumpMetricSource::from_records(next, 10);
        let report = updater(store.clone(), "2024-03")
            .run(&mut source, &mut CatalogResolver::default())
            .unwrap();
        assert_eq!(report.resolved, 0);

        let second = store.load_detail("a").unwrap().unwrap();
        assert_eq!(second.url, "https://custom.example/a");
        assert_eq!(second.total_visits, 44);
        // Entities without a resolver url still get the public page fallback.
        let b = store.load_detail("b").unwrap().unwrap();
        assert_eq!(b.url, format!("{DEFAULT_ENTITY_URL_BASE}b/"));
    }

    #[test]
    fn test_rankings_written_for_entities_with_metadata() {
        let tmp = TempDir::new().unwrap();
        let store = StateStore::new(tmp.path());
        let mut source = DumpMetricSource::from_records(batch(), 10);
        let report = updater(store.clone(), "2024-02")
            .run(&mut source, &mut resolver())
            .unwrap();

        let snapshot = store.load_rankings().unwrap().unwrap();
        let ids: Vec<&str> = snapshot
            .per_period
            .all_time
            .visits
            .iter()
            .map(|e| e.id.as_str())
            .collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(report.details, 2);
        assert!(store.load_detail("a").unwrap().is_some());
        assert!(store.load_detail("c").unwrap().is_none());
    }
}
