//! Throttled, retrying access to the upstream adapters.
//!
//! Every request is spaced by a fixed delay. A failed request is retried up
//! to `max_attempts` times in total, waiting `attempt × delay` before each
//! retry. When the attempts run out the last error is surfaced as
//! [`StatsError::Source`].

use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

use stats_core::error::{Result, StatsError};
use stats_core::formatting::format_count;
use stats_core::models::{EntityMetadata, MetricRecord};
use stats_core::month::Month;
use tracing::{debug, info, warn};

use crate::source::{MetadataResolver, MetricSource};

/// Attempts per request before giving up.
pub const MAX_RETRY_ATTEMPTS: u32 = 3;

/// Pause between two consecutive requests.
pub const DEFAULT_REQUEST_DELAY: Duration = Duration::from_millis(100);

/// Resolutions between two progress log messages.
const RESOLVE_PROGRESS_EVERY: usize = 100;

/// Result of resolving a list of entity ids.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolveOutcome {
    pub resolved: Vec<EntityMetadata>,
    /// Ids the resolver reported as unknown.
    pub not_found: Vec<String>,
}

// ── ThrottledFetcher ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ThrottledFetcher {
    delay: Duration,
    max_attempts: u32,
    requests: u64,
}

impl Default for ThrottledFetcher {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_DELAY, MAX_RETRY_ATTEMPTS)
    }
}

impl ThrottledFetcher {
    /// `max_attempts` is clamped to at least one.
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            max_attempts: max_attempts.max(1),
            requests: 0,
        }
    }

    /// Requests issued so far, retries included.
    pub fn requests(&self) -> u64 {
        self.requests
    }

    /// Run `op` under the throttle and retry policy.
    pub fn call<T>(&mut self, what: &str, mut op: impl FnMut() -> Result<T>) -> Result<T> {
        let mut last_err = String::new();

        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                let backoff = self.delay * attempt;
                debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying {what}");
                thread::sleep(backoff);
            } else if self.requests > 0 && !self.delay.is_zero() {
                thread::sleep(self.delay);
            }

            self.requests += 1;
            match op() {
                Ok(value) => return Ok(value),
                Err(e) => {
                    warn!(attempt = attempt + 1, error = %e, "{what} failed");
                    last_err = e.to_string();
                }
            }
        }

        Err(StatsError::Source(format!(
            "{what}: giving up after {} attempts: {last_err}",
            self.max_attempts
        )))
    }

    /// Fetch every page of every month in `months`.
    pub fn fetch_months(
        &mut self,
        source: &mut dyn MetricSource,
        months: &[Month],
    ) -> Result<Vec<MetricRecord>> {
        let mut records = Vec::new();

        for &month in months {
            let mut page = 0u32;
            let mut month_records = 0usize;
            loop {
                let fetched =
                    self.call(&format!("fetch {month} page {page}"), || source.fetch_page(month, page))?;
                month_records += fetched.records.len();
                records.extend(fetched.records);
                match fetched.next_page {
                    Some(next) if next > page => page = next,
                    Some(next) => {
                        return Err(StatsError::Source(format!(
                            "fetch {month}: page {next} does not follow page {page}"
                        )))
                    }
                    None => break,
                }
            }
            info!("{month}: {} records in {} pages", format_count(month_records as u64), page + 1);
        }

        Ok(records)
    }

    /// Resolve metadata for each id. Unknown ids are collected, not fatal.
    pub fn resolve_all(
        &mut self,
        resolver: &mut dyn MetadataResolver,
        ids: &[String],
    ) -> Result<ResolveOutcome> {
        let mut outcome = ResolveOutcome::default();
        if ids.is_empty() {
            return Ok(outcome);
        }
        info!("resolving metadata for {} entities", format_count(ids.len() as u64));

        for (i, id) in ids.iter().enumerate() {
            match self.call(&format!("resolve {id}"), || resolver.resolve(id))? {
                Some(meta) => outcome.resolved.push(meta),
                None => {
                    debug!(id = %id, "entity not found upstream");
                    outcome.not_found.push(id.clone());
                }
            }
            if (i + 1) % RESOLVE_PROGRESS_EVERY == 0 {
                info!("{}/{} entities resolved", i + 1, ids.len());
            }
        }

        if !outcome.not_found.is_empty() {
            warn!("{} entities without metadata", format_count(outcome.not_found.len() as u64));
        }
        Ok(outcome)
    }
}

/// Group a flat record list per month. Handy for logging batch shapes.
pub fn records_per_month(records: &[MetricRecord]) -> BTreeMap<Month, usize> {
    let mut counts = BTreeMap::new();
    for record in records {
        *counts.entry(record.month).or_insert(0) += 1;
    }
    counts
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::{CatalogResolver, DumpMetricSource, MetricPage};

    fn m(s: &str) -> Month {
        s.parse().unwrap()
    }

    fn rec(id: &str, month: &str) -> MetricRecord {
        MetricRecord {
            entity_id: id.to_string(),
            month: m(month),
            visit_count: 1,
            download_count: None,
        }
    }

    fn fetcher() -> ThrottledFetcher {
        ThrottledFetcher::new(Duration::ZERO, MAX_RETRY_ATTEMPTS)
    }

    /// Fails the first `failures` calls, then delegates.
    struct Flaky<S> {
        inner: S,
        failures: u32,
    }

    impl<S: MetricSource> MetricSource for Flaky<S> {
        fn fetch_page(&mut self, month: Month, page: u32) -> Result<MetricPage> {
            if self.failures > 0 {
                self.failures -= 1;
                return Err(StatsError::Source("503".to_string()));
            }
            self.inner.fetch_page(month, page)
        }
    }

    struct Broken;

    impl MetadataResolver for Broken {
        fn resolve(&mut self, _entity_id: &str) -> Result<Option<EntityMetadata>> {
            Err(StatsError::Source("timeout".to_string()))
        }
    }

    #[test]
    fn test_fetch_months_walks_all_pages() {
        let records: Vec<MetricRecord> = (0..5)
            .map(|i| rec(&format!("ds-{i}"), "2024-01"))
            .chain([rec("ds-x", "2024-02")])
            .collect();
        let mut source = DumpMetricSource::from_records(records, 2);
        let mut f = fetcher();

        let fetched = f.fetch_months(&mut source, &[m("2024-01"), m("2024-02")]).unwrap();
        assert_eq!(fetched.len(), 6);
        let per_month = records_per_month(&fetched);
        assert_eq!(per_month[&m("2024-01")], 5);
        assert_eq!(per_month[&m("2024-02")], 1);
        // Three pages for January, one for February.
        assert_eq!(f.requests(), 4);
    }

    #[test]
    fn test_transient_failure_is_retried() {
        let inner = DumpMetricSource::from_records(vec![rec("a", "2024-01")], 10);
        let mut source = Flaky { inner, failures: 2 };
        let mut f = fetcher();

        let fetched = f.fetch_months(&mut source, &[m("2024-01")]).unwrap();
        assert_eq!(fetched.len(), 1);
        assert_eq!(f.requests(), 3);
    }

    #[test]
    fn test_exhausted_retries_surface_source_error() {
        let inner = DumpMetricSource::from_records(vec![rec("a", "2024-01")], 10);
        let mut source = Flaky { inner, failures: 3 };
        let mut f = fetcher();

        let err = f.fetch_months(&mut source, &[m("2024-01")]).unwrap_err();
        assert!(matches!(err, StatsError::Source(ref msg) if msg.contains("3 attempts")));
        assert_eq!(f.requests(), 3);
    }

    #[test]
    fn test_max_attempts_clamped() {
        let mut f = ThrottledFetcher::new(Duration::ZERO, 0);
        let err = f.resolve_all(&mut Broken, &["a".to_string()]).unwrap_err();
        assert!(matches!(err, StatsError::Source(_)));
        assert_eq!(f.requests(), 1);
    }

    #[test]
    fn test_resolve_all_collects_not_found() {
        let json = r#"[{"id": "a", "title": "A", "slug": "a", "organization": null}]"#;
        let mut resolver = CatalogResolver::from_json(json).unwrap();
        let mut f = fetcher();

        let outcome = f
            .resolve_all(&mut resolver, &["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(outcome.resolved[0].id, "a");
        assert_eq!(outcome.not_found, vec!["b".to_string()]);
    }

    #[test]
    fn test_resolve_all_empty_makes_no_request() {
        let mut f = fetcher();
        let outcome = f.resolve_all(&mut Broken, &[]).unwrap();
        assert_eq!(outcome, ResolveOutcome::default());
        assert_eq!(f.requests(), 0);
    }
}
