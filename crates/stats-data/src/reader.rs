//! TSV dump reading.
//!
//! The upstream statistics platform publishes two headerless, tab-separated
//! dumps: one with per-entity visits and one with per-resource downloads.
//! Both are streamed line by line and aggregated per entity and month, then
//! combined into [`MetricRecord`]s for the merge engine.

use std::collections::{BTreeMap, BTreeSet};
use std::io::BufRead;
use std::path::Path;

use regex::Regex;
use stats_core::error::{Result, StatsError};
use stats_core::formatting::format_count;
use stats_core::models::MetricRecord;
use stats_core::month::Month;
use tracing::{debug, info, warn};

/// Lines between two progress log messages.
const PROGRESS_EVERY: u64 = 1_000_000;

/// Number of malformed lines reported individually at debug level.
const MAX_REPORTED_ERRORS: u64 = 10;

/// Per-entity, per-month counts read from one dump.
pub type DumpCounts = BTreeMap<String, BTreeMap<Month, u64>>;

// ── DumpKind ──────────────────────────────────────────────────────────────────

/// Column layout of a dump file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    /// `__id, date_metric, dataset_id, organization_id, nb_visit`
    Visits,
    /// `__id, date_metric, resource_id, dataset_id, organization_id, nb_visit`
    ///
    /// Downloads are attributed to the dataset, not the resource.
    Downloads,
}

impl DumpKind {
    fn min_columns(&self) -> usize {
        match self {
            DumpKind::Visits => 5,
            DumpKind::Downloads => 6,
        }
    }

    fn entity_column(&self) -> usize {
        match self {
            DumpKind::Visits => 2,
            DumpKind::Downloads => 3,
        }
    }

    fn count_column(&self) -> usize {
        match self {
            DumpKind::Visits => 4,
            DumpKind::Downloads => 5,
        }
    }
}

/// Line counters from one dump read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DumpReadReport {
    pub lines: u64,
    /// Lines with too few columns or a non-integer count.
    pub errors: u64,
    /// Well-formed lines dropped by the month filter.
    pub filtered: u64,
}

// ── Parsing ───────────────────────────────────────────────────────────────────

/// Extract the month of a `date_metric` value (`YYYY-MM-DD` or `YYYY-MM`).
pub fn parse_date_metric(re: &Regex, value: &str) -> Option<Month> {
    let caps = re.captures(value)?;
    caps.get(1)?.as_str().parse().ok()
}

fn date_metric_regex() -> Regex {
    Regex::new(r"^(\d{4}-\d{2})(?:-\d{2})?").expect("regex is valid")
}

// ── Reading ───────────────────────────────────────────────────────────────────

/// Read a dump file. When `months` is given, only rows in those months are
/// kept.
pub fn read_dump(
    path: &Path,
    kind: DumpKind,
    months: Option<&BTreeSet<Month>>,
) -> Result<(DumpCounts, DumpReadReport)> {
    let file = std::fs::File::open(path).map_err(|source| StatsError::FileRead {
        path: path.to_path_buf(),
        source,
    })?;
    info!("reading {:?} dump {}", kind, path.display());
    read_dump_from(std::io::BufReader::new(file), kind, months)
}

/// Same as [`read_dump`] over any buffered reader.
pub fn read_dump_from(
    reader: impl BufRead,
    kind: DumpKind,
    months: Option<&BTreeSet<Month>>,
) -> Result<(DumpCounts, DumpReadReport)> {
    let re = date_metric_regex();
    let started = std::time::Instant::now();
    let mut counts = DumpCounts::new();
    let mut report = DumpReadReport::default();

    for line in reader.lines() {
        let line = line?;
        report.lines += 1;

        if report.lines % PROGRESS_EVERY == 0 {
            info!(
                "{} lines read ({:.1}s)",
                format_count(report.lines),
                started.elapsed().as_secs_f64()
            );
        }

        let columns: Vec<&str> = line.split('\t').collect();
        if columns.len() < kind.min_columns() {
            report.errors += 1;
            if report.errors <= MAX_REPORTED_ERRORS {
                debug!(line = report.lines, "too few columns");
            }
            continue;
        }

        let count: u64 = match columns[kind.count_column()].trim().parse() {
            Ok(n) => n,
            Err(e) => {
                report.errors += 1;
                if report.errors <= MAX_REPORTED_ERRORS {
                    debug!(line = report.lines, error = %e, "invalid count");
                }
                continue;
            }
        };

        let entity_id = columns[kind.entity_column()].trim();
        let date_metric = columns[1].trim();
        if entity_id.is_empty() || date_metric.is_empty() {
            continue;
        }
        let Some(month) = parse_date_metric(&re, date_metric) else {
            continue;
        };
        if months.is_some_and(|set| !set.contains(&month)) {
            report.filtered += 1;
            continue;
        }

        *counts
            .entry(entity_id.to_string())
            .or_default()
            .entry(month)
            .or_default() += count;
    }

    info!(
        "{} lines read in {:.1}s, {} entities",
        format_count(report.lines),
        started.elapsed().as_secs_f64(),
        format_count(counts.len() as u64)
    );
    if report.errors > 0 {
        warn!("{} malformed lines skipped", format_count(report.errors));
    }

    Ok((counts, report))
}

/// Combine visits and downloads into one record per entity and month.
///
/// A month present only in the visits dump yields `download_count: None`.
pub fn combine_dumps(visits: &DumpCounts, downloads: &DumpCounts) -> Vec<MetricRecord> {
    let ids: BTreeSet<&String> = visits.keys().chain(downloads.keys()).collect();
    let empty = BTreeMap::new();
    let mut records = Vec::new();

    for id in ids {
        let v = visits.get(id).unwrap_or(&empty);
        let d = downloads.get(id).unwrap_or(&empty);
        let months: BTreeSet<&Month> = v.keys().chain(d.keys()).collect();
        for month in months {
            records.push(MetricRecord {
                entity_id: id.clone(),
                month: *month,
                visit_count: v.get(month).copied().unwrap_or(0),
                download_count: d.get(month).copied(),
            });
        }
    }

    records
}
