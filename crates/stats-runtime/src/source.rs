//! Upstream adapters.
//!
//! [`MetricSource`] serves monthly observations page by page and
//! [`MetadataResolver`] looks up display metadata for one entity. The
//! updater only talks to these traits; the file-backed implementations here
//! read the published TSV dumps and a JSON catalog.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;

use serde::Deserialize;
use stats_core::error::{Result, StatsError};
use stats_core::models::{EntityMetadata, MetricRecord};
use stats_core::month::Month;
use stats_data::reader::{combine_dumps, read_dump, DumpCounts, DumpKind};
use tracing::info;

/// Organization name used when the catalog has none for an entity.
pub const UNKNOWN_ORGANIZATION: &str = "Inconnu";

// ── Traits ────────────────────────────────────────────────────────────────────

/// One page of observations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricPage {
    pub records: Vec<MetricRecord>,
    /// Index of the following page, `None` on the last one.
    pub next_page: Option<u32>,
}

pub trait MetricSource {
    /// Fetch page `page` (0-based) of the observations for `month`.
    fn fetch_page(&mut self, month: Month, page: u32) -> Result<MetricPage>;
}

pub trait MetadataResolver {
    /// Metadata for `entity_id`, or `Ok(None)` when the entity is unknown
    /// upstream. Errors are transient and may be retried.
    fn resolve(&mut self, entity_id: &str) -> Result<Option<EntityMetadata>>;
}

// ── DumpMetricSource ──────────────────────────────────────────────────────────

/// Observations read once from the TSV dumps and served in pages.
#[derive(Debug, Clone, Default)]
pub struct DumpMetricSource {
    by_month: BTreeMap<Month, Vec<MetricRecord>>,
    page_size: usize,
}

impl DumpMetricSource {
    /// Read the dumps, keeping only rows in `months`.
    ///
    /// Either dump may be absent; an absent visits dump yields download-only
    /// records and vice versa.
    pub fn open(
        visits: Option<&Path>,
        downloads: Option<&Path>,
        months: &[Month],
        page_size: usize,
    ) -> Result<Self> {
        let filter: BTreeSet<Month> = months.iter().copied().collect();

        let read = |path: Option<&Path>, kind: DumpKind| -> Result<DumpCounts> {
            match path {
                Some(p) => Ok(read_dump(p, kind, Some(&filter))?.0),
                None => Ok(DumpCounts::new()),
            }
        };
        let visit_counts = read(visits, DumpKind::Visits)?;
        let download_counts = read(downloads, DumpKind::Downloads)?;

        let records = combine_dumps(&visit_counts, &download_counts);
        info!(records = records.len(), months = filter.len(), "dump source ready");
        Ok(Self::from_records(records, page_size))
    }

    pub fn from_records(records: Vec<MetricRecord>, page_size: usize) -> Self {
        let mut by_month: BTreeMap<Month, Vec<MetricRecord>> = BTreeMap::new();
        for record in records {
            by_month.entry(record.month).or_default().push(record);
        }
        Self {
            by_month,
            page_size: page_size.max(1),
        }
    }
}

impl MetricSource for DumpMetricSource {
    fn fetch_page(&mut self, month: Month, page: u32) -> Result<MetricPage> {
        let Some(records) = self.by_month.get(&month) else {
            return Ok(MetricPage::default());
        };
        let start = page as usize * self.page_size;
        let end = (start + self.page_size).min(records.len());
        if start >= records.len() {
            return Ok(MetricPage::default());
        }
        Ok(MetricPage {
            records: records[start..end].to_vec(),
            next_page: (end < records.len()).then_some(page + 1),
        })
    }
}

// ── CatalogResolver ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
struct CatalogOrganization {
    #[serde(default)]
    id: String,
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
struct CatalogEntry {
    id: String,
    title: String,
    #[serde(default)]
    slug: String,
    #[serde(default)]
    organization: Option<CatalogOrganization>,
    #[serde(default)]
    page: Option<String>,
}

impl From<CatalogEntry> for EntityMetadata {
    fn from(entry: CatalogEntry) -> Self {
        let (organization, organization_id) = match entry.organization {
            Some(org) if !org.name.is_empty() => (org.name, org.id),
            Some(org) => (UNKNOWN_ORGANIZATION.to_string(), org.id),
            None => (UNKNOWN_ORGANIZATION.to_string(), String::new()),
        };
        EntityMetadata {
            id: entry.id,
            title: entry.title,
            slug: entry.slug,
            organization,
            organization_id,
            url: entry.page,
        }
    }
}

/// Metadata resolver backed by a JSON catalog file.
#[derive(Debug, Clone, Default)]
pub struct CatalogResolver {
    entries: HashMap<String, EntityMetadata>,
}

impl CatalogResolver {
    pub fn open(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|source| StatsError::FileRead {
            path: path.to_path_buf(),
            source,
        })?;
        let resolver = Self::from_json(&content)?;
        info!(entries = resolver.len(), "catalog loaded from {}", path.display());
        Ok(resolver)
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let entries: Vec<CatalogEntry> = serde_json::from_str(content)?;
        Ok(Self::from_metadata(entries.into_iter().map(EntityMetadata::from)))
    }

    pub fn from_metadata(entries: impl IntoIterator<Item = EntityMetadata>) -> Self {
        Self {
            entries: entries.into_iter().map(|m| (m.id.clone(), m)).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl MetadataResolver for CatalogResolver {
    fn resolve(&mut self, entity_id: &str) -> Result<Option<EntityMetadata>> {
        Ok(self.entries.get(entity_id).cloned())
    }
}
