//! Entity directory maintenance.
//!
//! The directory only grows: resolved metadata is merged in by id and
//! entries are never removed, even when an entity disappears upstream.
//! Output is ordered by title under French collation.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use stats_core::collation::{collation_key, CollationKey};
use stats_core::models::{DirectoryEntry, EntityDirectoryRecord, EntityMetadata};

/// Counts from one [`EntityDirectory::merged`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirectoryMergeReport {
    pub added: usize,
    pub updated: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntityDirectory {
    entries: BTreeMap<String, EntityMetadata>,
}

impl EntityDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a directory from its persisted record.
    pub fn from_record(record: &EntityDirectoryRecord) -> Self {
        let entries = record
            .entries
            .iter()
            .map(|e| {
                (
                    e.id.clone(),
                    EntityMetadata {
                        id: e.id.clone(),
                        title: e.title.clone(),
                        slug: e.slug.clone(),
                        organization: e.organization.clone(),
                        organization_id: e.organization_id.clone(),
                        url: e.url.clone(),
                    },
                )
            })
            .collect();
        Self { entries }
    }

    pub fn get(&self, id: &str) -> Option<&EntityMetadata> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// A new directory with `resolved` merged in. Last write wins per id.
    pub fn merged(
        &self,
        resolved: impl IntoIterator<Item = EntityMetadata>,
    ) -> (Self, DirectoryMergeReport) {
        let mut entries = self.entries.clone();
        let mut report = DirectoryMergeReport::default();
        for meta in resolved {
            match entries.insert(meta.id.clone(), meta) {
                Some(_) => report.updated += 1,
                None => report.added += 1,
            }
        }
        (Self { entries }, report)
    }

    /// Entries ordered by title collation, then by id.
    pub fn sorted_entries(&self) -> Vec<DirectoryEntry> {
        let mut keyed: Vec<(CollationKey, &EntityMetadata)> = self
            .entries
            .values()
            .map(|meta| (collation_key(&meta.title), meta))
            .collect();
        keyed.sort_by(|(ka, a), (kb, b)| {
            ka.cmp(kb)
                .then_with(|| a.title.cmp(&b.title))
                .then_with(|| a.id.cmp(&b.id))
        });
        keyed
            .into_iter()
            .map(|(_, meta)| DirectoryEntry::from(meta))
            .collect()
    }

    pub fn to_record(&self, generated_at: DateTime<Utc>) -> EntityDirectoryRecord {
        EntityDirectoryRecord {
            last_update_timestamp: generated_at,
            entries: self.sorted_entries(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-20T10:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    #[test]
    fn test_sorted_by_french_collation() {
        let (dir, _) = EntityDirectory::new().merged(vec![
            meta("1", "Élection"),
            meta("2", "Agriculture"),
            meta("3", "Énergie"),
        ]);
        let titles: Vec<String> = dir.sorted_entries().into_iter().map(|e| e.title).collect();
        assert_eq!(titles, vec!["Agriculture", "Élection", "Énergie"]);
    }

    #[test]
    fn test_same_title_ordered_by_id() {
        let (dir, _) = EntityDirectory::new().merged(vec![meta("b", "Budget"), meta("a", "Budget")]);
        let ids: Vec<String> = dir.sorted_entries().into_iter().map(|e| e.id).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[test]
    fn test_merge_is_additive() {
        let (dir, _) = EntityDirectory::new().merged(vec![meta("1", "Un"), meta("2", "Deux")]);
        let (dir, report) = dir.merged(vec![meta("3", "Trois")]);
        assert_eq!(dir.len(), 3);
        assert!(dir.contains("1"));
        assert_eq!(report, DirectoryMergeReport { added: 1, updated: 0 });
    }

    #[test]
    fn test_merge_last_write_wins() {
        let (dir, _) = EntityDirectory::new().merged(vec![meta("1", "Ancien titre")]);
        let (updated, report) = dir.merged(vec![meta("1", "Nouveau titre")]);
        assert_eq!(updated.get("1").map(|m| m.title.as_str()), Some("Nouveau titre"));
        assert_eq!(report, DirectoryMergeReport { added: 0, updated: 1 });
        // Original untouched.
        assert_eq!(dir.get("1").map(|m| m.title.as_str()), Some("Ancien titre"));
    }

    #[test]
    fn test_record_round_trip() {
        let (dir, _) = EntityDirectory::new().merged(vec![meta("1", "Zèbre"), meta("2", "Abeille")]);
        let record = dir.to_record(now());
        assert_eq!(record.entries[0].title, "Abeille");
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("\"organizationId\""));
        let back: EntityDirectoryRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(EntityDirectory::from_record(&back), dir);
    }

    #[test]
    fn test_record_keeps_resolver_url() {
        let mut with_url = meta("1", "Budget");
        with_url.url = Some("https://custom.example/budget".to_string());
        let (dir, _) = EntityDirectory::new().merged(vec![with_url, meta("2", "Cadastre")]);

        let json = serde_json::to_string(&dir.to_record(now())).unwrap();
        // Entries without a url keep the field out of the file.
        assert_eq!(json.matches("\"url\"").count(), 1);

        let back: EntityDirectoryRecord = serde_json::from_str(&json).unwrap();
        let reloaded = EntityDirectory::from_record(&back);
        assert_eq!(
            reloaded.get("1").and_then(|m| m.url.as_deref()),
            Some("https://custom.example/budget")
        );
        assert!(reloaded.get("2").unwrap().url.is_none());
    }
}
