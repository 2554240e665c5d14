//! JSON state store.
//!
//! All state lives as JSON files under one directory. Writes are staged:
//! every file of a run is first written next to its target as `*.tmp`, and
//! only once all of them succeeded are they renamed into place. A failed run
//! leaves the previous state untouched.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use stats_core::error::{Result, StatsError};
use stats_core::models::{
    EntityDetailRecord, EntityDirectoryRecord, EntitySeriesRecord, GlobalStatsRecord,
    MonthlySeries, RankingSnapshot, UsageState,
};
use stats_core::month::Month;
use tracing::{debug, warn};

use crate::directory::EntityDirectory;

pub const GLOBAL_FILE: &str = "global-stats.json";
pub const ENTITY_SERIES_FILE: &str = "entity-series.json";
pub const RANKINGS_FILE: &str = "top-entities.json";
pub const DIRECTORY_FILE: &str = "entities-index.json";
pub const DETAILS_DIR: &str = "entities";
/// Present only while a write is being swapped in.
pub const JOURNAL_FILE: &str = "commit-journal.json";

/// State loaded at the start of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedState {
    pub usage: UsageState,
    pub directory: EntityDirectory,
    /// Start month recorded in the global record, if any.
    pub start_month: Option<Month>,
}

/// Every output of one aggregation cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct CycleOutputs {
    pub global: GlobalStatsRecord,
    pub entity_series: EntitySeriesRecord,
    pub rankings: RankingSnapshot,
    pub directory: EntityDirectoryRecord,
    pub details: Vec<EntityDetailRecord>,
}

/// Files swapped in by one write, relative to the state directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommitJournal {
    files: Vec<JournalEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct JournalEntry {
    path: PathBuf,
    had_previous: bool,
}

#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load persisted state. Missing files load as empty state.
    ///
    /// A write interrupted before its commit point is rolled back first.
    pub fn load(&self) -> Result<LoadedState> {
        self.recover()?;
        let mut loaded = LoadedState::default();

        if let Some(global) = read_json::<GlobalStatsRecord>(&self.dir.join(GLOBAL_FILE))? {
            loaded.usage.global = MonthlySeries::from_metrics(global.monthly_series);
            loaded.usage.processed_months = global.processed_months.into_iter().collect();
            loaded.start_month = Some(global.start_month);
        }

        if let Some(series) = read_json::<EntitySeriesRecord>(&self.dir.join(ENTITY_SERIES_FILE))? {
            loaded.usage.entities = series
                .entities
                .into_iter()
                .map(|(id, metrics)| (id, MonthlySeries::from_metrics(metrics)))
                .collect();
        }

        if let Some(directory) = read_json::<EntityDirectoryRecord>(&self.dir.join(DIRECTORY_FILE))? {
            loaded.directory = EntityDirectory::from_record(&directory);
        }

        debug!(
            entities = loaded.usage.entities.len(),
            months = loaded.usage.global.len(),
            directory = loaded.directory.len(),
            "state loaded from {}",
            self.dir.display()
        );

        Ok(loaded)
    }

    /// Read the last ranking snapshot, if one was written.
    pub fn load_rankings(&self) -> Result<Option<RankingSnapshot>> {
        read_json(&self.dir.join(RANKINGS_FILE))
    }

    /// Read the detail record of one entity, if one was written.
    pub fn load_detail(&self, id: &str) -> Result<Option<EntityDetailRecord>> {
        if !is_safe_file_stem(id) {
            return Ok(None);
        }
        read_json(&self.detail_path(id))
    }

    /// Write every output of a cycle, all or nothing.
    ///
    /// Files are staged as `*.tmp`, then swapped in under a commit journal
    /// with `global-stats.json` last. Any failure rolls back the files
    /// already swapped, and a journal left by an interrupted process is
    /// rolled back by the next [`StateStore::load`].
    pub fn write(&self, outputs: &CycleOutputs) -> Result<()> {
        self.recover()?;

        let mut staged: Vec<(PathBuf, Vec<u8>)> = Vec::with_capacity(outputs.details.len() + 4);
        for detail in &outputs.details {
            if !is_safe_file_stem(&detail.id) {
                warn!(id = %detail.id, "entity id is not usable as a file name; detail skipped");
                continue;
            }
            staged.push((self.detail_path(&detail.id), to_json(detail)?));
        }
        staged.push((self.dir.join(DIRECTORY_FILE), to_json(&outputs.directory)?));
        staged.push((self.dir.join(RANKINGS_FILE), to_json(&outputs.rankings)?));
        staged.push((self.dir.join(ENTITY_SERIES_FILE), to_json(&outputs.entity_series)?));
        // Holds the processed-months ledger, so it must land last.
        staged.push((self.dir.join(GLOBAL_FILE), to_json(&outputs.global)?));

        let mut written: Vec<PathBuf> = Vec::with_capacity(staged.len());
        for (target, bytes) in &staged {
            written.push(target.clone());
            if let Err(e) = write_file(&tmp_path(target), bytes) {
                discard(&written);
                return Err(e);
            }
        }

        for target in &written {
            // A stale backup would be restored over newer data on rollback.
            let _ = std::fs::remove_file(bak_path(target));
        }

        let journal = CommitJournal {
            files: written
                .iter()
                .map(|target| JournalEntry {
                    path: target.strip_prefix(&self.dir).unwrap_or(target).to_path_buf(),
                    had_previous: target.is_file(),
                })
                .collect(),
        };
        if let Err(e) = self.write_journal(&journal) {
            discard(&written);
            return Err(e);
        }

        for target in &written {
            if let Err(e) = swap_in(target) {
                self.roll_back(&journal);
                discard(&written);
                self.remove_journal();
                return Err(e);
            }
        }

        // Removing the journal is the commit point.
        let journal_path = self.journal_path();
        if let Err(source) = std::fs::remove_file(&journal_path) {
            self.roll_back(&journal);
            return Err(StatsError::FileWrite {
                path: journal_path,
                source,
            });
        }
        for target in &written {
            let _ = std::fs::remove_file(bak_path(target));
        }

        debug!(files = written.len(), "state written to {}", self.dir.display());
        Ok(())
    }

    /// Roll back a write interrupted before its commit point.
    fn recover(&self) -> Result<()> {
        let Some(journal) = read_json::<CommitJournal>(&self.journal_path())? else {
            return Ok(());
        };
        warn!(
            files = journal.files.len(),
            "rolling back interrupted write in {}",
            self.dir.display()
        );
        self.roll_back(&journal);
        for entry in &journal.files {
            let _ = std::fs::remove_file(tmp_path(&self.dir.join(&entry.path)));
        }
        self.remove_journal();
        Ok(())
    }

    /// Best effort: put back every backup and drop files the write created.
    fn roll_back(&self, journal: &CommitJournal) {
        for entry in &journal.files {
            let target = self.dir.join(&entry.path);
            let bak = bak_path(&target);
            if bak.is_file() {
                if let Err(e) = std::fs::rename(&bak, &target) {
                    warn!(error = %e, "could not restore {}", target.display());
                }
            } else if !entry.had_previous && target.is_file() {
                let _ = std::fs::remove_file(&target);
            }
        }
    }

    fn write_journal(&self, journal: &CommitJournal) -> Result<()> {
        let path = self.journal_path();
        let tmp = tmp_path(&path);
        write_file(&tmp, &to_json(journal)?)?;
        std::fs::rename(&tmp, &path).map_err(|source| {
            discard(std::slice::from_ref(&path));
            StatsError::FileWrite { path, source }
        })
    }

    fn remove_journal(&self) {
        let _ = std::fs::remove_file(self.journal_path());
    }

    fn journal_path(&self) -> PathBuf {
        self.dir.join(JOURNAL_FILE)
    }

    fn detail_path(&self, id: &str) -> PathBuf {
        self.dir.join(DETAILS_DIR).join(format!("{id}.json"))
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StatsError::FileRead {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    Ok(Some(serde_json::from_str(&content)?))
}

fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec_pretty(value)?)
}

fn write_file(path: &Path, bytes: &[u8]) -> Result<()> {
    let io = |source| StatsError::FileWrite {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    std::fs::write(path, bytes).map_err(io)
}

fn with_suffix(target: &Path, suffix: &str) -> PathBuf {
    let mut name = target.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    target.with_file_name(name)
}

fn tmp_path(target: &Path) -> PathBuf {
    with_suffix(target, ".tmp")
}

fn bak_path(target: &Path) -> PathBuf {
    with_suffix(target, ".bak")
}

/// Remove the staged `*.tmp` files of `targets`.
fn discard(targets: &[PathBuf]) {
    for target in targets {
        let _ = std::fs::remove_file(tmp_path(target));
    }
}

/// Move the current `target` aside as `*.bak`, then rename the staged file in.
fn swap_in(target: &Path) -> Result<()> {
    let io = |source| StatsError::FileWrite {
        path: target.to_path_buf(),
        source,
    };
    if target.is_file() {
        std::fs::rename(target, bak_path(target)).map_err(io)?;
    }
    std::fs::rename(tmp_path(target), target).map_err(io)
}

/// Entity ids are opaque; only plain names are written as files.
fn is_safe_file_stem(id: &str) -> bool {
    !id.is_empty()
        && id != "."
        && id != ".."
        && !id.contains(|c: char| matches!(c, '/' | '\\' | '\0'))
}
