use clap::{CommandFactory, Parser};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::month::Month;

// ── Settings (CLI) ─────────────────────────────────────────────────────────────

/// Incremental monthly usage statistics and leaderboards
#[derive(Parser, Debug, Clone)]
#[command(
    name = "usage-stats",
    about = "Incremental monthly usage statistics and leaderboards",
    version
)]
pub struct Settings {
    /// Directory holding the persisted JSON state
    #[arg(long)]
    pub state_dir: Option<PathBuf>,

    /// TSV dump of per-entity visits
    #[arg(long)]
    pub visits_dump: Option<PathBuf>,

    /// TSV dump of per-resource downloads
    #[arg(long)]
    pub downloads_dump: Option<PathBuf>,

    /// JSON metadata catalog
    #[arg(long)]
    pub catalog: Option<PathBuf>,

    /// Timezone used to derive the current month (auto-detected if not specified)
    #[arg(long, default_value = "auto")]
    pub timezone: String,

    /// Override the anchor month (YYYY-MM)
    #[arg(long)]
    pub anchor_month: Option<Month>,

    /// First month of the global series when no state exists yet
    #[arg(long, default_value = "2022-07")]
    pub start_month: Month,

    /// Length of each ranking list
    #[arg(long, default_value = "100", value_parser = clap::value_parser!(u32).range(1..=1000))]
    pub top_n: u32,

    /// Records per page served by the dump source
    #[arg(long, default_value = "10000", value_parser = clap::value_parser!(u32).range(1..))]
    pub page_size: u32,

    /// Delay between collaborator requests, in milliseconds
    #[arg(long, default_value = "100")]
    pub request_delay_ms: u64,

    /// Attempts per collaborator request before giving up
    #[arg(long, default_value = "3", value_parser = clap::value_parser!(u32).range(1..=10))]
    pub max_attempts: u32,

    /// Test mode: keep only the N entities with the most visits in the batch
    #[arg(long)]
    pub limit_entities: Option<usize>,

    /// Compute everything but write nothing
    #[arg(long)]
    pub dry_run: bool,

    /// Logging level
    #[arg(long, default_value = "INFO", value_parser = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL"])]
    pub log_level: String,

    /// Log file path
    #[arg(long)]
    pub log_file: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Clear saved configuration
    #[arg(long)]
    pub clear: bool,
}

// ── LastUsedParams ─────────────────────────────────────────────────────────────

/// Persisted last-used parameters saved to `~/.usage-stats/last_used.json`.
#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct LastUsedParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visits_dump: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloads_dump: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub catalog: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
}

/// Root of the per-user application directory (`~/.usage-stats`).
pub fn app_dir() -> PathBuf {
    app_dir_in(&dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
}

pub fn app_dir_in(base_dir: &Path) -> PathBuf {
    base_dir.join(".usage-stats")
}

impl LastUsedParams {
    /// Default path to the persisted config file.
    pub fn config_path() -> PathBuf {
        app_dir().join("last_used.json")
    }

    /// Config path rooted at `base_dir` (used for testing).
    pub fn config_path_in(base_dir: &Path) -> PathBuf {
        app_dir_in(base_dir).join("last_used.json")
    }

    /// Load persisted params from an explicit path.
    /// Returns `Default` when the file is absent or cannot be parsed.
    pub fn load_from(path: &Path) -> Self {
        let Ok(content) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        serde_json::from_str(&content).unwrap_or_default()
    }

    /// Atomically write params to an explicit path.
    pub fn save_to(&self, path: &Path) -> Result<(), std::io::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;

        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &json)?;
        std::fs::rename(&tmp, path)?;

        Ok(())
    }

    /// Delete the config file at an explicit path if it exists.
    pub fn clear_at(path: &Path) -> Result<(), std::io::Error> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

// ── Settings impl ──────────────────────────────────────────────────────────────

impl Settings {
    /// Parse CLI arguments, merge with last-used params where no explicit CLI
    /// value was provided, resolve `"auto"` values, and persist the result.
    pub fn load_with_last_used() -> Self {
        Self::load_with_last_used_impl(
            std::env::args_os().collect(),
            &LastUsedParams::config_path(),
        )
    }

    /// Full implementation; accepts args and an explicit config path so that
    /// tests can redirect to a temporary directory.
    pub fn load_with_last_used_impl(
        args: Vec<std::ffi::OsString>,
        config_path: &Path,
    ) -> Self {
        let matches = Settings::command().get_matches_from(args.clone());
        let mut settings = Settings::parse_from(args);

        if settings.clear {
            let _ = LastUsedParams::clear_at(config_path);
            return Self::resolve_auto_values(settings);
        }

        let last = LastUsedParams::load_from(config_path);

        // CLI always wins over persisted values.
        if !is_arg_explicitly_set(&matches, "state_dir") && settings.state_dir.is_none() {
            settings.state_dir = last.state_dir;
        }
        if !is_arg_explicitly_set(&matches, "visits_dump") && settings.visits_dump.is_none() {
            settings.visits_dump = last.visits_dump;
        }
        if !is_arg_explicitly_set(&matches, "downloads_dump")
            && settings.downloads_dump.is_none()
        {
            settings.downloads_dump = last.downloads_dump;
        }
        if !is_arg_explicitly_set(&matches, "catalog") && settings.catalog.is_none() {
            settings.catalog = last.catalog;
        }
        if !is_arg_explicitly_set(&matches, "timezone") {
            if let Some(v) = last.timezone {
                settings.timezone = v;
            }
        }

        settings = Self::resolve_auto_values(settings);

        let params = LastUsedParams::from(&settings);
        let _ = params.save_to(config_path);

        settings
    }

    /// Resolve `"auto"` sentinel values, default paths and the `--debug` flag.
    fn resolve_auto_values(mut settings: Settings) -> Settings {
        if settings.timezone == "auto" {
            settings.timezone = crate::time_utils::get_system_timezone();
        }

        if settings.state_dir.is_none() {
            settings.state_dir = Some(app_dir().join("data"));
        }

        if settings.debug {
            settings.log_level = "DEBUG".to_string();
        }

        settings
    }

    /// Resolved state directory.
    pub fn state_dir(&self) -> PathBuf {
        self.state_dir
            .clone()
            .unwrap_or_else(|| app_dir().join("data"))
    }
}

// ── Conversion ─────────────────────────────────────────────────────────────────

impl From<&Settings> for LastUsedParams {
    fn from(s: &Settings) -> Self {
        LastUsedParams {
            state_dir: s.state_dir.clone(),
            visits_dump: s.visits_dump.clone(),
            downloads_dump: s.downloads_dump.clone(),
            catalog: s.catalog.clone(),
            timezone: Some(s.timezone.clone()),
        }
    }
}

/// Returns `true` when `name` was supplied explicitly on the command line.
fn is_arg_explicitly_set(matches: &clap::ArgMatches, name: &str) -> bool {
    matches.value_source(name) == Some(clap::parser::ValueSource::CommandLine)
}

// ── Tests ──────────────────────────────────────────────────────────────────────
