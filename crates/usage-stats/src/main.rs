mod bootstrap;

use std::time::Duration;

use anyhow::{Context, Result};
use stats_core::formatting::format_count;
use stats_core::month::Month;
use stats_core::settings::Settings;
use stats_core::time_utils::current_month;
use stats_data::store::StateStore;
use stats_runtime::fetcher::ThrottledFetcher;
use stats_runtime::source::{CatalogResolver, DumpMetricSource};
use stats_runtime::updater::{UpdateConfig, UpdateReport, Updater};

/// Exit status after an interrupt, as a shell reports SIGINT.
const INTERRUPTED_EXIT_CODE: i32 = 130;

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::load_with_last_used();
    let state_dir = settings.state_dir();

    bootstrap::ensure_directories(&state_dir, settings.log_file.as_deref())?;
    bootstrap::setup_logging(&settings.log_level, settings.log_file.as_deref())?;

    tracing::info!("usage-stats v{} starting", env!("CARGO_PKG_VERSION"));

    let anchor = settings
        .anchor_month
        .unwrap_or_else(|| current_month(&settings.timezone));
    tracing::info!(
        "Anchor: {}, timezone: {}, state: {}",
        anchor,
        settings.timezone,
        state_dir.display()
    );

    // The cycle is blocking I/O and CPU work; keep it off the async runtime so
    // Ctrl+C stays responsive. An interrupt during the final write leaves a
    // commit journal, and the next run rolls that write back before loading.
    let task = tokio::task::spawn_blocking(move || run_update(&settings, anchor));

    tokio::select! {
        joined = task => {
            let report = joined.context("update task panicked")??;
            log_summary(&report);
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Ctrl+C received; aborting update");
            std::process::exit(INTERRUPTED_EXIT_CODE);
        }
    }

    Ok(())
}

fn run_update(settings: &Settings, anchor: Month) -> Result<UpdateReport> {
    let config = UpdateConfig {
        top_n: settings.top_n as usize,
        limit_entities: settings.limit_entities,
        dry_run: settings.dry_run,
        ..UpdateConfig::new(anchor, settings.start_month)
    };
    let fetcher = ThrottledFetcher::new(
        Duration::from_millis(settings.request_delay_ms),
        settings.max_attempts,
    );
    let mut updater = Updater::new(StateStore::new(settings.state_dir()), fetcher, config);

    let pending = updater.prepare()?;
    if pending.is_up_to_date() {
        let report = updater.complete(
            pending,
            &mut DumpMetricSource::default(),
            &mut CatalogResolver::default(),
        )?;
        return Ok(report);
    }

    if settings.visits_dump.is_none() && settings.downloads_dump.is_none() {
        anyhow::bail!(
            "{} month(s) to fetch but neither --visits-dump nor --downloads-dump was given",
            pending.months().len()
        );
    }

    let mut source = DumpMetricSource::open(
        settings.visits_dump.as_deref(),
        settings.downloads_dump.as_deref(),
        pending.months(),
        settings.page_size as usize,
    )?;
    let mut resolver = match settings.catalog.as_deref() {
        Some(path) => CatalogResolver::open(path)?,
        None => {
            tracing::warn!("no --catalog given; new entities will have no metadata");
            CatalogResolver::default()
        }
    };

    let report = updater.complete(pending, &mut source, &mut resolver)?;
    Ok(report)
}

fn log_summary(report: &UpdateReport) {
    let anchor = report
        .anchor
        .map(|m| m.to_string())
        .unwrap_or_default();

    if report.is_up_to_date() {
        tracing::info!("Already up to date through {}", anchor);
        return;
    }

    tracing::info!(
        "Merged {} month(s) through {}: {} records, {} new entities",
        report.months.len(),
        anchor,
        format_count(report.records as u64),
        format_count(report.new_entities as u64)
    );
    tracing::info!(
        "Totals: {} visits, {} downloads across {} entities",
        format_count(report.totals.visits),
        format_count(report.totals.downloads),
        format_count(report.entities as u64)
    );
    if report.not_found > 0 {
        tracing::info!(
            "{} entities without metadata left out of rankings",
            format_count(report.not_found as u64)
        );
    }
    if !report.written {
        tracing::info!("Dry run: no file written");
    }
}
