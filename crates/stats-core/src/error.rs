use std::path::PathBuf;
use thiserror::Error;

use crate::month::Month;

/// All errors produced by the usage-statistics crates.
#[derive(Error, Debug)]
pub enum StatsError {
    /// A state or dump file could not be opened or read from disk.
    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A state file could not be written or swapped into place.
    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A JSON document could not be parsed or serialized.
    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    /// A month string was not in fixed-width `YYYY-MM` form.
    #[error("Invalid month: {0}")]
    InvalidMonth(String),

    /// The month is already recorded in the processed-months ledger.
    /// Merging it again would double its values.
    #[error("Month {0} has already been merged")]
    MonthAlreadyMerged(Month),

    /// A record carries a month that the batch did not declare.
    #[error("Record for entity {entity_id} has month {month} outside the merge batch")]
    RecordOutsideBatch { entity_id: String, month: Month },

    /// A collaborator (metric source or metadata resolver) kept failing
    /// after all retry attempts.
    #[error("Source error: {0}")]
    Source(String),

    /// A configuration value is missing or invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Pass-through for any raw I/O error that does not carry a path.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// Catch-all for errors from third-party crates via `anyhow`.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Convenience alias used throughout the stats crates.
pub type Result<T> = std::result::Result<T, StatsError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_file_read() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
        let err = StatsError::FileRead {
            path: PathBuf::from("/state/global-stats.json"),
            source: io_err,
        };
        let msg = err.to_string();
        assert!(msg.contains("Failed to read file"));
        assert!(msg.contains("/state/global-stats.json"));
        assert!(msg.contains("no such file"));
    }

    #[test]
    fn test_error_display_invalid_month() {
        let err = StatsError::InvalidMonth("2024-13".to_string());
        assert_eq!(err.to_string(), "Invalid month: 2024-13");
    }

    #[test]
    fn test_error_display_month_already_merged() {
        let month: Month = "2024-03".parse().unwrap();
        let err = StatsError::MonthAlreadyMerged(month);
        assert_eq!(err.to_string(), "Month 2024-03 has already been merged");
    }

    #[test]
    fn test_error_display_record_outside_batch() {
        let err = StatsError::RecordOutsideBatch {
            entity_id: "ds-1".to_string(),
            month: "2023-12".parse().unwrap(),
        };
        assert_eq!(
            err.to_string(),
            "Record for entity ds-1 has month 2023-12 outside the merge batch"
        );
    }

    #[test]
    fn test_error_display_source() {
        let err = StatsError::Source("timed out".to_string());
        assert_eq!(err.to_string(), "Source error: timed out");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
        let err: StatsError = io_err.into();
        assert!(err.to_string().contains("denied"));
    }

    #[test]
    fn test_error_from_serde_json() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid}").unwrap_err();
        let err: StatsError = json_err.into();
        assert!(err.to_string().contains("Failed to parse JSON"));
    }
}
