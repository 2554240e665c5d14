//! Aggregation layer for the usage-statistics pipeline.
//!
//! Reads the upstream TSV dumps, folds new months into the running series,
//! maintains the entity directory, computes the leaderboards, and persists
//! every output as JSON.

pub mod analysis;
pub mod directory;
pub mod merge;
pub mod ranking;
pub mod reader;
pub mod store;

pub use stats_core as core;
