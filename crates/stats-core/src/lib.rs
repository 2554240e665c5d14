//! Core types for the usage-statistics pipeline.
//!
//! Holds the month arithmetic every window computation is built on, the
//! shared data model and output records, the error type, runtime settings,
//! and small helpers for formatting and French title collation.

pub mod collation;
pub mod error;
pub mod formatting;
pub mod models;
pub mod month;
pub mod settings;
pub mod time_utils;
