//! Runtime layer of the usage statistics pipeline.
//!
//! Wraps upstream adapters behind a throttled, retrying fetcher and drives
//! one complete update cycle over the persisted state.

pub mod fetcher;
pub mod source;
pub mod updater;

pub use stats_core as core;
pub use stats_data as data;
