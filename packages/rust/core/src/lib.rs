//! Harvest orchestration for the mention harvester.
//!
//! This crate ties together search, fetch, extraction, and storage into the
//! roster-wide run driven by the CLI.

pub mod failure_log;
pub mod pipeline;

pub use pipeline::{
    Harvester, PreparedRun, ProgressReporter, RunScope, RunSummary, SilentProgress,
    build_mentions, split_into_batches,
};
