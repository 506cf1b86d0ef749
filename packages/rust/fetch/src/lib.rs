//! Concurrent page fetching and content cleaning.
//!
//! This crate provides:
//! - [`PageFetcher`] — the raw retrieval seam, with an HTTP implementation
//! - [`FetchEngine`] — bounded-parallel fetch with retries and extraction

mod engine;
mod fetcher;

pub use engine::{FetchEngine, FetchFailure, FetchOutcome, FetchReport, FetchedContent};
pub use fetcher::{HttpPageFetcher, PageFetcher, RawPage};
