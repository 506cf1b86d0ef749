//! Shared types, error model, retry policy, and configuration for the harvester.
//!
//! This crate is the foundation depended on by all other harvester crates.
//! It provides:
//! - [`HarvestError`] — the unified error type and its retry [`Disposition`]
//! - Domain types ([`Entity`], [`Mention`], [`ScrapeJob`], [`FailedUrl`], [`JobId`])
//! - [`RetryPolicy`] — backoff wrapper shared by search and fetch
//! - Configuration ([`AppConfig`], config loading, credential resolution)

pub mod config;
pub mod error;
pub mod retry;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, BackoffMode, CredentialEnv, ExtractConfig, FetchConfig, LoggingConfig,
    PipelineConfig, RetryConfig, SearchConfig, StorageConfig, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, load_credentials,
};
pub use error::{Disposition, HarvestError, Result};
pub use retry::RetryPolicy;
pub use types::{
    Credential, Entity, FailedUrl, FailureReason, JobId, JobStatus, JobUpdate, Mention,
    ScrapeJob, domain_of,
};
