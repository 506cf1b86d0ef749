//! Application configuration for the harvester.
//!
//! User config lives at `~/.harvester/harvester.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{HarvestError, Result};
use crate::types::Credential;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "harvester.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".harvester";

/// Number of credential slots in the default config.
const DEFAULT_CREDENTIAL_SLOTS: usize = 5;

// ---------------------------------------------------------------------------
// Config structs (matching harvester.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub search: SearchConfig,

    #[serde(default)]
    pub fetch: FetchConfig,

    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub extract: ExtractConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// `[search]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Search provider endpoint.
    #[serde(default = "default_search_endpoint")]
    pub endpoint: String,

    /// Maximum candidate URLs kept per entity.
    #[serde(default = "default_results_per_entity")]
    pub results_per_entity: usize,

    /// Results requested per provider page.
    #[serde(default = "default_page_size")]
    pub page_size: usize,

    /// Timeout for a single search page request.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Env var names holding the credential pairs (never store the keys themselves).
    #[serde(default = "default_credentials")]
    pub credentials: Vec<CredentialEnv>,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            endpoint: default_search_endpoint(),
            results_per_entity: default_results_per_entity(),
            page_size: default_page_size(),
            timeout_ms: default_timeout_ms(),
            credentials: default_credentials(),
        }
    }
}

/// `[[search.credentials]]` entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEnv {
    pub api_key_env: String,
    pub engine_id_env: String,
}

fn default_search_endpoint() -> String {
    "https://www.googleapis.com/customsearch/v1".into()
}
fn default_results_per_entity() -> usize {
    20
}
fn default_page_size() -> usize {
    10
}
fn default_timeout_ms() -> u64 {
    10_000
}
fn default_credentials() -> Vec<CredentialEnv> {
    (1..=DEFAULT_CREDENTIAL_SLOTS)
        .map(|i| CredentialEnv {
            api_key_env: format!("GOOGLE_API_KEY_{i}"),
            engine_id_env: format!("GOOGLE_SEARCH_ENGINE_ID_{i}"),
        })
        .collect()
}

/// `[fetch]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Timeout for a single page fetch.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// Maximum in-flight fetches per entity.
    #[serde(default = "default_fetch_concurrency")]
    pub concurrency: usize,

    /// Pause taken inside each fetch slot before the request goes out.
    #[serde(default)]
    pub request_delay_ms: u64,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            concurrency: default_fetch_concurrency(),
            request_delay_ms: 0,
            user_agent: default_user_agent(),
        }
    }
}

fn default_fetch_concurrency() -> usize {
    20
}
fn default_user_agent() -> String {
    concat!("MentionHarvester/", env!("CARGO_PKG_VERSION")).into()
}

/// Growth curve for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffMode {
    /// `base * 2^(attempt-1)`.
    #[default]
    Exponential,
    /// `base * base^(attempt-1)`, matching the legacy scraper's timing.
    /// With a base below 1 the delay shrinks on later attempts.
    Literal,
}

/// `[retry]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Attempts per call, including the first.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: f64,

    #[serde(default)]
    pub backoff: BackoffMode,

    /// Upper bound on a single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_secs: default_backoff_base(),
            backoff: BackoffMode::default(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_base() -> f64 {
    0.5
}
fn default_max_delay_ms() -> u64 {
    30_000
}

/// `[extract]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractConfig {
    /// Cleaned text shorter than this (in characters) is kept but flagged partial.
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,

    /// Confidence assigned to the lowest preservation band.
    #[serde(default = "default_min_confidence")]
    pub min_confidence: f64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            min_content_length: default_min_content_length(),
            min_confidence: default_min_confidence(),
        }
    }
}

fn default_min_content_length() -> usize {
    50
}
fn default_min_confidence() -> f64 {
    0.5
}

/// `[pipeline]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Entities processed concurrently within a batch.
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,

    /// Entities per batch (progress checkpoint granularity).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            batch_size: default_batch_size(),
        }
    }
}

fn default_worker_count() -> usize {
    20
}
fn default_batch_size() -> usize {
    20
}

/// `[storage]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// libSQL database file; a leading `~/` expands to the home directory.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.harvester/harvester.db".into()
}

/// `[logging]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Append-only log of URLs that could not be harvested.
    #[serde(default = "default_failed_urls_log")]
    pub failed_urls_log: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            failed_urls_log: default_failed_urls_log(),
        }
    }
}

fn default_failed_urls_log() -> String {
    "logs/failed_urls.log".into()
}

impl AppConfig {
    /// Reject values that would stall or break a run.
    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.pipeline.batch_size == 0 {
            errors.push("pipeline.batch_size must be at least 1");
        }
        if self.pipeline.worker_count == 0 {
            errors.push("pipeline.worker_count must be at least 1");
        }
        if self.fetch.concurrency == 0 {
            errors.push("fetch.concurrency must be at least 1");
        }
        if self.search.page_size == 0 {
            errors.push("search.page_size must be at least 1");
        }
        if self.search.results_per_entity == 0 {
            errors.push("search.results_per_entity must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            errors.push("retry.max_attempts must be at least 1");
        }
        if !(0.0..=0.5).contains(&self.extract.min_confidence) {
            errors.push("extract.min_confidence must be within [0, 0.5]");
        }
        if !(self.retry.backoff_base_secs.is_finite() && self.retry.backoff_base_secs >= 0.0) {
            errors.push("retry.backoff_base_secs must be a non-negative number");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(HarvestError::config(format!(
                "invalid configuration:\n{}",
                errors
                    .iter()
                    .map(|e| format!("  - {e}"))
                    .collect::<Vec<_>>()
                    .join("\n")
            )))
        }
    }
}

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// Resolve the configured credential pairs from the environment.
///
/// Pairs with a missing or empty variable are skipped; at least one complete
/// pair is required.
pub fn load_credentials(config: &SearchConfig) -> Result<Vec<Credential>> {
    let credentials: Vec<Credential> = config
        .credentials
        .iter()
        .filter_map(|slot| {
            let key = std::env::var(&slot.api_key_env).ok().filter(|v| !v.is_empty())?;
            let cx = std::env::var(&slot.engine_id_env).ok().filter(|v| !v.is_empty())?;
            Some(Credential::new(key, cx))
        })
        .collect();

    if credentials.is_empty() {
        let names = config
            .credentials
            .iter()
            .map(|c| format!("{}/{}", c.api_key_env, c.engine_id_env))
            .collect::<Vec<_>>()
            .join(", ");
        return Err(HarvestError::config(format!(
            "no search credentials found. Set at least one pair of: {names}"
        )));
    }

    tracing::debug!(count = credentials.len(), "resolved search credentials");
    Ok(credentials)
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.harvester/`).
pub fn config_dir() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| HarvestError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.harvester/harvester.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Expand a leading `~/` against the home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix("~/") {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| HarvestError::config("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| HarvestError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content)
        .map_err(|e| HarvestError::config(format!("failed to parse {}: {e}", path.display())))?;
    config.validate()?;
    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| HarvestError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| HarvestError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| HarvestError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}
