//! Core domain types for the mention harvester.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

use crate::error::{HarvestError, Result};

// ---------------------------------------------------------------------------
// Entity
// ---------------------------------------------------------------------------

/// A named subject on the roster. Sourced from the store, never mutated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entity {
    /// Stable integer identifier (`celebrity_id` in storage).
    pub id: i64,
    /// Display name used as the search query (usually Traditional Chinese).
    pub name: String,
}

impl Entity {
    pub fn new(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Credential
// ---------------------------------------------------------------------------

/// One search-provider credential pair (API key + search engine id).
#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub api_key: String,
    pub engine_id: String,
}

impl Credential {
    pub fn new(api_key: impl Into<String>, engine_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            engine_id: engine_id.into(),
        }
    }
}

// Keys end up in log fields via `?credential`; never print the secret.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("api_key", &"<redacted>")
            .field("engine_id", &self.engine_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// JobId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper for scrape job identifiers (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub Uuid);

impl JobId {
    /// Generate a new time-sortable job identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Job status
// ---------------------------------------------------------------------------

/// Lifecycle of a scrape job: `pending -> running -> {completed | failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states stamp `end_time` and accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether moving from `self` to `next` respects the monotonic lifecycle.
    ///
    /// Staying in the same non-terminal state is allowed so that progress
    /// counters can be updated alongside an unchanged status.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Pending)
                | (Pending, Running)
                | (Pending, Failed)
                | (Running, Running)
                | (Running, Completed)
                | (Running, Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = HarvestError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(HarvestError::validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// ScrapeJob
// ---------------------------------------------------------------------------

/// A persisted run record (`scraping_jobs` row).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeJob {
    pub job_id: JobId,
    /// `None` for whole-roster (or resumed) runs.
    pub entity_id: Option<i64>,
    pub status: JobStatus,
    pub mentions_found: u64,
    pub urls_processed: u64,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

/// Partial update applied to a job; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub mentions_found: Option<u64>,
    pub urls_processed: Option<u64>,
    pub error_message: Option<String>,
}

impl JobUpdate {
    pub fn status(status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    /// Terminal failure with the message recorded on the job row.
    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn progress(mentions_found: u64, urls_processed: u64) -> Self {
        Self {
            mentions_found: Some(mentions_found),
            urls_processed: Some(urls_processed),
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.mentions_found.is_none()
            && self.urls_processed.is_none()
            && self.error_message.is_none()
    }
}

// ---------------------------------------------------------------------------
// Mention
// ---------------------------------------------------------------------------

/// One harvested page for one entity, keyed by `(entity_id, original_url)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mention {
    pub entity_id: i64,
    pub original_url: String,
    pub cleaned_text: String,
    pub domain: String,
    /// Length of `cleaned_text` in characters.
    pub content_length: usize,
    /// Extraction confidence in `[0, 1]`.
    pub extraction_confidence: f64,
    pub processing_time_ms: u64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Fetch failures
// ---------------------------------------------------------------------------

/// Why a URL produced no mention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    NetworkError,
    Timeout,
    HttpError,
    EmptyContent,
    InvalidContentType,
}

impl FailureReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NetworkError => "network-error",
            Self::Timeout => "timeout",
            Self::HttpError => "http-error",
            Self::EmptyContent => "empty-content",
            Self::InvalidContentType => "invalid-content-type",
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&HarvestError> for FailureReason {
    fn from(err: &HarvestError) -> Self {
        match err {
            HarvestError::Timeout(_) => Self::Timeout,
            HarvestError::Http { .. } => Self::HttpError,
            HarvestError::ContentType(_) => Self::InvalidContentType,
            _ => Self::NetworkError,
        }
    }
}

/// A URL that could not be harvested. Logged for manual follow-up, never stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedUrl {
    pub url: String,
    pub reason: FailureReason,
    /// Human-readable error detail.
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Host of `url` without a leading `www.`; empty when the URL does not parse.
pub fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .map(|host| match host.strip_prefix("www.") {
            Some(rest) => rest.to_string(),
            None => host,
        })
        .unwrap_or_default()
}
