//! Concurrent page retrieval for one entity's candidate URLs.
//!
//! Every URL is fetched under a shared concurrency ceiling with its own
//! timeout and retry budget. A URL that ultimately fails becomes a
//! [`FailedUrl`]; it never aborts its siblings.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, instrument, warn};
use url::Url;

use harvester_extract::{ExtractOptions, ExtractionStatus, extract};
use harvester_shared::{
    FailedUrl, FailureReason, FetchConfig, HarvestError, Result, RetryPolicy, domain_of,
};

use crate::fetcher::{HttpPageFetcher, PageFetcher};

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Cleaned content for one URL.
#[derive(Debug, Clone)]
pub struct FetchedContent {
    pub url: String,
    pub cleaned_text: String,
    /// Characters in `cleaned_text`.
    pub content_length: usize,
    pub confidence: f64,
    pub domain: String,
    pub elapsed_ms: u64,
    /// `Success` or `Partial`; failed extractions never become content.
    pub status: ExtractionStatus,
}

#[derive(Debug, Clone)]
pub struct FetchFailure {
    pub url: String,
    pub reason: FailureReason,
    pub detail: String,
    pub domain: String,
    pub elapsed_ms: u64,
}

impl From<FetchFailure> for FailedUrl {
    fn from(failure: FetchFailure) -> Self {
        FailedUrl {
            url: failure.url,
            reason: failure.reason,
            detail: failure.detail,
        }
    }
}

#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(FetchedContent),
    Failure(FetchFailure),
}

impl FetchOutcome {
    fn failure(url: String, reason: FailureReason, detail: impl Into<String>, started: Instant) -> Self {
        Self::Failure(FetchFailure {
            domain: domain_of(&url),
            url,
            reason,
            detail: detail.into(),
            elapsed_ms: elapsed_ms(started),
        })
    }
}

/// Result of [`FetchEngine::fetch_all`]. Every input URL appears exactly once
/// across `successes` and `failures`; order follows completion, not input.
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub successes: Vec<FetchedContent>,
    pub failures: Vec<FailedUrl>,
}

impl FetchReport {
    /// Number of URLs that were attempted.
    pub fn attempted(&self) -> usize {
        self.successes.len() + self.failures.len()
    }

    fn record(&mut self, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Success(content) => self.successes.push(content),
            FetchOutcome::Failure(failure) => self.failures.push(failure.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// FetchEngine
// ---------------------------------------------------------------------------

/// Bounded-parallel fetch, validate, and extract.
pub struct FetchEngine {
    fetcher: Arc<dyn PageFetcher>,
    retry: RetryPolicy,
    extract: ExtractOptions,
    timeout: Duration,
    concurrency: usize,
    request_delay: Duration,
}

impl FetchEngine {
    pub fn new(
        fetcher: Arc<dyn PageFetcher>,
        retry: RetryPolicy,
        extract: ExtractOptions,
        config: &FetchConfig,
    ) -> Self {
        Self {
            fetcher,
            retry,
            extract,
            timeout: Duration::from_millis(config.timeout_ms),
            concurrency: config.concurrency.max(1),
            request_delay: Duration::from_millis(config.request_delay_ms),
        }
    }

    /// Engine over a real HTTP client.
    pub fn http(config: &FetchConfig, retry: RetryPolicy, extract: ExtractOptions) -> Result<Self> {
        let fetcher = HttpPageFetcher::new(&config.user_agent)?;
        Ok(Self::new(Arc::new(fetcher), retry, extract, config))
    }

    /// Fetch and clean every URL with at most `concurrency` requests in flight.
    #[instrument(skip_all, fields(urls = urls.len(), concurrency = self.concurrency))]
    pub async fn fetch_all(&self, urls: Vec<String>) -> FetchReport {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for (index, url) in urls.iter().cloned().enumerate() {
            let semaphore = semaphore.clone();
            let fetcher = self.fetcher.clone();
            let retry = self.retry.clone();
            let opts = self.extract;
            let timeout = self.timeout;
            let delay = self.request_delay;

            tasks.spawn(async move {
                let begun = Instant::now();
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return (
                        index,
                        FetchOutcome::failure(url, FailureReason::NetworkError, "fetch slots closed", begun),
                    );
                };

                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }

                (index, fetch_one(fetcher.as_ref(), url, &retry, &opts, timeout).await)
            });
        }

        let mut reported = vec![false; urls.len()];
        let mut report = FetchReport::default();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, outcome)) => {
                    reported[index] = true;
                    report.record(outcome);
                }
                Err(e) => warn!(error = %e, "fetch task did not complete"),
            }
        }

        // A panicked task still owes its URL a place in the report.
        for (url, seen) in urls.into_iter().zip(reported) {
            if !seen {
                report.failures.push(FailedUrl {
                    url,
                    reason: FailureReason::NetworkError,
                    detail: "fetch task aborted".into(),
                });
            }
        }

        info!(
            succeeded = report.successes.len(),
            failed = report.failures.len(),
            duration_ms = started.elapsed().as_millis() as u64,
            "fetch batch finished"
        );

        report
    }
}

/// Fetch one URL with retries, validate it, and run extraction.
async fn fetch_one(
    fetcher: &dyn PageFetcher,
    url: String,
    retry: &RetryPolicy,
    opts: &ExtractOptions,
    timeout: Duration,
) -> FetchOutcome {
    let started = Instant::now();

    let parsed = match Url::parse(&url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => parsed,
        Ok(parsed) => {
            let detail = format!("unsupported scheme '{}'", parsed.scheme());
            return FetchOutcome::failure(url, FailureReason::NetworkError, detail, started);
        }
        Err(e) => {
            return FetchOutcome::failure(url, FailureReason::NetworkError, format!("invalid URL: {e}"), started);
        }
    };

    let body = retry
        .run(
            "fetch",
            |attempt| {
                let parsed = &parsed;
                async move {
                    debug!(url = %parsed, attempt, "fetching page");
                    let page = fetcher.fetch(parsed, timeout).await?;
                    if !page.is_success() {
                        return Err(HarvestError::Http {
                            status: page.status_code,
                            message: parsed.to_string(),
                        });
                    }
                    if !page.is_textual() {
                        return Err(HarvestError::ContentType(format!(
                            "{parsed}: unsupported content type '{}'",
                            page.content_type
                        )));
                    }
                    Ok(page.body)
                }
            },
            HarvestError::disposition,
        )
        .await;

    let body = match body {
        Ok(body) => body,
        Err(e) => {
            let reason = FailureReason::from(&e);
            debug!(%url, %reason, error = %e, "fetch failed");
            return FetchOutcome::failure(url, reason, e.to_string(), started);
        }
    };

    let extraction = extract(&body, opts);
    if extraction.status == ExtractionStatus::Failed {
        return FetchOutcome::failure(url, FailureReason::EmptyContent, "no readable text", started);
    }

    FetchOutcome::Success(FetchedContent {
        domain: domain_of(&url),
        url,
        cleaned_text: extraction.cleaned_text,
        content_length: extraction.content_length,
        confidence: extraction.confidence,
        elapsed_ms: elapsed_ms(started),
        status: extraction.status,
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
