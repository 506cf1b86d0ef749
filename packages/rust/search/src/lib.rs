//! Entity name to ranked candidate URLs.
//!
//! [`SearchClient`] pages through a [`SearchProvider`] until the per-entity
//! result cap is reached, wrapped in the shared [`RetryPolicy`]. Each logical
//! query claims its credential pair from a shared [`KeyRotator`] before the
//! first request, so concurrent queries start on different pairs and the
//! rotator moves exactly once per query whatever the outcome. Retries reuse
//! the claimed pair.

mod provider;
mod rotator;

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use harvester_shared::{Credential, HarvestError, Result, RetryPolicy, SearchConfig};

pub use provider::{GoogleCustomSearch, SearchProvider};
pub use rotator::KeyRotator;

/// Paginated, retrying search over a rotating credential pool.
pub struct SearchClient {
    provider: Arc<dyn SearchProvider>,
    rotator: Arc<KeyRotator>,
    retry: RetryPolicy,
    max_results: usize,
    page_size: usize,
}

impl SearchClient {
    pub fn new(
        provider: Arc<dyn SearchProvider>,
        rotator: Arc<KeyRotator>,
        retry: RetryPolicy,
        config: &SearchConfig,
    ) -> Self {
        Self {
            provider,
            rotator,
            retry,
            max_results: config.results_per_entity,
            page_size: config.page_size.max(1),
        }
    }

    /// Build a client for the configured Google Custom Search endpoint.
    pub fn google(
        config: &SearchConfig,
        credentials: Vec<Credential>,
        retry: RetryPolicy,
        user_agent: &str,
    ) -> Result<Self> {
        let provider = GoogleCustomSearch::new(
            config.endpoint.clone(),
            Duration::from_millis(config.timeout_ms),
            user_agent,
        )?;
        let rotator = KeyRotator::new(credentials)?;
        Ok(Self::new(Arc::new(provider), Arc::new(rotator), retry, config))
    }

    pub fn rotator(&self) -> &KeyRotator {
        &self.rotator
    }

    /// Candidate URLs for `query` in provider rank order, at most
    /// `results_per_entity` of them. Not deduplicated.
    #[instrument(skip_all, fields(query = %query))]
    pub async fn search(&self, query: &str) -> Result<Vec<String>> {
        let (key_slot, credential) = self.rotator.claim();

        let result = self
            .retry
            .run(
                "search",
                |_attempt| self.collect_pages(query, credential),
                HarvestError::disposition,
            )
            .await;

        match &result {
            Ok(urls) => info!(key_slot, results = urls.len(), "search completed"),
            Err(e) => warn!(key_slot, error = %e, "search failed"),
        }
        result
    }

    async fn collect_pages(&self, query: &str, credential: &Credential) -> Result<Vec<String>> {
        let mut urls = Vec::with_capacity(self.max_results);
        let mut page_start = 1;

        while urls.len() < self.max_results {
            let wanted = self.page_size.min(self.max_results - urls.len());
            let page = self
                .provider
                .query(query, credential, page_start, wanted)
                .await?;

            let received = page.len();
            debug!(page_start, received, "search page received");
            urls.extend(page);

            if received < wanted {
                break;
            }
            page_start += received;
        }

        urls.truncate(self.max_results);
        Ok(urls)
    }
}
