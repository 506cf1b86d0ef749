//! Raw page retrieval seam.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use reqwest::header::CONTENT_TYPE;
use url::Url;

use harvester_shared::{HarvestError, Result};

/// Maximum number of redirects to follow for a page fetch.
const MAX_REDIRECTS: usize = 5;

/// Bodies larger than this are rejected without being read (10 MB).
const MAX_RESPONSE_SIZE: u64 = 10 * 1024 * 1024;

/// What came back for one URL, whatever the status code.
#[derive(Debug, Clone)]
pub struct RawPage {
    pub status_code: u16,
    /// Value of the `Content-Type` header, empty when absent.
    pub content_type: String,
    pub body: String,
}

impl RawPage {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Textual or HTML payloads are the only ones worth extracting.
    pub fn is_textual(&self) -> bool {
        let content_type = self.content_type.to_ascii_lowercase();
        content_type.contains("text") || content_type.contains("html")
    }
}

/// Fetches one URL. Only transport problems are errors: a non-2xx response is
/// returned as a [`RawPage`] for the caller to judge.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<RawPage>;
}

/// [`PageFetcher`] backed by a shared `reqwest` client.
pub struct HttpPageFetcher {
    client: Client,
}

impl HttpPageFetcher {
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()
            .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl PageFetcher for HttpPageFetcher {
    async fn fetch(&self, url: &Url, timeout: Duration) -> Result<RawPage> {
        let response = self
            .client
            .get(url.as_str())
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_request_error(url, e))?;

        let status_code = response.status().as_u16();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        if let Some(len) = response.content_length() {
            if len > MAX_RESPONSE_SIZE {
                return Err(HarvestError::validation(format!(
                    "{url}: response too large ({len} bytes, max {MAX_RESPONSE_SIZE})"
                )));
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| map_request_error(url, e))?;

        Ok(RawPage {
            status_code,
            content_type,
            body,
        })
    }
}

fn map_request_error(url: &Url, err: reqwest::Error) -> HarvestError {
    if err.is_timeout() {
        HarvestError::Timeout(format!("{url}: {err}"))
    } else {
        HarvestError::Network(format!("{url}: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn textual_content_types() {
        let page = |ct: &str| RawPage {
            status_code: 200,
            content_type: ct.into(),
            body: String::new(),
        };
        assert!(page("text/html; charset=utf-8").is_textual());
        assert!(page("application/xhtml+xml").is_textual());
        assert!(page("TEXT/PLAIN").is_textual());
        assert!(!page("application/pdf").is_textual());
        assert!(!page("image/png").is_textual());
        assert!(!page("").is_textual());
    }

    #[tokio::test]
    async fn non_success_status_is_returned_not_raised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not here"))
            .mount(&server)
            .await;

        let fetcher = HttpPageFetcher::new("harvester-test").unwrap();
        let url = Url::parse(&format!("{}/gone", server.uri())).unwrap();
        let page = fetcher.fetch(&url, Duration::from_secs(5)).await.unwrap();

        assert_eq!(page.status_code, 404);
        assert!(!page.is_success());
        assert_eq!(page.body, "not here");
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string("late")
                    .set_delay(Duration::from_millis(500)),
            )
            .mount(&server)
            .await;

        let fetcher = HttpPageFetcher::new("harvester-test").unwrap();
        let url = Url::parse(&server.uri()).unwrap();
        let err = fetcher
            .fetch(&url, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Timeout(_)), "got {err:?}");
    }
}
