//! Search provider seam and the Google Custom Search implementation.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;

use harvester_shared::{Credential, HarvestError, Result};

/// Maximum number of redirects to follow for a search request.
const MAX_REDIRECTS: usize = 3;

/// One page of a ranked web search.
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Return up to `page_size` result URLs starting at 1-indexed rank
    /// `page_start`, in rank order.
    async fn query(
        &self,
        text: &str,
        credential: &Credential,
        page_start: usize,
        page_size: usize,
    ) -> Result<Vec<String>>;
}

// ---------------------------------------------------------------------------
// Google Custom Search JSON API
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    items: Vec<SearchItem>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct SearchItem {
    #[serde(default)]
    link: Option<String>,
}

/// Client for the Custom Search JSON API (`q`, `key`, `cx`, `num`, `start`).
pub struct GoogleCustomSearch {
    client: Client,
    endpoint: String,
}

impl GoogleCustomSearch {
    pub fn new(endpoint: impl Into<String>, timeout: Duration, user_agent: &str) -> Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .timeout(timeout)
            .build()
            .map_err(|e| HarvestError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl SearchProvider for GoogleCustomSearch {
    async fn query(
        &self,
        text: &str,
        credential: &Credential,
        page_start: usize,
        page_size: usize,
    ) -> Result<Vec<String>> {
        debug!(page_start, page_size, "requesting search page");

        let num = page_size.to_string();
        let start = page_start.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", text),
                ("key", credential.api_key.as_str()),
                ("cx", credential.engine_id.as_str()),
                ("num", num.as_str()),
                ("start", start.as_str()),
            ])
            .send()
            .await
            .map_err(map_request_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_request_error)?;

        if status.is_server_error() {
            return Err(HarvestError::Http {
                status: status.as_u16(),
                message: "search provider unavailable".into(),
            });
        }

        let parsed: Option<SearchResponse> = serde_json::from_str(&body).ok();
        if let Some(error) = parsed.as_ref().and_then(|p| p.error.as_ref()) {
            return Err(HarvestError::Provider(provider_error_message(error)));
        }

        if !status.is_success() {
            return Err(HarvestError::Http {
                status: status.as_u16(),
                message: "search request rejected".into(),
            });
        }

        let parsed = parsed
            .ok_or_else(|| HarvestError::parse("search response is not valid JSON"))?;

        Ok(parsed.items.into_iter().filter_map(|item| item.link).collect())
    }
}

fn map_request_error(err: reqwest::Error) -> HarvestError {
    // Strip the URL; it carries the API key as a query parameter.
    let err = err.without_url();
    if err.is_timeout() {
        HarvestError::Timeout(format!("search request: {err}"))
    } else {
        HarvestError::Network(format!("search request: {err}"))
    }
}

fn provider_error_message(error: &serde_json::Value) -> String {
    match error {
        serde_json::Value::String(message) => message.clone(),
        serde_json::Value::Object(fields) => {
            let message = fields
                .get("message")
                .and_then(|m| m.as_str())
                .unwrap_or("unknown provider error");
            match fields.get("code").and_then(|c| c.as_u64()) {
                Some(code) => format!("{code}: {message}"),
                None => message.to_string(),
            }
        }
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn credential() -> Credential {
        Credential::new("test-key", "test-cx")
    }

    fn provider(server: &MockServer) -> GoogleCustomSearch {
        GoogleCustomSearch::new(
            format!("{}/customsearch/v1", server.uri()),
            Duration::from_secs(5),
            "harvester-test",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn returns_links_in_rank_order() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/customsearch/v1"))
            .and(query_param("q", "周杰倫"))
            .and(query_param("key", "test-key"))
            .and(query_param("cx", "test-cx"))
            .and(query_param("start", "11"))
            .and(query_param("num", "10"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    { "link": "https://a.example/1" },
                    { "title": "no link" },
                    { "link": "https://b.example/2" }
                ]
            })))
            .mount(&server)
            .await;

        let urls = provider(&server)
            .query("周杰倫", &credential(), 11, 10)
            .await
            .unwrap();
        assert_eq!(urls, vec!["https://a.example/1", "https://b.example/2"]);
    }

    #[tokio::test]
    async fn missing_items_means_no_results() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({ "searchInformation": { "totalResults": "0" } })),
            )
            .mount(&server)
            .await;

        let urls = provider(&server).query("x", &credential(), 1, 10).await.unwrap();
        assert!(urls.is_empty());
    }

    #[tokio::test]
    async fn error_payload_is_provider_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429).set_body_json(serde_json::json!({
                "error": { "code": 429, "message": "Quota exceeded for quota metric" }
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .query("x", &credential(), 1, 10)
            .await
            .unwrap_err();
        match err {
            HarvestError::Provider(message) => assert!(message.contains("Quota exceeded")),
            other => panic!("expected provider error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = provider(&server)
            .query("x", &credential(), 1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Http { status: 503, .. }));
        assert_eq!(err.disposition(), harvester_shared::Disposition::Retry);
    }

    #[tokio::test]
    async fn malformed_body_is_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .query("x", &credential(), 1, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, HarvestError::Parse { .. }));
        assert_eq!(err.disposition(), harvester_shared::Disposition::Fail);
    }

    #[test]
    fn provider_error_message_shapes() {
        let obj = serde_json::json!({ "code": 403, "message": "API key not valid" });
        assert_eq!(provider_error_message(&obj), "403: API key not valid");
        let s = serde_json::json!("bad request");
        assert_eq!(provider_error_message(&s), "bad request");
    }
}
