//! Rendered page fetcher backed by an HTTP browser-rendering service.
//!
//! The service loads the page in a headless browser, executes its scripts,
//! and returns the settled DOM. The vendor stays opaque behind a narrow
//! client; only the `/render` call contract is assumed.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::FetchError;

use super::static_fetch::page_from_html;
use super::{FetchedPage, PageFetcher};

/// Request body for the rendering service.
#[derive(Debug, Serialize)]
struct RenderRequest<'a> {
    url: &'a str,
    /// Wait for network idle before reading the DOM.
    wait_until: &'a str,
}

/// Response body from the rendering service.
#[derive(Debug, Deserialize)]
struct RenderResponse {
    /// The rendered document HTML.
    html: String,
}

/// Client for an HTTP browser-rendering service.
pub struct RenderedFetcher {
    api_base: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl RenderedFetcher {
    /// Creates a fetcher for the given rendering service.
    ///
    /// # Arguments
    ///
    /// * `api_base` - Base URL of the rendering service
    /// * `api_key` - Optional bearer token
    /// * `timeout` - Per-request timeout; rendered fetches are slow, so this
    ///   should be generous but still below the stage retry budget
    pub fn new(
        api_base: String,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FetchError::RenderFailed(e.to_string()))?;

        Ok(Self {
            api_base,
            api_key,
            client,
        })
    }

    /// Creates a fetcher from environment variables, if configured.
    ///
    /// Reads `RENDER_API_BASE` (service URL) and `RENDER_API_KEY`
    /// (optional). Returns `None` when no service is configured, in which
    /// case the pipeline runs without a rendered fallback.
    pub fn from_env(timeout: Duration) -> Option<Result<Self, FetchError>> {
        let api_base = std::env::var("RENDER_API_BASE").ok()?;
        let api_key = std::env::var("RENDER_API_KEY").ok();
        Some(Self::new(api_base, api_key, timeout))
    }

    /// The rendering service base URL.
    pub fn api_base(&self) -> &str {
        &self.api_base
    }
}

#[async_trait]
impl PageFetcher for RenderedFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        debug!(url = %url, service = %self.api_base, "Rendered fetch");

        let endpoint = format!("{}/render", self.api_base);
        let body = RenderRequest {
            url,
            wait_until: "networkidle",
        };

        let mut request = self.client.post(&endpoint).json(&body);
        if let Some(ref key) = self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }

        let response = request
            .send()
            .await
            .map_err(|e| FetchError::RenderFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::RenderFailed(format!(
                "render service returned HTTP {} for {}",
                status.as_u16(),
                url
            )));
        }

        let rendered: RenderResponse = response
            .json()
            .await
            .map_err(|e| FetchError::RenderFailed(e.to_string()))?;

        Ok(page_from_html(&rendered.html))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_request_serialization() {
        let body = RenderRequest {
            url: "https://example.com/job/42",
            wait_until: "networkidle",
        };

        let json = serde_json::to_string(&body).expect("serialization should work");
        assert!(json.contains("https://example.com/job/42"));
        assert!(json.contains("networkidle"));
    }

    #[tokio::test]
    async fn test_unreachable_service_is_render_failure() {
        let fetcher = RenderedFetcher::new(
            "http://localhost:65535".to_string(),
            None,
            Duration::from_secs(2),
        )
        .expect("client should build");

        let err = fetcher
            .fetch_page("https://example.com/job/42")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::RenderFailed(_)));
        assert_eq!(err.class(), crate::error::ErrorClass::Transient);
    }
}
