//! Static page fetcher: plain HTTP GET plus markup parsing.
//!
//! Cheap and sufficient for server-rendered pages. Content is reduced to
//! visible text by locating the main content area with a selector ladder and
//! stripping boilerplate elements before collecting text nodes.

use std::time::Duration;

use async_trait::async_trait;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::error::FetchError;

use super::{FetchedPage, PageFetcher};

/// Selectors tried in order when locating the main content area.
const MAIN_CONTENT_SELECTORS: [&str; 8] = [
    "main",
    "article",
    "[role='main']",
    "#content",
    "#main",
    ".content",
    ".post-content",
    ".entry-content",
];

/// Elements stripped before text collection.
const BOILERPLATE_SELECTORS: [&str; 12] = [
    "nav", "header", "footer", "aside", "script", "style", "noscript", "iframe", ".nav",
    ".navbar", ".sidebar", ".menu",
];

/// Static page fetcher using reqwest + scraper.
pub struct StaticFetcher {
    client: reqwest::Client,
}

impl StaticFetcher {
    /// Creates a fetcher with the given per-request timeout.
    ///
    /// Uses a browser-like User-Agent and header set; many posting sites
    /// refuse obviously non-browser clients.
    pub fn new(timeout: Duration) -> Result<Self, FetchError> {
        let user_agent = "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::ACCEPT,
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8"
                .parse()
                .expect("static header value"),
        );
        headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            "en-US,en;q=0.5".parse().expect("static header value"),
        );

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .default_headers(headers)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        Ok(Self { client })
    }

    /// Fetches raw HTML from a URL.
    async fn fetch_html(&self, url: &str) -> Result<String, FetchError> {
        let parsed = Url::parse(url).map_err(|_| FetchError::InvalidUrl(url.to_string()))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(FetchError::InvalidUrl(url.to_string()));
        }

        let response = self
            .client
            .get(parsed)
            .send()
            .await
            .map_err(|e| FetchError::RequestFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        response
            .text()
            .await
            .map_err(|e| FetchError::RequestFailed(e.to_string()))
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError> {
        debug!(url = %url, "Static fetch");
        let html = self.fetch_html(url).await?;
        Ok(page_from_html(&html))
    }
}

/// Builds a [`FetchedPage`] from raw HTML.
pub(crate) fn page_from_html(html: &str) -> FetchedPage {
    let document = Html::parse_document(html);
    FetchedPage {
        title: extract_title(&document),
        text: extract_text(&document),
    }
}

/// Extracts the document title, if present and non-empty.
fn extract_title(document: &Html) -> Option<String> {
    let title_selector = Selector::parse("title").ok()?;
    document
        .select(&title_selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

/// Reduces a document to the visible text of its main content area.
fn extract_text(document: &Html) -> String {
    for selector_str in MAIN_CONTENT_SELECTORS {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(main) = document.select(&selector).next() {
                return collect_text(&main.html());
            }
        }
    }

    // No recognizable main area; fall back to the whole body.
    if let Ok(body_selector) = Selector::parse("body") {
        if let Some(body) = document.select(&body_selector).next() {
            return collect_text(&body.html());
        }
    }

    collect_text(html_string(document).as_str())
}

fn html_string(document: &Html) -> String {
    document.root_element().html()
}

/// Strips boilerplate elements from an HTML fragment and collects the
/// remaining text nodes with normalized whitespace.
fn collect_text(fragment: &str) -> String {
    let document = Html::parse_fragment(fragment);

    let mut stripped = fragment.to_string();
    for selector_str in BOILERPLATE_SELECTORS {
        if let Ok(selector) = Selector::parse(selector_str) {
            for element in document.select(&selector) {
                let element_html = element.html();
                stripped = stripped.replace(&element_html, "");
            }
        }
    }

    let cleaned = Html::parse_fragment(&stripped);
    let raw: String = cleaned
        .root_element()
        .text()
        .collect::<Vec<_>>()
        .join(" ");

    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_from_html_title_and_text() {
        let html = r#"<html><head><title>Backend Engineer</title></head>
            <body><main><h1>Backend Engineer</h1><p>Tell us why you fit.</p></main></body></html>"#;

        let page = page_from_html(html);
        assert_eq!(page.title, Some("Backend Engineer".to_string()));
        assert!(page.text.contains("Tell us why you fit."));
    }

    #[test]
    fn test_prefers_main_over_body() {
        let html = r#"<html><body>
            <nav>Home About Careers</nav>
            <main><p>Application questions below.</p></main>
            <footer>© 2026</footer>
        </body></html>"#;

        let page = page_from_html(html);
        assert!(page.text.contains("Application questions"));
        assert!(!page.text.contains("Careers"));
        assert!(!page.text.contains("2026"));
    }

    #[test]
    fn test_boilerplate_stripped_from_body_fallback() {
        let html = r#"<html><body>
            <script>window.dataLayer = [];</script>
            <p>Describe your experience.</p>
            <footer>legal text</footer>
        </body></html>"#;

        let page = page_from_html(html);
        assert!(page.text.contains("Describe your experience."));
        assert!(!page.text.contains("dataLayer"));
        assert!(!page.text.contains("legal text"));
    }

    #[test]
    fn test_whitespace_normalized() {
        let html = "<html><body><main><p>a</p>\n\n   <p>b</p></main></body></html>";
        let page = page_from_html(html);
        assert_eq!(page.text, "a b");
    }

    #[test]
    fn test_missing_title() {
        let html = "<html><body><main><p>content</p></main></body></html>";
        let page = page_from_html(html);
        assert_eq!(page.title, None);
    }

    #[tokio::test]
    async fn test_invalid_url_rejected() {
        let fetcher = StaticFetcher::new(Duration::from_secs(5)).expect("client should build");

        let err = fetcher.fetch_page("not a url").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));

        let err = fetcher.fetch_page("ftp://example.com/x").await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
    }
}
