//! Adaptive content fetching for submitted posting URLs.
//!
//! A static fetch (plain GET + markup parse) runs first; a heuristic on the
//! result decides whether to fall back to a browser-rendered fetch. The
//! fallback runs at most once per fetch. If neither method yields usable
//! content, the fetch fails permanently; retrying cannot fix a page that
//! parses to nothing.

pub mod rendered;
pub mod static_fetch;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::FetchError;

pub use rendered::RenderedFetcher;
pub use static_fetch::StaticFetcher;

/// Default minimum visible-text length for a static result to count as a
/// real page rather than a client-side shell.
pub const DEFAULT_MIN_CONTENT_CHARS: usize = 500;

/// Markers that identify a client-side-rendered shell even when the text
/// clears the length threshold.
const SHELL_MARKERS: [&str; 4] = [
    "enable javascript",
    "javascript is required",
    "you need to enable javascript",
    "loading...",
];

/// A fetched page reduced to visible text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedPage {
    /// Visible text of the page's main content.
    pub text: String,
    /// Document title, when present.
    pub title: Option<String>,
}

/// Which fetch method produced the content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchMethod {
    /// Plain HTTP GET + markup parse.
    Static,
    /// Headless-browser fetch through the rendering service.
    Rendered,
}

impl std::fmt::Display for FetchMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FetchMethod::Static => write!(f, "static"),
            FetchMethod::Rendered => write!(f, "rendered"),
        }
    }
}

/// Result of a successful adaptive fetch.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FetchedContent {
    /// Visible text of the page.
    pub content: String,
    /// Document title, when present.
    pub title: Option<String>,
    /// The method that produced the content.
    pub method: FetchMethod,
}

/// Trait for page fetchers (static or rendered).
#[async_trait]
pub trait PageFetcher: Send + Sync {
    /// Fetches a URL and reduces it to visible text.
    async fn fetch_page(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Adaptive fetcher: static first, rendered fallback at most once.
pub struct ContentFetcher {
    static_fetcher: Box<dyn PageFetcher>,
    rendered_fetcher: Option<Box<dyn PageFetcher>>,
    min_content_chars: usize,
}

impl ContentFetcher {
    /// Creates a fetcher from its two methods.
    ///
    /// # Arguments
    ///
    /// * `static_fetcher` - The cheap static method, always tried first
    /// * `rendered_fetcher` - Optional rendered fallback; without it, shell
    ///   pages fail permanently after the static attempt
    pub fn new(
        static_fetcher: Box<dyn PageFetcher>,
        rendered_fetcher: Option<Box<dyn PageFetcher>>,
    ) -> Self {
        Self {
            static_fetcher,
            rendered_fetcher,
            min_content_chars: DEFAULT_MIN_CONTENT_CHARS,
        }
    }

    /// Sets the minimum-content heuristic threshold.
    pub fn with_min_content_chars(mut self, min_content_chars: usize) -> Self {
        self.min_content_chars = min_content_chars;
        self
    }

    /// Returns whether a static result looks like a client-side shell that
    /// needs the rendered fallback.
    fn needs_rendered_fallback(&self, page: &FetchedPage) -> bool {
        if page.text.len() < self.min_content_chars {
            return true;
        }
        let lowered = page.text.to_lowercase();
        SHELL_MARKERS.iter().any(|marker| lowered.contains(marker))
    }

    /// Returns whether a static fetch error suggests the site blocks plain
    /// clients, in which case the rendered service may still succeed.
    fn is_blocking_error(error: &FetchError) -> bool {
        matches!(
            error,
            FetchError::Status {
                status: 403 | 429 | 503,
                ..
            }
        )
    }

    /// Fetches a URL, choosing between the static and rendered methods.
    ///
    /// The static method always runs first. The rendered fallback runs at
    /// most once, when the static result trips the shell heuristic or the
    /// static request is blocked outright. A page that yields no usable
    /// content after both methods is a permanent `EmptyContent` failure.
    pub async fn fetch(&self, url: &str) -> Result<FetchedContent, FetchError> {
        let static_result = self.static_fetcher.fetch_page(url).await;

        let static_page = match static_result {
            Ok(page) => {
                if !self.needs_rendered_fallback(&page) {
                    return Ok(FetchedContent {
                        content: page.text,
                        title: page.title,
                        method: FetchMethod::Static,
                    });
                }
                info!(
                    url = %url,
                    chars = page.text.len(),
                    "Static result below content heuristic, trying rendered fetch"
                );
                Some(page)
            }
            Err(e) if Self::is_blocking_error(&e) && self.rendered_fetcher.is_some() => {
                warn!(url = %url, error = %e, "Static fetch blocked, trying rendered fetch");
                None
            }
            Err(e) => return Err(e),
        };

        let Some(rendered) = self.rendered_fetcher.as_ref() else {
            // The static result was a shell and there is no fallback.
            return Err(FetchError::EmptyContent {
                url: url.to_string(),
                reason: format!(
                    "static fetch produced {} chars and no rendered fetcher is configured",
                    static_page.map(|p| p.text.len()).unwrap_or(0)
                ),
            });
        };

        let rendered_page = rendered.fetch_page(url).await?;

        if rendered_page.text.len() < self.min_content_chars {
            // Keep the better of the two attempts for the error report.
            let best = static_page
                .map(|p| p.text.len().max(rendered_page.text.len()))
                .unwrap_or(rendered_page.text.len());
            return Err(FetchError::EmptyContent {
                url: url.to_string(),
                reason: format!("{} chars of text after both fetch methods", best),
            });
        }

        Ok(FetchedContent {
            content: rendered_page.text,
            title: rendered_page.title,
            method: FetchMethod::Rendered,
        })
    }
}
