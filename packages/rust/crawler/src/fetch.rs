//! Bounded page fetch for discovered links.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, warn};
use url::Url;

use procwatch_shared::{ProcwatchError, Result, clip};

use crate::text::html_to_text;

/// User-Agent string for crawl requests.
const USER_AGENT: &str = concat!(
    "Procwatch/",
    env!("CARGO_PKG_VERSION"),
    " (Government Procurement Monitor)"
);

/// Discovered-link pages are fetched opportunistically; fail fast.
const FETCH_TIMEOUT: Duration = Duration::from_secs(20);

/// Fetches discovered-link pages and reduces them to bounded plain text.
/// Every failure degrades to `None` so one bad link never aborts a run.
pub struct PageFetcher {
    client: Client,
}

impl PageFetcher {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(FETCH_TIMEOUT)
            .build()
            .map_err(|e| ProcwatchError::Network(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    /// Fetch `url` and return its visible text, clipped to `max_chars`
    /// characters. HTML responses are stripped to plain text; other content
    /// types pass through raw. Returns `None` on any failure (invalid URL,
    /// transport error, timeout, non-2xx status) or when nothing remains.
    pub async fn fetch_page_text(&self, url: &str, max_chars: usize) -> Option<String> {
        let parsed = match Url::parse(url) {
            Ok(u) => u,
            Err(e) => {
                warn!(url, error = %e, "discovered link is not a valid URL");
                return None;
            }
        };

        let response = match self.client.get(parsed).send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(url, error = clip(&e.to_string(), 200), "page fetch failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            warn!(url, %status, "page fetch returned non-success status");
            return None;
        }

        let is_html = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.contains("html"));

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                warn!(url, error = clip(&e.to_string(), 200), "page body read failed");
                return None;
            }
        };

        let text = if is_html { html_to_text(&body) } else { body };
        let clipped = clip(&text, max_chars);
        if clipped.is_empty() {
            debug!(url, "page fetch produced no text");
            return None;
        }
        Some(clipped.to_string())
    }
}
