use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::config::PAGE_CACHE_TTL_SECS;
use crate::error::ScrapeError;

/// A fetched page, ready for block detection and extraction.
#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub html: String,
    pub status: u16,
    /// Response headers, keys lowercased.
    pub headers: HashMap<String, String>,
    pub from_cache: bool,
}

struct CachedPage {
    page: FetchedPage,
    stored_at: Instant,
}

/// Headless page fetcher. Concurrency is bounded by a global session
/// semaphore; each fetch applies the configured settle delay before the body
/// is read, and honors a `wait_for` selector with a single delayed re-read
/// when the first body does not contain a match.
pub struct PageFetcher {
    client: reqwest::Client,
    sessions: Arc<Semaphore>,
    page_load_delay: Duration,
    cache: DashMap<String, CachedPage>,
    cache_ttl: Duration,
}

impl PageFetcher {
    pub fn new(
        max_sessions: usize,
        request_timeout: Duration,
        page_load_delay: Duration,
    ) -> Result<Self, ScrapeError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| ScrapeError::Network(format!("client build failed: {e}")))?;

        Ok(Self {
            client,
            sessions: Arc::new(Semaphore::new(max_sessions)),
            page_load_delay,
            cache: DashMap::new(),
            cache_ttl: Duration::from_secs(PAGE_CACHE_TTL_SECS),
        })
    }

    /// Fetch `url` with the given request headers. The session permit is held
    /// for the duration of the fetch, including the settle delay.
    pub async fn fetch(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
        wait_for: Option<&str>,
        use_cache: bool,
    ) -> Result<FetchedPage, ScrapeError> {
        if use_cache {
            if let Some(cached) = self.cached(url.as_str()) {
                debug!(url = %url, "page cache hit");
                return Ok(cached);
            }
        }

        let _permit = self
            .sessions
            .acquire()
            .await
            .map_err(|_| ScrapeError::Network("fetcher is shutting down".to_string()))?;

        let mut page = self.fetch_once(url, headers).await?;

        // A declared wait_for selector that found nothing usually means the
        // page had not settled; give it one more delayed read.
        if let Some(selector) = wait_for {
            if !selector_matches(&page.html, selector) {
                debug!(url = %url, selector, "wait_for selector absent, re-reading page");
                tokio::time::sleep(self.page_load_delay).await;
                match self.fetch_once(url, headers).await {
                    Ok(retried) => page = retried,
                    Err(e) => warn!(url = %url, "wait_for re-read failed: {e}"),
                }
            }
        }

        if use_cache {
            self.cache.insert(
                url.as_str().to_string(),
                CachedPage {
                    page: page.clone(),
                    stored_at: Instant::now(),
                },
            );
        }

        Ok(page)
    }

    async fn fetch_once(
        &self,
        url: &Url,
        headers: &HashMap<String, String>,
    ) -> Result<FetchedPage, ScrapeError> {
        let mut request = self.client.get(url.clone());
        for (name, value) in headers {
            request = request.header(name.as_str(), value.as_str());
        }

        let response = request.send().await.map_err(map_reqwest_error)?;
        let status = response.status().as_u16();
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_ascii_lowercase(),
                    value.to_str().unwrap_or_default().to_string(),
                )
            })
            .collect();

        // Settle delay before the HTML read.
        if !self.page_load_delay.is_zero() {
            tokio::time::sleep(self.page_load_delay).await;
        }

        let html = response.text().await.map_err(map_reqwest_error)?;

        Ok(FetchedPage {
            html,
            status,
            headers: response_headers,
            from_cache: false,
        })
    }

    fn cached(&self, url: &str) -> Option<FetchedPage> {
        let entry = self.cache.get(url)?;
        if entry.stored_at.elapsed() >= self.cache_ttl {
            drop(entry);
            self.cache.remove(url);
            return None;
        }
        let mut page = entry.page.clone();
        page.from_cache = true;
        Some(page)
    }
}

fn map_reqwest_error(e: reqwest::Error) -> ScrapeError {
    if e.is_timeout() {
        ScrapeError::Timeout(e.to_string())
    } else {
        ScrapeError::Network(e.to_string())
    }
}

/// Cheap settle probe: does the wait_for CSS selector match the document?
fn selector_matches(html: &str, selector: &str) -> bool {
    let Ok(parsed) = scraper::Selector::parse(selector) else {
        return true;
    };
    let document = scraper::Html::parse_document(html);
    document.select(&parsed).next().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selector_probe_detects_presence() {
        let html = "<html><body><div id=\"price-block\">$9.99</div></body></html>";
        assert!(selector_matches(html, "#price-block"));
        assert!(!selector_matches(html, ".missing"));
        // Unparseable selectors never force a re-read.
        assert!(selector_matches(html, ":::"));
    }
}
