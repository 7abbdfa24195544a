use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::Config;
use crate::db::store_registry::StoreRegistry;
use crate::error::ScrapeError;
use crate::llm::CompletionModel;
use crate::scraper::block_detection::{detect_block, BlockType};
use crate::scraper::fetcher::{FetchedPage, PageFetcher};
use crate::scraper::rate_limiter::RateLimiter;
use crate::scraper::robots::RobotsCache;
use crate::scraper::retry::{RetryHandler, RetryPolicy};
use crate::scraper::strategies;
use crate::scraper::user_agent::UserAgentPool;
use crate::scraper::validators::{ensure_public_host, extract_domain, validate_url_format};
use crate::types::{ExtractionStrategy, ProductSnapshot, ScrapeErrorType, SelectorSet};

// ---------------------------------------------------------------------------
// Results and config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct ScrapeResult {
    pub success: bool,
    pub snapshot: Option<ProductSnapshot>,
    pub url: String,
    pub domain: String,
    pub strategy_used: Option<ExtractionStrategy>,
    pub response_time_ms: i64,
    pub error: Option<ScrapeError>,
    pub error_type: Option<ScrapeErrorType>,
    pub error_message: Option<String>,
    pub attempts: u32,
    pub status_code: Option<u16>,
}

impl ScrapeResult {
    fn failure(url: &str, domain: &str, error: ScrapeError, message: Option<String>) -> Self {
        Self {
            success: false,
            snapshot: None,
            url: url.to_string(),
            domain: domain.to_string(),
            strategy_used: None,
            response_time_ms: 0,
            error_type: Some(error.error_type()),
            error_message: Some(message.unwrap_or_else(|| error.to_string())),
            error: Some(error),
            attempts: 1,
            status_code: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ScraperConfig {
    pub request_timeout: Duration,
    pub operation_timeout: Duration,
    pub page_load_delay: Duration,
    pub max_concurrent: usize,
    pub respect_robots: bool,
    pub enable_retries: bool,
}

impl ScraperConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            request_timeout: Duration::from_secs(config.request_timeout_seconds),
            operation_timeout: Duration::from_secs(config.operation_timeout_seconds),
            page_load_delay: Duration::from_secs_f64(config.page_load_delay_seconds),
            max_concurrent: config.max_concurrent_browsers,
            respect_robots: true,
            enable_retries: true,
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Orchestrates a single-URL scrape: preflight (URL validation, SSRF guard,
/// robots, rate limit), bounded fetch, block detection, and the extraction
/// waterfall, wrapped in per-category retry.
pub struct ScrapeEngine {
    config: ScraperConfig,
    registry: StoreRegistry,
    rate_limiter: Arc<RateLimiter>,
    robots: Arc<RobotsCache>,
    ua_pool: Arc<UserAgentPool>,
    fetcher: PageFetcher,
    retry: RetryHandler,
    llm: Option<Arc<dyn CompletionModel>>,
}

impl ScrapeEngine {
    pub fn new(
        config: ScraperConfig,
        registry: StoreRegistry,
        rate_limiter: Arc<RateLimiter>,
        robots: Arc<RobotsCache>,
        ua_pool: Arc<UserAgentPool>,
        llm: Option<Arc<dyn CompletionModel>>,
    ) -> Result<Self, ScrapeError> {
        let fetcher = PageFetcher::new(
            config.max_concurrent,
            config.request_timeout,
            config.page_load_delay,
        )?;
        Ok(Self {
            config,
            registry,
            rate_limiter,
            robots,
            ua_pool,
            fetcher,
            retry: RetryHandler::new(RetryPolicy::default()),
            llm,
        })
    }

    /// Scrape one product URL into a [`ScrapeResult`]. Never panics or
    /// returns Err: every failure mode is folded into the result.
    pub async fn scrape(&self, raw_url: &str, validate_ssrf: bool, use_cache: bool) -> ScrapeResult {
        let started = Instant::now();

        let (url, domain, selectors) = match self.preflight(raw_url, validate_ssrf).await {
            Ok(parts) => parts,
            Err(e) => {
                let mut result = ScrapeResult::failure(raw_url, "", e, None);
                result.response_time_ms = started.elapsed().as_millis() as i64;
                return result;
            }
        };

        let mut result = if self.config.enable_retries {
            self.scrape_with_retry(&url, &domain, &selectors, use_cache).await
        } else {
            match self.attempt(&url, &domain, &selectors, use_cache).await {
                Ok((snapshot, status)) => self.success_result(&url, &domain, snapshot, status, 1),
                Err(e) => ScrapeResult::failure(url.as_str(), &domain, e, None),
            }
        };

        result.response_time_ms = started.elapsed().as_millis() as i64;

        if result.success {
            self.ua_pool.report_success(&domain);
            if let Err(e) = self.registry.record_success(&domain, chrono::Utc::now()).await {
                warn!(domain, "failed to stamp store success: {e}");
            }
        } else {
            self.ua_pool.report_failure(&domain);
        }

        result
    }

    async fn scrape_with_retry(
        &self,
        url: &Url,
        domain: &str,
        selectors: &Option<SelectorSet>,
        use_cache: bool,
    ) -> ScrapeResult {
        let outcome = self
            .retry
            .execute(
                || self.attempt(url, domain, selectors, use_cache),
                |err| {
                    // Bot-detection and access-denied verdicts rotate the UA
                    // before the next attempt.
                    if let ScrapeError::Blocked {
                        kind: BlockType::BotDetection | BlockType::AccessDenied,
                        ..
                    } = err
                    {
                        let rotated = self.ua_pool.rotate(domain);
                        debug!(domain, ua = rotated.as_str(), "rotated user agent after block");
                    }
                },
            )
            .await;

        match outcome.result {
            Ok((snapshot, status)) => {
                self.success_result(url, domain, snapshot, status, outcome.attempts)
            }
            Err(e) => {
                let mut result = ScrapeResult::failure(url.as_str(), domain, e, outcome.message);
                result.attempts = outcome.attempts;
                result
            }
        }
    }

    fn success_result(
        &self,
        url: &Url,
        domain: &str,
        snapshot: ProductSnapshot,
        status_code: Option<u16>,
        attempts: u32,
    ) -> ScrapeResult {
        info!(
            domain,
            strategy = %snapshot.strategy_used.map(|s| s.to_string()).unwrap_or_default(),
            price = snapshot.price.unwrap_or_default(),
            attempts,
            "scrape succeeded"
        );
        ScrapeResult {
            success: true,
            strategy_used: snapshot.strategy_used,
            snapshot: Some(snapshot),
            url: url.to_string(),
            domain: domain.to_string(),
            response_time_ms: 0,
            error: None,
            error_type: None,
            error_message: None,
            attempts,
            status_code,
        }
    }

    /// Ordered preflight: syntax, SSRF, robots, per-store rate-limit config,
    /// rate-limit acquisition.
    async fn preflight(
        &self,
        raw_url: &str,
        validate_ssrf: bool,
    ) -> Result<(Url, String, Option<SelectorSet>), ScrapeError> {
        let url = validate_url_format(raw_url)?;
        if validate_ssrf {
            ensure_public_host(&url).await?;
        }
        let domain = extract_domain(&url);

        if self.config.respect_robots {
            let verdict = self.robots.check(&url).await;
            if !verdict.allowed {
                return Err(ScrapeError::RobotsBlocked(verdict.reason));
            }
        }

        let mut selectors = None;
        match self.registry.lookup(&domain).await {
            Ok(Some(store)) => {
                self.rate_limiter
                    .set_host_limit(&domain, store.rate_limit_rpm.max(1) as usize)
                    .await;
                selectors = Some(store.selector_set());
            }
            Ok(None) => {}
            Err(e) => warn!(domain, "store lookup failed: {e}"),
        }

        self.rate_limiter.acquire(&domain).await?;
        Ok((url, domain, selectors))
    }

    /// One bounded attempt: fetch, block detection, extraction.
    async fn attempt(
        &self,
        url: &Url,
        domain: &str,
        selectors: &Option<SelectorSet>,
        use_cache: bool,
    ) -> Result<(ProductSnapshot, Option<u16>), ScrapeError> {
        let operation = self.fetch_and_extract(url, domain, selectors, use_cache);
        match tokio::time::timeout(self.config.operation_timeout, operation).await {
            Ok(result) => result,
            Err(_) => Err(ScrapeError::Timeout(format!(
                "operation timed out after {}s",
                self.config.operation_timeout.as_secs()
            ))),
        }
    }

    async fn fetch_and_extract(
        &self,
        url: &Url,
        domain: &str,
        selectors: &Option<SelectorSet>,
        use_cache: bool,
    ) -> Result<(ProductSnapshot, Option<u16>), ScrapeError> {
        let page = self.fetch_page(url, domain, selectors, use_cache).await?;

        let snapshot = strategies::extract(
            page.html,
            selectors.clone(),
            self.llm.as_deref(),
            url.as_str(),
        )
        .await
        .ok_or_else(|| {
            ScrapeError::ParseFailure("failed to extract product data from page".to_string())
        })?;

        Ok((snapshot, Some(page.status)))
    }

    async fn fetch_page(
        &self,
        url: &Url,
        domain: &str,
        selectors: &Option<SelectorSet>,
        use_cache: bool,
    ) -> Result<FetchedPage, ScrapeError> {
        let headers = self.ua_pool.headers_for(domain);
        let wait_for = selectors
            .as_ref()
            .and_then(|s| s.wait_for.as_deref());

        let page = self.fetcher.fetch(url, &headers, wait_for, use_cache).await?;

        let verdict = detect_block(&page.html, page.status, &page.headers);
        if verdict.is_blocked {
            let kind = verdict.block_type.unwrap_or(BlockType::BotDetection);
            debug!(domain, %kind, indicators = ?verdict.indicators, "block detected");
            return Err(ScrapeError::Blocked {
                kind,
                message: format!(
                    "{} (status {}, indicators: {})",
                    kind,
                    page.status,
                    verdict.indicators.join(", ")
                ),
            });
        }

        Ok(page)
    }

    /// Bare-fetch fast path for healing: shares preflight, rate limiting and
    /// block detection with the scrape path but skips extraction, returning
    /// the raw HTML sample.
    pub async fn fetch_sample(&self, raw_url: &str) -> Result<String, ScrapeError> {
        let (url, domain, selectors) = self.preflight(raw_url, false).await?;
        let operation = self.fetch_page(&url, &domain, &selectors, false);
        let page = match tokio::time::timeout(self.config.operation_timeout, operation).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ScrapeError::Timeout(format!(
                    "operation timed out after {}s",
                    self.config.operation_timeout.as_secs()
                )))
            }
        };
        Ok(page.html)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    async fn engine() -> ScrapeEngine {
        let pool = test_pool().await;
        let registry = StoreRegistry::new(pool);
        let ua_pool = Arc::new(UserAgentPool::new());
        let robots = Arc::new(RobotsCache::new(ua_pool.primary().to_string()));
        let config = ScraperConfig {
            request_timeout: Duration::from_secs(5),
            operation_timeout: Duration::from_secs(10),
            page_load_delay: Duration::ZERO,
            max_concurrent: 2,
            respect_robots: true,
            enable_retries: true,
        };
        ScrapeEngine::new(
            config,
            registry,
            Arc::new(RateLimiter::new(100)),
            robots,
            ua_pool,
            None,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn invalid_url_fails_before_any_fetch() {
        let engine = engine().await;
        let result = engine.scrape("ftp://shop.ca/product", true, false).await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(ScrapeError::InvalidUrl(_))));
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn private_ip_fails_ssrf_guard_before_any_fetch() {
        let engine = engine().await;
        let result = engine.scrape("http://127.0.0.1/product", true, false).await;
        assert!(!result.success);
        assert!(matches!(result.error, Some(ScrapeError::PrivateIp(_))));
        assert!(result
            .error_message
            .as_deref()
            .unwrap_or_default()
            .contains("private IP"));
    }
}
