use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::config::{RATE_WAIT_CAP_SECS, RATE_WINDOW_SECS};
use crate::error::ScrapeError;

// ---------------------------------------------------------------------------
// Sliding window
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct WindowState {
    /// Monotonic timestamps of admitted requests inside the window.
    requests: Vec<Instant>,
    limit: usize,
    window: Duration,
}

impl WindowState {
    fn new(limit: usize, window: Duration) -> Self {
        Self {
            requests: Vec::new(),
            limit,
            window,
        }
    }

    fn evict(&mut self, now: Instant) {
        let window = self.window;
        self.requests.retain(|t| now.duration_since(*t) < window);
    }

    /// Time until the oldest surviving timestamp leaves the window, zero when
    /// below capacity.
    fn wait_time(&mut self, now: Instant) -> Duration {
        self.evict(now);
        if self.requests.len() < self.limit {
            return Duration::ZERO;
        }
        let oldest = self.requests.iter().min().copied().unwrap_or(now);
        (oldest + self.window).saturating_duration_since(now)
    }

    fn record(&mut self, now: Instant) {
        self.requests.push(now);
    }
}

// ---------------------------------------------------------------------------
// RateLimiter
// ---------------------------------------------------------------------------

struct Inner {
    global: WindowState,
    hosts: HashMap<String, WindowState>,
    default_host_limit: usize,
    window: Duration,
}

/// Sliding-window admission control: a global cap across all hosts plus a
/// per-host cap (overridable from the store registry). State lives behind one
/// async mutex; `acquire` sleeps while holding it, so concurrent scrapes are
/// admitted strictly in turn.
pub struct RateLimiter {
    inner: Mutex<Inner>,
}

impl RateLimiter {
    pub fn new(global_limit: usize) -> Self {
        let window = Duration::from_secs(RATE_WINDOW_SECS);
        Self {
            inner: Mutex::new(Inner {
                global: WindowState::new(global_limit, window),
                hosts: HashMap::new(),
                default_host_limit: 10,
                window,
            }),
        }
    }

    /// Override the per-host cap (Store.rate_limit_rpm).
    pub async fn set_host_limit(&self, host: &str, limit: usize) {
        let mut inner = self.inner.lock().await;
        let window = inner.window;
        inner
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| WindowState::new(limit, window))
            .limit = limit;
    }

    /// Block until both the global and the host window admit one request.
    /// Waits above the cap fail instead, with `retry_after` for the caller to
    /// surface to the retry engine.
    pub async fn acquire(&self, host: &str) -> Result<(), ScrapeError> {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let window = inner.window;
        let default_limit = inner.default_host_limit;
        let global_wait = inner.global.wait_time(now);
        let host_wait = inner
            .hosts
            .entry(host.to_string())
            .or_insert_with(|| WindowState::new(default_limit, window))
            .wait_time(now);

        let wait = global_wait.max(host_wait);
        if wait > Duration::from_secs(RATE_WAIT_CAP_SECS) {
            return Err(ScrapeError::RateLimited {
                domain: host.to_string(),
                retry_after: wait.as_secs(),
            });
        }
        if wait > Duration::ZERO {
            debug!(host, wait_ms = wait.as_millis() as u64, "rate limit wait");
            tokio::time::sleep(wait).await;
        }

        let now = Instant::now();
        inner.global.record(now);
        if let Some(state) = inner.hosts.get_mut(host) {
            state.record(now);
        }
        Ok(())
    }

    /// Non-blocking probe: would a request to `host` be admitted right now?
    pub async fn check(&self, host: &str) -> bool {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();
        let global_ok = inner.global.wait_time(now).is_zero();
        let host_ok = inner
            .hosts
            .get_mut(host)
            .map(|s| s.wait_time(now).is_zero())
            .unwrap_or(true);
        global_ok && host_ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn waits_for_window_capacity_before_admitting() {
        let limiter = RateLimiter::new(100);
        limiter.set_host_limit("example.ca", 2).await;

        limiter.acquire("example.ca").await.unwrap();
        tokio::time::advance(Duration::from_secs(40)).await;
        limiter.acquire("example.ca").await.unwrap();

        // Window is full; the oldest entry expires in ~20s, which is under
        // the 30s cap, so this acquire sleeps instead of failing.
        let before = Instant::now();
        limiter.acquire("example.ca").await.unwrap();
        let waited = Instant::now().duration_since(before);
        assert!(waited >= Duration::from_secs(19), "waited {waited:?}");
    }

    #[tokio::test(start_paused = true)]
    async fn global_window_caps_across_hosts() {
        let limiter = RateLimiter::new(2);
        limiter.acquire("a.ca").await.unwrap();
        limiter.acquire("b.ca").await.unwrap();
        assert!(!limiter.check("c.ca").await);
    }

    #[tokio::test(start_paused = true)]
    async fn long_wait_fails_with_retry_after() {
        let limiter = RateLimiter::new(100);
        limiter.set_host_limit("slow.ca", 1).await;
        limiter.acquire("slow.ca").await.unwrap();

        // A 1-rpm host forces a ~60s wait, beyond the 30s cap.
        let err = limiter.acquire("slow.ca").await.unwrap_err();
        match err {
            ScrapeError::RateLimited { domain, retry_after } => {
                assert_eq!(domain, "slow.ca");
                assert!(retry_after > RATE_WAIT_CAP_SECS);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_frees_after_expiry() {
        let limiter = RateLimiter::new(100);
        limiter.set_host_limit("shop.ca", 2).await;
        limiter.acquire("shop.ca").await.unwrap();
        limiter.acquire("shop.ca").await.unwrap();
        assert!(!limiter.check("shop.ca").await);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check("shop.ca").await);
    }
}
