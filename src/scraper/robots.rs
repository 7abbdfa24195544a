use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};
use url::Url;

use crate::config::{ROBOTS_CACHE_TTL_SECS, ROBOTS_FETCH_TIMEOUT_SECS};

// ---------------------------------------------------------------------------
// Matcher
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Rule {
    Allow(String),
    Disallow(String),
}

#[derive(Debug, Clone, Default)]
struct Group {
    agents: Vec<String>,
    rules: Vec<Rule>,
    crawl_delay: Option<f64>,
}

/// Parsed robots.txt. Group selection is by case-insensitive substring match
/// of the UA family against `User-agent` lines, falling back to `*`; within a
/// group the longest matching path rule wins, Allow beating Disallow on ties.
#[derive(Debug, Clone, Default)]
pub struct RobotsMatcher {
    groups: Vec<Group>,
}

impl RobotsMatcher {
    pub fn parse(content: &str) -> Self {
        let mut groups: Vec<Group> = Vec::new();
        let mut current = Group::default();
        let mut in_rules = false;

        for line in content.lines() {
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }
            let Some((field, value)) = line.split_once(':') else {
                continue;
            };
            let field = field.trim().to_ascii_lowercase();
            let value = value.trim();

            match field.as_str() {
                "user-agent" => {
                    // A User-agent line after rules starts a new group.
                    if in_rules {
                        groups.push(std::mem::take(&mut current));
                        in_rules = false;
                    }
                    current.agents.push(value.to_ascii_lowercase());
                }
                "allow" => {
                    in_rules = true;
                    current.rules.push(Rule::Allow(value.to_string()));
                }
                "disallow" => {
                    in_rules = true;
                    current.rules.push(Rule::Disallow(value.to_string()));
                }
                "crawl-delay" => {
                    in_rules = true;
                    current.crawl_delay = value.parse().ok();
                }
                _ => {
                    in_rules = true;
                }
            }
        }
        if !current.agents.is_empty() {
            groups.push(current);
        }

        Self { groups }
    }

    fn group_for(&self, user_agent: &str) -> Option<&Group> {
        let ua = user_agent.to_ascii_lowercase();
        self.groups
            .iter()
            .find(|g| g.agents.iter().any(|a| a != "*" && ua.contains(a.as_str())))
            .or_else(|| self.groups.iter().find(|g| g.agents.iter().any(|a| a == "*")))
    }

    pub fn is_allowed(&self, user_agent: &str, path: &str) -> bool {
        let Some(group) = self.group_for(user_agent) else {
            return true;
        };

        let mut best_len = 0usize;
        let mut allowed = true;
        for rule in &group.rules {
            let (pattern, allow) = match rule {
                Rule::Allow(p) => (p.as_str(), true),
                Rule::Disallow(p) => (p.as_str(), false),
            };
            // Empty Disallow means unrestricted.
            if pattern.is_empty() {
                continue;
            }
            if path.starts_with(pattern) {
                let len = pattern.len();
                if len > best_len || (len == best_len && allow) {
                    best_len = len;
                    allowed = allow;
                }
            }
        }
        allowed
    }

    pub fn crawl_delay(&self, user_agent: &str) -> Option<f64> {
        self.group_for(user_agent).and_then(|g| g.crawl_delay)
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RobotsResult {
    pub allowed: bool,
    pub crawl_delay: Option<f64>,
    pub reason: String,
}

struct CachedRobots {
    matcher: RobotsMatcher,
    crawl_delay: Option<f64>,
    fetched_at: Instant,
}

/// Per-origin robots.txt cache with a 1 h TTL. Fetch failures fail open and
/// are not cached, so the next request re-attempts. Concurrent misses for the
/// same origin are collapsed onto one in-flight fetch.
pub struct RobotsCache {
    client: reqwest::Client,
    user_agent: String,
    ttl: Duration,
    cache: DashMap<String, CachedRobots>,
    fetch_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RobotsCache {
    pub fn new(user_agent: String) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(ROBOTS_FETCH_TIMEOUT_SECS))
            .build()
            .unwrap_or_default();
        Self {
            client,
            user_agent,
            ttl: Duration::from_secs(ROBOTS_CACHE_TTL_SECS),
            cache: DashMap::new(),
            fetch_locks: DashMap::new(),
        }
    }

    fn origin_of(url: &Url) -> String {
        format!(
            "{}://{}",
            url.scheme(),
            url.host_str().unwrap_or_default()
        )
    }

    /// Check whether the scraper may fetch `url`.
    pub async fn check(&self, url: &Url) -> RobotsResult {
        let origin = Self::origin_of(url);
        let path = url.path().to_string();

        if let Some(cached) = self.lookup(&origin) {
            return self.verdict(&cached.0, cached.1, &path);
        }

        // Single-flight per origin: first caller fetches, the rest wait on
        // the same lock and then hit the cache.
        let lock = self
            .fetch_locks
            .entry(origin.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if let Some(cached) = self.lookup(&origin) {
            return self.verdict(&cached.0, cached.1, &path);
        }

        match self.fetch(&origin).await {
            Some(matcher) => {
                let crawl_delay = matcher.crawl_delay(&self.user_agent);
                let verdict = self.verdict(&matcher, crawl_delay, &path);
                self.cache.insert(
                    origin,
                    CachedRobots {
                        matcher,
                        crawl_delay,
                        fetched_at: Instant::now(),
                    },
                );
                verdict
            }
            None => RobotsResult {
                allowed: true,
                crawl_delay: None,
                reason: "no robots.txt or fetch failed - proceeding".to_string(),
            },
        }
    }

    fn lookup(&self, origin: &str) -> Option<(RobotsMatcher, Option<f64>)> {
        let entry = self.cache.get(origin)?;
        if entry.fetched_at.elapsed() >= self.ttl {
            drop(entry);
            self.cache.remove(origin);
            return None;
        }
        Some((entry.matcher.clone(), entry.crawl_delay))
    }

    fn verdict(&self, matcher: &RobotsMatcher, crawl_delay: Option<f64>, path: &str) -> RobotsResult {
        let allowed = matcher.is_allowed(&self.user_agent, path);
        RobotsResult {
            allowed,
            crawl_delay,
            reason: if allowed {
                "robots.txt allows".to_string()
            } else {
                "robots.txt disallows".to_string()
            },
        }
    }

    async fn fetch(&self, origin: &str) -> Option<RobotsMatcher> {
        let robots_url = format!("{origin}/robots.txt");
        debug!(url = %robots_url, "fetching robots.txt");

        let response = self
            .client
            .get(&robots_url)
            .header("User-Agent", &self.user_agent)
            .send()
            .await;

        match response {
            Ok(resp) if resp.status().is_success() => match resp.text().await {
                Ok(body) => Some(RobotsMatcher::parse(&body)),
                Err(e) => {
                    warn!(origin, "robots.txt body read failed: {e}");
                    None
                }
            },
            Ok(resp) => {
                debug!(origin, status = resp.status().as_u16(), "robots.txt not available");
                None
            }
            Err(e) => {
                debug!(origin, "robots.txt fetch failed: {e}");
                None
            }
        }
    }

    /// Drop cached entries, for one origin or all.
    pub fn clear(&self, origin: Option<&str>) {
        match origin {
            Some(o) => {
                self.cache.retain(|key, _| !key.contains(o));
            }
            None => self.cache.clear(),
        }
    }
}
