use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::error::ScrapeError;
use crate::scraper::block_detection::{evasion_policy, BlockType, EvasionAction};

// ---------------------------------------------------------------------------
// Categories
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Network,
    Timeout,
    ServerError,
    RateLimited,
    Forbidden,
    NotFound,
    Blocked,
    ParseError,
}

impl ErrorCategory {
    fn key(self) -> &'static str {
        match self {
            ErrorCategory::Network => "network_error",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Forbidden => "forbidden",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::Blocked => "blocked",
            ErrorCategory::ParseError => "parse_error",
        }
    }
}

/// Map an error to its retry category. The variant decides in most cases;
/// embedded status tokens in the message break ties for generic errors.
pub fn categorize_error(error: &ScrapeError) -> ErrorCategory {
    match error {
        ScrapeError::Timeout(_) => ErrorCategory::Timeout,
        ScrapeError::NotFound(_) => ErrorCategory::NotFound,
        ScrapeError::RateLimited { .. } => ErrorCategory::RateLimited,
        ScrapeError::Blocked { kind, message } => match kind {
            BlockType::RateLimited => ErrorCategory::RateLimited,
            BlockType::NotFound => ErrorCategory::NotFound,
            BlockType::AccessDenied => ErrorCategory::Forbidden,
            _ => {
                if message.contains("429") {
                    ErrorCategory::RateLimited
                } else if message.contains("403") {
                    ErrorCategory::Forbidden
                } else {
                    ErrorCategory::Blocked
                }
            }
        },
        ScrapeError::ParseFailure(_)
        | ScrapeError::PriceValidation(_)
        | ScrapeError::StructureChange(_) => ErrorCategory::ParseError,
        ScrapeError::Network(message) => categorize_message(message),
        _ => ErrorCategory::Network,
    }
}

fn categorize_message(message: &str) -> ErrorCategory {
    let lower = message.to_lowercase();
    if lower.contains("timeout") {
        ErrorCategory::Timeout
    } else if lower.contains("404") {
        ErrorCategory::NotFound
    } else if lower.contains("403") {
        ErrorCategory::Forbidden
    } else if lower.contains("429") {
        ErrorCategory::RateLimited
    } else if lower.contains("500") || lower.contains("502") || lower.contains("503") || lower.contains("504")
    {
        ErrorCategory::ServerError
    } else {
        ErrorCategory::Network
    }
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Per-category backoff schedules in seconds.
    delays: HashMap<&'static str, Vec<f64>>,
    /// ±jitter fraction applied to every delay.
    jitter: f64,
    max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        let mut delays: HashMap<&'static str, Vec<f64>> = HashMap::new();
        delays.insert("network_error", vec![2.0, 4.0, 8.0]);
        delays.insert("timeout", vec![2.0, 4.0, 8.0]);
        delays.insert("server_error", vec![2.0, 4.0, 8.0]);
        delays.insert("rate_limited", vec![5.0, 10.0, 20.0]);
        delays.insert("forbidden", vec![5.0]);
        Self {
            delays,
            jitter: 0.2,
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    /// Delay before the next attempt, with ±20 % uniform jitter.
    /// `attempt` is zero-indexed.
    pub fn delay_for(&self, category: ErrorCategory, attempt: u32) -> Duration {
        let schedule = self
            .delays
            .get(category.key())
            .cloned()
            .unwrap_or_else(|| vec![2.0, 4.0, 8.0]);
        let idx = (attempt as usize).min(schedule.len() - 1);
        let base = schedule[idx];
        let jitter_range = base * self.jitter;
        let jittered = base + rand::thread_rng().gen_range(-jitter_range..=jitter_range);
        Duration::from_secs_f64(jittered.max(0.0))
    }

    /// Whether another attempt is allowed after `attempt` failures of this
    /// category. `attempt` is zero-indexed.
    pub fn should_retry(&self, category: ErrorCategory, attempt: u32) -> bool {
        match category {
            ErrorCategory::NotFound => false,
            ErrorCategory::Forbidden => attempt < 1,
            ErrorCategory::Blocked => attempt < 2,
            ErrorCategory::ParseError => attempt < 2,
            _ => attempt < self.max_retries,
        }
    }

    /// Retry eligibility for a concrete error. Block verdicts are governed by
    /// their evasion policy (CAPTCHA walls are terminal, bot detection gets
    /// bounded UA-rotation retries); everything else falls back to the
    /// category caps.
    pub fn should_retry_error(&self, error: &ScrapeError, attempt: u32) -> bool {
        if let ScrapeError::Blocked { kind, .. } = error {
            return match evasion_policy(*kind) {
                EvasionAction::Terminal => false,
                EvasionAction::RotateUserAgent { max_retries, .. } => attempt < max_retries,
                EvasionAction::SleepRetry(_) | EvasionAction::DelayedRetry => {
                    self.should_retry(categorize_error(error), attempt)
                }
            };
        }
        self.should_retry(categorize_error(error), attempt)
    }

    /// Delay before the next attempt for a concrete error. UA-rotation
    /// blocks carry their own short delay; rate-limited and transient blocks
    /// follow their category schedule.
    pub fn delay_for_error(&self, error: &ScrapeError, attempt: u32) -> Duration {
        if let ScrapeError::Blocked { kind, .. } = error {
            if let EvasionAction::RotateUserAgent { delay, .. } = evasion_policy(*kind) {
                return delay;
            }
        }
        self.delay_for(categorize_error(error), attempt)
    }

    /// The canned human sentence for a terminal failure.
    pub fn user_message(&self, category: ErrorCategory, attempts: u32) -> String {
        match category {
            ErrorCategory::Network => format!(
                "Network error after {attempts} attempts. Please check your connection."
            ),
            ErrorCategory::Timeout => format!(
                "Request timed out after {attempts} attempts. The website may be slow."
            ),
            ErrorCategory::ServerError => format!(
                "Server error after {attempts} attempts. The website may be having issues."
            ),
            ErrorCategory::RateLimited => {
                "Rate limited by the website. Please wait before trying again.".to_string()
            }
            ErrorCategory::Forbidden => {
                "Access denied by the website. This product may require login.".to_string()
            }
            ErrorCategory::NotFound => {
                "Product page not found (404). The URL may be incorrect.".to_string()
            }
            ErrorCategory::Blocked => {
                "Blocked by the website. CAPTCHA or login may be required.".to_string()
            }
            ErrorCategory::ParseError => {
                "Failed to extract product data. The page format may have changed.".to_string()
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub struct RetryOutcome<T> {
    pub result: Result<T, ScrapeError>,
    pub attempts: u32,
    pub category: Option<ErrorCategory>,
    pub message: Option<String>,
}

pub struct RetryHandler {
    policy: RetryPolicy,
}

impl RetryHandler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Run `op` until it succeeds or the error runs out of attempts.
    /// `on_retry` fires before each re-attempt (the engine uses it to rotate
    /// user agents on bot-detection blocks). Returns the final result plus
    /// the attempt count and, on failure, the category and canned message.
    pub async fn execute<T, F, Fut, H>(&self, mut op: F, mut on_retry: H) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ScrapeError>>,
        H: FnMut(&ScrapeError),
    {
        let mut attempt: u32 = 0;
        loop {
            match op().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt + 1,
                        category: None,
                        message: None,
                    }
                }
                Err(err) => {
                    let category = categorize_error(&err);
                    if !self.policy.should_retry_error(&err, attempt) {
                        let attempts = attempt + 1;
                        return RetryOutcome {
                            message: Some(self.policy.user_message(category, attempts)),
                            result: Err(err),
                            attempts,
                            category: Some(category),
                        };
                    }
                    let delay = self.policy.delay_for_error(&err, attempt);
                    debug!(
                        category = category.key(),
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        "retrying after {err}",
                    );
                    on_retry(&err);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn variant_categorization() {
        assert_eq!(
            categorize_error(&ScrapeError::Timeout("deadline".into())),
            ErrorCategory::Timeout
        );
        assert_eq!(
            categorize_error(&ScrapeError::NotFound("404".into())),
            ErrorCategory::NotFound
        );
        assert_eq!(
            categorize_error(&ScrapeError::ParseFailure("no price".into())),
            ErrorCategory::ParseError
        );
        assert_eq!(
            categorize_error(&ScrapeError::Blocked {
                kind: BlockType::Captcha,
                message: "captcha".into()
            }),
            ErrorCategory::Blocked
        );
        assert_eq!(
            categorize_error(&ScrapeError::Blocked {
                kind: BlockType::AccessDenied,
                message: "403".into()
            }),
            ErrorCategory::Forbidden
        );
    }

    #[test]
    fn message_token_categorization() {
        assert_eq!(
            categorize_error(&ScrapeError::Network("server returned 503".into())),
            ErrorCategory::ServerError
        );
        assert_eq!(
            categorize_error(&ScrapeError::Network("status 429 from upstream".into())),
            ErrorCategory::RateLimited
        );
        assert_eq!(
            categorize_error(&ScrapeError::Network("connection reset by peer".into())),
            ErrorCategory::Network
        );
        assert_eq!(
            categorize_error(&ScrapeError::Network("read timeout".into())),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn attempt_caps_per_category() {
        let policy = RetryPolicy::default();
        assert!(!policy.should_retry(ErrorCategory::NotFound, 0));
        assert!(policy.should_retry(ErrorCategory::Forbidden, 0));
        assert!(!policy.should_retry(ErrorCategory::Forbidden, 1));
        assert!(policy.should_retry(ErrorCategory::Blocked, 1));
        assert!(!policy.should_retry(ErrorCategory::Blocked, 2));
        assert!(policy.should_retry(ErrorCategory::Network, 2));
        assert!(!policy.should_retry(ErrorCategory::Network, 3));
    }

    #[test]
    fn delays_follow_schedule_with_bounded_jitter() {
        let policy = RetryPolicy::default();
        for (attempt, base) in [(0u32, 5.0f64), (1, 10.0), (2, 20.0), (5, 20.0)] {
            let d = policy.delay_for(ErrorCategory::RateLimited, attempt).as_secs_f64();
            assert!(d >= base * 0.8 - 1e-9 && d <= base * 1.2 + 1e-9, "attempt {attempt}: {d}");
        }
    }

    #[test]
    fn not_found_message_is_canned() {
        let policy = RetryPolicy::default();
        assert_eq!(
            policy.user_message(ErrorCategory::NotFound, 1),
            "Product page not found (404). The URL may be incorrect."
        );
    }

    #[test]
    fn evasion_policy_governs_block_retries() {
        let policy = RetryPolicy::default();
        let captcha = ScrapeError::Blocked {
            kind: BlockType::Captcha,
            message: "captcha wall".into(),
        };
        assert!(!policy.should_retry_error(&captcha, 0));

        let geo = ScrapeError::Blocked {
            kind: BlockType::GeoBlocked,
            message: "not available in your region".into(),
        };
        assert!(!policy.should_retry_error(&geo, 0));

        let bot = ScrapeError::Blocked {
            kind: BlockType::BotDetection,
            message: "checking your browser".into(),
        };
        assert!(policy.should_retry_error(&bot, 0));
        assert!(policy.should_retry_error(&bot, 1));
        assert!(!policy.should_retry_error(&bot, 2));
        assert_eq!(
            policy.delay_for_error(&bot, 0),
            Duration::from_secs(5)
        );

        let maintenance = ScrapeError::Blocked {
            kind: BlockType::Maintenance,
            message: "be right back".into(),
        };
        assert!(policy.should_retry_error(&maintenance, 1));

        // A 429 block retries on the rate_limited schedule (5s base, ±20%).
        let rate_limited = ScrapeError::Blocked {
            kind: BlockType::RateLimited,
            message: "status 429".into(),
        };
        assert!(policy.should_retry_error(&rate_limited, 0));
        let delay = policy.delay_for_error(&rate_limited, 0).as_secs_f64();
        assert!((4.0..=6.0).contains(&delay), "{delay}");
    }

    #[tokio::test(start_paused = true)]
    async fn execute_retries_until_success() {
        let handler = RetryHandler::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);
        let outcome = handler
            .execute(
                || {
                    let n = calls.fetch_add(1, Ordering::SeqCst);
                    async move {
                        if n < 2 {
                            Err(ScrapeError::Network("connection refused".into()))
                        } else {
                            Ok(42u32)
                        }
                    }
                },
                |_| {},
            )
            .await;
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn execute_never_retries_not_found() {
        let handler = RetryHandler::new(RetryPolicy::default());
        let calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = handler
            .execute(
                || {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async { Err(ScrapeError::NotFound("gone".into())) }
                },
                |_| {},
            )
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(outcome.category, Some(ErrorCategory::NotFound));
        assert!(outcome.message.unwrap().contains("404"));
    }

    #[tokio::test(start_paused = true)]
    async fn retry_hook_fires_between_attempts() {
        let handler = RetryHandler::new(RetryPolicy::default());
        let hook_calls = AtomicU32::new(0);
        let outcome: RetryOutcome<()> = handler
            .execute(
                || async {
                    Err(ScrapeError::Blocked {
                        kind: BlockType::BotDetection,
                        message: "unusual traffic".into(),
                    })
                },
                |_| {
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;
        // Two retries allowed for bot detection: hook runs twice, three
        // attempts total.
        assert_eq!(hook_calls.load(Ordering::SeqCst), 2);
        assert_eq!(outcome.attempts, 3);
    }
}
