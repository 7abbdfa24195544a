use crate::error::{AppError, Result};

/// Sliding-window length for both the global and per-host scrape limits.
pub const RATE_WINDOW_SECS: u64 = 60;

/// Computed rate-limit waits above this fail with retry_after instead of sleeping.
pub const RATE_WAIT_CAP_SECS: u64 = 30;

/// robots.txt cache TTL.
pub const ROBOTS_CACHE_TTL_SECS: u64 = 3600;

/// robots.txt fetch budget.
pub const ROBOTS_FETCH_TIMEOUT_SECS: u64 = 10;

/// Products per chunk when batch-scraping a single host.
pub const BATCH_CHUNK_SIZE: usize = 10;

/// Delay between chunks within one host.
pub const INTER_BATCH_DELAY_SECS: f64 = 1.0;

/// Delay between distinct hosts in a batch run.
pub const INTER_STORE_DELAY_SECS: f64 = 2.0;

/// Scheduler poll cadence for due jobs and persisted schedules.
pub const SCHEDULER_TICK_SECS: u64 = 30;

/// Missed firings older than this are skipped instead of coalesced.
pub const MISFIRE_GRACE_SECS: u64 = 3600;

/// Max concurrent instances of one scheduled job.
pub const JOB_MAX_INSTANCES: usize = 3;

/// Jitter applied to the daily scrape so the fleet doesn't fire as one.
pub const DAILY_SCRAPE_JITTER_SECS: u64 = 1800;

/// Grace the scheduler gives in-flight jobs on shutdown.
pub const SHUTDOWN_GRACE_SECS: u64 = 30;

/// Rolling window for store health computation.
pub const HEALTH_WINDOW_DAYS: i64 = 7;

/// Below this many scrapes in the window a store is assumed healthy.
pub const HEALTH_MIN_SCRAPES: i64 = 5;

/// Cached fetched pages live this long when use_cache is requested.
pub const PAGE_CACHE_TTL_SECS: u64 = 900;

/// HTML handed to the LLM (extraction fallback and selector regeneration) is
/// truncated to this many characters, biased toward product markers.
pub const LLM_HTML_MAX_CHARS: usize = 50_000;

/// Minimum regenerator confidence to accept a selector candidate.
pub const MIN_REGEN_CONFIDENCE: f64 = 0.7;

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub log_level: String,

    // LLM (OpenRouter) + embeddings (OpenAI)
    pub openrouter_api_key: String,
    pub openai_api_key: String,
    pub primary_model: String,
    pub fallback_models: Vec<String>,

    // Email
    pub resend_api_key: String,
    pub user_email: String,
    pub from_email: String,

    // Budgets and limits
    pub daily_token_limit: u64,
    pub max_scrapes_per_minute: u32,
    pub max_llm_requests_per_minute: u32,
    pub request_timeout_seconds: u64,
    pub operation_timeout_seconds: u64,

    // Scraper
    pub max_concurrent_browsers: usize,
    pub memory_threshold_percent: f64,
    pub page_load_delay_seconds: f64,

    // Self-healing
    pub max_consecutive_failures: i64,
    pub max_healing_attempts: u32,
    pub store_failure_threshold: f64,

    // Retention
    pub scrape_log_retention_days: i64,
    pub notification_retention_days: i64,

    // Scheduler
    pub default_check_hour: u8,
    pub scheduler_timezone: String,
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let default_check_hour = env_parse::<u8>("DEFAULT_CHECK_HOUR", 6);
        if default_check_hour > 23 {
            return Err(AppError::Config(
                "DEFAULT_CHECK_HOUR must be between 0 and 23".to_string(),
            ));
        }

        let memory_threshold_percent = env_parse::<f64>("MEMORY_THRESHOLD_PERCENT", 70.0);
        if !(0.0..=100.0).contains(&memory_threshold_percent) {
            return Err(AppError::Config(
                "MEMORY_THRESHOLD_PERCENT must be between 0 and 100".to_string(),
            ));
        }

        Ok(Self {
            database_url: env_or("DATABASE_URL", "sqlite:pricewatch.db"),
            log_level: env_or("LOG_LEVEL", "info"),
            openrouter_api_key: env_or("OPENROUTER_API_KEY", ""),
            openai_api_key: env_or("OPENAI_API_KEY", ""),
            primary_model: env_or("PRIMARY_MODEL", "google/gemini-2.0-flash-exp:free"),
            fallback_models: vec![
                env_or("FALLBACK_MODEL_1", "meta-llama/llama-3.3-70b-instruct:free"),
                env_or("FALLBACK_MODEL_2", "anthropic/claude-3.5-haiku"),
            ],
            resend_api_key: env_or("RESEND_API_KEY", ""),
            user_email: env_or("USER_EMAIL", ""),
            from_email: env_or("FROM_EMAIL", "alerts@pricewatch.app"),
            daily_token_limit: env_parse("DAILY_TOKEN_LIMIT", 100_000),
            max_scrapes_per_minute: env_parse("MAX_SCRAPES_PER_MINUTE", 10),
            max_llm_requests_per_minute: env_parse("MAX_LLM_REQUESTS_PER_MINUTE", 30),
            request_timeout_seconds: env_parse("REQUEST_TIMEOUT_SECONDS", 30),
            operation_timeout_seconds: env_parse("OPERATION_TIMEOUT_SECONDS", 120),
            max_concurrent_browsers: env_parse("MAX_CONCURRENT_BROWSERS", 3),
            memory_threshold_percent,
            page_load_delay_seconds: env_parse("PAGE_LOAD_DELAY_SECONDS", 1.0),
            max_consecutive_failures: env_parse("MAX_CONSECUTIVE_FAILURES", 3),
            max_healing_attempts: env_parse("MAX_HEALING_ATTEMPTS", 3),
            store_failure_threshold: env_parse("STORE_FAILURE_THRESHOLD", 0.5),
            scrape_log_retention_days: env_parse("SCRAPE_LOG_RETENTION_DAYS", 30),
            notification_retention_days: env_parse("NOTIFICATION_RETENTION_DAYS", 90),
            default_check_hour,
            scheduler_timezone: env_or("SCHEDULER_TIMEZONE", "UTC"),
        })
    }

    /// Cron expression for the default daily scrape, derived from DEFAULT_CHECK_HOUR.
    pub fn default_scrape_cron(&self) -> String {
        format!("0 {} * * *", self.default_check_hour)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: "sqlite::memory:".to_string(),
            log_level: "info".to_string(),
            openrouter_api_key: String::new(),
            openai_api_key: String::new(),
            primary_model: "google/gemini-2.0-flash-exp:free".to_string(),
            fallback_models: vec![
                "meta-llama/llama-3.3-70b-instruct:free".to_string(),
                "anthropic/claude-3.5-haiku".to_string(),
            ],
            resend_api_key: String::new(),
            user_email: String::new(),
            from_email: "alerts@pricewatch.app".to_string(),
            daily_token_limit: 100_000,
            max_scrapes_per_minute: 10,
            max_llm_requests_per_minute: 30,
            request_timeout_seconds: 30,
            operation_timeout_seconds: 120,
            max_concurrent_browsers: 3,
            memory_threshold_percent: 70.0,
            page_load_delay_seconds: 1.0,
            max_consecutive_failures: 3,
            max_healing_attempts: 3,
            store_failure_threshold: 0.5,
            scrape_log_retention_days: 30,
            notification_retention_days: 90,
            default_check_hour: 6,
            scheduler_timezone: "UTC".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_scrape_cron_uses_check_hour() {
        let cfg = Config {
            default_check_hour: 6,
            ..Default::default()
        };
        assert_eq!(cfg.default_scrape_cron(), "0 6 * * *");
    }
}
