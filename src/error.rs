use thiserror::Error;

use crate::scraper::block_detection::BlockType;
use crate::types::ScrapeErrorType;

/// Errors raised inside a single scrape attempt. The retry engine inspects
/// the variant (and embedded status tokens in the message) to decide whether
/// and how to retry; callers persist the mapped [`ScrapeErrorType`].
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("blocked ({kind}): {message}")]
    Blocked { kind: BlockType, message: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("parse failure: {0}")]
    ParseFailure(String),

    #[error("price validation failed: {0}")]
    PriceValidation(String),

    #[error("page structure changed: {0}")]
    StructureChange(String),

    #[error("blocked by robots.txt: {0}")]
    RobotsBlocked(String),

    #[error("rate limit exceeded for {domain}, retry after {retry_after}s")]
    RateLimited { domain: String, retry_after: u64 },

    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    #[error("unsupported store: {0}")]
    UnsupportedStore(String),

    #[error("URL resolves to private IP: {0}")]
    PrivateIp(String),

    #[error("daily LLM token budget exhausted ({used}/{limit})")]
    TokenLimit { used: u64, limit: u64 },

    #[error("LLM request rate limit exceeded")]
    LlmRateLimit,

    #[error("LLM error: {0}")]
    Llm(String),
}

impl ScrapeError {
    /// The kind persisted on scrape logs. URL and LLM errors fold into the
    /// nearest scrape kind; they terminate before any fetch happens.
    pub fn error_type(&self) -> ScrapeErrorType {
        match self {
            ScrapeError::Network(_) => ScrapeErrorType::NetworkError,
            ScrapeError::Timeout(_) => ScrapeErrorType::Timeout,
            ScrapeError::Blocked { kind, .. } => match kind {
                BlockType::NotFound => ScrapeErrorType::NotFound,
                _ => ScrapeErrorType::Blocked,
            },
            ScrapeError::NotFound(_) => ScrapeErrorType::NotFound,
            ScrapeError::ParseFailure(_) => ScrapeErrorType::ParseFailure,
            ScrapeError::PriceValidation(_) => ScrapeErrorType::PriceValidation,
            ScrapeError::StructureChange(_) => ScrapeErrorType::StructureChange,
            ScrapeError::RobotsBlocked(_) => ScrapeErrorType::RobotsBlocked,
            ScrapeError::RateLimited { .. } => ScrapeErrorType::Blocked,
            ScrapeError::InvalidUrl(_)
            | ScrapeError::UnsupportedStore(_)
            | ScrapeError::PrivateIp(_) => ScrapeErrorType::NetworkError,
            ScrapeError::TokenLimit { .. }
            | ScrapeError::LlmRateLimit
            | ScrapeError::Llm(_) => ScrapeErrorType::ParseFailure,
        }
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Database migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scrape error: {0}")]
    Scrape(#[from] ScrapeError),

    #[error("Notification error: {0}")]
    Notification(String),

    #[error("Schedule error: {0}")]
    Schedule(String),

    #[error("Record not found: {0}")]
    RecordNotFound(String),

    #[error("Duplicate record: {0}")]
    DuplicateRecord(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, AppError>;
