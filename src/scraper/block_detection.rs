use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Block taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockType {
    Captcha,
    LoginRequired,
    RateLimited,
    GeoBlocked,
    BotDetection,
    EmptyResponse,
    AccessDenied,
    AgeGate,
    Maintenance,
    NotFound,
}

impl std::fmt::Display for BlockType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BlockType::Captcha => "captcha",
            BlockType::LoginRequired => "login_required",
            BlockType::RateLimited => "rate_limited",
            BlockType::GeoBlocked => "geo_blocked",
            BlockType::BotDetection => "bot_detection",
            BlockType::EmptyResponse => "empty_response",
            BlockType::AccessDenied => "access_denied",
            BlockType::AgeGate => "age_gate",
            BlockType::Maintenance => "maintenance",
            BlockType::NotFound => "not_found",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct BlockDetectionResult {
    pub is_blocked: bool,
    pub block_type: Option<BlockType>,
    pub confidence: f64,
    pub indicators: Vec<String>,
}

impl BlockDetectionResult {
    fn clear() -> Self {
        Self {
            is_blocked: false,
            block_type: None,
            confidence: 0.0,
            indicators: Vec::new(),
        }
    }

    fn blocked(block_type: BlockType, confidence: f64, indicator: &str) -> Self {
        Self {
            is_blocked: true,
            block_type: Some(block_type),
            confidence,
            indicators: vec![indicator.to_string()],
        }
    }
}

// ---------------------------------------------------------------------------
// Pattern tables
// ---------------------------------------------------------------------------

const CAPTCHA_PATTERNS: &[&str] = &[
    "recaptcha",
    "hcaptcha",
    "cf-turnstile",
    "datadome",
    "px-captcha",
    "solve the captcha",
    "verify you are human",
    "are you a robot",
];

const BOT_DETECTION_PATTERNS: &[&str] = &[
    "pardon our interruption",
    "unusual traffic",
    "checking your browser",
    "cloudflare",
    "automated access",
    "detected unusual activity",
    "access to this page has been denied",
];

const RATE_LIMIT_PATTERNS: &[&str] = &[
    "too many requests",
    "rate limit exceeded",
    "slow down",
    "requests are coming too fast",
];

const GEO_BLOCK_PATTERNS: &[&str] = &[
    "not available in your country",
    "not available in your region",
    "unavailable in your location",
    "geo-restricted",
];

const AGE_GATE_PATTERNS: &[&str] = &[
    "verify your age",
    "age verification",
    "must be 18",
    "must be 19",
    "must be 21",
];

const MAINTENANCE_PATTERNS: &[&str] = &[
    "under maintenance",
    "scheduled maintenance",
    "be right back",
    "temporarily unavailable",
];

// Product pages routinely link to login; only the strong "continue" phrasings
// count as a login wall.
const LOGIN_WALL_PATTERNS: &[&str] = &["sign in to continue", "log in to continue"];

const CDN_BLOCK_HEADERS: &[&str] = &["cf-ray", "x-sucuri-id", "x-akamai-request-id", "x-cdn"];

fn contains_any(haystack: &str, patterns: &'static [&'static str]) -> Option<&'static str> {
    patterns.iter().find(|p| haystack.contains(*p)).copied()
}

// ---------------------------------------------------------------------------
// Detection
// ---------------------------------------------------------------------------

/// Classify a fetched page. First matching rule wins; header keys are
/// expected lowercased.
pub fn detect_block(
    html: &str,
    status_code: u16,
    headers: &HashMap<String, String>,
) -> BlockDetectionResult {
    if status_code == 429 {
        return BlockDetectionResult::blocked(BlockType::RateLimited, 0.95, "status 429");
    }
    if status_code == 404 {
        return BlockDetectionResult::blocked(BlockType::NotFound, 0.95, "status 404");
    }

    let body = html.trim();
    if body.len() < 100 {
        return BlockDetectionResult::blocked(
            BlockType::EmptyResponse,
            0.8,
            "body shorter than 100 bytes",
        );
    }

    let lower = body.to_lowercase();

    if status_code == 403 {
        if let Some(h) = CDN_BLOCK_HEADERS.iter().find(|h| headers.contains_key(**h)) {
            return BlockDetectionResult::blocked(BlockType::BotDetection, 0.9, h);
        }
        if let Some(p) = contains_any(&lower, CAPTCHA_PATTERNS) {
            return BlockDetectionResult::blocked(BlockType::Captcha, 0.9, p);
        }
        return BlockDetectionResult::blocked(BlockType::AccessDenied, 0.8, "status 403");
    }

    if status_code == 503 {
        if let Some(p) = contains_any(&lower, MAINTENANCE_PATTERNS) {
            return BlockDetectionResult::blocked(BlockType::Maintenance, 0.85, p);
        }
    }

    if let Some(p) = contains_any(&lower, CAPTCHA_PATTERNS) {
        return BlockDetectionResult::blocked(BlockType::Captcha, 0.85, p);
    }
    if let Some(p) = contains_any(&lower, BOT_DETECTION_PATTERNS) {
        return BlockDetectionResult::blocked(BlockType::BotDetection, 0.8, p);
    }
    if let Some(p) = contains_any(&lower, LOGIN_WALL_PATTERNS) {
        return BlockDetectionResult::blocked(BlockType::LoginRequired, 0.75, p);
    }
    if let Some(p) = contains_any(&lower, RATE_LIMIT_PATTERNS) {
        return BlockDetectionResult::blocked(BlockType::RateLimited, 0.7, p);
    }
    if let Some(p) = contains_any(&lower, GEO_BLOCK_PATTERNS) {
        return BlockDetectionResult::blocked(BlockType::GeoBlocked, 0.7, p);
    }
    if let Some(p) = contains_any(&lower, AGE_GATE_PATTERNS) {
        return BlockDetectionResult::blocked(BlockType::AgeGate, 0.7, p);
    }

    BlockDetectionResult::clear()
}

// ---------------------------------------------------------------------------
// Evasion policy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvasionAction {
    /// No retry will help.
    Terminal,
    /// Sleep the given duration, then retry.
    SleepRetry(Duration),
    /// Rotate the user agent, wait briefly, retry a bounded number of times.
    RotateUserAgent {
        delay: Duration,
        max_retries: u32,
    },
    /// Transient condition; retry on the normal delayed schedule.
    DelayedRetry,
}

pub fn evasion_policy(block_type: BlockType) -> EvasionAction {
    match block_type {
        BlockType::Captcha
        | BlockType::LoginRequired
        | BlockType::GeoBlocked
        | BlockType::AgeGate
        | BlockType::NotFound => EvasionAction::Terminal,
        BlockType::RateLimited => EvasionAction::SleepRetry(Duration::from_secs(60)),
        BlockType::BotDetection | BlockType::AccessDenied => EvasionAction::RotateUserAgent {
            delay: Duration::from_secs(5),
            max_retries: 2,
        },
        BlockType::EmptyResponse | BlockType::Maintenance => EvasionAction::DelayedRetry,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_headers() -> HashMap<String, String> {
        HashMap::new()
    }

    fn long_body(content: &str) -> String {
        format!("{content}{}", " filler".repeat(30))
    }

    #[test]
    fn status_429_is_rate_limited() {
        let result = detect_block("", 429, &no_headers());
        assert!(result.is_blocked);
        assert_eq!(result.block_type, Some(BlockType::RateLimited));
    }

    #[test]
    fn status_404_is_not_found() {
        let result = detect_block(&long_body("missing"), 404, &no_headers());
        assert_eq!(result.block_type, Some(BlockType::NotFound));
    }

    #[test]
    fn short_body_is_empty_response() {
        let result = detect_block("   ", 200, &no_headers());
        assert_eq!(result.block_type, Some(BlockType::EmptyResponse));
    }

    #[test]
    fn forbidden_with_cdn_header_is_bot_detection() {
        let mut headers = HashMap::new();
        headers.insert("cf-ray".to_string(), "8a1b2c3d".to_string());
        let result = detect_block(&long_body("forbidden"), 403, &headers);
        assert_eq!(result.block_type, Some(BlockType::BotDetection));
    }

    #[test]
    fn forbidden_with_captcha_body_is_captcha() {
        let result = detect_block(&long_body("please solve the recaptcha"), 403, &no_headers());
        assert_eq!(result.block_type, Some(BlockType::Captcha));
    }

    #[test]
    fn forbidden_without_indicators_is_access_denied() {
        let result = detect_block(&long_body("forbidden"), 403, &no_headers());
        assert_eq!(result.block_type, Some(BlockType::AccessDenied));
    }

    #[test]
    fn captcha_body_on_200_is_captcha() {
        let result = detect_block(
            &long_body("<div class=\"g-recaptcha\"></div>"),
            200,
            &no_headers(),
        );
        assert_eq!(result.block_type, Some(BlockType::Captcha));
    }

    #[test]
    fn bot_detection_phrases_match() {
        let result = detect_block(
            &long_body("Pardon Our Interruption — checking your browser"),
            200,
            &no_headers(),
        );
        assert_eq!(result.block_type, Some(BlockType::BotDetection));
    }

    #[test]
    fn login_link_alone_is_not_a_wall() {
        let result = detect_block(
            &long_body("<a href=\"/login\">Sign in</a> <h1>Blue Widget</h1> $19.99"),
            200,
            &no_headers(),
        );
        assert!(!result.is_blocked);

        let walled = detect_block(
            &long_body("You must sign in to continue viewing this page"),
            200,
            &no_headers(),
        );
        assert_eq!(walled.block_type, Some(BlockType::LoginRequired));
    }

    #[test]
    fn clean_product_page_is_not_blocked() {
        let result = detect_block(
            &long_body("<h1>Blue Widget</h1><span class=\"price\">$19.99</span>"),
            200,
            &no_headers(),
        );
        assert!(!result.is_blocked);
        assert!(result.block_type.is_none());
    }

    #[test]
    fn evasion_policies_match_taxonomy() {
        assert_eq!(evasion_policy(BlockType::Captcha), EvasionAction::Terminal);
        assert_eq!(evasion_policy(BlockType::NotFound), EvasionAction::Terminal);
        assert_eq!(
            evasion_policy(BlockType::RateLimited),
            EvasionAction::SleepRetry(Duration::from_secs(60))
        );
        assert!(matches!(
            evasion_policy(BlockType::BotDetection),
            EvasionAction::RotateUserAgent { max_retries: 2, .. }
        ));
        assert_eq!(
            evasion_policy(BlockType::Maintenance),
            EvasionAction::DelayedRetry
        );
    }
}
