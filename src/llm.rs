use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::ScrapeError;

/// Rough chars-per-token estimate used for budget accounting.
const CHARS_PER_TOKEN: u64 = 4;

const OPENROUTER_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

// ---------------------------------------------------------------------------
// Token budget
// ---------------------------------------------------------------------------

struct DayCounter {
    day: NaiveDate,
    used: u64,
}

struct MinuteWindow {
    requests: Vec<Instant>,
    limit: usize,
}

/// Shared budget for every LLM-using path: a daily token ceiling that rolls
/// over at UTC midnight, plus a per-minute sliding-window request limiter.
/// Budget rejections are distinct errors and must not be retried.
pub struct TokenBudget {
    daily_limit: u64,
    day: Mutex<DayCounter>,
    minute: Mutex<MinuteWindow>,
}

impl TokenBudget {
    pub fn new(daily_limit: u64, requests_per_minute: usize) -> Self {
        Self {
            daily_limit,
            day: Mutex::new(DayCounter {
                day: Utc::now().date_naive(),
                used: 0,
            }),
            minute: Mutex::new(MinuteWindow {
                requests: Vec::new(),
                limit: requests_per_minute,
            }),
        }
    }

    /// Reserve `estimate` tokens and one request slot. Fails with TokenLimit
    /// when the daily ceiling would be crossed, LlmRateLimit when the minute
    /// window is full.
    pub async fn reserve(&self, estimate: u64) -> Result<(), ScrapeError> {
        {
            let mut day = self.day.lock().await;
            let today = Utc::now().date_naive();
            if day.day != today {
                day.day = today;
                day.used = 0;
            }
            if day.used + estimate > self.daily_limit {
                return Err(ScrapeError::TokenLimit {
                    used: day.used,
                    limit: self.daily_limit,
                });
            }
        }

        let mut minute = self.minute.lock().await;
        let now = Instant::now();
        minute
            .requests
            .retain(|t| now.duration_since(*t) < Duration::from_secs(60));
        if minute.requests.len() >= minute.limit {
            return Err(ScrapeError::LlmRateLimit);
        }
        minute.requests.push(now);
        Ok(())
    }

    /// Debit actual usage after a request completes.
    pub async fn debit(&self, tokens: u64) {
        let mut day = self.day.lock().await;
        let today = Utc::now().date_naive();
        if day.day != today {
            day.day = today;
            day.used = 0;
        }
        day.used += tokens;
    }

    pub async fn used_today(&self) -> u64 {
        let day = self.day.lock().await;
        if day.day == Utc::now().date_naive() {
            day.used
        } else {
            0
        }
    }
}

pub fn estimate_tokens(text: &str) -> u64 {
    (text.len() as u64) / CHARS_PER_TOKEN + 1
}

// ---------------------------------------------------------------------------
// Completion model seam
// ---------------------------------------------------------------------------

/// The completion seam the extraction fallback and the selector regenerator
/// call through. Implementations return a best-effort JSON string.
#[async_trait]
pub trait CompletionModel: Send + Sync {
    async fn complete(&self, prompt: &str) -> Result<String, ScrapeError>;
}

// ---------------------------------------------------------------------------
// OpenRouter client
// ---------------------------------------------------------------------------

/// OpenRouter chat-completions client with a primary/fallback model chain.
/// Every request passes through the shared [`TokenBudget`].
pub struct LlmClient {
    client: reqwest::Client,
    api_key: String,
    models: Vec<String>,
    budget: std::sync::Arc<TokenBudget>,
}

impl LlmClient {
    pub fn from_config(config: &Config, budget: std::sync::Arc<TokenBudget>) -> Option<Self> {
        if config.openrouter_api_key.is_empty() {
            return None;
        }
        let mut models = vec![config.primary_model.clone()];
        models.extend(config.fallback_models.iter().cloned());

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .ok()?;

        Some(Self {
            client,
            api_key: config.openrouter_api_key.clone(),
            models,
            budget,
        })
    }

    async fn complete_with_model(
        &self,
        model: &str,
        prompt: &str,
    ) -> Result<String, ScrapeError> {
        let body = json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": 0.1,
        });

        let response = self
            .client
            .post(OPENROUTER_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| ScrapeError::Llm(format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Llm(format!("{model} returned {status}")));
        }

        let payload: serde_json::Value = response
            .json()
            .await
            .map_err(|e| ScrapeError::Llm(format!("invalid response body: {e}")))?;

        // Prefer reported usage; fall back to a character estimate.
        let used = payload
            .get("usage")
            .and_then(|u| u.get("total_tokens"))
            .and_then(|t| t.as_u64());

        let content = payload
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| ScrapeError::Llm(format!("{model} returned no content")))?
            .to_string();

        self.budget
            .debit(used.unwrap_or_else(|| estimate_tokens(prompt) + estimate_tokens(&content)))
            .await;

        Ok(content)
    }
}

#[async_trait]
impl CompletionModel for LlmClient {
    async fn complete(&self, prompt: &str) -> Result<String, ScrapeError> {
        self.budget.reserve(estimate_tokens(prompt)).await?;

        let mut last_error = ScrapeError::Llm("no models configured".to_string());
        for model in &self.models {
            match self.complete_with_model(model, prompt).await {
                Ok(content) => {
                    debug!(model, "completion succeeded");
                    return Ok(content);
                }
                Err(e) => {
                    warn!(model, "completion failed, dropping to next tier: {e}");
                    last_error = e;
                }
            }
        }
        Err(last_error)
    }
}

/// Strip markdown code fences an LLM may wrap around JSON output.
pub fn strip_code_fences(response: &str) -> &str {
    let trimmed = response.trim();
    if let Some(start) = trimmed.find("```") {
        let after = &trimmed[start + 3..];
        let after = after.strip_prefix("json").unwrap_or(after);
        if let Some(end) = after.find("```") {
            return after[..end].trim();
        }
        return after.trim();
    }
    trimmed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn daily_ceiling_rejects_with_distinct_error() {
        let budget = TokenBudget::new(100, 30);
        budget.debit(95).await;
        let err = budget.reserve(10).await.unwrap_err();
        assert!(matches!(err, ScrapeError::TokenLimit { .. }));
        // Small reservations still fit.
        budget.reserve(5).await.unwrap();
    }

    #[tokio::test]
    async fn minute_window_limits_request_rate() {
        let budget = TokenBudget::new(1_000_000, 2);
        budget.reserve(1).await.unwrap();
        budget.reserve(1).await.unwrap();
        let err = budget.reserve(1).await.unwrap_err();
        assert!(matches!(err, ScrapeError::LlmRateLimit));
    }

    #[test]
    fn code_fence_stripping() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(
            strip_code_fences("Here you go:\n```json\n{\"a\":1}\n```"),
            "{\"a\":1}"
        );
    }

    #[test]
    fn token_estimate_scales_with_length() {
        assert_eq!(estimate_tokens(""), 1);
        assert_eq!(estimate_tokens(&"x".repeat(400)), 101);
    }
}
