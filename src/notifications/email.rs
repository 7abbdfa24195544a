use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{info, warn};

use crate::config::Config;

const RESEND_URL: &str = "https://api.resend.com/emails";

/// Delivery attempts per message.
const MAX_SEND_ATTEMPTS: u32 = 3;

/// Backoff floor and ceiling between attempts.
const BACKOFF_MIN: Duration = Duration::from_secs(2);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct EmailResult {
    pub success: bool,
    pub message_id: Option<String>,
    pub error_message: Option<String>,
}

/// Tag attached to outgoing messages for provider-side filtering.
#[derive(Debug, Clone)]
pub struct EmailTag {
    pub name: String,
    pub value: String,
}

/// The delivery seam. The production implementation speaks the Resend HTTPS
/// API; tests substitute a recording transport.
#[async_trait]
pub trait EmailTransport: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
        tags: &[EmailTag],
    ) -> EmailResult;
}

// ---------------------------------------------------------------------------
// Resend channel
// ---------------------------------------------------------------------------

pub struct ResendChannel {
    client: reqwest::Client,
    api_key: String,
    from_email: String,
}

impl ResendChannel {
    pub fn from_config(config: &Config) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .unwrap_or_default();
        Self {
            client,
            api_key: config.resend_api_key.clone(),
            from_email: config.from_email.clone(),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.api_key.is_empty() && !self.from_email.is_empty()
    }

    async fn send_once(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
        tags: &[EmailTag],
    ) -> Result<String, SendFailure> {
        let mut body = json!({
            "from": self.from_email,
            "to": [to],
            "subject": subject,
            "html": html,
        });
        if let Some(text) = text {
            body["text"] = json!(text);
        }
        if !tags.is_empty() {
            body["tags"] = json!(tags
                .iter()
                .map(|t| json!({"name": t.name, "value": t.value}))
                .collect::<Vec<_>>());
        }

        let response = self
            .client
            .post(RESEND_URL)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| SendFailure::Transport(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            let payload: serde_json::Value = response
                .json()
                .await
                .map_err(|e| SendFailure::Transport(e.to_string()))?;
            Ok(payload
                .get("id")
                .and_then(|i| i.as_str())
                .unwrap_or_default()
                .to_string())
        } else if status.is_server_error() || status.as_u16() == 429 {
            Err(SendFailure::Transport(format!("provider returned {status}")))
        } else {
            // 4xx other than 429: invalid address, bad payload — retrying
            // cannot help.
            Err(SendFailure::Terminal(format!(
                "provider rejected message: {status}"
            )))
        }
    }
}

enum SendFailure {
    /// Connect/transport-level failure, eligible for backoff and retry.
    Transport(String),
    /// Provider rejected the message; do not retry.
    Terminal(String),
}

impl SendFailure {
    fn message(&self) -> &str {
        match self {
            SendFailure::Transport(m) | SendFailure::Terminal(m) => m,
        }
    }
}

#[async_trait]
impl EmailTransport for ResendChannel {
    /// Up to three attempts with exponential backoff (2 s doubling, capped at
    /// 30 s) on transport errors; terminal rejections fail immediately.
    async fn send(
        &self,
        to: &str,
        subject: &str,
        html: &str,
        text: Option<&str>,
        tags: &[EmailTag],
    ) -> EmailResult {
        if !self.is_configured() {
            warn!("email channel not configured - skipping send");
            return EmailResult {
                success: false,
                message_id: None,
                error_message: Some("Email channel not configured".to_string()),
            };
        }

        let mut backoff = BACKOFF_MIN;
        let mut last_error = String::new();

        for attempt in 1..=MAX_SEND_ATTEMPTS {
            match self.send_once(to, subject, html, text, tags).await {
                Ok(message_id) => {
                    info!(to, subject, message_id, "email sent");
                    return EmailResult {
                        success: true,
                        message_id: Some(message_id),
                        error_message: None,
                    };
                }
                Err(SendFailure::Terminal(message)) => {
                    warn!(to, subject, "email rejected: {message}");
                    return EmailResult {
                        success: false,
                        message_id: None,
                        error_message: Some(message),
                    };
                }
                Err(failure) => {
                    last_error = failure.message().to_string();
                    warn!(to, attempt, "email send failed: {last_error}");
                    if attempt < MAX_SEND_ATTEMPTS {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        }

        EmailResult {
            success: false,
            message_id: None,
            error_message: Some(last_error),
        }
    }
}
