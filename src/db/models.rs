use chrono::{DateTime, Utc};
use sqlx::FromRow;

use crate::types::{
    AlertType, ExtractionStrategy, NotificationStatus, ProductStatus, ScrapeErrorType, SelectorSet,
};

#[derive(Debug, Clone, FromRow)]
pub struct StoreRow {
    pub domain: String,
    pub display_name: String,
    pub whitelisted: bool,
    pub active: bool,
    pub rate_limit_rpm: i64,
    /// JSON-serialized [`SelectorSet`].
    pub selectors: String,
    pub success_rate: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StoreRow {
    pub fn selector_set(&self) -> SelectorSet {
        serde_json::from_str(&self.selectors).unwrap_or_default()
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct ProductRow {
    pub id: i64,
    pub url: String,
    pub store_domain: String,
    pub name: String,
    pub brand: Option<String>,
    pub upc: Option<String>,
    pub image_url: Option<String>,
    pub current_price: Option<f64>,
    pub original_price: Option<f64>,
    pub currency: String,
    pub in_stock: bool,
    pub status: ProductStatus,
    pub consecutive_failures: i64,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub canonical_id: Option<String>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct PriceHistoryRow {
    pub id: i64,
    pub product_id: i64,
    pub price: f64,
    pub original_price: Option<f64>,
    pub in_stock: bool,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct AlertRow {
    pub id: i64,
    pub product_id: i64,
    pub alert_type: AlertType,
    pub target_value: Option<f64>,
    pub min_change_threshold: f64,
    pub active: bool,
    pub triggered: bool,
    pub triggered_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScheduleRow {
    pub id: i64,
    pub product_id: Option<i64>,
    pub store_domain: Option<String>,
    pub cron_expression: String,
    pub active: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct ScrapeLogRow {
    pub id: i64,
    pub product_id: i64,
    pub success: bool,
    pub strategy_used: Option<ExtractionStrategy>,
    pub error_type: Option<ScrapeErrorType>,
    pub error_message: Option<String>,
    pub response_time_ms: Option<i64>,
    pub scraped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct NotificationRow {
    pub id: i64,
    pub alert_id: Option<i64>,
    pub product_id: i64,
    pub channel: String,
    pub status: NotificationStatus,
    /// Opaque JSON payload captured at dispatch time.
    pub payload: String,
    pub sent_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NotificationRow {
    pub fn payload_json(&self) -> serde_json::Value {
        serde_json::from_str(&self.payload).unwrap_or(serde_json::Value::Null)
    }
}
