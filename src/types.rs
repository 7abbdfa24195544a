use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Product lifecycle
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Paused,
    Error,
    NeedsAttention,
    PriceUnavailable,
    Archived,
}

impl std::fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProductStatus::Active => "active",
            ProductStatus::Paused => "paused",
            ProductStatus::Error => "error",
            ProductStatus::NeedsAttention => "needs_attention",
            ProductStatus::PriceUnavailable => "price_unavailable",
            ProductStatus::Archived => "archived",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Alerts
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum AlertType {
    TargetPrice,
    PercentDrop,
    AnyChange,
    BackInStock,
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertType::TargetPrice => "target_price",
            AlertType::PercentDrop => "percent_drop",
            AlertType::AnyChange => "any_change",
            AlertType::BackInStock => "back_in_stock",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum NotificationStatus {
    Pending,
    Sent,
    Failed,
}

// ---------------------------------------------------------------------------
// Extraction
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ExtractionStrategy {
    JsonLd,
    CssSelector,
    Xpath,
    Llm,
}

impl std::fmt::Display for ExtractionStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExtractionStrategy::JsonLd => "json_ld",
            ExtractionStrategy::CssSelector => "css_selector",
            ExtractionStrategy::Xpath => "xpath",
            ExtractionStrategy::Llm => "llm",
        };
        write!(f, "{s}")
    }
}

/// A single extraction outcome. Complete iff `name` is non-empty and `price`
/// is set and within validation bounds.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProductSnapshot {
    pub name: Option<String>,
    pub price: Option<f64>,
    pub original_price: Option<f64>,
    pub currency: String,
    pub in_stock: bool,
    pub image_url: Option<String>,
    pub brand: Option<String>,
    pub upc: Option<String>,
    pub strategy_used: Option<ExtractionStrategy>,
}

impl ProductSnapshot {
    pub fn new(strategy: ExtractionStrategy) -> Self {
        Self {
            currency: "CAD".to_string(),
            in_stock: true,
            strategy_used: Some(strategy),
            ..Default::default()
        }
    }

    pub fn is_complete(&self) -> bool {
        self.name.as_deref().is_some_and(|n| !n.is_empty())
            && self
                .price
                .is_some_and(crate::scraper::sanitize::validate_price)
    }
}

// ---------------------------------------------------------------------------
// Persisted scrape error kinds
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(rename_all = "snake_case")]
pub enum ScrapeErrorType {
    NetworkError,
    Timeout,
    Blocked,
    NotFound,
    ParseFailure,
    PriceValidation,
    StructureChange,
    RobotsBlocked,
}

impl std::fmt::Display for ScrapeErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ScrapeErrorType::NetworkError => "network_error",
            ScrapeErrorType::Timeout => "timeout",
            ScrapeErrorType::Blocked => "blocked",
            ScrapeErrorType::NotFound => "not_found",
            ScrapeErrorType::ParseFailure => "parse_failure",
            ScrapeErrorType::PriceValidation => "price_validation",
            ScrapeErrorType::StructureChange => "structure_change",
            ScrapeErrorType::RobotsBlocked => "robots_blocked",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Healing classification
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    // Plausibly a broken selector — selector regeneration may fix these.
    ParseFailure,
    StructureChange,
    PriceValidation,
    // Require manual intervention.
    Blocked,
    NotFound,
    Network,
    Timeout,
    RobotsBlocked,
    Unknown,
}

impl FailureCategory {
    pub fn is_healable(self) -> bool {
        matches!(
            self,
            FailureCategory::ParseFailure
                | FailureCategory::StructureChange
                | FailureCategory::PriceValidation
        )
    }
}

impl From<ScrapeErrorType> for FailureCategory {
    fn from(value: ScrapeErrorType) -> Self {
        match value {
            ScrapeErrorType::ParseFailure => FailureCategory::ParseFailure,
            ScrapeErrorType::StructureChange => FailureCategory::StructureChange,
            ScrapeErrorType::PriceValidation => FailureCategory::PriceValidation,
            ScrapeErrorType::Blocked => FailureCategory::Blocked,
            ScrapeErrorType::NotFound => FailureCategory::NotFound,
            ScrapeErrorType::NetworkError => FailureCategory::Network,
            ScrapeErrorType::Timeout => FailureCategory::Timeout,
            ScrapeErrorType::RobotsBlocked => FailureCategory::RobotsBlocked,
        }
    }
}

// ---------------------------------------------------------------------------
// Selector sets
// ---------------------------------------------------------------------------

/// Per-field extraction configuration: ordered CSS selectors, optional XPath
/// expressions, and (for availability) substrings that signal in-stock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldSelectors {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub css: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub xpath: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub in_stock_patterns: Vec<String>,
}

impl FieldSelectors {
    pub fn css(list: &[&str]) -> Self {
        Self {
            css: list.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.css.is_empty() && self.xpath.is_empty() && self.in_stock_patterns.is_empty()
    }
}

/// The per-store selector dictionary. Serialized to JSON on the store row;
/// mutated only by seed reconcile and selector regeneration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SelectorSet {
    #[serde(default)]
    pub price: FieldSelectors,
    #[serde(default)]
    pub name: FieldSelectors,
    #[serde(default)]
    pub availability: FieldSelectors,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<FieldSelectors>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_price: Option<FieldSelectors>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait_for: Option<String>,
    #[serde(default)]
    pub json_ld: bool,
}

impl SelectorSet {
    /// Merge `other` into self: fields present in `other` overwrite, fields
    /// absent in `other` are preserved. Used both by seed reconcile (so
    /// healing-learned selectors survive restart) and by healing merges (so
    /// keys the regenerator did not emit survive).
    pub fn merge(&mut self, other: &SelectorSet) {
        if !other.price.is_empty() {
            self.price = other.price.clone();
        }
        if !other.name.is_empty() {
            self.name = other.name.clone();
        }
        if !other.availability.is_empty() {
            self.availability = other.availability.clone();
        }
        if other.image.is_some() {
            self.image = other.image.clone();
        }
        if other.original_price.is_some() {
            self.original_price = other.original_price.clone();
        }
        if other.wait_for.is_some() {
            self.wait_for = other.wait_for.clone();
        }
        if other.json_ld {
            self.json_ld = true;
        }
    }

    pub fn has_xpath(&self) -> bool {
        !self.price.xpath.is_empty() || !self.name.xpath.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_preserves_fields_absent_in_other() {
        let mut base = SelectorSet {
            price: FieldSelectors::css(&[".price"]),
            name: FieldSelectors::css(&["h1.title"]),
            wait_for: Some(".product".to_string()),
            json_ld: true,
            ..Default::default()
        };
        let update = SelectorSet {
            price: FieldSelectors::css(&[".new-price"]),
            ..Default::default()
        };
        base.merge(&update);
        assert_eq!(base.price.css, vec![".new-price"]);
        assert_eq!(base.name.css, vec!["h1.title"]);
        assert_eq!(base.wait_for.as_deref(), Some(".product"));
        assert!(base.json_ld);
    }

    #[test]
    fn selector_set_round_trips_through_json() {
        let set = SelectorSet {
            price: FieldSelectors::css(&[".price", "[itemprop=price]"]),
            name: FieldSelectors::css(&["h1"]),
            availability: FieldSelectors {
                css: vec!["#add-to-cart".to_string()],
                in_stock_patterns: vec!["in stock".to_string()],
                ..Default::default()
            },
            json_ld: true,
            ..Default::default()
        };
        let json = serde_json::to_string(&set).unwrap();
        let back: SelectorSet = serde_json::from_str(&json).unwrap();
        assert_eq!(set, back);
    }

    #[test]
    fn snapshot_completeness_requires_name_and_valid_price() {
        let mut snap = ProductSnapshot::new(ExtractionStrategy::JsonLd);
        assert!(!snap.is_complete());
        snap.name = Some("Widget".to_string());
        snap.price = Some(0.0);
        assert!(!snap.is_complete());
        snap.price = Some(19.99);
        assert!(snap.is_complete());
    }

    #[test]
    fn failure_category_healable_split() {
        assert!(FailureCategory::ParseFailure.is_healable());
        assert!(FailureCategory::PriceValidation.is_healable());
        assert!(!FailureCategory::Blocked.is_healable());
        assert!(!FailureCategory::NotFound.is_healable());
        assert!(FailureCategory::from(ScrapeErrorType::StructureChange).is_healable());
    }
}
