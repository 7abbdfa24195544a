use serde_json::Value;
use tracing::warn;

use crate::config::MIN_REGEN_CONFIDENCE;
use crate::llm::{strip_code_fences, CompletionModel};
use crate::scraper::strategies::clean_html_for_llm;
use crate::types::{FieldSelectors, SelectorSet};

#[derive(Debug, Clone)]
pub struct RegenerationResult {
    pub success: bool,
    pub domain: String,
    pub selectors: Option<SelectorSet>,
    pub confidence: f64,
    pub error: Option<String>,
}

impl RegenerationResult {
    fn failed(domain: &str, confidence: f64, error: impl Into<String>) -> Self {
        Self {
            success: false,
            domain: domain.to_string(),
            selectors: None,
            confidence,
            error: Some(error.into()),
        }
    }
}

/// Asks the completion model for a fresh selector candidate from an HTML
/// sample. One shot, no internal retry; the healing controller owns the
/// attempt budget. Candidates below the confidence floor or failing
/// structural validation are rejected.
pub struct SelectorRegenerator {
    min_confidence: f64,
}

impl SelectorRegenerator {
    pub fn new() -> Self {
        Self {
            min_confidence: MIN_REGEN_CONFIDENCE,
        }
    }

    pub async fn regenerate(
        &self,
        llm: &dyn CompletionModel,
        html: &str,
        domain: &str,
        current_selectors: Option<&SelectorSet>,
    ) -> RegenerationResult {
        // clean_html_for_llm caps output at the 50k budget, biased toward
        // the product-marker region.
        let truncated = clean_html_for_llm(html);
        let prompt = build_prompt(&truncated, domain, current_selectors);

        let response = match llm.complete(&prompt).await {
            Ok(r) => r,
            Err(e) => return RegenerationResult::failed(domain, 0.0, e.to_string()),
        };

        let Some(parsed) = parse_response(&response) else {
            return RegenerationResult::failed(domain, 0.0, "failed to parse selector response");
        };

        let confidence = parsed
            .get("confidence")
            .and_then(|c| c.as_f64())
            .unwrap_or(0.5);
        if confidence < self.min_confidence {
            return RegenerationResult::failed(
                domain,
                confidence,
                format!("low confidence: {confidence:.2}"),
            );
        }

        let Some(raw_selectors) = parsed.get("selectors") else {
            return RegenerationResult::failed(domain, confidence, "response carries no selectors");
        };
        let Some(selectors) = validate_selectors(raw_selectors) else {
            return RegenerationResult::failed(
                domain,
                confidence,
                "selector candidate failed structural validation",
            );
        };

        RegenerationResult {
            success: true,
            domain: domain.to_string(),
            selectors: Some(selectors),
            confidence,
            error: None,
        }
    }
}

impl Default for SelectorRegenerator {
    fn default() -> Self {
        Self::new()
    }
}

fn build_prompt(html: &str, domain: &str, current_selectors: Option<&SelectorSet>) -> String {
    let mut prompt = format!(
        "You are a web scraping expert specializing in e-commerce product pages.\n\
         Analyze this HTML from {domain} and generate reliable CSS selectors for product data \
         extraction.\n\n\
         Guidelines:\n\
         - Prefer semantic attributes (data-*, itemprop, aria-*) and stable ids.\n\
         - Provide 2-4 selectors per field, most specific first.\n\
         - The price selectors must target the current selling price, not the MSRP.\n\n\
         Respond with JSON only:\n\
         {{\"selectors\": {{\"price\": {{\"css\": [\"...\"]}}, \"name\": {{\"css\": [\"...\"]}}, \
         \"availability\": {{\"css\": [\"...\"], \"in_stock_patterns\": [\"in stock\"]}}, \
         \"image\": {{\"css\": [\"...\"]}}, \"original_price\": {{\"css\": [\"...\"]}}, \
         \"wait_for\": \"...\", \"json_ld\": false}}, \
         \"confidence\": 0.0, \"notes\": \"...\"}}\n"
    );

    if let Some(current) = current_selectors {
        if let Ok(json) = serde_json::to_string_pretty(current) {
            prompt.push_str(&format!(
                "\nThese selectors stopped working and need replacement:\n{json}\n"
            ));
        }
    }

    prompt.push_str(&format!("\nHTML:\n{html}\n"));
    prompt
}

fn parse_response(response: &str) -> Option<Value> {
    match serde_json::from_str(strip_code_fences(response)) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("selector response was not valid JSON: {e}");
            None
        }
    }
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(|v| v.as_array())
        .map(|items| {
            items
                .iter()
                .filter_map(|i| i.as_str())
                .map(|s| s.to_string())
                .collect()
        })
        .unwrap_or_default()
}

/// Structural validation: price, name and availability must each carry a
/// non-empty CSS list. Optional fields come through when present.
pub fn validate_selectors(raw: &Value) -> Option<SelectorSet> {
    let price = string_list(raw.get("price").and_then(|p| p.get("css")));
    let name = string_list(raw.get("name").and_then(|n| n.get("css")));
    let availability_css = string_list(raw.get("availability").and_then(|a| a.get("css")));

    if price.is_empty() || name.is_empty() || availability_css.is_empty() {
        return None;
    }

    let in_stock_patterns =
        string_list(raw.get("availability").and_then(|a| a.get("in_stock_patterns")));

    let image = {
        let css = string_list(raw.get("image").and_then(|i| i.get("css")));
        (!css.is_empty()).then(|| FieldSelectors {
            css,
            ..Default::default()
        })
    };
    let original_price = {
        let css = string_list(raw.get("original_price").and_then(|o| o.get("css")));
        (!css.is_empty()).then(|| FieldSelectors {
            css,
            ..Default::default()
        })
    };

    Some(SelectorSet {
        price: FieldSelectors {
            css: price,
            ..Default::default()
        },
        name: FieldSelectors {
            css: name,
            ..Default::default()
        },
        availability: FieldSelectors {
            css: availability_css,
            in_stock_patterns,
            ..Default::default()
        },
        image,
        original_price,
        wait_for: raw
            .get("wait_for")
            .and_then(|w| w.as_str())
            .map(|s| s.to_string()),
        json_ld: raw.get("json_ld").and_then(|j| j.as_bool()).unwrap_or(false),
    })
}
