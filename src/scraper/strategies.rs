use scraper::{Html, Selector};
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::LLM_HTML_MAX_CHARS;
use crate::llm::{strip_code_fences, CompletionModel};
use crate::scraper::sanitize::{
    normalize_price, sanitize_image_url, sanitize_product_name, sanitize_text, sanitize_upc,
};
use crate::types::{ExtractionStrategy, ProductSnapshot, SelectorSet};

const JSON_LD_PRODUCT_TYPES: &[&str] = &["Product", "IndividualProduct", "ProductModel"];

const IN_STOCK_AVAILABILITY: &[&str] =
    &["instock", "in stock", "available", "preorder", "pre-order"];

/// Sections of a page likely to contain the product; used to bias truncation
/// when handing HTML to the LLM.
const PRODUCT_MARKERS: &[&str] = &[
    "<main",
    "itemtype=\"http://schema.org/product",
    "itemtype=\"https://schema.org/product",
    "data-product",
    "class=\"product",
    "id=\"product",
];

// ---------------------------------------------------------------------------
// Waterfall
// ---------------------------------------------------------------------------

/// Run the synchronous strategies in fixed order: JSON-LD → CSS → XPath.
/// Stops at the first complete snapshot.
pub fn extract_sync(html: &str, selectors: Option<&SelectorSet>) -> Option<ProductSnapshot> {
    if let Some(snapshot) = extract_json_ld(html) {
        if snapshot.is_complete() {
            return Some(snapshot);
        }
    }
    if let Some(set) = selectors {
        if let Some(snapshot) = extract_css(html, set) {
            if snapshot.is_complete() {
                return Some(snapshot);
            }
        }
        if set.has_xpath() {
            if let Some(snapshot) = extract_xpath(html, set) {
                if snapshot.is_complete() {
                    return Some(snapshot);
                }
            }
        }
    }
    None
}

/// Full waterfall including the LLM fallback. Parsing runs on a blocking
/// thread; the LLM strategy is only consulted when a client is wired and the
/// structured strategies all failed.
pub async fn extract(
    html: String,
    selectors: Option<SelectorSet>,
    llm: Option<&dyn CompletionModel>,
    url: &str,
) -> Option<ProductSnapshot> {
    let html_for_parse = html.clone();
    let parsed = tokio::task::spawn_blocking(move || {
        extract_sync(&html_for_parse, selectors.as_ref())
    })
    .await
    .ok()
    .flatten();

    if parsed.is_some() {
        return parsed;
    }

    let llm = llm?;
    extract_llm(&html, url, llm).await
}

// ---------------------------------------------------------------------------
// JSON-LD
// ---------------------------------------------------------------------------

pub fn extract_json_ld(html: &str) -> Option<ProductSnapshot> {
    let selector = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;
    let document = Html::parse_document(html);

    for script in document.select(&selector) {
        let raw: String = script.text().collect();
        let Ok(data) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        if let Some(product) = find_product(&data) {
            return Some(parse_json_ld_product(product));
        }
    }
    None
}

/// Locate a product node inside a JSON-LD payload: walks lists, `@graph`, and
/// `mainEntity`/`mainEntityOfPage` wrappers.
fn find_product(data: &Value) -> Option<&Value> {
    match data {
        Value::Array(items) => items.iter().find_map(find_product),
        Value::Object(map) => {
            if let Some(graph) = map.get("@graph") {
                if let Some(found) = find_product(graph) {
                    return Some(found);
                }
            }

            let item_type = match map.get("@type") {
                Some(Value::String(s)) => s.as_str(),
                Some(Value::Array(a)) => a.first().and_then(|v| v.as_str()).unwrap_or(""),
                _ => "",
            };
            if JSON_LD_PRODUCT_TYPES.contains(&item_type) {
                return Some(data);
            }

            for key in ["mainEntity", "mainEntityOfPage"] {
                if let Some(nested) = map.get(key) {
                    if let Some(found) = find_product(nested) {
                        return Some(found);
                    }
                }
            }
            None
        }
        _ => None,
    }
}

fn parse_json_ld_product(data: &Value) -> ProductSnapshot {
    let mut snapshot = ProductSnapshot::new(ExtractionStrategy::JsonLd);

    if let Some(name) = data.get("name").and_then(|n| n.as_str()) {
        let name = sanitize_product_name(name);
        if !name.is_empty() {
            snapshot.name = Some(name);
        }
    }

    snapshot.brand = match data.get("brand") {
        Some(Value::String(s)) => Some(sanitize_text(s)),
        Some(Value::Object(o)) => o
            .get("name")
            .and_then(|n| n.as_str())
            .map(sanitize_text),
        _ => None,
    }
    .filter(|b| !b.is_empty());

    snapshot.upc = ["gtin13", "gtin", "sku"]
        .iter()
        .find_map(|key| value_as_string(data.get(*key)))
        .and_then(|v| sanitize_upc(&v));

    snapshot.image_url = match data.get("image") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Array(a)) => a.first().and_then(|v| v.as_str()).map(|s| s.to_string()),
        Some(Value::Object(o)) => o.get("url").and_then(|u| u.as_str()).map(|s| s.to_string()),
        _ => None,
    }
    .and_then(|u| sanitize_image_url(&u));

    if let Some(offers) = data.get("offers") {
        parse_offers(offers, &mut snapshot);
    }

    snapshot
}

fn parse_offers(offers: &Value, snapshot: &mut ProductSnapshot) {
    let offer = match offers {
        Value::Array(items) => match items.first() {
            Some(first) => first,
            None => return,
        },
        other => other,
    };
    let Value::Object(map) = offer else { return };

    let offer_type = map.get("@type").and_then(|t| t.as_str()).unwrap_or("");
    let price_value = if offer_type == "AggregateOffer" {
        map.get("lowPrice").or_else(|| map.get("price"))
    } else {
        map.get("price")
    };
    if let Some(price) = value_as_string(price_value) {
        snapshot.price = normalize_price(&price);
    }

    if let Some(currency) = map.get("priceCurrency").and_then(|c| c.as_str()) {
        snapshot.currency = currency.to_string();
    }

    if let Some(availability) = map.get("availability").and_then(|a| a.as_str()) {
        let lower = availability.to_lowercase();
        snapshot.in_stock = IN_STOCK_AVAILABILITY.iter().any(|s| lower.contains(s));
    }
}

fn value_as_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// CSS selectors
// ---------------------------------------------------------------------------

pub fn extract_css(html: &str, selectors: &SelectorSet) -> Option<ProductSnapshot> {
    let document = Html::parse_document(html);
    let mut snapshot = ProductSnapshot::new(ExtractionStrategy::CssSelector);

    snapshot.price = select_first(&document, &selectors.price.css, |text, _| {
        normalize_price(text)
    });

    snapshot.name = select_first(&document, &selectors.name.css, |text, _| {
        let name = sanitize_product_name(text);
        (!name.is_empty()).then_some(name)
    });

    if let Some(field) = &selectors.original_price {
        snapshot.original_price =
            select_first(&document, &field.css, |text, _| normalize_price(text));
    }

    snapshot.in_stock = extract_availability(&document, selectors);

    if let Some(field) = &selectors.image {
        snapshot.image_url = field.css.iter().find_map(|sel| {
            let parsed = Selector::parse(sel).ok()?;
            let element = document.select(&parsed).next()?;
            let src = element
                .value()
                .attr("src")
                .or_else(|| element.value().attr("data-src"))?;
            sanitize_image_url(src)
        });
    }

    snapshot.is_complete().then_some(snapshot)
}

fn select_first<T>(
    document: &Html,
    css: &[String],
    mut map: impl FnMut(&str, &scraper::ElementRef<'_>) -> Option<T>,
) -> Option<T> {
    for sel in css {
        let Ok(parsed) = Selector::parse(sel) else {
            debug!(selector = sel.as_str(), "unparseable CSS selector skipped");
            continue;
        };
        if let Some(element) = document.select(&parsed).next() {
            let text: String = element.text().collect::<Vec<_>>().join(" ");
            if let Some(value) = map(text.trim(), &element) {
                return Some(value);
            }
        }
    }
    None
}

/// In-stock iff a configured availability selector matches and its text
/// contains a configured in-stock substring, or the matched element is a
/// button. No configured selectors means no signal, which reads as in-stock.
fn extract_availability(document: &Html, selectors: &SelectorSet) -> bool {
    let field = &selectors.availability;
    if field.css.is_empty() {
        return true;
    }

    for sel in &field.css {
        let Ok(parsed) = Selector::parse(sel) else {
            continue;
        };
        if let Some(element) = document.select(&parsed).next() {
            let text = element
                .text()
                .collect::<Vec<_>>()
                .join(" ")
                .to_lowercase();
            if field
                .in_stock_patterns
                .iter()
                .any(|p| text.contains(&p.to_lowercase()))
            {
                return true;
            }
            if element.value().name() == "button" {
                return true;
            }
        }
    }
    false
}

// ---------------------------------------------------------------------------
// XPath
// ---------------------------------------------------------------------------

/// XPath extraction runs only when the selector set declares xpath entries.
/// Real-world tag soup frequently fails strict XML parsing; any failure is a
/// plain None and the waterfall moves on.
pub fn extract_xpath(html: &str, selectors: &SelectorSet) -> Option<ProductSnapshot> {
    let package = sxd_document::parser::parse(html).ok()?;
    let document = package.as_document();
    let mut snapshot = ProductSnapshot::new(ExtractionStrategy::Xpath);

    snapshot.price = selectors
        .price
        .xpath
        .iter()
        .find_map(|xpath| xpath_string(&document, xpath).and_then(|t| normalize_price(&t)));

    snapshot.name = selectors.name.xpath.iter().find_map(|xpath| {
        xpath_string(&document, xpath).and_then(|t| {
            let name = sanitize_product_name(&t);
            (!name.is_empty()).then_some(name)
        })
    });

    snapshot.is_complete().then_some(snapshot)
}

fn xpath_string(document: &sxd_document::dom::Document<'_>, xpath: &str) -> Option<String> {
    let value = sxd_xpath::evaluate_xpath(document, xpath).ok()?;
    let text = match value {
        sxd_xpath::Value::String(s) => s,
        sxd_xpath::Value::Number(n) => n.to_string(),
        sxd_xpath::Value::Nodeset(nodes) => nodes.document_order_first()?.string_value(),
        sxd_xpath::Value::Boolean(_) => return None,
    };
    let text = text.trim().to_string();
    (!text.is_empty()).then_some(text)
}

// ---------------------------------------------------------------------------
// LLM fallback
// ---------------------------------------------------------------------------

async fn extract_llm(
    html: &str,
    url: &str,
    llm: &dyn CompletionModel,
) -> Option<ProductSnapshot> {
    let cleaned = clean_html_for_llm(html);
    let prompt = format!(
        "Extract product data from this e-commerce page HTML (source: {url}).\n\
         Respond with JSON only, no prose:\n\
         {{\"name\": string, \"price\": number, \"original_price\": number|null, \
         \"currency\": string, \"in_stock\": boolean, \"image_url\": string|null, \
         \"brand\": string|null, \"upc\": string|null}}\n\n\
         HTML:\n{cleaned}"
    );

    let response = match llm.complete(&prompt).await {
        Ok(r) => r,
        Err(e) => {
            warn!(url, "LLM extraction failed: {e}");
            return None;
        }
    };

    let parsed: Value = serde_json::from_str(strip_code_fences(&response)).ok()?;

    let mut snapshot = ProductSnapshot::new(ExtractionStrategy::Llm);
    snapshot.name = parsed
        .get("name")
        .and_then(|n| n.as_str())
        .map(sanitize_product_name)
        .filter(|n| !n.is_empty());
    snapshot.price = match parsed.get("price") {
        Some(Value::Number(n)) => n.as_f64().and_then(|p| {
            let rounded = (p * 100.0).round() / 100.0;
            crate::scraper::sanitize::validate_price(rounded).then_some(rounded)
        }),
        Some(Value::String(s)) => normalize_price(s),
        _ => None,
    };
    snapshot.original_price = parsed
        .get("original_price")
        .and_then(|p| p.as_f64())
        .map(|p| (p * 100.0).round() / 100.0)
        .filter(|p| crate::scraper::sanitize::validate_price(*p));
    if let Some(currency) = parsed.get("currency").and_then(|c| c.as_str()) {
        snapshot.currency = currency.to_string();
    }
    snapshot.in_stock = parsed
        .get("in_stock")
        .and_then(|s| s.as_bool())
        .unwrap_or(true);
    snapshot.image_url = parsed
        .get("image_url")
        .and_then(|i| i.as_str())
        .and_then(sanitize_image_url);
    snapshot.brand = parsed
        .get("brand")
        .and_then(|b| b.as_str())
        .map(sanitize_text)
        .filter(|b| !b.is_empty());
    snapshot.upc = parsed
        .get("upc")
        .and_then(|u| u.as_str())
        .and_then(sanitize_upc);

    snapshot.is_complete().then_some(snapshot)
}

/// Strip script/style/noscript/iframe/svg blocks and HTML comments, then cap
/// at 50k characters biased toward the first product marker found.
pub fn clean_html_for_llm(html: &str) -> String {
    let mut cleaned = html.to_string();
    for tag in ["script", "style", "noscript", "iframe", "svg"] {
        cleaned = strip_tag_blocks(&cleaned, tag);
    }
    cleaned = strip_comments(&cleaned);

    if cleaned.len() <= LLM_HTML_MAX_CHARS {
        return cleaned;
    }

    // ASCII lowercase preserves byte offsets into the original.
    let lower = cleaned.to_ascii_lowercase();
    for marker in PRODUCT_MARKERS {
        if let Some(idx) = lower.find(marker) {
            let start = idx.saturating_sub(1000);
            let end = (start + LLM_HTML_MAX_CHARS).min(cleaned.len());
            let start = floor_char_boundary(&cleaned, start);
            let end = floor_char_boundary(&cleaned, end);
            return cleaned[start..end].to_string();
        }
    }

    let end = floor_char_boundary(&cleaned, LLM_HTML_MAX_CHARS);
    cleaned[..end].to_string()
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    idx = idx.min(s.len());
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn strip_tag_blocks(html: &str, tag: &str) -> String {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let lower = html.to_ascii_lowercase();
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;

    while let Some(rel_start) = lower[pos..].find(&open) {
        let start = pos + rel_start;
        out.push_str(&html[pos..start]);
        match lower[start..].find(&close) {
            Some(rel_end) => {
                pos = start + rel_end + close.len();
            }
            None => {
                // Unclosed block: drop the remainder.
                return out;
            }
        }
    }
    out.push_str(&html[pos..]);
    out
}

fn strip_comments(html: &str) -> String {
    let mut out = String::with_capacity(html.len());
    let mut pos = 0;
    while let Some(rel_start) = html[pos..].find("<!--") {
        let start = pos + rel_start;
        out.push_str(&html[pos..start]);
        match html[start..].find("-->") {
            Some(rel_end) => pos = start + rel_end + 3,
            None => return out,
        }
    }
    out.push_str(&html[pos..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FieldSelectors;

    const JSON_LD_PAGE: &str = r#"<html><head>
<script type="application/ld+json">
{"@context":"https://schema.org","@graph":[
  {"@type":"BreadcrumbList","itemListElement":[]},
  {"@type":"Product","name":"Stand Mixer <b>Pro</b>","brand":{"name":"KitchenCo"},
   "gtin13":"0062345678901",
   "image":["//images.example.ca/mixer.jpg"],
   "offers":{"@type":"Offer","price":"449.99","priceCurrency":"CAD",
             "availability":"https://schema.org/InStock"}}
]}
</script></head><body></body></html>"#;

    #[test]
    fn json_ld_graph_product_extracts() {
        let snapshot = extract_json_ld(JSON_LD_PAGE).expect("product found");
        assert_eq!(snapshot.name.as_deref(), Some("Stand Mixer Pro"));
        assert_eq!(snapshot.price, Some(449.99));
        assert_eq!(snapshot.currency, "CAD");
        assert_eq!(snapshot.brand.as_deref(), Some("KitchenCo"));
        assert_eq!(snapshot.upc.as_deref(), Some("0062345678901"));
        assert_eq!(
            snapshot.image_url.as_deref(),
            Some("https://images.example.ca/mixer.jpg")
        );
        assert!(snapshot.in_stock);
        assert_eq!(snapshot.strategy_used, Some(ExtractionStrategy::JsonLd));
    }

    #[test]
    fn json_ld_aggregate_offer_prefers_low_price() {
        let html = r#"<script type="application/ld+json">
        {"@type":"Product","name":"Cable","offers":{"@type":"AggregateOffer",
         "lowPrice":"9.99","price":"14.99","priceCurrency":"CAD"}}
        </script>"#;
        let snapshot = extract_json_ld(html).unwrap();
        assert_eq!(snapshot.price, Some(9.99));
    }

    #[test]
    fn json_ld_out_of_stock_availability() {
        let html = r#"<script type="application/ld+json">
        {"@type":"Product","name":"Cable","offers":{"price":"9.99",
         "availability":"https://schema.org/OutOfStock"}}
        </script>"#;
        let snapshot = extract_json_ld(html).unwrap();
        assert!(!snapshot.in_stock);
    }

    #[test]
    fn json_ld_main_entity_is_resolved() {
        let html = r#"<script type="application/ld+json">
        {"@type":"WebPage","mainEntity":{"@type":"Product","name":"Lamp",
         "offers":{"price":19.5}}}
        </script>"#;
        let snapshot = extract_json_ld(html).unwrap();
        assert_eq!(snapshot.name.as_deref(), Some("Lamp"));
        assert_eq!(snapshot.price, Some(19.5));
    }

    fn css_selectors() -> SelectorSet {
        SelectorSet {
            price: FieldSelectors::css(&[".sale-price", ".price"]),
            name: FieldSelectors::css(&["h1.product-title"]),
            availability: FieldSelectors {
                css: vec!["#add-to-cart".to_string()],
                in_stock_patterns: vec!["add to cart".to_string()],
                ..Default::default()
            },
            image: Some(FieldSelectors::css(&["img.product-image"])),
            original_price: Some(FieldSelectors::css(&[".was-price"])),
            ..Default::default()
        }
    }

    const CSS_PAGE: &str = r#"<html><body>
      <h1 class="product-title">Cordless Drill 20V</h1>
      <span class="was-price">$129.99</span>
      <span class="price">$99.99</span>
      <button id="add-to-cart">Add to Cart</button>
      <img class="product-image" src="//cdn.example.ca/drill.jpg">
    </body></html>"#;

    #[test]
    fn css_extraction_first_matching_selector_wins() {
        let snapshot = extract_css(CSS_PAGE, &css_selectors()).expect("complete snapshot");
        assert_eq!(snapshot.name.as_deref(), Some("Cordless Drill 20V"));
        assert_eq!(snapshot.price, Some(99.99));
        assert_eq!(snapshot.original_price, Some(129.99));
        assert!(snapshot.in_stock);
        assert_eq!(
            snapshot.image_url.as_deref(),
            Some("https://cdn.example.ca/drill.jpg")
        );
        assert_eq!(snapshot.strategy_used, Some(ExtractionStrategy::CssSelector));
    }

    #[test]
    fn css_availability_defaults_out_of_stock_when_selector_misses() {
        let html = r#"<h1 class="product-title">Drill</h1><span class="price">$99.99</span>"#;
        let snapshot = extract_css(html, &css_selectors()).unwrap();
        assert!(!snapshot.in_stock);
    }

    #[test]
    fn css_incomplete_page_returns_none() {
        let html = r#"<h1 class="product-title">Drill</h1>"#;
        assert!(extract_css(html, &css_selectors()).is_none());
    }

    #[test]
    fn xpath_requires_entries_and_wellformed_markup() {
        let mut selectors = SelectorSet::default();
        selectors.price.xpath = vec!["//span[@class='price']".to_string()];
        selectors.name.xpath = vec!["//h1".to_string()];

        let page = r#"<html><body><h1>Desk Lamp</h1><span class="price">$25.00</span></body></html>"#;
        let snapshot = extract_xpath(page, &selectors).expect("xhtml parses");
        assert_eq!(snapshot.name.as_deref(), Some("Desk Lamp"));
        assert_eq!(snapshot.price, Some(25.0));

        // Tag soup fails XML parsing and yields None rather than an error.
        assert!(extract_xpath("<html><body><p>broken", &selectors).is_none());
    }

    #[test]
    fn waterfall_prefers_json_ld_over_css() {
        let combined = format!("{JSON_LD_PAGE}{CSS_PAGE}");
        let snapshot = extract_sync(&combined, Some(&css_selectors())).unwrap();
        assert_eq!(snapshot.strategy_used, Some(ExtractionStrategy::JsonLd));
    }

    #[test]
    fn waterfall_falls_through_to_css() {
        let snapshot = extract_sync(CSS_PAGE, Some(&css_selectors())).unwrap();
        assert_eq!(snapshot.strategy_used, Some(ExtractionStrategy::CssSelector));
    }

    #[test]
    fn extraction_is_idempotent() {
        let a = extract_sync(CSS_PAGE, Some(&css_selectors()));
        let b = extract_sync(CSS_PAGE, Some(&css_selectors()));
        assert_eq!(a, b);
    }

    #[test]
    fn llm_cleaning_strips_noise_and_respects_cap() {
        let html = format!(
            "<html><head><script>var x = 1;</script><style>.a{{}}</style></head>\
             <body><!-- comment --><main data-product>Product text</main>{}</body></html>",
            "<p>padding</p>".repeat(10_000)
        );
        let cleaned = clean_html_for_llm(&html);
        assert!(!cleaned.contains("var x"));
        assert!(!cleaned.contains("comment"));
        assert!(cleaned.contains("Product text"));
        assert!(cleaned.len() <= LLM_HTML_MAX_CHARS);
    }
}
