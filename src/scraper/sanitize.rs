use std::sync::OnceLock;

use regex::Regex;

/// Overall length cap applied by [`sanitize_text`].
const MAX_TEXT_LENGTH: usize = 10_000;

/// Product names are capped tighter.
const MAX_NAME_LENGTH: usize = 500;

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

fn control_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[\x00-\x08\x0b\x0c\x0e-\x1f\x7f]").expect("static regex"))
}

fn punctuation_run_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"[!@#$%^&*()_+=\[\]{}|\\:";<>?,./]{3,}"#).expect("static regex")
    })
}

fn currency_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z$€£¥]").expect("static regex"))
}

/// Remove all HTML tags and collapse whitespace.
pub fn strip_html_tags(html: &str) -> String {
    if html.is_empty() {
        return String::new();
    }
    let stripped = tag_re().replace_all(html, " ");
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove control characters, collapse whitespace, cap length.
pub fn sanitize_text(text: &str) -> String {
    if text.is_empty() {
        return String::new();
    }
    let cleaned = control_re().replace_all(text, "");
    let mut cleaned = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    if cleaned.chars().count() > MAX_TEXT_LENGTH {
        cleaned = cleaned.chars().take(MAX_TEXT_LENGTH).collect();
        cleaned.push('…');
    }
    cleaned
}

/// Sanitize a scraped product name: strip markup, drop punctuation runs, cap
/// at 500 characters.
pub fn sanitize_product_name(name: &str) -> String {
    let stripped = strip_html_tags(name);
    let cleaned = sanitize_text(&stripped);
    let cleaned = punctuation_run_re().replace_all(&cleaned, "");
    let mut cleaned = cleaned.trim().to_string();
    if cleaned.chars().count() > MAX_NAME_LENGTH {
        cleaned = cleaned.chars().take(MAX_NAME_LENGTH).collect();
        cleaned.push('…');
    }
    cleaned
}

/// Parse a scraped price string ("$1,234.56", "CAD 99.99", "19.99 - 24.99")
/// into a validated two-decimal amount. Returns None when the text does not
/// yield a price inside the accepted range.
pub fn normalize_price(price_text: &str) -> Option<f64> {
    if price_text.is_empty() {
        return None;
    }

    let cleaned = currency_re().replace_all(price_text, "");
    let cleaned = cleaned.replace(',', "");
    let mut cleaned = cleaned.trim().to_string();

    // Ranges take the lower bound.
    if cleaned.matches('-').count() == 1 && !cleaned.starts_with('-') {
        if let Some((low, _)) = cleaned.split_once('-') {
            cleaned = low.trim().to_string();
        }
    }

    let price: f64 = cleaned.parse().ok()?;
    let price = (price * 100.0).round() / 100.0;
    validate_price(price).then_some(price)
}

/// Accepted price range: one cent to one million.
pub fn validate_price(price: f64) -> bool {
    (0.01..=1_000_000.0).contains(&price)
}

/// Normalize an image URL: protocol-relative URLs become https, anything that
/// is not absolute http(s) is dropped.
pub fn sanitize_image_url(url: &str) -> Option<String> {
    let url = url.trim();
    if url.is_empty() {
        return None;
    }
    let url = if let Some(rest) = url.strip_prefix("//") {
        format!("https://{rest}")
    } else {
        url.to_string()
    };
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return None;
    }
    Some(strip_html_tags(&url))
}

/// Keep only alphanumerics in a UPC/GTIN and cap its length.
pub fn sanitize_upc(upc: &str) -> Option<String> {
    let cleaned: String = upc.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.chars().take(50).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_price_handles_currency_and_commas() {
        assert_eq!(normalize_price("$1,234.56"), Some(1234.56));
        assert_eq!(normalize_price("CAD 99.99"), Some(99.99));
        assert_eq!(normalize_price("  19.9 "), Some(19.9));
    }

    #[test]
    fn normalize_price_takes_lower_bound_of_range() {
        assert_eq!(normalize_price("$19.99 - $24.99"), Some(19.99));
    }

    #[test]
    fn normalize_price_rejects_out_of_range() {
        assert_eq!(normalize_price("0.001"), None);
        assert_eq!(normalize_price("$2,000,000"), None);
        assert_eq!(normalize_price("free"), None);
        assert_eq!(normalize_price(""), None);
    }

    #[test]
    fn normalize_price_rounds_to_cents() {
        assert_eq!(normalize_price("10.999"), Some(11.0));
        assert_eq!(normalize_price("10.994"), Some(10.99));
    }

    #[test]
    fn product_name_strips_markup_and_punctuation_runs() {
        let name = sanitize_product_name("  <b>Blue&nbsp;Widget</b> !!!!! Deluxe  ");
        assert!(!name.contains('<'));
        assert!(!name.contains("!!!"));
        assert!(name.contains("Widget"));
    }

    #[test]
    fn product_name_truncates_to_500_chars() {
        let long = "x".repeat(900);
        let name = sanitize_product_name(&long);
        assert!(name.chars().count() <= 501);
    }

    #[test]
    fn sanitize_text_removes_control_chars() {
        assert_eq!(sanitize_text("a\x00b\x1fc"), "abc");
    }

    #[test]
    fn image_url_rewrites_protocol_relative() {
        assert_eq!(
            sanitize_image_url("//cdn.example.com/a.jpg").as_deref(),
            Some("https://cdn.example.com/a.jpg")
        );
        assert_eq!(sanitize_image_url("/relative/a.jpg"), None);
        assert_eq!(
            sanitize_image_url("https://cdn.example.com/b.png").as_deref(),
            Some("https://cdn.example.com/b.png")
        );
    }
}
