use std::sync::OnceLock;

use regex::Regex;

#[derive(Debug, Clone, PartialEq)]
pub struct RenderedEmail {
    pub subject: String,
    pub html: String,
    pub text: String,
}

fn wrap_html(title: &str, body: &str) -> String {
    format!(
        "<!doctype html><html><body style=\"font-family:Arial,Helvetica,sans-serif;color:#222;\">\
         <h2>{title}</h2>{body}\
         <p style=\"color:#888;font-size:12px\">You are receiving this because price tracking is enabled for this product.</p>\
         </body></html>"
    )
}

fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

// ---------------------------------------------------------------------------
// Templates
// ---------------------------------------------------------------------------

pub fn render_price_alert(
    product_name: &str,
    store_name: &str,
    current_price: f64,
    previous_price: Option<f64>,
    original_price: Option<f64>,
    product_url: &str,
    alert_type_label: &str,
) -> RenderedEmail {
    let name = escape(product_name);
    let store = escape(store_name);

    let drop_amount = previous_price
        .filter(|p| *p > current_price)
        .map(|p| ((p - current_price) * 100.0).round() / 100.0);

    let mut body = format!(
        "<p><strong>{name}</strong> at {store} is now <strong>${current_price:.2}</strong>.</p>"
    );
    if let Some(previous) = previous_price {
        body.push_str(&format!("<p>Previous price: ${previous:.2}</p>"));
    }
    if let Some(original) = original_price {
        if original > current_price {
            let discount = ((1.0 - current_price / original) * 100.0).round() as i64;
            body.push_str(&format!(
                "<p>Regular price ${original:.2} — {discount}% off</p>"
            ));
        }
    }
    body.push_str(&format!(
        "<p><a href=\"{product_url}\">View product</a></p>"
    ));

    let subject = match drop_amount {
        Some(amount) => format!(
            "Price Drop: {product_name} is now ${current_price:.2} (Save ${amount:.2})"
        ),
        None => format!("Price Alert: {product_name} is now ${current_price:.2}"),
    };

    let html = wrap_html(alert_type_label, &body);
    let text = html_to_text(&html);
    RenderedEmail { subject, html, text }
}

pub fn render_back_in_stock(
    product_name: &str,
    store_name: &str,
    current_price: f64,
    product_url: &str,
) -> RenderedEmail {
    let name = escape(product_name);
    let store = escape(store_name);
    let body = format!(
        "<p><strong>{name}</strong> is back in stock at {store} for <strong>${current_price:.2}</strong>.</p>\
         <p>Popular items can sell out again quickly.</p>\
         <p><a href=\"{product_url}\">View product</a></p>"
    );
    let html = wrap_html("Back in Stock", &body);
    let text = html_to_text(&html);
    RenderedEmail {
        subject: format!("Back in Stock: {product_name}"),
        html,
        text,
    }
}

pub fn render_product_error(
    product_name: &str,
    store_name: &str,
    error_type: &str,
    error_message: &str,
    product_url: &str,
) -> RenderedEmail {
    let name = escape(product_name);
    let store = escape(store_name);
    let body = format!(
        "<p>Tracking for <strong>{name}</strong> at {store} is failing.</p>\
         <p>Issue: {} — {}</p>\
         <p><a href=\"{product_url}\">Check the product page</a></p>",
        escape(error_type),
        escape(error_message),
    );
    let html = wrap_html("Tracking Issue", &body);
    let text = html_to_text(&html);
    RenderedEmail {
        subject: format!("Tracking Issue: {product_name}"),
        html,
        text,
    }
}

pub fn render_store_flagged(
    store_name: &str,
    store_domain: &str,
    success_rate: f64,
    products_affected: i64,
) -> RenderedEmail {
    let rate_percent = (success_rate * 100.0).round() as i64;
    let body = format!(
        "<p>Scrapes against <strong>{}</strong> ({}) are failing frequently.</p>\
         <ul><li>7-day success rate: {rate_percent}%</li>\
         <li>Products affected: {products_affected}</li></ul>\
         <p>Selectors may need regeneration, or the store may be blocking automated access.</p>",
        escape(store_name),
        escape(store_domain),
    );
    let html = wrap_html("Store Health Warning", &body);
    let text = html_to_text(&html);
    RenderedEmail {
        subject: format!("Store Health Warning: {store_name} ({rate_percent}% success rate)"),
        html,
        text,
    }
}

// ---------------------------------------------------------------------------
// HTML → text
// ---------------------------------------------------------------------------

fn style_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(style|script)[^>]*>.*?</(style|script)>").expect("static regex"))
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"(?i)<a[^>]*href="([^"]*)"[^>]*>([^<]*)</a>"#).expect("static regex"))
}

fn break_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)<br\s*/?>").expect("static regex"))
}

fn block_close_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)</p>|</div>|</li>|</h[1-6]>").expect("static regex"))
}

fn tag_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"<[^>]+>").expect("static regex"))
}

/// Derive the plain-text body from rendered HTML: breaks and block closers
/// become newlines, links become `text (url)`, entities are decoded, and
/// whitespace is tidied.
pub fn html_to_text(html: &str) -> String {
    let text = style_re().replace_all(html, "");
    let text = break_re().replace_all(&text, "\n");
    let text = block_close_re().replace_all(&text, "\n");
    let text = link_re().replace_all(&text, "$2 ($1)");
    let text = tag_re().replace_all(&text, "");

    let text = text
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"");

    // Collapse runs of blank lines and trailing spaces.
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line);
        out.push('\n');
    }
    out.trim().to_string()
}
