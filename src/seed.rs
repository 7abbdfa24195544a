use crate::types::{FieldSelectors, SelectorSet};

/// One immutable seed entry. Reconciled into the stores table on startup:
/// seed-present fields overwrite, everything else on the row is preserved.
#[derive(Debug, Clone)]
pub struct SeedStore {
    pub domain: &'static str,
    pub display_name: &'static str,
    pub rate_limit_rpm: i64,
    pub selectors: SelectorSet,
}

fn availability(css: &[&str], patterns: &[&str]) -> FieldSelectors {
    FieldSelectors {
        css: css.iter().map(|s| s.to_string()).collect(),
        in_stock_patterns: patterns.iter().map(|s| s.to_string()).collect(),
        ..Default::default()
    }
}

/// Canadian retailer seed set. Most of these publish JSON-LD, so the CSS
/// selectors are the fallback tier.
pub fn seed_stores() -> Vec<SeedStore> {
    vec![
        SeedStore {
            domain: "amazon.ca",
            display_name: "Amazon Canada",
            rate_limit_rpm: 5,
            selectors: SelectorSet {
                price: FieldSelectors::css(&[
                    "span.a-price span.a-offscreen",
                    "#priceblock_ourprice",
                    "#corePrice_feature_div span.a-offscreen",
                ]),
                name: FieldSelectors::css(&["#productTitle", "h1#title"]),
                availability: availability(
                    &["#availability span", "#add-to-cart-button"],
                    &["in stock", "add to cart"],
                ),
                image: Some(FieldSelectors::css(&["#landingImage", "#imgBlkFront"])),
                original_price: Some(FieldSelectors::css(&[
                    "span.basisPrice span.a-offscreen",
                    "#listPrice",
                ])),
                wait_for: Some("#productTitle".to_string()),
                json_ld: false,
            },
        },
        SeedStore {
            domain: "walmart.ca",
            display_name: "Walmart Canada",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["[data-automation=\"buybox-price\"]", "span[itemprop=price]"]),
                name: FieldSelectors::css(&["h1[data-automation=\"product-title\"]", "h1"]),
                availability: availability(
                    &["[data-automation=\"cta-button\"]"],
                    &["add to cart"],
                ),
                image: Some(FieldSelectors::css(&["img[data-automation=\"image-main\"]"])),
                original_price: None,
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "bestbuy.ca",
            display_name: "Best Buy Canada",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["[data-automation=\"product-price\"] span", "div.price"]),
                name: FieldSelectors::css(&["h1[data-automation=\"product-title\"]"]),
                availability: availability(
                    &["[data-automation=\"addToCartButton\"]"],
                    &["add to cart"],
                ),
                image: Some(FieldSelectors::css(&["img[data-automation=\"image-gallery-main\"]"])),
                original_price: Some(FieldSelectors::css(&["[data-automation=\"product-saving\"]"])),
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "canadiantire.ca",
            display_name: "Canadian Tire",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.price__value", "[data-testid=\"price\"]"]),
                name: FieldSelectors::css(&["h1.product__title", "h1"]),
                availability: availability(&["button.add-to-cart"], &["add to cart", "in stock"]),
                image: Some(FieldSelectors::css(&["img.product__image"])),
                original_price: Some(FieldSelectors::css(&["span.price__was"])),
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "costco.ca",
            display_name: "Costco Canada",
            rate_limit_rpm: 5,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.value", "#pull-right-price span"]),
                name: FieldSelectors::css(&["h1[itemprop=name]", "h1"]),
                availability: availability(&["#add-to-cart-btn"], &["add to cart"]),
                image: Some(FieldSelectors::css(&["img#initialProductImage"])),
                original_price: None,
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "loblaws.ca",
            display_name: "Loblaws",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.selling-price-list__item__price--now-price__value", "[data-testid=\"price\"]"]),
                name: FieldSelectors::css(&["h1.product-name__item--name", "h1"]),
                availability: availability(
                    &["button[data-testid=\"atc-button\"]"],
                    &["add to cart"],
                ),
                image: Some(FieldSelectors::css(&["img.responsive-image--product-tile-image"])),
                original_price: Some(FieldSelectors::css(&["span.selling-price-list__item__price--was-price__value"])),
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "realcanadiansuperstore.ca",
            display_name: "Real Canadian Superstore",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.selling-price-list__item__price--now-price__value"]),
                name: FieldSelectors::css(&["h1.product-name__item--name", "h1"]),
                availability: availability(
                    &["button[data-testid=\"atc-button\"]"],
                    &["add to cart"],
                ),
                image: None,
                original_price: None,
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "homedepot.ca",
            display_name: "Home Depot Canada",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.hdca-product__description-pricing-price-value", "[data-testid=\"price\"]"]),
                name: FieldSelectors::css(&["h1.hdca-product__description-title-product-name", "h1"]),
                availability: availability(&["button.acl-button--primary"], &["add to cart"]),
                image: None,
                original_price: None,
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "rona.ca",
            display_name: "Rona",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.price-box__price__amount", ".price"]),
                name: FieldSelectors::css(&["h1.product-title__title", "h1"]),
                availability: availability(&["button.add-to-cart"], &["add to cart"]),
                image: None,
                original_price: Some(FieldSelectors::css(&["span.price-box__regular-price"])),
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "staples.ca",
            display_name: "Staples Canada",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.money.pre-money", "div.product-price span"]),
                name: FieldSelectors::css(&["h1.product-title", "h1"]),
                availability: availability(&["button#addToCartBtn"], &["add to cart"]),
                image: None,
                original_price: None,
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "sportchek.ca",
            display_name: "Sport Chek",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.product-price__price", ".price"]),
                name: FieldSelectors::css(&["h1.product-title", "h1"]),
                availability: availability(&["button.add-to-cart"], &["add to cart"]),
                image: None,
                original_price: Some(FieldSelectors::css(&["span.product-price__was"])),
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "marks.com",
            display_name: "Mark's",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.product-price__price"]),
                name: FieldSelectors::css(&["h1.product-title", "h1"]),
                availability: availability(&["button.add-to-cart"], &["add to cart"]),
                image: None,
                original_price: None,
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "indigo.ca",
            display_name: "Indigo",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.product-list-price", ".price"]),
                name: FieldSelectors::css(&["h1.product-name", "h1"]),
                availability: availability(&["button.add-to-cart-button"], &["add to cart"]),
                image: None,
                original_price: None,
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "well.ca",
            display_name: "Well.ca",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.product_price", ".price"]),
                name: FieldSelectors::css(&["h1[itemprop=name]", "h1"]),
                availability: availability(&["button#add-to-cart"], &["add to cart", "in stock"]),
                image: None,
                original_price: None,
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "londondrugs.com",
            display_name: "London Drugs",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["span.price-sales", ".price"]),
                name: FieldSelectors::css(&["h1.product-name", "h1"]),
                availability: availability(&["button#add-to-cart"], &["add to cart"]),
                image: None,
                original_price: Some(FieldSelectors::css(&["span.price-standard"])),
                wait_for: None,
                json_ld: true,
            },
        },
        SeedStore {
            domain: "newegg.ca",
            display_name: "Newegg Canada",
            rate_limit_rpm: 10,
            selectors: SelectorSet {
                price: FieldSelectors::css(&["li.price-current", ".price-current"]),
                name: FieldSelectors::css(&["h1.product-title", "h1"]),
                availability: availability(&["button.btn-primary"], &["add to cart"]),
                image: None,
                original_price: Some(FieldSelectors::css(&["li.price-was"])),
                wait_for: None,
                json_ld: true,
            },
        },
    ]
}
