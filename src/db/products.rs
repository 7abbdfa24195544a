use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::db::models::{ProductRow, ScrapeLogRow};
use crate::error::Result;
use crate::types::{
    ExtractionStrategy, FailureCategory, ProductSnapshot, ProductStatus, ScrapeErrorType,
};

/// Consecutive-failure threshold at which status degrades.
const FAILURE_THRESHOLD: i64 = 3;

/// Days of persistent 404s before a product is flagged for attention.
const ATTENTION_404_DAYS: i64 = 3;

/// What a successful scrape did to the row, for the alert pipeline.
#[derive(Debug, Clone)]
pub struct SuccessOutcome {
    pub previous_price: Option<f64>,
    pub previous_in_stock: bool,
    pub new_price: f64,
    pub new_in_stock: bool,
    pub price_history_written: bool,
}

pub async fn product_by_id(pool: &SqlitePool, id: i64) -> Result<Option<ProductRow>> {
    let row = sqlx::query_as::<_, ProductRow>(
        "SELECT * FROM products WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn product_by_url(pool: &SqlitePool, url: &str) -> Result<Option<ProductRow>> {
    let row = sqlx::query_as::<_, ProductRow>(
        "SELECT * FROM products WHERE url = ? AND deleted_at IS NULL",
    )
    .bind(url)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

/// Products eligible for the daily sweep: live, active-tracked rows.
pub async fn scrapeable_products(pool: &SqlitePool) -> Result<Vec<ProductRow>> {
    let rows = sqlx::query_as::<_, ProductRow>(
        "SELECT * FROM products
         WHERE deleted_at IS NULL AND status IN ('active', 'error')
         ORDER BY store_domain, id",
    )
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn products_for_store(pool: &SqlitePool, domain: &str) -> Result<Vec<ProductRow>> {
    let rows = sqlx::query_as::<_, ProductRow>(
        "SELECT * FROM products
         WHERE store_domain = ? AND deleted_at IS NULL AND status IN ('active', 'error')
         ORDER BY id",
    )
    .bind(domain)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

pub async fn insert_product(
    pool: &SqlitePool,
    url: &str,
    store_domain: &str,
    name: &str,
) -> Result<ProductRow> {
    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO products (url, store_domain, name, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?)",
    )
    .bind(url)
    .bind(store_domain)
    .bind(name)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    let row = product_by_id(pool, id)
        .await?
        .ok_or_else(|| crate::error::AppError::RecordNotFound(format!("product {id}")))?;
    Ok(row)
}

pub async fn soft_delete_product(pool: &SqlitePool, id: i64) -> Result<()> {
    sqlx::query("UPDATE products SET deleted_at = ?, updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scrape outcome application
// ---------------------------------------------------------------------------

/// Apply a successful scrape: update product fields, reset the failure
/// counter, restore ACTIVE from error states, and append a price-history row
/// iff the price moved at least one cent or stock flipped.
pub async fn apply_scrape_success(
    pool: &SqlitePool,
    product: &ProductRow,
    snapshot: &ProductSnapshot,
    strategy: Option<ExtractionStrategy>,
    response_time_ms: i64,
) -> Result<SuccessOutcome> {
    let now = Utc::now();
    let new_price = snapshot.price.unwrap_or_default();
    let previous_price = product.current_price;
    let previous_in_stock = product.in_stock;

    let status = match product.status {
        ProductStatus::Error | ProductStatus::NeedsAttention => ProductStatus::Active,
        other => other,
    };

    // Backfill identity fields only when the stored value is empty.
    let name = if product.name.is_empty() {
        snapshot.name.clone().unwrap_or_default()
    } else {
        product.name.clone()
    };
    let brand = product.brand.clone().or_else(|| snapshot.brand.clone());
    let upc = product.upc.clone().or_else(|| snapshot.upc.clone());
    let image_url = product
        .image_url
        .clone()
        .or_else(|| snapshot.image_url.clone());

    sqlx::query(
        "UPDATE products
         SET name = ?, brand = ?, upc = ?, image_url = ?,
             current_price = ?, original_price = ?, currency = ?, in_stock = ?,
             status = ?, consecutive_failures = 0, last_checked_at = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(&name)
    .bind(&brand)
    .bind(&upc)
    .bind(&image_url)
    .bind(new_price)
    .bind(snapshot.original_price)
    .bind(&snapshot.currency)
    .bind(snapshot.in_stock)
    .bind(status)
    .bind(now)
    .bind(now)
    .bind(product.id)
    .execute(pool)
    .await?;

    let price_moved = match previous_price {
        None => true,
        Some(old) => (new_price - old).abs() + 1e-9 >= 0.01,
    };
    let stock_flipped = previous_in_stock != snapshot.in_stock;
    let price_history_written = price_moved || stock_flipped;

    if price_history_written {
        sqlx::query(
            "INSERT INTO price_history (product_id, price, original_price, in_stock, scraped_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(product.id)
        .bind(new_price)
        .bind(snapshot.original_price)
        .bind(snapshot.in_stock)
        .bind(now)
        .execute(pool)
        .await?;
    }

    append_scrape_log(pool, product.id, true, strategy, None, None, Some(response_time_ms)).await?;

    debug!(
        product_id = product.id,
        price = new_price,
        history = price_history_written,
        "scrape success applied"
    );

    Ok(SuccessOutcome {
        previous_price,
        previous_in_stock,
        new_price,
        new_in_stock: snapshot.in_stock,
        price_history_written,
    })
}

/// Apply a failed scrape: append the log, increment the failure counter, then
/// degrade status. Counter first, status second; at the threshold a healable
/// category goes ERROR, a non-healable one NEEDS_ATTENTION. A 404 that has
/// persisted three days flags attention regardless of the counter.
pub async fn apply_scrape_failure(
    pool: &SqlitePool,
    product: &ProductRow,
    error_type: ScrapeErrorType,
    error_message: Option<&str>,
    response_time_ms: Option<i64>,
) -> Result<ProductStatus> {
    let now = Utc::now();

    append_scrape_log(
        pool,
        product.id,
        false,
        None,
        Some(error_type),
        error_message,
        response_time_ms,
    )
    .await?;

    let failures = product.consecutive_failures + 1;
    let category = FailureCategory::from(error_type);

    let status = if product.status == ProductStatus::NeedsAttention {
        ProductStatus::NeedsAttention
    } else if category == FailureCategory::NotFound
        && not_found_persisted(pool, product.id, now).await?
    {
        ProductStatus::NeedsAttention
    } else if failures >= FAILURE_THRESHOLD && !category.is_healable() {
        ProductStatus::NeedsAttention
    } else if failures >= FAILURE_THRESHOLD {
        ProductStatus::Error
    } else {
        product.status
    };

    sqlx::query(
        "UPDATE products
         SET consecutive_failures = ?, status = ?, last_checked_at = ?, updated_at = ?
         WHERE id = ?",
    )
    .bind(failures)
    .bind(status)
    .bind(now)
    .bind(now)
    .bind(product.id)
    .execute(pool)
    .await?;

    Ok(status)
}

/// True when the product has been 404 continuously for >= 3 days: the
/// earliest 404 since its last successful scrape is at least that old.
pub(crate) async fn not_found_persisted(
    pool: &SqlitePool,
    product_id: i64,
    now: DateTime<Utc>,
) -> Result<bool> {
    let last_success: Option<DateTime<Utc>> = sqlx::query_scalar(
        "SELECT MAX(scraped_at) FROM scrape_logs WHERE product_id = ? AND success = 1",
    )
    .bind(product_id)
    .fetch_one(pool)
    .await?;

    let first_404: Option<DateTime<Utc>> = match last_success {
        Some(since) => {
            sqlx::query_scalar(
                "SELECT MIN(scraped_at) FROM scrape_logs
                 WHERE product_id = ? AND error_type = 'not_found' AND scraped_at > ?",
            )
            .bind(product_id)
            .bind(since)
            .fetch_one(pool)
            .await?
        }
        None => {
            sqlx::query_scalar(
                "SELECT MIN(scraped_at) FROM scrape_logs
                 WHERE product_id = ? AND error_type = 'not_found'",
            )
            .bind(product_id)
            .fetch_one(pool)
            .await?
        }
    };

    let window_start = now - Duration::days(ATTENTION_404_DAYS);
    Ok(first_404.is_some_and(|t| t <= window_start))
}

/// Reset the failure streak without touching price data. Used by healing
/// after a successful selector merge.
pub async fn reset_failures(pool: &SqlitePool, product_id: i64) -> Result<()> {
    sqlx::query(
        "UPDATE products
         SET consecutive_failures = 0,
             status = CASE WHEN status IN ('error', 'needs_attention')
                           THEN 'active' ELSE status END,
             updated_at = ?
         WHERE id = ?",
    )
    .bind(Utc::now())
    .bind(product_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn flag_needs_attention(pool: &SqlitePool, product_id: i64) -> Result<()> {
    sqlx::query("UPDATE products SET status = 'needs_attention', updated_at = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(product_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scrape logs
// ---------------------------------------------------------------------------

pub async fn append_scrape_log(
    pool: &SqlitePool,
    product_id: i64,
    success: bool,
    strategy: Option<ExtractionStrategy>,
    error_type: Option<ScrapeErrorType>,
    error_message: Option<&str>,
    response_time_ms: Option<i64>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO scrape_logs
         (product_id, success, strategy_used, error_type, error_message, response_time_ms, scraped_at)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(product_id)
    .bind(success)
    .bind(strategy)
    .bind(error_type)
    .bind(error_message)
    .bind(response_time_ms)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn latest_scrape_log(pool: &SqlitePool, product_id: i64) -> Result<Option<ScrapeLogRow>> {
    let row = sqlx::query_as::<_, ScrapeLogRow>(
        "SELECT * FROM scrape_logs WHERE product_id = ? ORDER BY scraped_at DESC, id DESC LIMIT 1",
    )
    .bind(product_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

pub async fn latest_failed_log(pool: &SqlitePool, product_id: i64) -> Result<Option<ScrapeLogRow>> {
    let row = sqlx::query_as::<_, ScrapeLogRow>(
        "SELECT * FROM scrape_logs
         WHERE product_id = ? AND success = 0
         ORDER BY scraped_at DESC, id DESC LIMIT 1",
    )
    .bind(product_id)
    .fetch_optional(pool)
    .await?;
    Ok(row)
}

// ---------------------------------------------------------------------------
// Retention
// ---------------------------------------------------------------------------

pub async fn prune_scrape_logs(pool: &SqlitePool, retention_days: i64) -> Result<u64> {
    let cutoff = Utc::now() - Duration::days(retention_days);
    let result = sqlx::query("DELETE FROM scrape_logs WHERE scraped_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

pub async fn prune_notifications(pool: &SqlitePool, retention_days: i64) -> Result<u64> {
    let cutoff = Utc::now() - Duration::days(retention_days);
    let result = sqlx::query("DELETE FROM notifications WHERE created_at < ?")
        .bind(cutoff)
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}
