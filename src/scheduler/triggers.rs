use std::str::FromStr;

use chrono::{DateTime, Utc};
use cron::Schedule;
use sqlx::SqlitePool;

use crate::db::models::ScheduleRow;
use crate::error::{AppError, Result};

/// Minimum interval between firings of a user-submitted schedule.
pub const MIN_INTERVAL_HOURS: f64 = 24.0;

/// System default: daily at 06:00 UTC.
pub const DEFAULT_CRON: &str = "0 6 * * *";

#[derive(Debug, Clone)]
pub struct CronValidation {
    pub valid: bool,
    pub expression: String,
    pub error: Option<String>,
    pub next_run: Option<DateTime<Utc>>,
    pub interval_hours: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleSource {
    Product,
    Store,
    System,
}

#[derive(Debug, Clone)]
pub struct ScheduleInfo {
    pub product_id: i64,
    pub cron_expression: String,
    pub source: ScheduleSource,
    pub schedule_id: Option<i64>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Parse a standard five-field cron expression. The cron crate expects a
/// leading seconds field, so one is prepended; a bare `0` day-of-week (the
/// classic Sunday spelling) is rewritten to `SUN`, which the parser accepts.
pub fn parse_cron(expression: &str) -> std::result::Result<Schedule, String> {
    let fields: Vec<&str> = expression.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(format!("expected 5 fields, got {}", fields.len()));
    }
    let dow = if fields[4] == "0" { "SUN" } else { fields[4] };
    let normalized = format!(
        "0 {} {} {} {} {dow}",
        fields[0], fields[1], fields[2], fields[3]
    );
    Schedule::from_str(&normalized).map_err(|e| e.to_string())
}

pub fn validate_cron(expression: &str) -> CronValidation {
    let expression = expression.trim().to_string();
    match parse_cron(&expression) {
        Ok(schedule) => {
            let mut upcoming = schedule.upcoming(Utc);
            let next_run = upcoming.next();
            let second = upcoming.next();
            let interval_hours = match (next_run, second) {
                (Some(a), Some(b)) => Some((b - a).num_seconds() as f64 / 3600.0),
                _ => None,
            };
            CronValidation {
                valid: true,
                expression,
                error: None,
                next_run,
                interval_hours,
            }
        }
        Err(e) => CronValidation {
            valid: false,
            expression,
            error: Some(e),
            next_run: None,
            interval_hours: None,
        },
    }
}

/// Validate and enforce the minimum firing interval, computed from the gap
/// between the next and next-next fire times.
pub fn validate_cron_with_minimum(expression: &str) -> CronValidation {
    let mut validation = validate_cron(expression);
    if !validation.valid {
        return validation;
    }
    if let Some(hours) = validation.interval_hours {
        if hours < MIN_INTERVAL_HOURS {
            validation.valid = false;
            validation.error = Some(format!(
                "interval {hours:.1}h is below minimum {MIN_INTERVAL_HOURS:.0}h"
            ));
        }
    }
    validation
}

pub fn next_run_time(expression: &str, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    parse_cron(expression).ok()?.after(&after).next()
}

// ---------------------------------------------------------------------------
// Effective schedule resolution
// ---------------------------------------------------------------------------

/// Resolve the effective schedule for a product:
/// product-schedule > store-schedule > system default.
pub async fn effective_schedule(
    pool: &SqlitePool,
    product_id: i64,
    default_cron: &str,
) -> Result<ScheduleInfo> {
    let product: Option<(String,)> = sqlx::query_as(
        "SELECT store_domain FROM products WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(product_id)
    .fetch_optional(pool)
    .await?;

    let Some((store_domain,)) = product else {
        return Ok(ScheduleInfo {
            product_id,
            cron_expression: default_cron.to_string(),
            source: ScheduleSource::System,
            schedule_id: None,
            next_run: next_run_time(default_cron, Utc::now()),
        });
    };

    let product_schedule: Option<ScheduleRow> = sqlx::query_as(
        "SELECT * FROM schedules
         WHERE product_id = ? AND active = 1 AND deleted_at IS NULL
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(product_id)
    .fetch_optional(pool)
    .await?;
    if let Some(row) = product_schedule {
        return Ok(ScheduleInfo {
            product_id,
            next_run: next_run_time(&row.cron_expression, Utc::now()),
            cron_expression: row.cron_expression,
            source: ScheduleSource::Product,
            schedule_id: Some(row.id),
        });
    }

    let store_schedule: Option<ScheduleRow> = sqlx::query_as(
        "SELECT * FROM schedules
         WHERE store_domain = ? AND product_id IS NULL AND active = 1 AND deleted_at IS NULL
         ORDER BY created_at DESC, id DESC LIMIT 1",
    )
    .bind(&store_domain)
    .fetch_optional(pool)
    .await?;
    if let Some(row) = store_schedule {
        return Ok(ScheduleInfo {
            product_id,
            next_run: next_run_time(&row.cron_expression, Utc::now()),
            cron_expression: row.cron_expression,
            source: ScheduleSource::Store,
            schedule_id: Some(row.id),
        });
    }

    Ok(ScheduleInfo {
        product_id,
        cron_expression: default_cron.to_string(),
        source: ScheduleSource::System,
        schedule_id: None,
        next_run: next_run_time(default_cron, Utc::now()),
    })
}

// ---------------------------------------------------------------------------
// Persistence
// ---------------------------------------------------------------------------

/// Create a schedule for exactly one of a product or a store, enforcing the
/// minimum interval.
pub async fn create_schedule(
    pool: &SqlitePool,
    cron_expression: &str,
    product_id: Option<i64>,
    store_domain: Option<&str>,
) -> Result<ScheduleRow> {
    if product_id.is_some() == store_domain.is_some() {
        return Err(AppError::Schedule(
            "exactly one of product_id or store_domain must be set".to_string(),
        ));
    }

    let validation = validate_cron_with_minimum(cron_expression);
    if !validation.valid {
        return Err(AppError::Schedule(format!(
            "invalid cron expression: {}",
            validation.error.unwrap_or_default()
        )));
    }

    let now = Utc::now();
    let id = sqlx::query(
        "INSERT INTO schedules
         (product_id, store_domain, cron_expression, active, next_run_at, created_at, updated_at)
         VALUES (?, ?, ?, 1, ?, ?, ?)",
    )
    .bind(product_id)
    .bind(store_domain)
    .bind(&validation.expression)
    .bind(validation.next_run)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?
    .last_insert_rowid();

    let row: ScheduleRow = sqlx::query_as("SELECT * FROM schedules WHERE id = ?")
        .bind(id)
        .fetch_one(pool)
        .await?;
    Ok(row)
}

/// Stamp a schedule after it fires: last_run_at = now, next_run_at from cron.
pub async fn mark_schedule_run(pool: &SqlitePool, schedule_id: i64) -> Result<()> {
    let row: Option<ScheduleRow> = sqlx::query_as("SELECT * FROM schedules WHERE id = ?")
        .bind(schedule_id)
        .fetch_optional(pool)
        .await?;
    let Some(row) = row else {
        return Err(AppError::RecordNotFound(format!("schedule {schedule_id}")));
    };

    let now = Utc::now();
    sqlx::query(
        "UPDATE schedules SET last_run_at = ?, next_run_at = ?, updated_at = ? WHERE id = ?",
    )
    .bind(now)
    .bind(next_run_time(&row.cron_expression, now))
    .bind(now)
    .bind(schedule_id)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn set_schedule_active(pool: &SqlitePool, schedule_id: i64, active: bool) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE schedules SET active = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(active)
    .bind(Utc::now())
    .bind(schedule_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn cancel_schedule(pool: &SqlitePool, schedule_id: i64) -> Result<bool> {
    let result = sqlx::query(
        "UPDATE schedules SET deleted_at = ?, active = 0, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(Utc::now())
    .bind(Utc::now())
    .bind(schedule_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Persisted schedules due at or before `now`.
pub async fn due_schedules(pool: &SqlitePool, now: DateTime<Utc>) -> Result<Vec<ScheduleRow>> {
    let rows: Vec<ScheduleRow> = sqlx::query_as(
        "SELECT * FROM schedules
         WHERE active = 1 AND deleted_at IS NULL
           AND next_run_at IS NOT NULL AND next_run_at <= ?
         ORDER BY next_run_at",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::products::insert_product;
    use crate::db::test_pool;

    #[test]
    fn five_field_daily_cron_is_valid() {
        let validation = validate_cron_with_minimum("0 6 * * *");
        assert!(validation.valid, "{:?}", validation.error);
        assert_eq!(validation.interval_hours, Some(24.0));
        assert!(validation.next_run.is_some());
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        let validation = validate_cron("0 6 * *");
        assert!(!validation.valid);
        assert!(validation.error.unwrap().contains("5 fields"));
    }

    #[test]
    fn sub_daily_interval_is_rejected() {
        // Hourly: next-next gap is one hour.
        let validation = validate_cron_with_minimum("0 * * * *");
        assert!(!validation.valid);
        assert!(validation.error.unwrap().contains("below minimum"));

        // Every 30 minutes.
        let validation = validate_cron_with_minimum("*/30 * * * *");
        assert!(!validation.valid);
    }

    #[test]
    fn weekly_cron_passes_minimum() {
        let validation = validate_cron_with_minimum("0 6 * * 1");
        assert!(validation.valid);
        assert_eq!(validation.interval_hours, Some(24.0 * 7.0));
    }

    #[tokio::test]
    async fn schedule_requires_exactly_one_owner() {
        let pool = test_pool().await;
        assert!(create_schedule(&pool, "0 6 * * *", None, None).await.is_err());
        assert!(
            create_schedule(&pool, "0 6 * * *", Some(1), Some("shop.ca"))
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn next_and_last_run_stay_a_day_apart() {
        let pool = test_pool().await;
        let row = create_schedule(&pool, "0 6 * * *", None, Some("shop.ca"))
            .await
            .unwrap();
        assert!(row.next_run_at.is_some());

        mark_schedule_run(&pool, row.id).await.unwrap();
        let row: ScheduleRow = sqlx::query_as("SELECT * FROM schedules WHERE id = ?")
            .bind(row.id)
            .fetch_one(&pool)
            .await
            .unwrap();
        let last = row.last_run_at.unwrap();
        let next = row.next_run_at.unwrap();
        assert!(next - last >= chrono::Duration::hours(24) - chrono::Duration::minutes(1));
    }

    #[tokio::test]
    async fn resolution_prefers_product_then_store_then_system() {
        let pool = test_pool().await;
        sqlx::query(
            "INSERT INTO stores (domain, display_name, created_at, updated_at)
             VALUES ('shop.ca', 'Shop', ?, ?)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(&pool)
        .await
        .unwrap();
        let product = insert_product(&pool, "https://shop.ca/p/1", "shop.ca", "Widget")
            .await
            .unwrap();

        // No schedules: system default.
        let info = effective_schedule(&pool, product.id, DEFAULT_CRON).await.unwrap();
        assert_eq!(info.source, ScheduleSource::System);
        assert_eq!(info.cron_expression, DEFAULT_CRON);

        // Store schedule takes over.
        create_schedule(&pool, "0 7 * * *", None, Some("shop.ca"))
            .await
            .unwrap();
        let info = effective_schedule(&pool, product.id, DEFAULT_CRON).await.unwrap();
        assert_eq!(info.source, ScheduleSource::Store);
        assert_eq!(info.cron_expression, "0 7 * * *");

        // Product schedule wins over both.
        create_schedule(&pool, "0 8 * * *", Some(product.id), None)
            .await
            .unwrap();
        let info = effective_schedule(&pool, product.id, DEFAULT_CRON).await.unwrap();
        assert_eq!(info.source, ScheduleSource::Product);
        assert_eq!(info.cron_expression, "0 8 * * *");
    }

    #[tokio::test]
    async fn due_listing_and_cancel() {
        let pool = test_pool().await;
        let row = create_schedule(&pool, "0 6 * * *", None, Some("shop.ca"))
            .await
            .unwrap();

        // Not due yet.
        assert!(due_schedules(&pool, Utc::now()).await.unwrap().is_empty());

        // Backdate next_run_at to force due.
        sqlx::query("UPDATE schedules SET next_run_at = ? WHERE id = ?")
            .bind(Utc::now() - chrono::Duration::minutes(5))
            .bind(row.id)
            .execute(&pool)
            .await
            .unwrap();
        let due = due_schedules(&pool, Utc::now()).await.unwrap();
        assert_eq!(due.len(), 1);

        assert!(cancel_schedule(&pool, row.id).await.unwrap());
        assert!(due_schedules(&pool, Utc::now()).await.unwrap().is_empty());
    }
}
