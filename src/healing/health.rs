use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::info;

use crate::config::{HEALTH_MIN_SCRAPES, HEALTH_WINDOW_DAYS};
use crate::db::store_registry::StoreRegistry;
use crate::error::Result;

#[derive(Debug, Clone)]
pub struct StoreHealth {
    pub domain: String,
    pub display_name: String,
    pub total_products: i64,
    pub active_products: i64,
    pub failing_products: i64,
    pub success_rate: f64,
    pub total_scrapes: i64,
    pub successful_scrapes: i64,
    pub is_healthy: bool,
    pub last_success_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub calculated_at: DateTime<Utc>,
    pub total_stores: usize,
    pub healthy_stores: usize,
    pub unhealthy_stores: usize,
    pub overall_success_rate: f64,
    pub stores: Vec<StoreHealth>,
}

/// Rolling success-rate computation per store over its own products' scrape
/// logs. Fewer than five scrapes in the window is not enough signal, so the
/// store is treated as healthy.
pub struct StoreHealthCalculator {
    pool: SqlitePool,
    registry: StoreRegistry,
    failure_threshold: f64,
}

impl StoreHealthCalculator {
    pub fn new(pool: SqlitePool, registry: StoreRegistry, failure_threshold: f64) -> Self {
        Self {
            pool,
            registry,
            failure_threshold,
        }
    }

    pub async fn store_health(&self, domain: &str) -> Result<Option<StoreHealth>> {
        let Some(store) = self.registry.lookup(domain).await? else {
            return Ok(None);
        };

        let cutoff = Utc::now() - Duration::days(HEALTH_WINDOW_DAYS);

        let total_products: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM products WHERE store_domain = ? AND deleted_at IS NULL",
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;

        let active_products: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM products
             WHERE store_domain = ? AND deleted_at IS NULL AND status = 'active'",
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;

        let failing_products: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM products
             WHERE store_domain = ? AND deleted_at IS NULL
               AND status IN ('error', 'needs_attention')",
        )
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;

        let total_scrapes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scrape_logs
             WHERE scraped_at >= ?
               AND product_id IN
                   (SELECT id FROM products WHERE store_domain = ? AND deleted_at IS NULL)",
        )
        .bind(cutoff)
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;

        let successful_scrapes: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM scrape_logs
             WHERE scraped_at >= ? AND success = 1
               AND product_id IN
                   (SELECT id FROM products WHERE store_domain = ? AND deleted_at IS NULL)",
        )
        .bind(cutoff)
        .bind(domain)
        .fetch_one(&self.pool)
        .await?;

        let success_rate = if total_scrapes < HEALTH_MIN_SCRAPES {
            1.0
        } else {
            successful_scrapes as f64 / total_scrapes as f64
        };

        Ok(Some(StoreHealth {
            domain: store.domain,
            display_name: store.display_name,
            total_products,
            active_products,
            failing_products,
            success_rate,
            total_scrapes,
            successful_scrapes,
            is_healthy: success_rate >= self.failure_threshold,
            last_success_at: store.last_success_at,
        }))
    }

    /// Compute and persist health for every active store; returns the report.
    pub async fn recompute_all(&self) -> Result<HealthReport> {
        let stores = self.registry.all_active().await?;
        let mut report_stores = Vec::new();
        let mut total_success = 0i64;
        let mut total_scrapes = 0i64;

        for store in &stores {
            if let Some(health) = self.store_health(&store.domain).await? {
                self.registry
                    .update_success_rate(&store.domain, health.success_rate)
                    .await?;
                total_success += health.successful_scrapes;
                total_scrapes += health.total_scrapes;
                report_stores.push(health);
            }
        }

        let healthy = report_stores.iter().filter(|h| h.is_healthy).count();
        let report = HealthReport {
            calculated_at: Utc::now(),
            total_stores: report_stores.len(),
            healthy_stores: healthy,
            unhealthy_stores: report_stores.len() - healthy,
            overall_success_rate: if total_scrapes > 0 {
                total_success as f64 / total_scrapes as f64
            } else {
                1.0
            },
            stores: report_stores,
        };

        info!(
            stores = report.total_stores,
            healthy = report.healthy_stores,
            unhealthy = report.unhealthy_stores,
            overall_rate = report.overall_success_rate,
            "store health recomputed"
        );

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::products::{append_scrape_log, insert_product};
    use crate::db::test_pool;
    use crate::types::ScrapeErrorType;

    async fn setup(pool: &SqlitePool) -> i64 {
        sqlx::query(
            "INSERT INTO stores (domain, display_name, created_at, updated_at)
             VALUES ('shop.ca', 'Shop', ?, ?)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
        insert_product(pool, "https://shop.ca/p/1", "shop.ca", "Widget")
            .await
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn insufficient_signal_reads_healthy() {
        let pool = test_pool().await;
        let product_id = setup(&pool).await;
        // Three failures is under the minimum sample.
        for _ in 0..3 {
            append_scrape_log(
                &pool,
                product_id,
                false,
                None,
                Some(ScrapeErrorType::ParseFailure),
                None,
                None,
            )
            .await
            .unwrap();
        }

        let registry = StoreRegistry::new(pool.clone());
        let calc = StoreHealthCalculator::new(pool.clone(), registry, 0.5);
        let health = calc.store_health("shop.ca").await.unwrap().unwrap();
        assert_eq!(health.total_scrapes, 3);
        assert_eq!(health.success_rate, 1.0);
        assert!(health.is_healthy);
    }

    #[tokio::test]
    async fn failing_store_drops_below_threshold_and_persists() {
        let pool = test_pool().await;
        let product_id = setup(&pool).await;
        // 2 successes, 8 failures: 20% success rate.
        for _ in 0..2 {
            append_scrape_log(&pool, product_id, true, None, None, None, Some(10))
                .await
                .unwrap();
        }
        for _ in 0..8 {
            append_scrape_log(
                &pool,
                product_id,
                false,
                None,
                Some(ScrapeErrorType::ParseFailure),
                None,
                None,
            )
            .await
            .unwrap();
        }

        let registry = StoreRegistry::new(pool.clone());
        let calc = StoreHealthCalculator::new(pool.clone(), registry.clone(), 0.5);
        let report = calc.recompute_all().await.unwrap();
        assert_eq!(report.total_stores, 1);
        assert_eq!(report.unhealthy_stores, 1);

        let health = &report.stores[0];
        assert!((health.success_rate - 0.2).abs() < 1e-9);
        assert!(!health.is_healthy);

        // Persisted on the store row.
        let store = registry.lookup("shop.ca").await.unwrap().unwrap();
        assert!((store.success_rate - 0.2).abs() < 1e-9);
    }

    #[tokio::test]
    async fn old_logs_fall_out_of_the_window() {
        let pool = test_pool().await;
        let product_id = setup(&pool).await;
        // Ten ancient failures plus five fresh successes.
        for _ in 0..10 {
            sqlx::query(
                "INSERT INTO scrape_logs (product_id, success, error_type, scraped_at)
                 VALUES (?, 0, 'parse_failure', ?)",
            )
            .bind(product_id)
            .bind(Utc::now() - Duration::days(10))
            .execute(&pool)
            .await
            .unwrap();
        }
        for _ in 0..5 {
            append_scrape_log(&pool, product_id, true, None, None, None, Some(10))
                .await
                .unwrap();
        }

        let registry = StoreRegistry::new(pool.clone());
        let calc = StoreHealthCalculator::new(pool.clone(), registry, 0.5);
        let health = calc.store_health("shop.ca").await.unwrap().unwrap();
        assert_eq!(health.total_scrapes, 5);
        assert_eq!(health.success_rate, 1.0);
    }
}
