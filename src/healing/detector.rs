use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use crate::db::models::ProductRow;
use crate::db::products::{latest_failed_log, not_found_persisted, product_by_id};
use crate::error::Result;
use crate::types::{FailureCategory, ProductStatus};

#[derive(Debug, Clone)]
pub struct FailureAnalysis {
    pub product_id: i64,
    pub store_domain: String,
    pub category: FailureCategory,
    pub consecutive_failures: i64,
    pub needs_healing: bool,
    pub needs_attention: bool,
    pub last_error: Option<String>,
    pub last_failure_at: Option<DateTime<Utc>>,
}

/// Maps scrape-log history to healing eligibility: which products are broken,
/// whether the breakage looks like a selector problem, and which products are
/// beyond self-repair.
pub struct FailureDetector {
    pool: SqlitePool,
    failure_threshold: i64,
}

impl FailureDetector {
    pub fn new(pool: SqlitePool, failure_threshold: i64) -> Self {
        Self {
            pool,
            failure_threshold,
        }
    }

    /// Analyze one product's failure state from its latest failed log.
    pub async fn analyze(&self, product_id: i64) -> Result<Option<FailureAnalysis>> {
        let Some(product) = product_by_id(&self.pool, product_id).await? else {
            return Ok(None);
        };
        Ok(Some(self.analyze_product(&product).await?))
    }

    async fn analyze_product(&self, product: &ProductRow) -> Result<FailureAnalysis> {
        let last_failure = latest_failed_log(&self.pool, product.id).await?;

        let category = last_failure
            .as_ref()
            .and_then(|log| log.error_type)
            .map(FailureCategory::from)
            .unwrap_or(FailureCategory::Unknown);

        let needs_healing = product.consecutive_failures >= self.failure_threshold
            && category.is_healable()
            && product.status != ProductStatus::NeedsAttention;

        let needs_attention = self.check_needs_attention(product, category).await?;

        Ok(FailureAnalysis {
            product_id: product.id,
            store_domain: product.store_domain.clone(),
            category,
            consecutive_failures: product.consecutive_failures,
            needs_healing,
            needs_attention,
            last_error: last_failure.as_ref().and_then(|l| l.error_message.clone()),
            last_failure_at: last_failure.map(|l| l.scraped_at),
        })
    }

    async fn check_needs_attention(
        &self,
        product: &ProductRow,
        category: FailureCategory,
    ) -> Result<bool> {
        if product.status == ProductStatus::NeedsAttention {
            return Ok(true);
        }
        if category == FailureCategory::NotFound
            && not_found_persisted(&self.pool, product.id, Utc::now()).await?
        {
            return Ok(true);
        }
        Ok(!category.is_healable()
            && category != FailureCategory::Unknown
            && product.consecutive_failures >= self.failure_threshold)
    }

    /// Candidate products for a healing cycle: failure streak at threshold,
    /// healable latest category, not already flagged or archived.
    pub async fn products_needing_healing(
        &self,
        store_domain: Option<&str>,
        limit: i64,
    ) -> Result<Vec<FailureAnalysis>> {
        let rows: Vec<ProductRow> = match store_domain {
            Some(domain) => {
                sqlx::query_as(
                    "SELECT * FROM products
                     WHERE deleted_at IS NULL AND consecutive_failures >= ?
                       AND status NOT IN ('needs_attention', 'archived')
                       AND store_domain = ?
                     ORDER BY store_domain, id LIMIT ?",
                )
                .bind(self.failure_threshold)
                .bind(domain)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    "SELECT * FROM products
                     WHERE deleted_at IS NULL AND consecutive_failures >= ?
                       AND status NOT IN ('needs_attention', 'archived')
                     ORDER BY store_domain, id LIMIT ?",
                )
                .bind(self.failure_threshold)
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };

        let mut candidates = Vec::new();
        for product in &rows {
            let analysis = self.analyze_product(product).await?;
            if analysis.needs_healing {
                candidates.push(analysis);
            }
        }
        Ok(candidates)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::products::{append_scrape_log, apply_scrape_failure, insert_product};
    use crate::db::test_pool;
    use crate::types::ScrapeErrorType;

    async fn seeded_product(pool: &SqlitePool, url: &str) -> ProductRow {
        sqlx::query(
            "INSERT OR IGNORE INTO stores (domain, display_name, created_at, updated_at)
             VALUES ('shop.ca', 'Shop', ?, ?)",
        )
        .bind(Utc::now())
        .bind(Utc::now())
        .execute(pool)
        .await
        .unwrap();
        insert_product(pool, url, "shop.ca", "Widget").await.unwrap()
    }

    async fn fail_n(pool: &SqlitePool, product_id: i64, error: ScrapeErrorType, n: usize) {
        for _ in 0..n {
            let p = product_by_id(pool, product_id).await.unwrap().unwrap();
            apply_scrape_failure(pool, &p, error, Some("boom"), None)
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn parse_failure_streak_needs_healing() {
        let pool = test_pool().await;
        let product = seeded_product(&pool, "https://shop.ca/p/1").await;
        fail_n(&pool, product.id, ScrapeErrorType::ParseFailure, 3).await;

        let detector = FailureDetector::new(pool.clone(), 3);
        let analysis = detector.analyze(product.id).await.unwrap().unwrap();
        assert_eq!(analysis.category, FailureCategory::ParseFailure);
        assert_eq!(analysis.consecutive_failures, 3);
        assert!(analysis.needs_healing);
        assert!(!analysis.needs_attention);
    }

    #[tokio::test]
    async fn blocked_streak_needs_attention_not_healing() {
        let pool = test_pool().await;
        let product = seeded_product(&pool, "https://shop.ca/p/2").await;
        fail_n(&pool, product.id, ScrapeErrorType::Blocked, 3).await;

        let detector = FailureDetector::new(pool.clone(), 3);
        let analysis = detector.analyze(product.id).await.unwrap().unwrap();
        assert!(!analysis.needs_healing);
        assert!(analysis.needs_attention);
    }

    #[tokio::test]
    async fn below_threshold_is_left_alone() {
        let pool = test_pool().await;
        let product = seeded_product(&pool, "https://shop.ca/p/3").await;
        fail_n(&pool, product.id, ScrapeErrorType::ParseFailure, 2).await;

        let detector = FailureDetector::new(pool.clone(), 3);
        let analysis = detector.analyze(product.id).await.unwrap().unwrap();
        assert!(!analysis.needs_healing);
        assert!(!analysis.needs_attention);
    }

    #[tokio::test]
    async fn candidate_listing_filters_by_eligibility() {
        let pool = test_pool().await;
        let healable = seeded_product(&pool, "https://shop.ca/p/4").await;
        let blocked = seeded_product(&pool, "https://shop.ca/p/5").await;
        let healthy = seeded_product(&pool, "https://shop.ca/p/6").await;
        fail_n(&pool, healable.id, ScrapeErrorType::ParseFailure, 3).await;
        fail_n(&pool, blocked.id, ScrapeErrorType::Blocked, 3).await;
        append_scrape_log(&pool, healthy.id, true, None, None, None, Some(10))
            .await
            .unwrap();

        let detector = FailureDetector::new(pool.clone(), 3);
        let candidates = detector.products_needing_healing(None, 50).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].product_id, healable.id);
    }
}
