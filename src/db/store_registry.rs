use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info};

use crate::db::models::StoreRow;
use crate::error::Result;
use crate::seed::SeedStore;
use crate::types::SelectorSet;

/// Read-mostly registry over the stores table. Writers (seed reconcile,
/// healing, health recompute, success tracking) go through row-level updates
/// here; nothing else mutates store rows.
#[derive(Clone)]
pub struct StoreRegistry {
    pool: SqlitePool,
}

impl StoreRegistry {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn lookup(&self, domain: &str) -> Result<Option<StoreRow>> {
        let row = sqlx::query_as::<_, StoreRow>("SELECT * FROM stores WHERE domain = ?")
            .bind(domain)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    pub async fn selectors_for(&self, domain: &str) -> Result<Option<SelectorSet>> {
        Ok(self.lookup(domain).await?.map(|s| s.selector_set()))
    }

    pub async fn all_active(&self) -> Result<Vec<StoreRow>> {
        let rows = sqlx::query_as::<_, StoreRow>("SELECT * FROM stores WHERE active = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Stamp the latest successful scrape for a store.
    pub async fn record_success(&self, domain: &str, at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE stores SET last_success_at = ?, updated_at = ? WHERE domain = ?")
            .bind(at)
            .bind(Utc::now())
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Merge new selectors into a store's existing set. Keys the update does
    /// not carry survive untouched.
    pub async fn update_selectors(&self, domain: &str, new_selectors: &SelectorSet) -> Result<bool> {
        let Some(store) = self.lookup(domain).await? else {
            return Ok(false);
        };
        let mut merged = store.selector_set();
        merged.merge(new_selectors);
        let json = serde_json::to_string(&merged)?;

        sqlx::query("UPDATE stores SET selectors = ?, updated_at = ? WHERE domain = ?")
            .bind(json)
            .bind(Utc::now())
            .bind(domain)
            .execute(&self.pool)
            .await?;
        info!(domain, "store selectors updated");
        Ok(true)
    }

    pub async fn update_success_rate(&self, domain: &str, rate: f64) -> Result<()> {
        sqlx::query("UPDATE stores SET success_rate = ?, updated_at = ? WHERE domain = ?")
            .bind(rate.clamp(0.0, 1.0))
            .bind(Utc::now())
            .bind(domain)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Reconcile the seed into the table. Fields the seed carries overwrite;
    /// fields it does not (success_rate, last_success_at, healing-learned
    /// selector keys) are preserved across restarts.
    pub async fn reconcile_seed(&self, seeds: &[SeedStore]) -> Result<()> {
        for seed in seeds {
            let now = Utc::now();
            match self.lookup(seed.domain).await? {
                Some(existing) => {
                    let mut merged = existing.selector_set();
                    merged.merge(&seed.selectors);
                    let json = serde_json::to_string(&merged)?;
                    sqlx::query(
                        "UPDATE stores
                         SET display_name = ?, rate_limit_rpm = ?, selectors = ?, updated_at = ?
                         WHERE domain = ?",
                    )
                    .bind(seed.display_name)
                    .bind(seed.rate_limit_rpm)
                    .bind(json)
                    .bind(now)
                    .bind(seed.domain)
                    .execute(&self.pool)
                    .await?;
                    debug!(domain = seed.domain, "seed reconciled into existing store");
                }
                None => {
                    let json = serde_json::to_string(&seed.selectors)?;
                    sqlx::query(
                        "INSERT INTO stores
                         (domain, display_name, whitelisted, active, rate_limit_rpm,
                          selectors, success_rate, created_at, updated_at)
                         VALUES (?, ?, 1, 1, ?, ?, 1.0, ?, ?)",
                    )
                    .bind(seed.domain)
                    .bind(seed.display_name)
                    .bind(seed.rate_limit_rpm)
                    .bind(json)
                    .bind(now)
                    .bind(now)
                    .execute(&self.pool)
                    .await?;
                    debug!(domain = seed.domain, "seed store created");
                }
            }
        }
        info!(count = seeds.len(), "store seed reconciled");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::types::FieldSelectors;

    fn seed(domain: &'static str) -> SeedStore {
        SeedStore {
            domain,
            display_name: "Test Store",
            rate_limit_rpm: 7,
            selectors: SelectorSet {
                price: FieldSelectors::css(&[".price"]),
                name: FieldSelectors::css(&["h1"]),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn reconcile_creates_then_preserves_learned_state() {
        let pool = test_pool().await;
        let registry = StoreRegistry::new(pool);

        registry.reconcile_seed(&[seed("shop.ca")]).await.unwrap();
        let store = registry.lookup("shop.ca").await.unwrap().unwrap();
        assert_eq!(store.display_name, "Test Store");
        assert_eq!(store.rate_limit_rpm, 7);
        assert_eq!(store.success_rate, 1.0);

        // Healing learns a wait_for and a new price selector.
        let learned = SelectorSet {
            price: FieldSelectors::css(&[".healed-price"]),
            wait_for: Some("#main".to_string()),
            ..Default::default()
        };
        registry.update_selectors("shop.ca", &learned).await.unwrap();
        registry.update_success_rate("shop.ca", 0.4).await.unwrap();

        // Restart: the seed reconcile must overwrite seed-carried fields but
        // keep the learned wait_for and the recorded success rate.
        registry.reconcile_seed(&[seed("shop.ca")]).await.unwrap();
        let store = registry.lookup("shop.ca").await.unwrap().unwrap();
        let selectors = store.selector_set();
        assert_eq!(selectors.price.css, vec![".price"]);
        assert_eq!(selectors.wait_for.as_deref(), Some("#main"));
        assert_eq!(store.success_rate, 0.4);
    }

    #[tokio::test]
    async fn update_selectors_merges_rather_than_replaces() {
        let pool = test_pool().await;
        let registry = StoreRegistry::new(pool);
        registry.reconcile_seed(&[seed("merge.ca")]).await.unwrap();

        let update = SelectorSet {
            availability: FieldSelectors {
                css: vec!["#cart".to_string()],
                in_stock_patterns: vec!["in stock".to_string()],
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(registry.update_selectors("merge.ca", &update).await.unwrap());

        let selectors = registry.selectors_for("merge.ca").await.unwrap().unwrap();
        assert_eq!(selectors.price.css, vec![".price"]);
        assert_eq!(selectors.availability.css, vec!["#cart"]);
    }

    #[tokio::test]
    async fn missing_store_reports_false() {
        let pool = test_pool().await;
        let registry = StoreRegistry::new(pool);
        assert!(!registry
            .update_selectors("ghost.ca", &SelectorSet::default())
            .await
            .unwrap());
        assert!(registry.lookup("ghost.ca").await.unwrap().is_none());
    }
}
