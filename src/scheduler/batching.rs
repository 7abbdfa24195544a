use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{FuturesUnordered, StreamExt};
use sqlx::SqlitePool;
use sysinfo::System;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, warn};

use crate::config::{BATCH_CHUNK_SIZE, INTER_BATCH_DELAY_SECS, INTER_STORE_DELAY_SECS};
use crate::db::models::ProductRow;
use crate::db::products::{apply_scrape_failure, apply_scrape_success, product_by_id};
use crate::db::store_registry::StoreRegistry;
use crate::error::Result;
use crate::indexer::ProductIndex;
use crate::notifications::service::NotificationService;
use crate::scraper::engine::ScrapeEngine;
use crate::types::ScrapeErrorType;

#[derive(Debug, Default, Clone)]
pub struct BatchReport {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub skipped: usize,
    pub by_store: HashMap<String, (usize, usize)>,
}

/// Memory watermark probe. RSS above the threshold pauses admission of new
/// scrape tasks until the pressure clears.
struct MemoryGate {
    system: Mutex<System>,
    threshold_percent: f64,
}

impl MemoryGate {
    fn new(threshold_percent: f64) -> Self {
        Self {
            system: Mutex::new(System::new()),
            threshold_percent,
        }
    }

    async fn used_percent(&self) -> f64 {
        let mut system = self.system.lock().await;
        system.refresh_memory();
        let total = system.total_memory();
        if total == 0 {
            return 0.0;
        }
        system.used_memory() as f64 / total as f64 * 100.0
    }

    async fn wait_for_headroom(&self) {
        loop {
            let used = self.used_percent().await;
            if used <= self.threshold_percent {
                return;
            }
            debug!(used_percent = used, "memory above threshold, pausing admission");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

/// Groups due products by host and works through each host in chunks.
/// Within a chunk, scrapes run concurrently under the session cap and the
/// memory watermark; results are committed as they arrive, and each product's
/// scrape → history → alerts → notification chain completes before that
/// product is considered done.
pub struct BatchDispatcher {
    pool: SqlitePool,
    engine: Arc<ScrapeEngine>,
    registry: StoreRegistry,
    notifier: Arc<NotificationService>,
    index: Arc<dyn ProductIndex>,
    sessions: Arc<Semaphore>,
    memory: MemoryGate,
    chunk_size: usize,
}

impl BatchDispatcher {
    pub fn new(
        pool: SqlitePool,
        engine: Arc<ScrapeEngine>,
        registry: StoreRegistry,
        notifier: Arc<NotificationService>,
        index: Arc<dyn ProductIndex>,
        max_sessions: usize,
        memory_threshold_percent: f64,
    ) -> Self {
        Self {
            pool,
            engine,
            registry,
            notifier,
            index,
            sessions: Arc::new(Semaphore::new(max_sessions.max(1))),
            memory: MemoryGate::new(memory_threshold_percent),
            chunk_size: BATCH_CHUNK_SIZE,
        }
    }

    /// Process a set of due products grouped by store.
    pub async fn process_products(&self, products: Vec<ProductRow>) -> Result<BatchReport> {
        let mut report = BatchReport {
            total: products.len(),
            ..Default::default()
        };
        if products.is_empty() {
            return Ok(report);
        }

        let mut by_store: HashMap<String, Vec<ProductRow>> = HashMap::new();
        for product in products {
            by_store.entry(product.store_domain.clone()).or_default().push(product);
        }
        let store_count = by_store.len();

        for (idx, (domain, group)) in by_store.into_iter().enumerate() {
            let (ok, failed, skipped) = self.process_store(&domain, group).await?;
            report.successful += ok;
            report.failed += failed;
            report.skipped += skipped;
            report.by_store.insert(domain, (ok, failed));

            if idx + 1 < store_count {
                tokio::time::sleep(Duration::from_secs_f64(INTER_STORE_DELAY_SECS)).await;
            }
        }

        info!(
            total = report.total,
            successful = report.successful,
            failed = report.failed,
            skipped = report.skipped,
            "batch run complete"
        );
        Ok(report)
    }

    async fn process_store(
        &self,
        domain: &str,
        products: Vec<ProductRow>,
    ) -> Result<(usize, usize, usize)> {
        // Inactive stores skip their whole batch.
        match self.registry.lookup(domain).await? {
            Some(store) if store.active => {}
            _ => {
                warn!(domain, "store missing or inactive, skipping batch");
                return Ok((0, 0, products.len()));
            }
        }

        info!(domain, products = products.len(), "processing store batch");
        let mut successful = 0usize;
        let mut failed = 0usize;
        let chunk_count = products.len().div_ceil(self.chunk_size);

        for (chunk_idx, chunk) in products.chunks(self.chunk_size).enumerate() {
            let mut tasks = FuturesUnordered::new();
            for product in chunk {
                self.memory.wait_for_headroom().await;
                let permit = self
                    .sessions
                    .clone()
                    .acquire_owned()
                    .await
                    .map_err(|_| crate::error::AppError::Schedule("dispatcher shut down".into()))?;
                let engine = self.engine.clone();
                let product = product.clone();
                tasks.push(async move {
                    let result = engine.scrape(&product.url, false, false).await;
                    drop(permit);
                    (product, result)
                });
            }

            // Results are handled on arrival; the per-product chain runs to
            // completion here before the product counts as processed.
            while let Some((product, result)) = tasks.next().await {
                match self.commit_result(&product, result).await {
                    Ok(true) => successful += 1,
                    Ok(false) => failed += 1,
                    Err(e) => {
                        warn!(product_id = product.id, "failed to commit scrape result: {e}");
                        failed += 1;
                    }
                }
            }

            if chunk_idx + 1 < chunk_count {
                tokio::time::sleep(Duration::from_secs_f64(INTER_BATCH_DELAY_SECS)).await;
            }
        }

        if successful > 0 {
            self.registry.record_success(domain, chrono::Utc::now()).await?;
        }

        info!(domain, successful, failed, "store batch complete");
        Ok((successful, failed, 0))
    }

    /// Apply one scrape result: product row, price history, alert evaluation,
    /// notification dispatch, index hooks. Returns whether it was a success.
    async fn commit_result(
        &self,
        product: &ProductRow,
        result: crate::scraper::engine::ScrapeResult,
    ) -> Result<bool> {
        // Re-read the row so the chain works from current state.
        let Some(current) = product_by_id(&self.pool, product.id).await? else {
            return Ok(false);
        };

        if result.success {
            let snapshot = result.snapshot.unwrap_or_default();
            let name_was_empty = current.name.is_empty();
            let outcome = apply_scrape_success(
                &self.pool,
                &current,
                &snapshot,
                result.strategy_used,
                result.response_time_ms,
            )
            .await?;

            let updated = product_by_id(&self.pool, product.id).await?.unwrap_or(current);

            // Alerts are evaluated on every successful scrape; the notifier's
            // duplicate suppression handles unchanged prices.
            self.notifier
                .process_price_change(
                    &updated,
                    outcome.new_price,
                    outcome.new_in_stock,
                    outcome.previous_price,
                    Some(outcome.previous_in_stock),
                )
                .await?;

            // Fire-and-forget index sync; a freshly learned name changes the
            // embedded document.
            self.index.index(&updated, &snapshot);
            if name_was_empty && !updated.name.is_empty() {
                self.index.reembed(&updated);
            }
            Ok(true)
        } else {
            let error_type = result.error_type.unwrap_or(ScrapeErrorType::NetworkError);
            apply_scrape_failure(
                &self.pool,
                &current,
                error_type,
                result.error_message.as_deref(),
                Some(result.response_time_ms),
            )
            .await?;
            Ok(false)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_gate_passes_under_generous_threshold() {
        let gate = MemoryGate::new(100.0);
        // Never above 100%, so this returns immediately.
        gate.wait_for_headroom().await;
        assert!(gate.used_percent().await <= 100.0);
    }
}
