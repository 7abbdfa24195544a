use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::db::products::{flag_needs_attention, reset_failures};
use crate::db::store_registry::StoreRegistry;
use crate::error::Result;
use crate::healing::detector::{FailureAnalysis, FailureDetector};
use crate::healing::health::StoreHealthCalculator;
use crate::healing::regenerator::SelectorRegenerator;
use crate::llm::CompletionModel;
use crate::notifications::service::NotificationService;
use crate::scraper::engine::ScrapeEngine;

/// Products examined per healing cycle.
const MAX_PRODUCTS_PER_CYCLE: i64 = 50;

#[derive(Debug, Default, Clone)]
pub struct HealingReport {
    pub products_checked: usize,
    pub products_healed: usize,
    pub products_failed: usize,
    pub products_flagged: usize,
    pub stores_updated: usize,
    pub stores_flagged: usize,
}

/// Orchestrates the healing pipeline: detect broken products, group them by
/// host, regenerate selectors once per host from a representative sample,
/// merge accepted candidates into the store registry, and flag what cannot
/// be repaired. Healing attempts are bounded per product in process memory.
pub struct SelfHealingService {
    pool: SqlitePool,
    detector: FailureDetector,
    regenerator: SelectorRegenerator,
    engine: Arc<ScrapeEngine>,
    registry: StoreRegistry,
    health: StoreHealthCalculator,
    notifier: Arc<NotificationService>,
    llm: Option<Arc<dyn CompletionModel>>,
    max_attempts: u32,
    store_failure_threshold: f64,
    attempts: Mutex<HashMap<i64, u32>>,
}

impl SelfHealingService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        pool: SqlitePool,
        detector: FailureDetector,
        engine: Arc<ScrapeEngine>,
        registry: StoreRegistry,
        health: StoreHealthCalculator,
        notifier: Arc<NotificationService>,
        llm: Option<Arc<dyn CompletionModel>>,
        max_attempts: u32,
        store_failure_threshold: f64,
    ) -> Self {
        Self {
            pool,
            detector,
            regenerator: SelectorRegenerator::new(),
            engine,
            registry,
            health,
            notifier,
            llm,
            max_attempts,
            store_failure_threshold,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Run one complete healing cycle.
    pub async fn run_cycle(&self) -> Result<HealingReport> {
        let mut report = HealingReport::default();

        let candidates = self
            .detector
            .products_needing_healing(None, MAX_PRODUCTS_PER_CYCLE)
            .await?;
        report.products_checked = candidates.len();

        if candidates.is_empty() {
            info!("no products need healing");
        } else {
            info!(count = candidates.len(), "products need healing");

            let mut by_store: HashMap<String, Vec<FailureAnalysis>> = HashMap::new();
            for analysis in candidates {
                by_store
                    .entry(analysis.store_domain.clone())
                    .or_default()
                    .push(analysis);
            }

            for (domain, group) in by_store {
                self.heal_store_group(&domain, &group, &mut report).await?;
            }
        }

        self.flag_unhealthy_stores(&mut report).await?;

        info!(
            healed = report.products_healed,
            failed = report.products_failed,
            flagged = report.products_flagged,
            stores_updated = report.stores_updated,
            stores_flagged = report.stores_flagged,
            "healing cycle complete"
        );
        Ok(report)
    }

    async fn heal_store_group(
        &self,
        domain: &str,
        group: &[FailureAnalysis],
        report: &mut HealingReport,
    ) -> Result<()> {
        let Some(representative) = group.first() else {
            return Ok(());
        };

        // Attempt bound is per representative product, held in memory.
        let attempt = {
            let mut attempts = self.attempts.lock().await;
            let counter = attempts.entry(representative.product_id).or_insert(0);
            *counter += 1;
            *counter
        };
        if attempt > self.max_attempts {
            warn!(
                domain,
                product_id = representative.product_id,
                "healing attempt budget exhausted, flagging group"
            );
            self.flag_group(group, report).await?;
            return Ok(());
        }

        let Some(product) =
            crate::db::products::product_by_id(&self.pool, representative.product_id).await?
        else {
            return Ok(());
        };

        info!(
            domain,
            products = group.len(),
            attempt,
            max = self.max_attempts,
            "attempting selector regeneration"
        );

        let html = match self.engine.fetch_sample(&product.url).await {
            Ok(html) => html,
            Err(e) => {
                warn!(domain, "sample fetch for healing failed: {e}");
                report.products_failed += group.len();
                if attempt >= self.max_attempts {
                    self.flag_group(group, report).await?;
                }
                return Ok(());
            }
        };

        if self.apply_regeneration(domain, &html, group, report).await? {
            report.stores_updated += 1;
        } else if attempt >= self.max_attempts {
            self.flag_group(group, report).await?;
        }

        Ok(())
    }

    /// Regenerate from a sample and, on an accepted candidate, merge it and
    /// reset every grouped product. Returns whether the store was updated.
    pub(crate) async fn apply_regeneration(
        &self,
        domain: &str,
        html: &str,
        group: &[FailureAnalysis],
        report: &mut HealingReport,
    ) -> Result<bool> {
        let Some(llm) = self.llm.as_deref() else {
            warn!(domain, "no completion model configured, cannot regenerate selectors");
            report.products_failed += group.len();
            return Ok(false);
        };

        let current = self.registry.selectors_for(domain).await?;
        let result = self
            .regenerator
            .regenerate(llm, html, domain, current.as_ref())
            .await;

        if !result.success {
            warn!(
                domain,
                confidence = result.confidence,
                "selector regeneration failed: {}",
                result.error.as_deref().unwrap_or("unknown")
            );
            report.products_failed += group.len();
            return Ok(false);
        }

        let Some(selectors) = result.selectors else {
            report.products_failed += group.len();
            return Ok(false);
        };

        if !self.registry.update_selectors(domain, &selectors).await? {
            warn!(domain, "store not found for selector update");
            report.products_failed += group.len();
            return Ok(false);
        }

        for analysis in group {
            reset_failures(&self.pool, analysis.product_id).await?;
            report.products_healed += 1;
        }

        info!(
            domain,
            confidence = result.confidence,
            healed = group.len(),
            "selectors regenerated and group reset"
        );
        Ok(true)
    }

    async fn flag_group(&self, group: &[FailureAnalysis], report: &mut HealingReport) -> Result<()> {
        for analysis in group {
            flag_needs_attention(&self.pool, analysis.product_id).await?;
            report.products_flagged += 1;
        }
        Ok(())
    }

    /// After a cycle, every store whose rolling success rate sits below the
    /// threshold gets exactly one store_flagged notification.
    async fn flag_unhealthy_stores(&self, report: &mut HealingReport) -> Result<()> {
        let health_report = self.health.recompute_all().await?;
        for health in health_report
            .stores
            .iter()
            .filter(|h| h.success_rate < self.store_failure_threshold)
        {
            let Some(store) = self.registry.lookup(&health.domain).await? else {
                continue;
            };
            match self
                .notifier
                .send_store_flagged(&store, health.failing_products)
                .await
            {
                Ok(result) if result.success => report.stores_flagged += 1,
                Ok(result) => warn!(
                    domain = health.domain,
                    "store_flagged notification not sent: {}",
                    result.error_message.unwrap_or_default()
                ),
                Err(e) => warn!(domain = health.domain, "store_flagged dispatch failed: {e}"),
            }
        }
        Ok(())
    }

    /// Clear the in-memory attempt counters (all, or one product).
    pub async fn reset_attempts(&self, product_id: Option<i64>) {
        let mut attempts = self.attempts.lock().await;
        match product_id {
            Some(id) => {
                attempts.remove(&id);
            }
            None => attempts.clear(),
        }
    }
}
