use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::{error, info};

use crate::config::Config;
use crate::db::models::ScheduleRow;
use crate::db::products;
use crate::error::Result;
use crate::healing::health::StoreHealthCalculator;
use crate::healing::service::SelfHealingService;
use crate::scheduler::batching::BatchDispatcher;

pub const JOB_DAILY_SCRAPE: &str = "daily-scrape";
pub const JOB_HEALTH_RECOMPUTE: &str = "store-health-recompute";
pub const JOB_HEALING_CYCLE: &str = "healing-cycle";
pub const JOB_DATA_CLEANUP: &str = "data-cleanup";

/// Everything a scheduled job needs, shared across firings.
pub struct JobContext {
    pub pool: SqlitePool,
    pub config: Config,
    pub dispatcher: Arc<BatchDispatcher>,
    pub healing: Arc<SelfHealingService>,
    pub health: Arc<StoreHealthCalculator>,
}

/// Daily sweep over products that are not covered by a product- or
/// store-level override schedule; those fire on their own rows.
pub async fn daily_scrape_job(ctx: &JobContext) -> Result<()> {
    let rows = sqlx::query_as::<_, crate::db::models::ProductRow>(
        "SELECT * FROM products p
         WHERE p.deleted_at IS NULL AND p.status IN ('active', 'error')
           AND NOT EXISTS
               (SELECT 1 FROM schedules s
                WHERE s.product_id = p.id AND s.active = 1 AND s.deleted_at IS NULL)
           AND NOT EXISTS
               (SELECT 1 FROM schedules s
                WHERE s.store_domain = p.store_domain AND s.product_id IS NULL
                  AND s.active = 1 AND s.deleted_at IS NULL)
         ORDER BY p.store_domain, p.id",
    )
    .fetch_all(&ctx.pool)
    .await?;

    info!(products = rows.len(), "daily scrape sweep starting");
    let report = ctx.dispatcher.process_products(rows).await?;
    info!(
        successful = report.successful,
        failed = report.failed,
        "daily scrape sweep finished"
    );
    Ok(())
}

pub async fn health_recompute_job(ctx: &JobContext) -> Result<()> {
    ctx.health.recompute_all().await?;
    Ok(())
}

pub async fn healing_cycle_job(ctx: &JobContext) -> Result<()> {
    ctx.healing.run_cycle().await?;
    Ok(())
}

/// Enforce the rolling retention windows on append-only tables.
pub async fn data_cleanup_job(ctx: &JobContext) -> Result<()> {
    let logs = products::prune_scrape_logs(&ctx.pool, ctx.config.scrape_log_retention_days).await?;
    let notifications =
        products::prune_notifications(&ctx.pool, ctx.config.notification_retention_days).await?;
    info!(
        scrape_logs_pruned = logs,
        notifications_pruned = notifications,
        "data cleanup finished"
    );
    Ok(())
}

/// Fire one persisted schedule row: a single product, or a whole store.
pub async fn run_persisted_schedule(ctx: &JobContext, schedule: &ScheduleRow) -> Result<()> {
    if let Some(product_id) = schedule.product_id {
        let Some(product) = products::product_by_id(&ctx.pool, product_id).await? else {
            info!(schedule_id = schedule.id, product_id, "scheduled product is gone");
            return Ok(());
        };
        info!(schedule_id = schedule.id, product_id, "product schedule firing");
        ctx.dispatcher.process_products(vec![product]).await?;
    } else if let Some(domain) = &schedule.store_domain {
        let rows = products::products_for_store(&ctx.pool, domain).await?;
        info!(
            schedule_id = schedule.id,
            domain,
            products = rows.len(),
            "store schedule firing"
        );
        ctx.dispatcher.process_products(rows).await?;
    }
    Ok(())
}

/// Wrapper used by the scheduler loop: jobs log their own failures and never
/// bring the loop down.
pub async fn run_job(ctx: Arc<JobContext>, name: &'static str) {
    let result = match name {
        JOB_DAILY_SCRAPE => daily_scrape_job(&ctx).await,
        JOB_HEALTH_RECOMPUTE => health_recompute_job(&ctx).await,
        JOB_HEALING_CYCLE => healing_cycle_job(&ctx).await,
        JOB_DATA_CLEANUP => data_cleanup_job(&ctx).await,
        other => {
            error!(job = other, "unknown job name");
            return;
        }
    };
    if let Err(e) = result {
        error!(job = name, "scheduled job failed: {e}");
    }
}
