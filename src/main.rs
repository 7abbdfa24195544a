mod config;
mod db;
mod error;
mod healing;
mod indexer;
mod llm;
mod notifications;
mod scheduler;
mod scraper;
mod seed;
mod types;

use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::Config;
use crate::db::store_registry::StoreRegistry;
use crate::error::Result;
use crate::healing::detector::FailureDetector;
use crate::healing::health::StoreHealthCalculator;
use crate::healing::service::SelfHealingService;
use crate::indexer::LoggingIndex;
use crate::llm::{CompletionModel, LlmClient, TokenBudget};
use crate::notifications::email::ResendChannel;
use crate::notifications::service::NotificationService;
use crate::scheduler::batching::BatchDispatcher;
use crate::scheduler::jobs::JobContext;
use crate::scheduler::service::SchedulerService;
use crate::scraper::engine::{ScrapeEngine, ScraperConfig};
use crate::scraper::rate_limiter::RateLimiter;
use crate::scraper::robots::RobotsCache;
use crate::scraper::user_agent::UserAgentPool;

#[tokio::main]
async fn main() {
    dotenv::dotenv().ok();

    let cfg = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config) -> Result<()> {
    // --- Database setup ---
    let pool = db::connect(&cfg.database_url).await?;
    info!("database ready at {}", cfg.database_url);

    // --- Seed reconcile: seed-carried fields overwrite, learned state survives ---
    let registry = StoreRegistry::new(pool.clone());
    registry.reconcile_seed(&seed::seed_stores()).await?;

    // --- Core components ---
    let ua_pool = Arc::new(UserAgentPool::new());
    let robots = Arc::new(RobotsCache::new(ua_pool.primary().to_string()));
    let rate_limiter = Arc::new(RateLimiter::new(cfg.max_scrapes_per_minute as usize));

    let token_budget = Arc::new(TokenBudget::new(
        cfg.daily_token_limit,
        cfg.max_llm_requests_per_minute as usize,
    ));
    let llm: Option<Arc<dyn CompletionModel>> = LlmClient::from_config(&cfg, token_budget)
        .map(|client| Arc::new(client) as Arc<dyn CompletionModel>);
    if llm.is_none() {
        warn!("OPENROUTER_API_KEY not set - LLM extraction fallback and selector healing are disabled");
    }

    let engine = Arc::new(
        ScrapeEngine::new(
            ScraperConfig::from_config(&cfg),
            registry.clone(),
            rate_limiter,
            robots,
            ua_pool,
            llm.clone(),
        )
        .map_err(crate::error::AppError::Scrape)?,
    );

    let email = ResendChannel::from_config(&cfg);
    if !email.is_configured() {
        warn!("RESEND_API_KEY/FROM_EMAIL not fully set - notifications will not be delivered");
    }
    let notifier = Arc::new(NotificationService::new(
        pool.clone(),
        Arc::new(email),
        cfg.user_email.clone(),
    ));

    let dispatcher = Arc::new(BatchDispatcher::new(
        pool.clone(),
        engine.clone(),
        registry.clone(),
        notifier.clone(),
        Arc::new(LoggingIndex),
        cfg.max_concurrent_browsers,
        cfg.memory_threshold_percent,
    ));

    let health = Arc::new(StoreHealthCalculator::new(
        pool.clone(),
        registry.clone(),
        cfg.store_failure_threshold,
    ));
    let healing = Arc::new(SelfHealingService::new(
        pool.clone(),
        FailureDetector::new(pool.clone(), cfg.max_consecutive_failures),
        engine.clone(),
        registry.clone(),
        StoreHealthCalculator::new(pool.clone(), registry.clone(), cfg.store_failure_threshold),
        notifier.clone(),
        llm,
        cfg.max_healing_attempts,
        cfg.store_failure_threshold,
    ));

    // --- Scheduler ---
    let ctx = Arc::new(JobContext {
        pool: pool.clone(),
        config: cfg.clone(),
        dispatcher,
        healing,
        health,
    });
    let scheduler = Arc::new(SchedulerService::new(pool.clone(), ctx));
    scheduler.register_core_jobs().await?;

    let shutdown = scheduler.shutdown_token();
    let scheduler_task = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run().await })
    };

    info!(timezone = %cfg.scheduler_timezone, "price monitoring core running");

    // --- Run until interrupted ---
    tokio::signal::ctrl_c().await?;
    info!("shutdown requested, draining in-flight jobs");
    shutdown.cancel();
    let _ = scheduler_task.await;

    Ok(())
}
