use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule;
use rand::Rng;
use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::{
    Config, DAILY_SCRAPE_JITTER_SECS, JOB_MAX_INSTANCES, MISFIRE_GRACE_SECS, SCHEDULER_TICK_SECS,
    SHUTDOWN_GRACE_SECS,
};
use crate::db::models::{ScheduleRow, ScrapeLogRow};
use crate::db::products;
use crate::error::{AppError, Result};
use crate::scheduler::jobs::{
    self, JobContext, JOB_DAILY_SCRAPE, JOB_DATA_CLEANUP, JOB_HEALING_CYCLE, JOB_HEALTH_RECOMPUTE,
};
use crate::scheduler::triggers;

type JobFuture = Pin<Box<dyn std::future::Future<Output = ()> + Send>>;
type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

struct JobEntry {
    schedule: Schedule,
    cron_expression: String,
    jitter_secs: u64,
    next_run: Option<DateTime<Utc>>,
    last_run: Option<DateTime<Utc>>,
    paused: bool,
    running: Arc<AtomicUsize>,
    func: JobFn,
}

/// Summary row for the control surface.
#[derive(Debug, Clone)]
pub struct JobStatus {
    pub name: String,
    pub cron_expression: String,
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    pub paused: bool,
    pub running: usize,
}

/// Single-process cron scheduler. A coarse tick drives two sources of work:
/// in-process core jobs, and persisted schedule rows polled by next_run_at.
/// Missed firings inside the grace window coalesce into one execution; older
/// ones are skipped. Each job runs at most three instances concurrently.
pub struct SchedulerService {
    pool: SqlitePool,
    ctx: Arc<JobContext>,
    jobs: Mutex<HashMap<String, JobEntry>>,
    in_flight: Mutex<JoinSet<()>>,
    cancel: CancellationToken,
}

impl SchedulerService {
    pub fn new(pool: SqlitePool, ctx: Arc<JobContext>) -> Self {
        Self {
            pool,
            ctx,
            jobs: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(JoinSet::new()),
            cancel: CancellationToken::new(),
        }
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Register a job under a five-field cron expression.
    pub async fn add_job(
        &self,
        name: &str,
        cron_expression: &str,
        jitter_secs: u64,
        func: JobFn,
    ) -> Result<()> {
        let schedule = triggers::parse_cron(cron_expression)
            .map_err(|e| AppError::Schedule(format!("invalid cron '{cron_expression}': {e}")))?;
        let next_run = schedule.upcoming(Utc).next();

        let mut jobs = self.jobs.lock().await;
        jobs.insert(
            name.to_string(),
            JobEntry {
                schedule,
                cron_expression: cron_expression.to_string(),
                jitter_secs,
                next_run,
                last_run: None,
                paused: false,
                running: Arc::new(AtomicUsize::new(0)),
                func,
            },
        );
        info!(job = name, cron = cron_expression, "job registered");
        Ok(())
    }

    /// Register the four core jobs.
    pub async fn register_core_jobs(&self) -> Result<()> {
        let make = |name: &'static str| -> JobFn {
            let ctx = self.ctx.clone();
            Arc::new(move || {
                let ctx = ctx.clone();
                Box::pin(jobs::run_job(ctx, name)) as JobFuture
            })
        };

        self.add_job(JOB_DAILY_SCRAPE, "0 6 * * *", DAILY_SCRAPE_JITTER_SECS, make(JOB_DAILY_SCRAPE))
            .await?;
        self.add_job(JOB_HEALTH_RECOMPUTE, "0 7 * * *", 0, make(JOB_HEALTH_RECOMPUTE))
            .await?;
        self.add_job(JOB_HEALING_CYCLE, "0 8 * * *", 0, make(JOB_HEALING_CYCLE))
            .await?;
        self.add_job(JOB_DATA_CLEANUP, "0 0 * * 0", 0, make(JOB_DATA_CLEANUP))
            .await?;
        Ok(())
    }

    /// Main loop. Returns after shutdown has been requested and in-flight
    /// jobs have been given the grace period.
    pub async fn run(&self) {
        info!("scheduler started");
        let mut ticker = tokio::time::interval(Duration::from_secs(SCHEDULER_TICK_SECS));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now();
                    self.fire_due_jobs(now).await;
                    if let Err(e) = self.fire_due_schedules(now).await {
                        warn!("persisted schedule poll failed: {e}");
                    }
                    self.reap_finished().await;
                }
                _ = self.cancel.cancelled() => break,
            }
        }

        self.drain(Duration::from_secs(SHUTDOWN_GRACE_SECS)).await;
        info!("scheduler stopped");
    }

    /// Fire every registered job whose next_run has passed. Backlog beyond
    /// one firing coalesces; firings older than the grace window are skipped.
    pub(crate) async fn fire_due_jobs(&self, now: DateTime<Utc>) {
        let mut jobs_map = self.jobs.lock().await;
        for (name, entry) in jobs_map.iter_mut() {
            if entry.paused {
                continue;
            }
            let Some(next_run) = entry.next_run else {
                continue;
            };
            if next_run > now {
                continue;
            }

            // Coalesce: a single execution covers all missed firings.
            entry.next_run = entry.schedule.after(&now).next();

            let age = (now - next_run).num_seconds().max(0) as u64;
            if age > MISFIRE_GRACE_SECS {
                warn!(job = name.as_str(), age_secs = age, "missed firing beyond grace window, skipping");
                continue;
            }

            if entry.running.load(Ordering::SeqCst) >= JOB_MAX_INSTANCES {
                warn!(job = name.as_str(), "max concurrent instances reached, dropping firing");
                continue;
            }

            entry.last_run = Some(now);
            let running = entry.running.clone();
            running.fetch_add(1, Ordering::SeqCst);
            let func = entry.func.clone();
            let jitter_secs = entry.jitter_secs;
            let job_name = name.clone();

            self.in_flight.lock().await.spawn(async move {
                if jitter_secs > 0 {
                    let delay = rand::thread_rng().gen_range(0..=jitter_secs);
                    tokio::time::sleep(Duration::from_secs(delay)).await;
                }
                info!(job = job_name.as_str(), "job firing");
                func().await;
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }
    }

    /// Poll the persisted schedules table and fire due rows. Rows are stamped
    /// before the work is spawned so the next tick does not re-fire them.
    async fn fire_due_schedules(&self, now: DateTime<Utc>) -> Result<()> {
        let due = triggers::due_schedules(&self.pool, now).await?;
        for row in due {
            triggers::mark_schedule_run(&self.pool, row.id).await?;
            let ctx = self.ctx.clone();
            self.in_flight.lock().await.spawn(async move {
                if let Err(e) = jobs::run_persisted_schedule(&ctx, &row).await {
                    warn!(schedule_id = row.id, "persisted schedule run failed: {e}");
                }
            });
        }
        Ok(())
    }

    async fn reap_finished(&self) {
        let mut in_flight = self.in_flight.lock().await;
        while let Some(result) = in_flight.try_join_next() {
            if let Err(e) = result {
                warn!("scheduled task panicked or was aborted: {e}");
            }
        }
    }

    /// Give in-flight work a grace period, then abort the stragglers.
    async fn drain(&self, grace: Duration) {
        let mut in_flight = self.in_flight.lock().await;
        let deadline = tokio::time::Instant::now() + grace;
        while !in_flight.is_empty() {
            tokio::select! {
                _ = in_flight.join_next() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(remaining = in_flight.len(), "shutdown grace elapsed, aborting jobs");
                    in_flight.shutdown().await;
                    break;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Control surface (ordinarily reached through an HTTP layer)
    // -----------------------------------------------------------------------

    pub async fn submit_schedule(
        &self,
        cron_expression: &str,
        product_id: Option<i64>,
        store_domain: Option<&str>,
    ) -> Result<ScheduleRow> {
        triggers::create_schedule(&self.pool, cron_expression, product_id, store_domain).await
    }

    pub async fn cancel_schedule(&self, schedule_id: i64) -> Result<bool> {
        triggers::cancel_schedule(&self.pool, schedule_id).await
    }

    pub async fn pause_schedule(&self, schedule_id: i64) -> Result<bool> {
        triggers::set_schedule_active(&self.pool, schedule_id, false).await
    }

    pub async fn resume_schedule(&self, schedule_id: i64) -> Result<bool> {
        triggers::set_schedule_active(&self.pool, schedule_id, true).await
    }

    pub async fn pause_job(&self, name: &str) -> bool {
        let mut jobs_map = self.jobs.lock().await;
        match jobs_map.get_mut(name) {
            Some(entry) => {
                entry.paused = true;
                true
            }
            None => false,
        }
    }

    pub async fn resume_job(&self, name: &str) -> bool {
        let mut jobs_map = self.jobs.lock().await;
        match jobs_map.get_mut(name) {
            Some(entry) => {
                entry.paused = false;
                entry.next_run = entry.schedule.upcoming(Utc).next();
                true
            }
            None => false,
        }
    }

    /// Registered jobs plus persisted schedules currently due.
    pub async fn list_jobs(&self) -> Vec<JobStatus> {
        let jobs_map = self.jobs.lock().await;
        jobs_map
            .iter()
            .map(|(name, entry)| JobStatus {
                name: name.clone(),
                cron_expression: entry.cron_expression.clone(),
                next_run: entry.next_run,
                last_run: entry.last_run,
                paused: entry.paused,
                running: entry.running.load(Ordering::SeqCst),
            })
            .collect()
    }

    pub async fn due_schedules(&self) -> Result<Vec<ScheduleRow>> {
        triggers::due_schedules(&self.pool, Utc::now()).await
    }

    /// One-shot scrape of a single product, outside any schedule.
    pub async fn trigger_scrape_now(&self, product_id: i64) -> Result<()> {
        let Some(product) = products::product_by_id(&self.pool, product_id).await? else {
            return Err(AppError::RecordNotFound(format!("product {product_id}")));
        };
        self.ctx.dispatcher.process_products(vec![product]).await?;
        Ok(())
    }

    pub async fn latest_scrape_log(&self, product_id: i64) -> Result<Option<ScrapeLogRow>> {
        products::latest_scrape_log(&self.pool, product_id).await
    }

    pub fn default_cron(config: &Config) -> String {
        config.default_scrape_cron()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::store_registry::StoreRegistry;
    use crate::db::test_pool;
    use crate::healing::detector::FailureDetector;
    use crate::healing::health::StoreHealthCalculator;
    use crate::healing::service::SelfHealingService;
    use crate::indexer::LoggingIndex;
    use crate::notifications::email::testing::MockTransport;
    use crate::notifications::service::NotificationService;
    use crate::scheduler::batching::BatchDispatcher;
    use crate::scraper::engine::{ScrapeEngine, ScraperConfig};
    use crate::scraper::rate_limiter::RateLimiter;
    use crate::scraper::robots::RobotsCache;
    use crate::scraper::user_agent::UserAgentPool;
    use std::sync::atomic::AtomicU32;

    async fn scheduler(pool: &SqlitePool) -> SchedulerService {
        let registry = StoreRegistry::new(pool.clone());
        let ua_pool = Arc::new(UserAgentPool::new());
        let engine = Arc::new(
            ScrapeEngine::new(
                ScraperConfig {
                    request_timeout: Duration::from_secs(5),
                    operation_timeout: Duration::from_secs(10),
                    page_load_delay: Duration::ZERO,
                    max_concurrent: 1,
                    respect_robots: false,
                    enable_retries: false,
                },
                registry.clone(),
                Arc::new(RateLimiter::new(100)),
                Arc::new(RobotsCache::new(ua_pool.primary().to_string())),
                ua_pool,
                None,
            )
            .unwrap(),
        );
        let notifier = Arc::new(NotificationService::new(
            pool.clone(),
            Arc::new(MockTransport::default()),
            String::new(),
        ));
        let dispatcher = Arc::new(BatchDispatcher::new(
            pool.clone(),
            engine.clone(),
            registry.clone(),
            notifier.clone(),
            Arc::new(LoggingIndex),
            1,
            100.0,
        ));
        let health = Arc::new(StoreHealthCalculator::new(
            pool.clone(),
            registry.clone(),
            0.5,
        ));
        let healing = Arc::new(SelfHealingService::new(
            pool.clone(),
            FailureDetector::new(pool.clone(), 3),
            engine,
            registry,
            StoreHealthCalculator::new(pool.clone(), StoreRegistry::new(pool.clone()), 0.5),
            notifier,
            None,
            3,
            0.5,
        ));
        let ctx = Arc::new(JobContext {
            pool: pool.clone(),
            config: Config::default(),
            dispatcher,
            healing,
            health,
        });
        SchedulerService::new(pool.clone(), ctx)
    }

    fn counting_job(counter: Arc<AtomicU32>) -> JobFn {
        Arc::new(move || {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }) as JobFuture
        })
    }

    #[tokio::test]
    async fn due_job_fires_once_and_reschedules() {
        let pool = test_pool().await;
        let svc = scheduler(&pool).await;
        let counter = Arc::new(AtomicU32::new(0));
        svc.add_job("test-job", "0 6 * * *", 0, counting_job(counter.clone()))
            .await
            .unwrap();

        // Backdate next_run within the grace window.
        let now = Utc::now();
        {
            let mut jobs_map = svc.jobs.lock().await;
            jobs_map.get_mut("test-job").unwrap().next_run =
                Some(now - chrono::Duration::seconds(120));
        }

        svc.fire_due_jobs(now).await;
        svc.drain(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        // next_run advanced into the future; firing again does nothing.
        svc.fire_due_jobs(now).await;
        svc.drain(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let status = svc.list_jobs().await;
        assert!(status[0].next_run.unwrap() > now);
        assert_eq!(status[0].last_run, Some(now));
    }

    #[tokio::test]
    async fn stale_firing_beyond_grace_is_skipped() {
        let pool = test_pool().await;
        let svc = scheduler(&pool).await;
        let counter = Arc::new(AtomicU32::new(0));
        svc.add_job("stale-job", "0 6 * * *", 0, counting_job(counter.clone()))
            .await
            .unwrap();

        let now = Utc::now();
        {
            let mut jobs_map = svc.jobs.lock().await;
            jobs_map.get_mut("stale-job").unwrap().next_run =
                Some(now - chrono::Duration::seconds(MISFIRE_GRACE_SECS as i64 + 60));
        }

        svc.fire_due_jobs(now).await;
        svc.drain(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        // But it is rescheduled for the future, not stuck.
        let status = svc.list_jobs().await;
        assert!(status[0].next_run.unwrap() > now);
    }

    #[tokio::test]
    async fn paused_job_does_not_fire() {
        let pool = test_pool().await;
        let svc = scheduler(&pool).await;
        let counter = Arc::new(AtomicU32::new(0));
        svc.add_job("paused-job", "0 6 * * *", 0, counting_job(counter.clone()))
            .await
            .unwrap();
        assert!(svc.pause_job("paused-job").await);

        let now = Utc::now();
        {
            let mut jobs_map = svc.jobs.lock().await;
            jobs_map.get_mut("paused-job").unwrap().next_run =
                Some(now - chrono::Duration::seconds(10));
        }
        svc.fire_due_jobs(now).await;
        svc.drain(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        assert!(svc.resume_job("paused-job").await);
        let status = svc.list_jobs().await;
        assert!(!status[0].paused);
    }

    #[tokio::test]
    async fn instance_cap_drops_excess_firings() {
        let pool = test_pool().await;
        let svc = scheduler(&pool).await;
        let counter = Arc::new(AtomicU32::new(0));
        svc.add_job("capped-job", "0 6 * * *", 0, counting_job(counter.clone()))
            .await
            .unwrap();

        let now = Utc::now();
        {
            let mut jobs_map = svc.jobs.lock().await;
            let entry = jobs_map.get_mut("capped-job").unwrap();
            entry.next_run = Some(now - chrono::Duration::seconds(10));
            entry.running.store(JOB_MAX_INSTANCES, Ordering::SeqCst);
        }

        svc.fire_due_jobs(now).await;
        svc.drain(Duration::from_secs(5)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn core_jobs_register_with_expected_crons() {
        let pool = test_pool().await;
        let svc = scheduler(&pool).await;
        svc.register_core_jobs().await.unwrap();

        let mut status = svc.list_jobs().await;
        status.sort_by(|a, b| a.name.cmp(&b.name));
        let names: Vec<_> = status.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                JOB_DAILY_SCRAPE,
                JOB_DATA_CLEANUP,
                JOB_HEALING_CYCLE,
                JOB_HEALTH_RECOMPUTE,
            ]
        );
        for job in &status {
            assert!(job.next_run.is_some(), "{}", job.name);
        }
    }
}
