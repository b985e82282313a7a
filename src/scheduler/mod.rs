//! Periodic job coordinator.
//!
//! One loop ticks every `tick_ms`, runs the jobs whose `next_run_at` has
//! passed and reschedules them one period later. Crawl jobs only hand off to
//! their worker (skipped while it is already busy or looping); maintenance
//! jobs run inline on the blocking pool.

use crate::config::{SchedulerConfig, StorageConfig};
use crate::crawler::{CrawlJob, Worker};
use crate::storage::Store;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// What the scheduler needs from a crawl worker.
pub trait CrawlTrigger: Send + Sync {
    /// Period to trigger at, or `None` when periodic crawling is disabled.
    fn schedule(&self) -> Option<Duration>;

    /// The worker's own loop is active or a run is in flight.
    fn is_occupied(&self) -> bool;

    /// Spawn a one-off run. `false` when it could not be started.
    fn trigger(&self) -> bool;
}

impl<J: CrawlJob> CrawlTrigger for Worker<J> {
    fn schedule(&self) -> Option<Duration> {
        self.job().enabled().then(|| self.job().interval())
    }

    fn is_occupied(&self) -> bool {
        self.status().is_running || self.is_busy()
    }

    fn trigger(&self) -> bool {
        self.trigger_once(Default::default())
    }
}

// ── Jobs ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobAction {
    PriceCrawl,
    Cleanup,
    Backup,
}

impl JobAction {
    pub fn name(self) -> &'static str {
        match self {
            JobAction::PriceCrawl => "price-crawl",
            JobAction::Cleanup => "cleanup",
            JobAction::Backup => "backup",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub action: JobAction,
    pub period_secs: u64,
    pub next_run_at: NaiveDateTime,
    pub run_count: u64,
    pub skip_count: u64,
    pub last_run_at: Option<NaiveDateTime>,
    pub last_error: Option<String>,
}

impl ScheduledJob {
    fn new(action: JobAction, period: Duration, now: NaiveDateTime) -> Self {
        Self {
            action,
            period_secs: period.as_secs(),
            next_run_at: now + chrono::Duration::seconds(period.as_secs() as i64),
            run_count: 0,
            skip_count: 0,
            last_run_at: None,
            last_error: None,
        }
    }

    fn is_due(&self, now: NaiveDateTime) -> bool {
        self.next_run_at <= now
    }
}

/// Outcome of one job execution.
enum JobResult {
    Ran,
    Skipped,
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub started_at: Option<NaiveDateTime>,
    pub jobs: Vec<ScheduledJob>,
}

// ── Scheduler ─────────────────────────────────────────────────────────────────

struct Inner {
    config: SchedulerConfig,
    cleanup_days: i64,
    price: Arc<dyn CrawlTrigger>,
    store: Arc<Store>,
    jobs: Mutex<Vec<ScheduledJob>>,
    started_at: Mutex<Option<NaiveDateTime>>,
    handle: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        storage: &StorageConfig,
        price: Arc<dyn CrawlTrigger>,
        store: Arc<Store>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                cleanup_days: storage.cleanup_days,
                price,
                store,
                jobs: Mutex::new(Vec::new()),
                started_at: Mutex::new(None),
                handle: Mutex::new(None),
            }),
        }
    }

    /// Fresh job table; the price job only when price crawling is enabled.
    pub fn build_jobs(&self, now: NaiveDateTime) -> Vec<ScheduledJob> {
        let cfg = &self.inner.config;
        let mut jobs = Vec::with_capacity(3);
        if let Some(period) = self.inner.price.schedule() {
            jobs.push(ScheduledJob::new(JobAction::PriceCrawl, period, now));
        }
        jobs.push(ScheduledJob::new(JobAction::Cleanup, cfg.cleanup_interval(), now));
        jobs.push(ScheduledJob::new(JobAction::Backup, cfg.backup_interval(), now));
        jobs
    }

    pub fn start(&self) -> bool {
        let mut slot = lock(&self.inner.handle);
        if slot.as_ref().is_some_and(|(_, task)| !task.is_finished()) {
            info!("Scheduler already running");
            return false;
        }

        let now = now();
        let jobs = self.build_jobs(now);
        for job in &jobs {
            info!(
                "Scheduled {} every {}s, first at {}",
                job.action.name(),
                job.period_secs,
                job.next_run_at
            );
        }
        *lock(&self.inner.jobs) = jobs;
        *lock(&self.inner.started_at) = Some(now);

        let token = CancellationToken::new();
        let task = tokio::spawn(self.clone().run_loop(token.clone()));
        *slot = Some((token, task));
        true
    }

    pub async fn stop(&self) -> bool {
        let Some((token, mut task)) = lock(&self.inner.handle).take() else {
            return false;
        };
        token.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, &mut task).await.is_err() {
            warn!("Scheduler did not stop within {:?}, aborting", STOP_TIMEOUT);
            task.abort();
        }
        *lock(&self.inner.started_at) = None;
        info!("Scheduler stopped");
        true
    }

    pub fn status(&self) -> SchedulerStatus {
        let running = lock(&self.inner.handle)
            .as_ref()
            .is_some_and(|(_, task)| !task.is_finished());
        SchedulerStatus {
            running,
            started_at: *lock(&self.inner.started_at),
            jobs: lock(&self.inner.jobs).clone(),
        }
    }

    async fn run_loop(self, token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.tick());
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("Scheduler loop started");
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = ticker.tick() => self.run_due(now()).await,
            }
        }
        info!("Scheduler loop exited");
    }

    /// Run every job due at `now` and reschedule it.
    pub async fn run_due(&self, now: NaiveDateTime) {
        let due: Vec<JobAction> = lock(&self.inner.jobs)
            .iter()
            .filter(|j| j.is_due(now))
            .map(|j| j.action)
            .collect();

        for action in due {
            debug!("Running job {}", action.name());
            let result = self.execute(action).await;

            let mut jobs = lock(&self.inner.jobs);
            let Some(job) = jobs.iter_mut().find(|j| j.action == action) else {
                continue;
            };
            job.next_run_at = now + chrono::Duration::seconds(job.period_secs as i64);
            match result {
                JobResult::Ran => {
                    job.run_count += 1;
                    job.last_run_at = Some(now);
                    job.last_error = None;
                }
                JobResult::Skipped => job.skip_count += 1,
                JobResult::Failed(e) => {
                    error!("Job {} failed: {}", action.name(), e);
                    job.run_count += 1;
                    job.last_run_at = Some(now);
                    job.last_error = Some(e);
                }
            }
        }
    }

    async fn execute(&self, action: JobAction) -> JobResult {
        match action {
            JobAction::PriceCrawl => {
                if self.inner.price.is_occupied() {
                    info!("Price crawler busy, scheduled crawl skipped");
                    return JobResult::Skipped;
                }
                if self.inner.price.trigger() {
                    JobResult::Ran
                } else {
                    JobResult::Skipped
                }
            }
            JobAction::Cleanup => match self.cleanup().await {
                Ok(removed) => {
                    info!("Cleanup removed {} stale price rows", removed);
                    JobResult::Ran
                }
                Err(e) => JobResult::Failed(format!("{e:#}")),
            },
            JobAction::Backup => match self.backup().await {
                Ok(n) => {
                    info!("Backup job wrote {} files", n);
                    JobResult::Ran
                }
                Err(e) => JobResult::Failed(format!("{e:#}")),
            },
        }
    }

    async fn cleanup(&self) -> Result<usize> {
        let store = Arc::clone(&self.inner.store);
        let days = self.inner.cleanup_days;
        let today = Local::now().date_naive();
        let removed = tokio::task::spawn_blocking(move || store.prune_prices_older_than(days, today))
            .await
            .context("Cleanup task panicked")??;
        Ok(removed)
    }

    async fn backup(&self) -> Result<usize> {
        let store = Arc::clone(&self.inner.store);
        let written = tokio::task::spawn_blocking(move || store.backup_all())
            .await
            .context("Backup task panicked")??;
        Ok(written.len())
    }
}

fn now() -> NaiveDateTime {
    Local::now().naive_local()
}
