//! Pipeline wiring: builds client → store → workers → scheduler once and
//! exposes the operations the CLI (or any other front-end) drives.
//!
//! ## Crawl control
//!
//! Each worker has a periodic loop (`start_*` / `stop_*`), a status snapshot,
//! and a one-off run. Runs never overlap per worker; a second request while
//! one is in flight is skipped.
//!
//! ## Queries
//!
//! Store reads and writes are blocking file I/O and run on the blocking pool.

use crate::analysis::{ParsedMetrics, metrics_series};
use crate::config::{AppConfig, ConfigError, PriceCrawlerConfig, PriceCrawlerOverrides};
use crate::crawler::price::PriceCrawler;
use crate::crawler::report::ReportCrawler;
use crate::crawler::{RunOptions, RunOutcome, RunState, Worker};
use crate::models::{PriceRecord, ReportKind};
use crate::remote::AgriApi;
use crate::scheduler::{Scheduler, SchedulerStatus};
use crate::storage::query::{PriceFilter, PriceStats, ReportListing, ReportQuery, ReportStats};
use crate::storage::{Store, StoreError};
use anyhow::{Context, Result};
use chrono::Local;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct Pipeline {
    config: AppConfig,
    store: Arc<Store>,
    prices: Worker<PriceCrawler>,
    reports: Worker<ReportCrawler>,
    scheduler: Scheduler,
    shutdown: CancellationToken,
}

impl Pipeline {
    pub fn new(config: AppConfig) -> Result<Self> {
        let api = Arc::new(AgriApi::new(&config.api).context("Failed to build API client")?);
        let store = Arc::new(Store::open(&config.storage).context("Failed to open data store")?);
        let jitter = Duration::from_millis(config.api.jitter_ms);
        let shutdown = CancellationToken::new();

        let prices = Worker::with_shutdown(
            PriceCrawler::new(
                api.clone(),
                Arc::clone(&store),
                config.price_crawler.clone(),
                jitter,
            ),
            shutdown.child_token(),
        );
        let reports = Worker::with_shutdown(
            ReportCrawler::new(api, Arc::clone(&store), config.report_crawler.clone(), jitter),
            shutdown.child_token(),
        );
        let scheduler = Scheduler::new(
            config.scheduler.clone(),
            &config.storage,
            Arc::new(prices.clone()),
            Arc::clone(&store),
        );

        info!("Data directory: {}", config.storage.data_dir.display());
        Ok(Self {
            config,
            store,
            prices,
            reports,
            scheduler,
            shutdown,
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    // ── Price crawler ────────────────────────────────────────────────────────

    pub fn start_price_crawl(&self) -> bool {
        self.prices.start()
    }

    pub async fn stop_price_crawl(&self) -> bool {
        self.prices.stop().await
    }

    pub fn price_crawl_status(&self) -> RunState {
        self.prices.status()
    }

    pub async fn run_price_crawl_once(&self) -> RunOutcome {
        self.prices.run_once().await
    }

    pub fn update_price_crawl_config(
        &self,
        overrides: &PriceCrawlerOverrides,
    ) -> Result<PriceCrawlerConfig, ConfigError> {
        self.prices.job().update_config(overrides)
    }

    // ── Report crawler ───────────────────────────────────────────────────────

    pub fn start_report_crawl(&self) -> bool {
        self.reports.start()
    }

    pub async fn stop_report_crawl(&self) -> bool {
        self.reports.stop().await
    }

    pub fn report_crawl_status(&self) -> RunState {
        self.reports.status()
    }

    /// One report run with `full_crawl` forced for this run only.
    pub async fn run_report_crawl_once(&self, full: bool) -> RunOutcome {
        self.reports
            .run_once_with(RunOptions { full_crawl: Some(full) })
            .await
    }

    // ── Scheduler ────────────────────────────────────────────────────────────

    pub fn start_scheduler(&self) -> bool {
        self.scheduler.start()
    }

    pub fn scheduler_status(&self) -> SchedulerStatus {
        self.scheduler.status()
    }

    /// Stop the scheduler and both workers, cancelling in-flight runs.
    pub async fn shutdown(&self) {
        self.scheduler.stop().await;
        self.shutdown.cancel();
        self.prices.shutdown().await;
        self.reports.shutdown().await;
    }

    // ── Queries ──────────────────────────────────────────────────────────────

    async fn with_store<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Store) -> Result<T, StoreError> + Send + 'static,
    {
        let store = Arc::clone(&self.store);
        let out = tokio::task::spawn_blocking(move || f(&store))
            .await
            .context("Store task panicked")??;
        Ok(out)
    }

    pub async fn search(&self, filter: PriceFilter, limit: usize) -> Result<Vec<PriceRecord>> {
        self.with_store(move |s| s.search(&filter, limit)).await
    }

    pub async fn latest(&self, limit: usize) -> Result<Vec<PriceRecord>> {
        self.with_store(move |s| s.latest(limit)).await
    }

    pub async fn statistics(&self) -> Result<PriceStats> {
        self.with_store(Store::statistics).await
    }

    pub async fn provinces(&self) -> Result<Vec<String>> {
        self.with_store(Store::provinces).await
    }

    pub async fn varieties(&self) -> Result<Vec<String>> {
        self.with_store(Store::varieties).await
    }

    pub async fn markets(&self) -> Result<Vec<String>> {
        self.with_store(Store::markets).await
    }

    pub async fn export(&self, filter: PriceFilter) -> Result<PathBuf> {
        self.with_store(move |s| s.export(&filter)).await
    }

    pub async fn export_reports(&self, kind: Option<ReportKind>) -> Result<PathBuf> {
        self.with_store(move |s| s.export_reports(kind)).await
    }

    pub async fn reports(&self, query: ReportQuery) -> Result<ReportListing> {
        self.with_store(move |s| s.report_page(&query)).await
    }

    pub async fn report_stats(&self) -> Result<ReportStats> {
        self.with_store(Store::report_stats).await
    }

    pub async fn backup(&self) -> Result<Vec<PathBuf>> {
        self.with_store(Store::backup_all).await
    }

    pub async fn cleanup(&self) -> Result<usize> {
        let days = self.config.storage.cleanup_days;
        let today = Local::now().date_naive();
        self.with_store(move |s| s.prune_prices_older_than(days, today)).await
    }

    pub async fn metrics(&self) -> Result<Vec<ParsedMetrics>> {
        let reports = self.with_store(|s| s.reports().load()).await?;
        Ok(metrics_series(&reports))
    }
}
