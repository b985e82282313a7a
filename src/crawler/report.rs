use super::{CrawlJob, RunContext};
use crate::config::ReportCrawlerConfig;
use crate::models::{ReportKind, ReportRecord};
use crate::remote::ReportSource;
use crate::remote::cleaner::report_from_item;
use crate::storage::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Local;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Pages through the daily, weekly and analysis report listings.
pub struct ReportCrawler {
    source: Arc<dyn ReportSource>,
    store: Arc<Store>,
    config: ReportCrawlerConfig,
    jitter: Duration,
}

impl ReportCrawler {
    pub fn new(
        source: Arc<dyn ReportSource>,
        store: Arc<Store>,
        config: ReportCrawlerConfig,
        jitter: Duration,
    ) -> Self {
        Self {
            source,
            store,
            config,
            jitter,
        }
    }

    pub fn config(&self) -> &ReportCrawlerConfig {
        &self.config
    }

    /// Raw listing items of one report type.
    ///
    /// Pagination ends on the first of: an empty page, the per-type cap
    /// (result truncated to it), page 1 in quick mode, the server's last
    /// page, a short page, a failed page (counted; items so far are kept),
    /// or cancellation.
    pub async fn list(&self, kind: ReportKind, ctx: &RunContext, full: bool) -> Vec<Value> {
        let page_size = self.source.page_size(kind);
        let cap = self.config.max_reports_per_type;
        let mut items = Vec::new();
        let mut page = 1u32;

        while !ctx.is_cancelled() {
            let fetched = match self.source.fetch_report_page(kind, page, page_size).await {
                Ok(p) => p,
                Err(e) => {
                    warn!("{} page {} failed: {:#}", kind.name(), page, e);
                    ctx.record_error();
                    break;
                }
            };

            if fetched.items.is_empty() {
                info!("{} page {} is empty, done", kind.name(), page);
                break;
            }
            let got = fetched.items.len();
            items.extend(fetched.items);
            info!(
                "{} page {}: {} reports, {} so far",
                kind.name(),
                page,
                got,
                items.len()
            );

            if items.len() >= cap {
                items.truncate(cap);
                info!("{} reached the cap of {}", kind.name(), cap);
                break;
            }
            if !full {
                break;
            }
            if fetched.total_pages > 0 && page >= fetched.total_pages {
                debug!("{} all {} pages fetched", kind.name(), fetched.total_pages);
                break;
            }
            if got < page_size as usize {
                break;
            }

            page += 1;
            if !ctx.polite_pause(self.config.page_delay(), self.jitter).await {
                break;
            }
        }
        items
    }

    /// Map listing items to stored reports, pausing every
    /// `detail_pause_every` items.
    async fn details(&self, kind: ReportKind, items: &[Value], ctx: &RunContext) -> Vec<ReportRecord> {
        let captured_at = Local::now().naive_local();
        let every = self.config.detail_pause_every;
        let mut out = Vec::with_capacity(items.len());

        for (i, item) in items.iter().enumerate() {
            if every > 0 && i > 0 && i % every == 0 && !ctx.pause(self.config.detail_pause()).await {
                break;
            }
            match report_from_item(kind, item, captured_at) {
                Some(r) => out.push(r),
                None => debug!("{} item without id skipped", kind.name()),
            }
        }
        ctx.record_items(out.len());
        out
    }

    async fn collect(&self, ctx: &RunContext) -> Vec<ReportRecord> {
        let full = ctx.options().full_crawl.unwrap_or(self.config.full_crawl);
        info!("Report crawl ({} mode)", if full { "full" } else { "quick" });

        let mut batch = Vec::new();
        for (i, kind) in ReportKind::ALL.into_iter().enumerate() {
            if ctx.is_cancelled() {
                break;
            }
            if i > 0 && !ctx.polite_pause(self.config.type_delay(), self.jitter).await {
                break;
            }

            let items = self.list(kind, ctx, full).await;
            let records = self.details(kind, &items, ctx).await;
            info!("{}: {} reports collected", kind.name(), records.len());
            batch.extend(records);
        }
        batch
    }
}

#[async_trait]
impl CrawlJob for ReportCrawler {
    fn name(&self) -> &'static str {
        "report"
    }

    fn interval(&self) -> Duration {
        self.config.interval()
    }

    fn error_cooldown(&self) -> Duration {
        self.config.error_cooldown()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        let batch = self.collect(ctx).await;
        if batch.is_empty() {
            info!("Report crawl produced no reports");
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let saved = tokio::task::spawn_blocking(move || store.reports().append(batch))
            .await
            .context("Report save task panicked")?
            .context("Failed to save reports")?;
        info!("Report crawl saved {} reports", saved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{RunOptions, RunOutcome, Worker};
    use crate::models::ReportPage;
    use crate::storage::tests::test_store;
    use serde_json::json;
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Serves `total` items per report type in pages of `page_size`.
    struct StubReports {
        total: usize,
        page_size: u32,
        reported_pages: u32,
        fail_on_page: Option<u32>,
        calls: Mutex<Vec<(ReportKind, u32)>>,
    }

    impl StubReports {
        fn new(total: usize) -> Self {
            Self {
                total,
                page_size: 10,
                reported_pages: 0,
                fail_on_page: None,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn calls_for(&self, kind: ReportKind) -> usize {
            self.calls.lock().unwrap().iter().filter(|(k, _)| *k == kind).count()
        }
    }

    #[async_trait]
    impl ReportSource for StubReports {
        async fn fetch_report_page(&self, kind: ReportKind, page: u32, page_size: u32) -> Result<ReportPage> {
            self.calls.lock().unwrap().push((kind, page));
            if self.fail_on_page == Some(page) {
                anyhow::bail!("HTTP 502");
            }
            let start = ((page - 1) * page_size) as usize;
            let end = (start + page_size as usize).min(self.total);
            let items = (start..end)
                .map(|i| json!({"id": format!("{}-{i}", kind.code()), "title": format!("报告{i}")}))
                .collect();
            Ok(ReportPage {
                items,
                total_pages: self.reported_pages,
            })
        }

        fn page_size(&self, _kind: ReportKind) -> u32 {
            self.page_size
        }
    }

    fn crawler(source: Arc<StubReports>, dir: &TempDir, full_crawl: bool, cap: usize) -> ReportCrawler {
        let config = ReportCrawlerConfig {
            full_crawl,
            max_reports_per_type: cap,
            page_delay_secs: 0.0,
            type_delay_secs: 0.0,
            detail_pause_ms: 0,
            ..ReportCrawlerConfig::default()
        };
        ReportCrawler::new(source, Arc::new(test_store(dir, 10)), config, Duration::ZERO)
    }

    fn ctx() -> RunContext {
        RunContext::detached(RunOptions::default())
    }

    #[tokio::test]
    async fn quick_mode_fetches_at_most_one_page() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubReports::new(100));
        let c = crawler(Arc::clone(&source), &dir, false, 1000);

        let items = c.list(ReportKind::Daily, &ctx(), false).await;
        assert_eq!(items.len(), 10);
        assert_eq!(source.calls_for(ReportKind::Daily), 1);
    }

    #[tokio::test]
    async fn cap_truncates_and_stops() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubReports::new(100));
        let c = crawler(Arc::clone(&source), &dir, true, 25);

        let items = c.list(ReportKind::Weekly, &ctx(), true).await;
        assert_eq!(items.len(), 25);
        assert_eq!(source.calls_for(ReportKind::Weekly), 3);
    }

    #[tokio::test]
    async fn failed_page_keeps_what_was_accumulated() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubReports {
            fail_on_page: Some(3),
            ..StubReports::new(100)
        });
        let c = crawler(Arc::clone(&source), &dir, true, 1000);
        let ctx = ctx();

        let items = c.list(ReportKind::Analysis, &ctx, true).await;
        assert_eq!(items.len(), 20);
        assert_eq!(ctx.errors_this_run(), 1);
    }

    #[tokio::test]
    async fn short_page_ends_pagination() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubReports::new(23));
        let c = crawler(Arc::clone(&source), &dir, true, 1000);

        let items = c.list(ReportKind::Daily, &ctx(), true).await;
        assert_eq!(items.len(), 23);
        assert_eq!(source.calls_for(ReportKind::Daily), 3);
    }

    #[tokio::test]
    async fn server_page_count_ends_pagination() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubReports {
            reported_pages: 2,
            ..StubReports::new(100)
        });
        let c = crawler(Arc::clone(&source), &dir, true, 1000);

        let items = c.list(ReportKind::Daily, &ctx(), true).await;
        assert_eq!(items.len(), 20);
        assert_eq!(source.calls_for(ReportKind::Daily), 2);
    }

    #[tokio::test]
    async fn exact_multiple_of_page_size_stops_on_empty_page() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubReports::new(20));
        let c = crawler(Arc::clone(&source), &dir, true, 1000);

        let items = c.list(ReportKind::Daily, &ctx(), true).await;
        assert_eq!(items.len(), 20);
        assert_eq!(source.calls_for(ReportKind::Daily), 3);
    }

    #[tokio::test]
    async fn full_crawl_override_applies_to_one_run_only() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubReports::new(15));
        let worker = Worker::new(crawler(Arc::clone(&source), &dir, false, 1000));

        let outcome = worker
            .run_once_with(RunOptions { full_crawl: Some(true) })
            .await;
        assert_eq!(outcome, RunOutcome::CompletedOk);
        assert_eq!(source.calls_for(ReportKind::Weekly), 2);
        assert!(!worker.job().config().full_crawl);

        // All three types merged into one batch.
        let dir_store = test_store(&dir, 10);
        assert_eq!(dir_store.reports().load().unwrap().len(), 45);
        assert_eq!(worker.status().items_crawled, 45);

        worker.run_once().await;
        assert_eq!(source.calls_for(ReportKind::Weekly), 3);
    }

    #[tokio::test]
    async fn detail_pause_falls_on_every_tenth_item() {
        let dir = TempDir::new().unwrap();
        let c = crawler(Arc::new(StubReports::new(0)), &dir, true, 1000);
        let items: Vec<Value> = (0..25).map(|i| json!({"id": i})).collect();

        // No pause point is reached before item 10, so a cancelled run maps
        // exactly the first ten and stops at the pause.
        let cancelled = ctx();
        cancelled.cancel();
        assert_eq!(c.details(ReportKind::Daily, &items, &cancelled).await.len(), 10);
        assert_eq!(c.details(ReportKind::Daily, &items[..10], &cancelled).await.len(), 10);

        let live = ctx();
        assert_eq!(c.details(ReportKind::Daily, &items, &live).await.len(), 25);
    }

    #[tokio::test]
    async fn detail_mapping_skips_items_without_id() {
        let dir = TempDir::new().unwrap();
        let c = crawler(Arc::new(StubReports::new(0)), &dir, true, 1000);
        let ctx = ctx();
        let items = vec![json!({"id": "1", "title": "a"}), json!({"title": "no id"}), json!({"id": 2})];

        let records = c.details(ReportKind::Weekly, &items, &ctx).await;
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].report_id, "2");
        assert_eq!(records[0].report_type_code, "weekly_price_report");
    }
}
