use super::{CrawlJob, RunContext};
use crate::config::{ConfigError, PriceCrawlerConfig, PriceCrawlerOverrides, Province};
use crate::models::{MarketSummary, PriceRecord};
use crate::remote::PriceSource;
use crate::remote::http_client::FetchPolicy;
use crate::remote::cleaner::listing_to_record;
use crate::storage::Store;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Days, Local, NaiveDateTime};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{info, warn};

/// Samples markets per province and saves one page of today's listings for each.
pub struct PriceCrawler {
    source: Arc<dyn PriceSource>,
    store: Arc<Store>,
    config: RwLock<PriceCrawlerConfig>,
    jitter: Duration,
}

impl PriceCrawler {
    pub fn new(
        source: Arc<dyn PriceSource>,
        store: Arc<Store>,
        config: PriceCrawlerConfig,
        jitter: Duration,
    ) -> Self {
        source.set_fetch_policy(fetch_policy(&config));
        Self {
            source,
            store,
            config: RwLock::new(config),
            jitter,
        }
    }

    pub fn config(&self) -> PriceCrawlerConfig {
        self.config.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Validate and apply a partial override. Takes effect from the next run.
    pub fn update_config(&self, overrides: &PriceCrawlerOverrides) -> Result<PriceCrawlerConfig, ConfigError> {
        let mut guard = self.config.write().unwrap_or_else(PoisonError::into_inner);
        let merged = guard.merged(overrides)?;
        *guard = merged.clone();
        self.source.set_fetch_policy(fetch_policy(&merged));
        info!(
            "Price crawler config updated: every {} min, {} provinces × {} markets",
            merged.interval_minutes, merged.province_limit, merged.markets_per_province
        );
        Ok(merged)
    }

    /// Walk the sampled provinces and markets, returning every accepted record.
    async fn collect(&self, ctx: &RunContext, cfg: &PriceCrawlerConfig) -> Vec<PriceRecord> {
        let mut batch = Vec::new();
        let provinces = cfg.provinces.iter().take(cfg.province_limit);

        for (i, province) in provinces.enumerate() {
            if ctx.is_cancelled() {
                break;
            }
            if i > 0 && !ctx.polite_pause(cfg.province_delay(), self.jitter).await {
                break;
            }

            let markets = match self.source.fetch_markets(&province.code).await {
                Ok(m) => m,
                Err(e) => {
                    warn!("{}: market list failed: {:#}", province.name, e);
                    ctx.record_error();
                    continue;
                }
            };

            let sampled: Vec<MarketSummary> = markets
                .into_iter()
                .filter(|m| !m.market_id.is_empty() && !m.market_name.is_empty())
                .take(cfg.markets_per_province)
                .collect();
            info!("{}: crawling {} markets", province.name, sampled.len());

            for (j, market) in sampled.iter().enumerate() {
                if ctx.is_cancelled() {
                    break;
                }
                if j > 0 && !ctx.polite_pause(cfg.market_delay(), self.jitter).await {
                    break;
                }
                match self.crawl_market(province, market, cfg.page_size).await {
                    Ok(records) => {
                        ctx.record_items(records.len());
                        batch.extend(records);
                    }
                    Err(e) => {
                        warn!("{} / {}: {:#}", province.name, market.market_name, e);
                        ctx.record_error();
                    }
                }
            }
        }
        batch
    }

    async fn crawl_market(
        &self,
        province: &Province,
        market: &MarketSummary,
        page_size: u32,
    ) -> Result<Vec<PriceRecord>> {
        let today = Local::now().date_naive();
        let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
        let listings = self
            .source
            .fetch_listings(&market.market_id, yesterday, today, page_size)
            .await?;

        let captured_at: NaiveDateTime = Local::now().naive_local();
        let records: Vec<PriceRecord> = listings
            .iter()
            .filter_map(|item| listing_to_record(item, &province.name, &market.market_id, captured_at))
            .collect();

        info!(
            "{} / {}: {} of {} listings accepted",
            province.name,
            market.market_name,
            records.len(),
            listings.len()
        );
        Ok(records)
    }
}

fn fetch_policy(cfg: &PriceCrawlerConfig) -> FetchPolicy {
    FetchPolicy {
        timeout: cfg.timeout_secs.map(Duration::from_secs),
        retry_times: cfg.retry_times,
    }
}

#[async_trait]
impl CrawlJob for PriceCrawler {
    fn name(&self) -> &'static str {
        "price"
    }

    fn enabled(&self) -> bool {
        self.config().enabled
    }

    fn interval(&self) -> Duration {
        self.config().interval()
    }

    fn error_cooldown(&self) -> Duration {
        self.config().error_cooldown()
    }

    async fn run(&self, ctx: &RunContext) -> Result<()> {
        let cfg = self.config();
        let batch = self.collect(ctx, &cfg).await;
        if batch.is_empty() {
            info!("Price crawl produced no records");
            return Ok(());
        }

        let store = Arc::clone(&self.store);
        let saved = tokio::task::spawn_blocking(move || store.prices().append(batch))
            .await
            .context("Price save task panicked")?
            .context("Failed to save price records")?;
        info!("Price crawl saved {} records", saved);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crawler::{RunOutcome, Worker};
    use crate::storage::tests::test_store;
    use chrono::NaiveDate;
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Two markets per province; listings change between "rounds".
    struct StubPrices {
        round: AtomicUsize,
        listing_calls: AtomicUsize,
        failing_province: Option<&'static str>,
        listing_delay: Duration,
        policy: std::sync::Mutex<FetchPolicy>,
    }

    impl StubPrices {
        fn new() -> Self {
            Self {
                round: AtomicUsize::new(0),
                listing_calls: AtomicUsize::new(0),
                failing_province: None,
                listing_delay: Duration::ZERO,
                policy: Default::default(),
            }
        }
    }

    #[async_trait]
    impl PriceSource for StubPrices {
        async fn fetch_markets(&self, province_code: &str) -> Result<Vec<MarketSummary>> {
            if self.failing_province == Some(province_code) {
                anyhow::bail!("HTTP 503");
            }
            Ok(vec![
                MarketSummary {
                    market_id: String::new(),
                    market_name: "无ID市场".into(),
                },
                MarketSummary {
                    market_id: format!("{province_code}-1"),
                    market_name: format!("{province_code}批发市场"),
                },
                MarketSummary {
                    market_id: format!("{province_code}-2"),
                    market_name: format!("{province_code}农贸市场"),
                },
            ])
        }

        async fn fetch_listings(
            &self,
            market_id: &str,
            _start: NaiveDate,
            _end: NaiveDate,
            _page_size: u32,
        ) -> Result<Vec<Value>> {
            self.listing_calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.listing_delay).await;
            let market_name = format!("{}批发市场", market_id.trim_end_matches("-1"));
            let second = if self.round.load(Ordering::SeqCst) == 0 { "土豆" } else { "茄子" };
            Ok(vec![
                json!({"marketName": market_name, "varietyName": "大白菜", "middlePrice": "1.2", "reportTime": "2024-05-01"}),
                json!({"marketName": market_name, "varietyName": second, "middlePrice": 2.5, "reportTime": "2024-05-01"}),
                json!({"marketName": market_name, "varietyName": "", "middlePrice": 9.9, "reportTime": "2024-05-01"}),
            ])
        }

        fn set_fetch_policy(&self, policy: FetchPolicy) {
            *self.policy.lock().unwrap() = policy;
        }
    }

    fn crawler_config() -> PriceCrawlerConfig {
        PriceCrawlerConfig {
            province_limit: 2,
            markets_per_province: 1,
            market_delay_secs: 0.0,
            province_delay_secs: 0.0,
            provinces: vec![
                Province { code: "110000".into(), name: "北京市".into() },
                Province { code: "310000".into(), name: "上海市".into() },
                Province { code: "440000".into(), name: "广东省".into() },
            ],
            ..PriceCrawlerConfig::default()
        }
    }

    fn setup(source: Arc<StubPrices>, dir: &TempDir) -> (Worker<PriceCrawler>, Arc<Store>) {
        let store = Arc::new(test_store(dir, 10));
        let crawler = PriceCrawler::new(source, Arc::clone(&store), crawler_config(), Duration::ZERO);
        (Worker::new(crawler), store)
    }

    #[tokio::test]
    async fn two_runs_merge_into_deduplicated_dataset() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubPrices::new());
        let (worker, store) = setup(Arc::clone(&source), &dir);

        assert_eq!(worker.run_once().await, RunOutcome::CompletedOk);
        source.round.store(1, Ordering::SeqCst);
        assert_eq!(worker.run_once().await, RunOutcome::CompletedOk);

        // 2 provinces × 1 market × 2 valid listings per run.
        assert_eq!(source.listing_calls.load(Ordering::SeqCst), 4);
        assert_eq!(worker.status().items_crawled, 8);

        let rows = store.prices().load().unwrap();
        assert_eq!(rows.len(), 6);
        assert!(rows.iter().all(|r| !r.variety_name.is_empty()));
        assert!(rows.iter().all(|r| r.market_id.ends_with("-1")));
        assert!(rows.iter().all(|r| r.saved_at.is_some()));
    }

    #[tokio::test]
    async fn failing_province_is_counted_and_skipped() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubPrices {
            failing_province: Some("110000"),
            ..StubPrices::new()
        });
        let (worker, store) = setup(source, &dir);

        assert_eq!(worker.run_once().await, RunOutcome::CompletedWithErrors);
        let status = worker.status();
        assert_eq!(status.errors_count, 1);
        assert_eq!(status.items_crawled, 2);
        assert_eq!(store.prices().load().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancellation_stops_enumeration() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(test_store(&dir, 10));
        let crawler = PriceCrawler::new(
            Arc::new(StubPrices::new()),
            Arc::clone(&store),
            crawler_config(),
            Duration::ZERO,
        );

        let ctx = RunContext::detached(Default::default());
        let cfg = crawler.config();
        let first = crawler.collect(&ctx, &cfg).await;
        assert_eq!(first.len(), 4);

        ctx.cancel();
        assert!(crawler.collect(&ctx, &cfg).await.is_empty());
        crawler.run(&ctx).await.unwrap();
        assert!(store.prices().load().unwrap().is_empty());
    }

    #[tokio::test]
    async fn shutdown_waits_for_triggered_run_to_save() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubPrices {
            listing_delay: Duration::from_millis(300),
            ..StubPrices::new()
        });
        let (worker, store) = setup(Arc::clone(&source), &dir);

        assert!(worker.trigger_once(Default::default()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        worker.shutdown().await;

        assert!(!worker.is_busy());
        assert_eq!(worker.status().last_outcome, Some(RunOutcome::Cancelled));
        // The first market's listings were in flight and are kept.
        assert_eq!(source.listing_calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.prices().load().unwrap().len(), 2);
    }

    #[test]
    fn timeout_and_retry_overrides_reach_the_source() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(StubPrices::new());
        let crawler = PriceCrawler::new(
            Arc::clone(&source) as Arc<dyn PriceSource>,
            Arc::new(test_store(&dir, 10)),
            crawler_config(),
            Duration::ZERO,
        );
        assert_eq!(*source.policy.lock().unwrap(), FetchPolicy::default());

        crawler
            .update_config(&PriceCrawlerOverrides {
                timeout_secs: Some(8),
                retry_times: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(
            *source.policy.lock().unwrap(),
            FetchPolicy {
                timeout: Some(Duration::from_secs(8)),
                retry_times: Some(2),
            }
        );

        // A rejected update leaves the applied policy alone.
        assert!(crawler
            .update_config(&PriceCrawlerOverrides {
                retry_times: Some(0),
                ..Default::default()
            })
            .is_err());
        assert_eq!(source.policy.lock().unwrap().retry_times, Some(2));
    }

    #[test]
    fn config_update_is_validated() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(test_store(&dir, 10));
        let crawler = PriceCrawler::new(
            Arc::new(StubPrices::new()),
            store,
            crawler_config(),
            Duration::ZERO,
        );

        let updated = crawler
            .update_config(&PriceCrawlerOverrides {
                interval_minutes: Some(5),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(updated.interval_minutes, 5);
        assert_eq!(crawler.interval(), Duration::from_secs(300));

        let err = crawler.update_config(&PriceCrawlerOverrides {
            page_size: Some(0),
            ..Default::default()
        });
        assert!(err.is_err());
        assert_eq!(crawler.config().page_size, PriceCrawlerConfig::default().page_size);
    }
}
