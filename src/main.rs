mod analysis;
mod config;
mod crawler;
mod models;
mod pipeline;
mod remote;
mod scheduler;
mod storage;
mod utils;

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use crate::config::{AppConfig, PriceCrawlerOverrides};
use crate::crawler::RunState;
use crate::models::{PriceRecord, ReportKind};
use crate::pipeline::Pipeline;
use crate::storage::query::{PriceFilter, ReportQuery};

#[derive(Parser)]
#[command(name = "agri-crawler", about = "Agricultural wholesale price & report crawler", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduler and report crawler until Ctrl-C
    Serve,

    /// Crawl prices once
    CrawlPrices {
        /// Override how many provinces are sampled
        #[arg(long)]
        provinces: Option<usize>,
        /// Override how many markets per province are sampled
        #[arg(long)]
        markets: Option<usize>,
        /// Per-request timeout in seconds for this crawl
        #[arg(long)]
        timeout: Option<u64>,
        /// Attempts per request for this crawl
        #[arg(long)]
        retries: Option<u32>,
    },

    /// Crawl reports once (all pages unless --quick)
    CrawlReports {
        /// Only the first page of each report type
        #[arg(long)]
        quick: bool,
    },

    /// Search stored prices
    Search {
        #[command(flatten)]
        filter: FilterArgs,
        #[arg(short, long, default_value_t = 100)]
        limit: usize,
    },

    /// Most recently saved prices
    Latest {
        #[arg(short, long, default_value_t = 50)]
        limit: usize,
    },

    /// Show dataset statistics
    Stats,

    /// List provinces with stored prices
    Provinces,

    /// List varieties with stored prices
    Varieties,

    /// List markets with stored prices
    Markets,

    /// Export matching prices (or reports) to a CSV file in the data directory
    Export {
        #[command(flatten)]
        filter: FilterArgs,
        /// Export the report dataset instead of prices
        #[arg(long)]
        reports: bool,
        /// With --reports, only reports of this kind
        #[arg(short, long, value_enum, requires = "reports")]
        kind: Option<KindArg>,
    },

    /// List stored reports, newest first
    Reports {
        #[arg(short, long, value_enum)]
        kind: Option<KindArg>,
        #[arg(short, long, default_value_t = 1)]
        page: usize,
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
    },

    /// Back up both datasets now
    Backup,

    /// Drop price rows older than the configured retention
    Cleanup,

    /// Index and category figures extracted from daily reports
    Metrics,
}

#[derive(Args)]
struct FilterArgs {
    #[arg(long)]
    province: Option<String>,
    #[arg(long)]
    variety: Option<String>,
    #[arg(long)]
    market: Option<String>,
    /// Earliest trade date (YYYY-MM-DD), inclusive
    #[arg(long)]
    from: Option<String>,
    /// Latest trade date (YYYY-MM-DD), inclusive
    #[arg(long)]
    to: Option<String>,
}

impl From<FilterArgs> for PriceFilter {
    fn from(a: FilterArgs) -> Self {
        PriceFilter {
            province: a.province,
            variety: a.variety,
            market: a.market,
            date_from: a.from,
            date_to: a.to,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    Daily,
    Weekly,
    Analysis,
}

impl From<KindArg> for ReportKind {
    fn from(k: KindArg) -> Self {
        match k {
            KindArg::Daily => ReportKind::Daily,
            KindArg::Weekly => ReportKind::Weekly,
            KindArg::Analysis => ReportKind::Analysis,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "agri_price_crawler=info,warn",
        1 => "agri_price_crawler=debug,info",
        _ => "trace",
    };

    tracing_subscriber::registry()
        .with(fmt::layer().compact().with_target(false))
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)))
        .init();

    let config = AppConfig::load()?;
    let pipeline = Pipeline::new(config)?;

    match cli.command {
        Command::Serve => serve(&pipeline).await?,

        Command::CrawlPrices {
            provinces,
            markets,
            timeout,
            retries,
        } => {
            let overrides = PriceCrawlerOverrides {
                province_limit: provinces,
                markets_per_province: markets,
                timeout_secs: timeout,
                retry_times: retries,
                ..Default::default()
            };
            if provinces.is_some() || markets.is_some() || timeout.is_some() || retries.is_some() {
                pipeline.update_price_crawl_config(&overrides)?;
            }
            let _t = utils::Timer::start("Price crawl");
            let outcome = pipeline.run_price_crawl_once().await;
            print_run("Price crawl", outcome, &pipeline.price_crawl_status());
        }

        Command::CrawlReports { quick } => {
            let _t = utils::Timer::start("Report crawl");
            let outcome = pipeline.run_report_crawl_once(!quick).await;
            print_run("Report crawl", outcome, &pipeline.report_crawl_status());
        }

        Command::Search { filter, limit } => {
            let rows = pipeline.search(filter.into(), limit).await?;
            print_prices(&rows);
        }

        Command::Latest { limit } => {
            let rows = pipeline.latest(limit).await?;
            print_prices(&rows);
        }

        Command::Stats => {
            let stats = pipeline.statistics().await?;
            let reports = pipeline.report_stats().await?;
            println!("─────────────────────────────────");
            println!("  Agri crawler — Dataset Stats");
            println!("─────────────────────────────────");
            println!("  Price rows : {}", utils::fmt_count(stats.total_records as u64));
            println!("  Markets    : {}", utils::fmt_count(stats.distinct_markets as u64));
            println!("  Varieties  : {}", utils::fmt_count(stats.distinct_varieties as u64));
            println!("  Provinces  : {}", utils::fmt_count(stats.distinct_provinces as u64));
            println!(
                "  Last saved : {}",
                stats.last_update.map(|d| d.to_string()).unwrap_or("—".into())
            );
            println!("  Reports    : {}", utils::fmt_count(reports.total as u64));
            for (name, n) in &reports.by_type {
                println!("    {} : {}", name, utils::fmt_count(*n as u64));
            }
            println!("─────────────────────────────────");
        }

        Command::Provinces => print_list("provinces", &pipeline.provinces().await?),
        Command::Varieties => print_list("varieties", &pipeline.varieties().await?),
        Command::Markets => print_list("markets", &pipeline.markets().await?),

        Command::Export { filter, reports, kind } => {
            let path = if reports {
                pipeline.export_reports(kind.map(ReportKind::from)).await?
            } else {
                pipeline.export(filter.into()).await?
            };
            println!("Exported to {}", path.display());
        }

        Command::Reports { kind, page, limit } => {
            let listing = pipeline
                .reports(ReportQuery {
                    kind: kind.map(ReportKind::from),
                    page,
                    limit,
                })
                .await?;
            println!(
                "Page {}/{} ({} reports)",
                listing.page,
                listing.total_pages.max(1),
                listing.total
            );
            for r in &listing.items {
                println!("  [{}] {}  {}", r.report_date(), r.report_type_name, r.title);
            }
        }

        Command::Backup => {
            let written = pipeline.backup().await?;
            if written.is_empty() {
                println!("Nothing to back up.");
            }
            for path in &written {
                println!("Backup written: {}", path.display());
            }
        }

        Command::Cleanup => {
            let removed = pipeline.cleanup().await?;
            println!("Removed {} stale price rows.", utils::fmt_count(removed as u64));
        }

        Command::Metrics => {
            let series = pipeline.metrics().await?;
            if series.is_empty() {
                println!("No daily report metrics — run `agri-crawler crawl-reports` first.");
            }
            for m in &series {
                let fmt = |v: Option<f64>| v.map(|v| format!("{v:.2}")).unwrap_or("—".into());
                println!(
                    "{}  200指数 {}  菜篮子 {}  蔬菜 {}  水果 {}  猪肉 {}  牛肉 {}  鸡蛋 {}",
                    m.report_date,
                    fmt(m.price_index_200),
                    fmt(m.basket_index),
                    fmt(m.vegetables.map(|c| c.avg_price)),
                    fmt(m.fruits.map(|c| c.avg_price)),
                    fmt(m.pork.map(|c| c.avg_price)),
                    fmt(m.beef),
                    fmt(m.eggs),
                );
            }
        }
    }

    Ok(())
}

async fn serve(pipeline: &Pipeline) -> Result<()> {
    let config = pipeline.config();
    if config.scheduler.enabled {
        pipeline.start_scheduler();
    } else if config.price_crawler.enabled {
        pipeline.start_price_crawl();
    }
    if config.report_crawler.enabled {
        pipeline.start_report_crawl();
    }

    info!("Running; press Ctrl-C to stop");
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Could not listen for Ctrl-C: {}", e);
    }

    info!("Shutting down");
    pipeline.shutdown().await;
    let prices = pipeline.price_crawl_status();
    let reports = pipeline.report_crawl_status();
    info!(
        "Prices: {} items, {} errors | Reports: {} items, {} errors",
        prices.items_crawled, prices.errors_count, reports.items_crawled, reports.errors_count
    );
    Ok(())
}

fn print_run(label: &str, outcome: crawler::RunOutcome, state: &RunState) {
    println!(
        "{}: {:?} — {} items, {} errors",
        label,
        outcome,
        utils::fmt_count(state.items_crawled),
        state.errors_count
    );
    if let Some(e) = &state.last_error {
        println!("  last error: {}", e);
    }
}

fn print_prices(rows: &[PriceRecord]) {
    if rows.is_empty() {
        println!("No matching prices.");
        return;
    }
    for r in rows {
        println!(
            "{:<12} {:<8} {:<16} {:<10} {:>8.2} {:>8.2} {:>8.2} {}",
            r.trade_date.get(..10).unwrap_or(&r.trade_date),
            r.province,
            r.market_name,
            r.variety_name,
            r.min_price,
            r.avg_price,
            r.max_price,
            r.unit
        );
    }
    println!("{} rows", rows.len());
}

fn print_list(what: &str, items: &[String]) {
    if items.is_empty() {
        println!("No {} — run `agri-crawler crawl-prices` first.", what);
        return;
    }
    println!("{} {}:", items.len(), what);
    for s in items {
        println!("  {}", s);
    }
}
