use super::{Store, StoreError, write_rows};
use crate::models::{PriceRecord, ReportKind, ReportRecord};
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::info;

/// Price search filters. Text filters match by substring; the date bounds are
/// inclusive and compare against the date part of `trade_date`.
#[derive(Debug, Clone, Default)]
pub struct PriceFilter {
    pub province: Option<String>,
    pub variety: Option<String>,
    pub market: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
}

impl PriceFilter {
    pub fn matches(&self, r: &PriceRecord) -> bool {
        fn contains(field: &str, needle: &Option<String>) -> bool {
            needle.as_deref().is_none_or(|n| field.contains(n))
        }

        let day = trade_day(&r.trade_date);
        contains(&r.province, &self.province)
            && contains(&r.variety_name, &self.variety)
            && contains(&r.market_name, &self.market)
            && self.date_from.as_deref().is_none_or(|from| day >= from)
            && self.date_to.as_deref().is_none_or(|to| day <= to)
    }
}

/// `YYYY-MM-DD` prefix of a trade date, or the whole string when shorter.
fn trade_day(s: &str) -> &str {
    s.get(..10).unwrap_or(s)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct PriceStats {
    pub total_records: usize,
    pub distinct_markets: usize,
    pub distinct_varieties: usize,
    pub distinct_provinces: usize,
    pub last_update: Option<NaiveDateTime>,
}

#[derive(Debug, Clone)]
pub struct ReportQuery {
    pub kind: Option<ReportKind>,
    /// 1-based.
    pub page: usize,
    pub limit: usize,
}

impl Default for ReportQuery {
    fn default() -> Self {
        Self {
            kind: None,
            page: 1,
            limit: 20,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReportListing {
    pub items: Vec<ReportRecord>,
    pub total: usize,
    pub page: usize,
    pub total_pages: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportStats {
    pub total: usize,
    /// Count per report type name, including names not produced by this crawler.
    pub by_type: BTreeMap<String, usize>,
}

impl Store {
    pub fn search(&self, filter: &PriceFilter, limit: usize) -> Result<Vec<PriceRecord>, StoreError> {
        self.prices()
            .query(|r| filter.matches(r), |r| r.trade_date.clone(), limit)
    }

    /// Most recently saved rows first.
    pub fn latest(&self, limit: usize) -> Result<Vec<PriceRecord>, StoreError> {
        self.prices()
            .query(|_| true, |r| (r.saved_at, r.trade_date.clone()), limit)
    }

    pub fn statistics(&self) -> Result<PriceStats, StoreError> {
        let rows = self.prices().load()?;

        let distinct = |f: fn(&PriceRecord) -> &str| {
            rows.iter().map(f).filter(|s| !s.is_empty()).collect::<BTreeSet<_>>().len()
        };
        Ok(PriceStats {
            total_records: rows.len(),
            distinct_markets: distinct(|r| r.market_name.as_str()),
            distinct_varieties: distinct(|r| r.variety_name.as_str()),
            distinct_provinces: distinct(|r| r.province.as_str()),
            last_update: rows.iter().filter_map(|r| r.saved_at).max(),
        })
    }

    pub fn provinces(&self) -> Result<Vec<String>, StoreError> {
        self.distinct_prices(|r| r.province.as_str())
    }

    pub fn varieties(&self) -> Result<Vec<String>, StoreError> {
        self.distinct_prices(|r| r.variety_name.as_str())
    }

    pub fn markets(&self) -> Result<Vec<String>, StoreError> {
        self.distinct_prices(|r| r.market_name.as_str())
    }

    fn distinct_prices(&self, f: fn(&PriceRecord) -> &str) -> Result<Vec<String>, StoreError> {
        let rows = self.prices().load()?;
        let set: BTreeSet<&str> = rows.iter().map(f).filter(|s| !s.is_empty()).collect();
        Ok(set.into_iter().map(str::to_string).collect())
    }

    fn export_path(&self, stem: &str) -> PathBuf {
        self.data_dir()
            .join(format!("{}_{}.csv", stem, Local::now().format("%Y%m%d_%H%M%S_%6f")))
    }

    /// Write the rows matching `filter` (at most `export_limit`) to a fresh
    /// `export_<timestamp>.csv` in the data directory.
    pub fn export(&self, filter: &PriceFilter) -> Result<PathBuf, StoreError> {
        let rows = self.search(filter, self.export_limit)?;
        if rows.is_empty() {
            return Err(StoreError::NoRows);
        }
        let path = self.export_path("export");
        write_rows(&path, &rows)?;
        info!("Exported {} rows to {}", rows.len(), path.display());
        Ok(path)
    }

    /// Copy the stored reports, optionally of one kind, to a fresh
    /// `analysis_reports_<timestamp>.csv` in the data directory.
    pub fn export_reports(&self, kind: Option<ReportKind>) -> Result<PathBuf, StoreError> {
        let rows: Vec<ReportRecord> = self
            .reports()
            .load()?
            .into_iter()
            .filter(|r| kind.is_none_or(|k| r.kind() == Some(k)))
            .collect();
        if rows.is_empty() {
            return Err(StoreError::NoRows);
        }
        let path = self.export_path("analysis_reports");
        write_rows(&path, &rows)?;
        info!("Exported {} reports to {}", rows.len(), path.display());
        Ok(path)
    }

    /// Drop price rows traded before `today - days`. Rows whose trade date
    /// cannot be parsed are kept.
    pub fn prune_prices_older_than(&self, days: i64, today: NaiveDate) -> Result<usize, StoreError> {
        let cutoff = today - chrono::Duration::days(days);
        let removed = self.prices().retain(|r| {
            NaiveDate::parse_from_str(trade_day(&r.trade_date), "%Y-%m-%d")
                .map(|d| d >= cutoff)
                .unwrap_or(true)
        })?;
        if removed > 0 {
            info!("Removed {} price rows traded before {}", removed, cutoff);
        }
        Ok(removed)
    }

    /// One page of reports, newest capture first.
    pub fn report_page(&self, q: &ReportQuery) -> Result<ReportListing, StoreError> {
        let limit = q.limit.max(1);
        let page = q.page.max(1);

        let mut rows: Vec<ReportRecord> = self
            .reports()
            .load()?
            .into_iter()
            .filter(|r| q.kind.is_none_or(|k| r.report_type_code == k.code()))
            .collect();
        rows.sort_by(|a, b| b.captured_at.cmp(&a.captured_at));

        let total = rows.len();
        let items = rows.into_iter().skip((page - 1) * limit).take(limit).collect();
        Ok(ReportListing {
            items,
            total,
            page,
            total_pages: total.div_ceil(limit),
        })
    }

    pub fn report_stats(&self) -> Result<ReportStats, StoreError> {
        let rows = self.reports().load()?;
        let mut by_type = BTreeMap::new();
        for r in &rows {
            *by_type.entry(r.report_type_name.clone()).or_default() += 1;
        }
        Ok(ReportStats {
            total: rows.len(),
            by_type,
        })
    }
}
