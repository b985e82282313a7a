use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

// ── Price record ──────────────────────────────────────────────────────────────

/// One wholesale price observation. Column names follow the dataset layout
/// already on disk, so files written by earlier tooling load unchanged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PriceRecord {
    #[serde(rename = "省份", default)]
    pub province: String,
    #[serde(rename = "市场名称")]
    pub market_name: String,
    #[serde(rename = "品种名称")]
    pub variety_name: String,
    #[serde(rename = "最低价", default, deserialize_with = "lenient::number")]
    pub min_price: f64,
    #[serde(rename = "平均价", default, deserialize_with = "lenient::number")]
    pub avg_price: f64,
    #[serde(rename = "最高价", default, deserialize_with = "lenient::number")]
    pub max_price: f64,
    #[serde(rename = "单位", default)]
    pub unit: String,
    /// Kept as the source sends it (usually `YYYY-MM-DD[ HH:MM:SS]`).
    #[serde(rename = "交易日期")]
    pub trade_date: String,
    #[serde(rename = "更新时间", with = "timestamp")]
    pub captured_at: NaiveDateTime,
    #[serde(rename = "保存时间", default, with = "timestamp::option")]
    pub saved_at: Option<NaiveDateTime>,
    #[serde(rename = "产地", default)]
    pub produce_place: String,
    #[serde(rename = "交易量", default, deserialize_with = "lenient::number")]
    pub trading_volume: f64,
    #[serde(rename = "品种类型", default)]
    pub variety_type: String,
    #[serde(rename = "市场ID", default)]
    pub market_id: String,
    #[serde(rename = "品种ID", default)]
    pub variety_id: String,
}

// ── Report record ─────────────────────────────────────────────────────────────

/// The three report families published by the portal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportKind {
    Daily,
    Weekly,
    Analysis,
}

impl ReportKind {
    pub const ALL: [ReportKind; 3] = [ReportKind::Daily, ReportKind::Weekly, ReportKind::Analysis];

    pub fn name(self) -> &'static str {
        match self {
            ReportKind::Daily => "农产品批发市场价格日报",
            ReportKind::Weekly => "农产品批发市场价格周报",
            ReportKind::Analysis => "农业分析报告",
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            ReportKind::Daily => "daily_price_report",
            ReportKind::Weekly => "weekly_price_report",
            ReportKind::Analysis => "analysis_report",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.code() == code)
    }
}

/// A report as stored. Fields that a report family does not carry are left
/// empty; the dataset is the union of all three families' columns.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReportRecord {
    #[serde(rename = "报告ID")]
    pub report_id: String,
    #[serde(rename = "报告标题")]
    pub title: String,
    #[serde(rename = "报告类型")]
    pub report_type_name: String,
    #[serde(rename = "报告类型代码")]
    pub report_type_code: String,
    /// Report day of a daily report.
    #[serde(rename = "日报日期")]
    pub daily_date: String,
    /// Publication time of a weekly or analysis report.
    #[serde(rename = "发布时间")]
    pub published_at: String,
    #[serde(rename = "创建时间")]
    pub created_at: String,
    #[serde(rename = "爬取时间", with = "timestamp::option")]
    pub captured_at: Option<NaiveDateTime>,
    #[serde(rename = "来源")]
    pub source: String,
    #[serde(rename = "报告内容")]
    pub body_html_cleaned: String,
    #[serde(rename = "纯文本内容")]
    pub body_text: String,

    // daily price report sections
    #[serde(rename = "总体结论")]
    pub overall_conclusion: String,
    #[serde(rename = "畜产品结论")]
    pub livestock_conclusion: String,
    #[serde(rename = "水产品结论")]
    pub aquatic_conclusion: String,
    #[serde(rename = "蔬菜结论")]
    pub vegetable_conclusion: String,
    #[serde(rename = "水果结论")]
    pub fruit_conclusion: String,
    #[serde(rename = "价格指数结论")]
    pub index_conclusion: String,
    #[serde(rename = "涨跌幅分析")]
    pub change_range: String,
    #[serde(rename = "年份")]
    pub year: String,
    #[serde(rename = "JSON数据")]
    pub structured_json: String,

    // weekly / analysis
    #[serde(rename = "报告摘要")]
    pub summary: String,
    #[serde(rename = "关键词")]
    pub keywords: String,
    #[serde(rename = "作者")]
    pub author: String,
    #[serde(rename = "状态")]
    pub status: String,
    #[serde(rename = "阅读量", deserialize_with = "lenient::count")]
    pub read_count: u64,
    #[serde(rename = "分析领域")]
    pub category: String,

    #[serde(rename = "数据类型")]
    pub data_category: String,
    #[serde(rename = "监测范围")]
    pub coverage: String,
}

impl ReportRecord {
    pub fn kind(&self) -> Option<ReportKind> {
        ReportKind::from_code(&self.report_type_code)
    }

    /// The date a report is about, whichever column its family fills.
    pub fn report_date(&self) -> &str {
        if self.daily_date.is_empty() {
            &self.published_at
        } else {
            &self.daily_date
        }
    }
}

// ── Remote shapes ─────────────────────────────────────────────────────────────

/// Market entry from the per-province market listing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MarketSummary {
    pub market_id: String,
    pub market_name: String,
}

/// One page of a report listing, items still in source shape.
#[derive(Debug, Clone, Default)]
pub struct ReportPage {
    pub items: Vec<serde_json::Value>,
    /// Server-reported page count; 0 when absent.
    pub total_pages: u32,
}

// ── Lenient numeric columns ───────────────────────────────────────────────────

/// Numeric cells may be blank or carry stray text in files written by hand
/// or by older tooling; those read as zero.
pub mod lenient {
    use serde::{Deserialize, Deserializer};

    pub fn number<'de, D: Deserializer<'de>>(d: D) -> Result<f64, D::Error> {
        let s = String::deserialize(d)?;
        Ok(s.trim().parse::<f64>().ok().filter(|v| v.is_finite()).unwrap_or(0.0))
    }

    pub fn count<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let v = number(d)?;
        Ok(if v > 0.0 { v as u64 } else { 0 })
    }
}

// ── Timestamp column format ───────────────────────────────────────────────────

pub mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn serialize<S: Serializer>(t: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&t.format(FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let s = String::deserialize(d)?;
        parse(&s).ok_or_else(|| serde::de::Error::custom(format!("bad timestamp `{s}`")))
    }

    /// Accepts the column format and ISO `T`-separated timestamps, with or
    /// without fractional seconds.
    pub fn parse(s: &str) -> Option<NaiveDateTime> {
        let s = s.trim();
        NaiveDateTime::parse_from_str(s, FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f"))
            .ok()
    }

    pub mod option {
        use super::{FORMAT, parse};
        use chrono::NaiveDateTime;
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(t: &Option<NaiveDateTime>, s: S) -> Result<S::Ok, S::Error> {
            match t {
                Some(t) => s.collect_str(&t.format(FORMAT)),
                None => s.serialize_str(""),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<NaiveDateTime>, D::Error> {
            let s = String::deserialize(d)?;
            if s.trim().is_empty() {
                return Ok(None);
            }
            parse(&s)
                .map(Some)
                .ok_or_else(|| serde::de::Error::custom(format!("bad timestamp `{s}`")))
        }
    }
}
