//! Headline figures pulled out of daily price report text.

use crate::models::{ReportKind, ReportRecord};
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;

// The portal quotes index names with either ASCII or CJK quotation marks.
static PRICE_INDEX_200: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["“]?农产品批发价格200指数["”]?.*?(\d+(?:\.\d+)?)"#).expect("Invalid 200-index regex")
});

static BASKET_INDEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["“]?菜篮子["”]?产品批发价格指数.*?(\d+(?:\.\d+)?)"#).expect("Invalid basket-index regex")
});

static PRICE_PER_KG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)元/公斤").expect("Invalid price regex"));

static CHANGE_RATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"比.*?(上升|下降)(\d+(?:\.\d+)?)%").expect("Invalid change-rate regex")
});

static PORK_PRICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"猪肉.*?(\d+(?:\.\d+)?)元/公斤").expect("Invalid pork regex"));

static PORK_CHANGE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"猪肉.*?比.*?(上升|下降)(\d+(?:\.\d+)?)%").expect("Invalid pork change regex")
});

static BEEF_PRICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"牛肉.*?(\d+(?:\.\d+)?)元/公斤").expect("Invalid beef regex"));

static EGG_PRICE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"鸡蛋.*?(\d+(?:\.\d+)?)元/公斤").expect("Invalid egg regex"));

static TOP_GAINERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"价格升幅前五名的是(.+?)，幅度分别为(.+?)；").expect("Invalid gainers regex")
});

static TOP_LOSERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"价格降幅前五名的是(.+?)，幅度分别为(.+?)。").expect("Invalid losers regex")
});

static PERCENT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+(?:\.\d+)?)%").expect("Invalid percent regex"));

/// Average price and signed day-on-day change of one product category.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CategoryMetric {
    pub avg_price: f64,
    /// Percent; negative for a fall. Zero when the text gives no change.
    pub change_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mover {
    pub product: String,
    /// Percent; negative for the losers list.
    pub change_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedMetrics {
    pub report_date: String,
    pub price_index_200: Option<f64>,
    pub basket_index: Option<f64>,
    pub vegetables: Option<CategoryMetric>,
    pub fruits: Option<CategoryMetric>,
    pub pork: Option<CategoryMetric>,
    /// 元/公斤
    pub beef: Option<f64>,
    /// 元/公斤
    pub eggs: Option<f64>,
    pub top_gainers: Vec<Mover>,
    pub top_losers: Vec<Mover>,
}

impl ParsedMetrics {
    pub fn is_empty(&self) -> bool {
        self.price_index_200.is_none()
            && self.basket_index.is_none()
            && self.vegetables.is_none()
            && self.fruits.is_none()
            && self.pork.is_none()
            && self.beef.is_none()
            && self.eggs.is_none()
            && self.top_gainers.is_empty()
            && self.top_losers.is_empty()
    }
}

fn capture_f64(re: &Regex, text: &str, group: usize) -> Option<f64> {
    re.captures(text)?.get(group)?.as_str().parse().ok()
}

fn signed_change(re: &Regex, text: &str) -> f64 {
    let Some(caps) = re.captures(text) else { return 0.0 };
    let rate: f64 = caps[2].parse().unwrap_or(0.0);
    if &caps[1] == "上升" { rate } else { -rate }
}

fn category(text: &str) -> Option<CategoryMetric> {
    Some(CategoryMetric {
        avg_price: capture_f64(&PRICE_PER_KG, text, 1)?,
        change_rate: signed_change(&CHANGE_RATE, text),
    })
}

fn pork(text: &str) -> Option<CategoryMetric> {
    Some(CategoryMetric {
        avg_price: capture_f64(&PORK_PRICE, text, 1)?,
        change_rate: signed_change(&PORK_CHANGE, text),
    })
}

/// Pair the `、`-separated product list with the listed percentages.
fn movers(re: &Regex, text: &str, sign: f64) -> Vec<Mover> {
    let Some(caps) = re.captures(text) else {
        return Vec::new();
    };
    let rates = PERCENT
        .captures_iter(&caps[2])
        .filter_map(|c| c[1].parse::<f64>().ok());
    caps[1]
        .split('、')
        .map(str::trim)
        .zip(rates)
        .map(|(product, rate)| Mover {
            product: product.to_string(),
            change_rate: sign * rate,
        })
        .collect()
}

/// Extract index levels, category and key product prices, and top movers
/// from a daily report.
pub fn parse_daily_metrics(report: &ReportRecord) -> ParsedMetrics {
    ParsedMetrics {
        report_date: report.report_date().to_string(),
        price_index_200: capture_f64(&PRICE_INDEX_200, &report.overall_conclusion, 1),
        basket_index: capture_f64(&BASKET_INDEX, &report.overall_conclusion, 1),
        vegetables: category(&report.vegetable_conclusion),
        fruits: category(&report.fruit_conclusion),
        pork: pork(&report.livestock_conclusion),
        beef: capture_f64(&BEEF_PRICE, &report.livestock_conclusion, 1),
        eggs: capture_f64(&EGG_PRICE, &report.livestock_conclusion, 1),
        top_gainers: movers(&TOP_GAINERS, &report.change_range, 1.0),
        top_losers: movers(&TOP_LOSERS, &report.change_range, -1.0),
    }
}

/// Metrics of every daily report that yields any, oldest first.
pub fn metrics_series(reports: &[ReportRecord]) -> Vec<ParsedMetrics> {
    let mut series: Vec<ParsedMetrics> = reports
        .iter()
        .filter(|r| r.kind() == Some(ReportKind::Daily))
        .map(parse_daily_metrics)
        .filter(|m| !m.is_empty())
        .collect();
    series.sort_by(|a, b| a.report_date.cmp(&b.report_date));
    series
}

#[cfg(test)]
mod tests {
    use super::*;

    fn daily(date: &str) -> ReportRecord {
        ReportRecord {
            report_id: date.into(),
            report_type_code: ReportKind::Daily.code().into(),
            daily_date: date.into(),
            overall_conclusion: "今日“农产品批发价格200指数”为121.35，比昨天下降0.12个点，\
                                 “菜篮子”产品批发价格指数为123.08，比昨天下降0.14个点。"
                .into(),
            vegetable_conclusion: "重点监测的28种蔬菜平均价格为5.12元/公斤，比昨天下降0.8%。".into(),
            fruit_conclusion: "重点监测的6种水果平均价格为7.47元/公斤，比昨天上升1.2%。".into(),
            livestock_conclusion: "猪肉平均价格为23.56元/公斤，比昨天上升0.3%；牛肉71.20元/公斤；鸡蛋9.85元/公斤。"
                .into(),
            change_range: "价格升幅前五名的是西兰花、菠菜、生菜，幅度分别为6.1%、4.3%、3.9%；\
                           价格降幅前五名的是鲢鱼、黄瓜，幅度分别为3.2%、2.5%。"
                .into(),
            ..Default::default()
        }
    }

    #[test]
    fn parses_indices_and_categories() {
        let m = parse_daily_metrics(&daily("2024-05-01"));
        assert_eq!(m.price_index_200, Some(121.35));
        assert_eq!(m.basket_index, Some(123.08));
        assert_eq!(
            m.vegetables,
            Some(CategoryMetric {
                avg_price: 5.12,
                change_rate: -0.8
            })
        );
        assert_eq!(m.fruits.unwrap().change_rate, 1.2);
        assert_eq!(m.pork.unwrap().avg_price, 23.56);
    }

    #[test]
    fn parses_beef_and_egg_prices() {
        let m = parse_daily_metrics(&daily("2024-05-01"));
        assert_eq!(m.beef, Some(71.20));
        assert_eq!(m.eggs, Some(9.85));

        let only_eggs = ReportRecord {
            livestock_conclusion: "鸡蛋平均价格为10.02元/公斤，与昨天持平。".into(),
            ..Default::default()
        };
        let m = parse_daily_metrics(&only_eggs);
        assert_eq!(m.eggs, Some(10.02));
        assert_eq!(m.beef, None);
        assert_eq!(m.pork, None);
        assert!(!m.is_empty());
    }

    #[test]
    fn parses_top_movers_with_signs() {
        let m = parse_daily_metrics(&daily("2024-05-01"));
        assert_eq!(m.top_gainers.len(), 3);
        assert_eq!(m.top_gainers[0].product, "西兰花");
        assert_eq!(m.top_gainers[2].change_rate, 3.9);
        assert_eq!(m.top_losers[1].product, "黄瓜");
        assert_eq!(m.top_losers[1].change_rate, -2.5);
    }

    #[test]
    fn missing_change_defaults_to_zero() {
        let r = ReportRecord {
            vegetable_conclusion: "蔬菜平均价格为4.00元/公斤。".into(),
            ..Default::default()
        };
        assert_eq!(parse_daily_metrics(&r).vegetables.unwrap().change_rate, 0.0);
    }

    #[test]
    fn series_keeps_daily_reports_with_metrics_oldest_first() {
        let mut weekly = daily("2024-04-01");
        weekly.report_type_code = ReportKind::Weekly.code().into();
        let blank = ReportRecord {
            report_type_code: ReportKind::Daily.code().into(),
            daily_date: "2024-04-15".into(),
            ..Default::default()
        };

        let series = metrics_series(&[daily("2024-05-02"), weekly, blank, daily("2024-05-01")]);
        let dates: Vec<_> = series.iter().map(|m| m.report_date.as_str()).collect();
        assert_eq!(dates, vec!["2024-05-01", "2024-05-02"]);
    }
}
