use crate::models::{PriceRecord, ReportKind, ReportRecord};
use chrono::NaiveDateTime;
use scraper::Html;
use serde_json::Value;

/// Cleaned report bodies are cut to this many characters (plus `...`) so a
/// single oversized report cannot bloat the dataset.
pub const MAX_CLEAN_TEXT_CHARS: usize = 5000;

// ── Coercion ──────────────────────────────────────────────────────────────────

/// Parse a number out of source text: strip everything except digits, dot, minus.
/// "1,234.56" → 1234.56 | "3.5元" → 3.5 | "N/A" → None
pub fn parse_number(s: &str) -> Option<f64> {
    let s = s.trim();
    if s.is_empty() || s == "N/A" || s == "-" || s == "—" {
        return None;
    }
    let cleaned: String = s
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
        .collect();
    cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Missing, null or non-numeric ⇒ 0.0.
pub fn coerce_f64(v: Option<&Value>) -> f64 {
    match v {
        Some(Value::Number(n)) => n.as_f64().filter(|f| f.is_finite()).unwrap_or(0.0),
        Some(Value::String(s)) => parse_number(s).unwrap_or(0.0),
        _ => 0.0,
    }
}

/// Missing or null ⇒ "". Scalars are rendered, strings trimmed.
pub fn coerce_string(v: Option<&Value>) -> String {
    match v {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(Value::Bool(b)) => b.to_string(),
        Some(other) => other.to_string(),
    }
}

fn field(item: &Value, key: &str) -> String {
    coerce_string(item.get(key))
}

// ── Price listing → PriceRecord ───────────────────────────────────────────────

/// Normalise one listing from `priceQuotationController/pageList`.
/// Returns `None` when market or variety name is empty.
pub fn listing_to_record(
    item: &Value,
    province: &str,
    market_id: &str,
    captured_at: NaiveDateTime,
) -> Option<PriceRecord> {
    let market_name = field(item, "marketName");
    let variety_name = field(item, "varietyName");
    if market_name.is_empty() || variety_name.is_empty() {
        return None;
    }

    Some(PriceRecord {
        province: province.to_string(),
        market_name,
        variety_name,
        min_price: coerce_f64(item.get("minimumPrice")),
        avg_price: coerce_f64(item.get("middlePrice")),
        max_price: coerce_f64(item.get("highestPrice")),
        unit: field(item, "meteringUnit"),
        trade_date: field(item, "reportTime"),
        captured_at,
        saved_at: None,
        produce_place: field(item, "producePlace"),
        trading_volume: coerce_f64(item.get("tradingVolume")),
        variety_type: field(item, "varietyTypeName"),
        market_id: market_id.to_string(),
        variety_id: field(item, "varietyId"),
    })
}

// ── Report item → ReportRecord ────────────────────────────────────────────────

/// Map a raw listing item onto the stored report shape. Items without an id
/// are rejected since they cannot be deduplicated.
pub fn report_from_item(kind: ReportKind, item: &Value, captured_at: NaiveDateTime) -> Option<ReportRecord> {
    let report_id = field(item, "id");
    if report_id.is_empty() {
        return None;
    }

    let base = ReportRecord {
        report_id,
        report_type_name: kind.name().to_string(),
        report_type_code: kind.code().to_string(),
        captured_at: Some(captured_at),
        source: field(item, "source"),
        ..Default::default()
    };

    let record = match kind {
        ReportKind::Daily => daily_report(item, base),
        ReportKind::Weekly => weekly_report(item, base),
        ReportKind::Analysis => analysis_report(item, base),
    };
    Some(record)
}

// The daily endpoint's field names are misspelled at the source
// (`counclesion`, `countent`, `daylyDate`).
fn daily_report(item: &Value, base: ReportRecord) -> ReportRecord {
    ReportRecord {
        title: field(item, "remark"),
        daily_date: field(item, "daylyDate"),
        created_at: field(item, "createDate"),
        body_html_cleaned: clean_html(&field(item, "countent")),
        body_text: field(item, "countentstr"),
        overall_conclusion: field(item, "counclesion"),
        livestock_conclusion: field(item, "animalConclusion"),
        aquatic_conclusion: field(item, "aquaticConclusion"),
        vegetable_conclusion: field(item, "vegetablesConclusion"),
        fruit_conclusion: field(item, "fruitsConclusion"),
        index_conclusion: field(item, "indexConclusion"),
        change_range: field(item, "incOrReduRange"),
        year: field(item, "year"),
        structured_json: field(item, "wordJson"),
        data_category: "价格监测".to_string(),
        coverage: "全国农产品批发市场".to_string(),
        ..base
    }
}

fn weekly_report(item: &Value, base: ReportRecord) -> ReportRecord {
    let title = match field(item, "title") {
        t if t.is_empty() => field(item, "remark"),
        t => t,
    };
    ReportRecord {
        title,
        published_at: field(item, "publishTime"),
        created_at: field(item, "createTime"),
        body_html_cleaned: clean_html(&field(item, "content")),
        summary: field(item, "summary"),
        keywords: field(item, "keywords"),
        author: field(item, "author"),
        status: field(item, "status"),
        data_category: "周度分析".to_string(),
        coverage: "全国农产品市场".to_string(),
        ..base
    }
}

fn analysis_report(item: &Value, base: ReportRecord) -> ReportRecord {
    ReportRecord {
        title: field(item, "title"),
        published_at: field(item, "publishTime"),
        created_at: field(item, "createTime"),
        body_html_cleaned: clean_html(&field(item, "content")),
        summary: field(item, "summary"),
        keywords: field(item, "keywords"),
        author: field(item, "author"),
        read_count: coerce_f64(item.get("readCount")).max(0.0) as u64,
        category: field(item, "category"),
        data_category: "深度分析".to_string(),
        ..base
    }
}

// ── HTML ──────────────────────────────────────────────────────────────────────

/// Extract readable text from an HTML fragment: script/style content dropped,
/// whitespace runs collapsed, result capped at `MAX_CLEAN_TEXT_CHARS`.
pub fn clean_html(html: &str) -> String {
    if html.trim().is_empty() {
        return String::new();
    }

    let fragment = Html::parse_fragment(html);
    let mut raw = String::with_capacity(html.len());
    for node in fragment.tree.root().descendants() {
        let Some(text) = node.value().as_text() else { continue };
        let hidden = node.ancestors().any(|a| {
            a.value()
                .as_element()
                .is_some_and(|e| matches!(e.name(), "script" | "style"))
        });
        if !hidden {
            raw.push_str(text);
        }
    }

    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    truncate_chars(collapsed, MAX_CLEAN_TEXT_CHARS)
}

fn truncate_chars(s: String, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &s[..cut]),
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use serde_json::json;

    fn now() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 5, 2).unwrap().and_hms_opt(8, 0, 0).unwrap()
    }

    #[test]
    fn test_parse_number() {
        assert_eq!(parse_number("1,234.56"), Some(1234.56));
        assert_eq!(parse_number(" 3.5元 "), Some(3.5));
        assert_eq!(parse_number("N/A"), None);
        assert_eq!(parse_number("abc"), None);
    }

    #[test]
    fn coercion_defaults() {
        let item = json!({"a": "2.5", "b": 4, "c": null, "d": "x", "e": 12345});
        assert_eq!(coerce_f64(item.get("a")), 2.5);
        assert_eq!(coerce_f64(item.get("b")), 4.0);
        assert_eq!(coerce_f64(item.get("c")), 0.0);
        assert_eq!(coerce_f64(item.get("d")), 0.0);
        assert_eq!(coerce_f64(item.get("missing")), 0.0);
        assert_eq!(coerce_string(item.get("c")), "");
        assert_eq!(coerce_string(item.get("e")), "12345");
        assert_eq!(coerce_string(item.get("missing")), "");
    }

    #[test]
    fn listing_is_normalised() {
        let item = json!({
            "marketName": "北京新发地",
            "varietyName": "大白菜",
            "minimumPrice": "0.8",
            "middlePrice": 1.0,
            "highestPrice": null,
            "meteringUnit": "元/公斤",
            "reportTime": "2024-05-01",
            "varietyId": 77,
        });
        let rec = listing_to_record(&item, "北京市", "m1", now()).unwrap();
        assert_eq!(rec.min_price, 0.8);
        assert_eq!(rec.avg_price, 1.0);
        assert_eq!(rec.max_price, 0.0);
        assert_eq!(rec.produce_place, "");
        assert_eq!(rec.variety_id, "77");
        assert_eq!(rec.market_id, "m1");
    }

    #[test]
    fn listing_without_variety_is_dropped() {
        let item = json!({"marketName": "北京新发地", "varietyName": "  ", "middlePrice": 1.0});
        assert!(listing_to_record(&item, "北京市", "m1", now()).is_none());
        let item = json!({"varietyName": "大白菜"});
        assert!(listing_to_record(&item, "北京市", "m1", now()).is_none());
    }

    #[test]
    fn clean_html_drops_scripts_and_collapses_whitespace() {
        let html = "<div><style>p{color:red}</style><p>猪肉  价格\n\n上涨</p><script>alert(1)</script><p>0.5%</p></div>";
        assert_eq!(clean_html(html), "猪肉 价格 上涨0.5%");
        assert_eq!(clean_html(""), "");
    }

    #[test]
    fn clean_html_truncates_long_text() {
        let html = format!("<p>{}</p>", "价".repeat(MAX_CLEAN_TEXT_CHARS + 10));
        let cleaned = clean_html(&html);
        assert_eq!(cleaned.chars().count(), MAX_CLEAN_TEXT_CHARS + 3);
        assert!(cleaned.ends_with("..."));
    }

    #[test]
    fn daily_report_mapping() {
        let item = json!({
            "id": 901,
            "remark": "2024年5月1日农产品批发市场价格日报",
            "counclesion": "“农产品批发价格200指数”为120.5",
            "countent": "<p>正文</p>",
            "daylyDate": "2024-05-01",
            "source": "农业农村部",
        });
        let rec = report_from_item(ReportKind::Daily, &item, now()).unwrap();
        assert_eq!(rec.report_id, "901");
        assert_eq!(rec.report_type_code, "daily_price_report");
        assert_eq!(rec.daily_date, "2024-05-01");
        assert_eq!(rec.report_date(), "2024-05-01");
        assert_eq!(rec.body_html_cleaned, "正文");
        assert_eq!(rec.data_category, "价格监测");
    }

    #[test]
    fn weekly_title_falls_back_to_remark() {
        let item = json!({"id": "w1", "title": "", "remark": "第18周", "publishTime": "2024-05-03"});
        let rec = report_from_item(ReportKind::Weekly, &item, now()).unwrap();
        assert_eq!(rec.title, "第18周");
        assert_eq!(rec.kind(), Some(ReportKind::Weekly));
    }

    #[test]
    fn analysis_read_count_is_coerced() {
        let item = json!({"id": "a1", "title": "玉米市场分析", "readCount": "37"});
        let rec = report_from_item(ReportKind::Analysis, &item, now()).unwrap();
        assert_eq!(rec.read_count, 37);
        assert!(report_from_item(ReportKind::Analysis, &json!({"title": "x"}), now()).is_none());
    }
}
