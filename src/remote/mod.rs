pub mod cleaner;
pub mod http_client;

use crate::config::ApiConfig;
use crate::models::{MarketSummary, ReportKind, ReportPage};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::Method;
use serde_json::{Value, json};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

use self::cleaner::{coerce_f64, coerce_string};
use self::http_client::{FetchClient, FetchError, FetchPolicy};

// ── Source traits ─────────────────────────────────────────────────────────────

/// Where the price worker gets markets and listings from.
#[async_trait]
pub trait PriceSource: Send + Sync {
    async fn fetch_markets(&self, province_code: &str) -> Result<Vec<MarketSummary>>;

    /// One page of listings for `market_id` traded between `start` and `end`.
    async fn fetch_listings(
        &self,
        market_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        page_size: u32,
    ) -> Result<Vec<Value>>;

    /// Timeout and attempt count for subsequent price requests.
    fn set_fetch_policy(&self, _policy: FetchPolicy) {}
}

/// Where the report worker pages report listings from.
#[async_trait]
pub trait ReportSource: Send + Sync {
    async fn fetch_report_page(&self, kind: ReportKind, page: u32, page_size: u32) -> Result<ReportPage>;

    fn page_size(&self, kind: ReportKind) -> u32 {
        report_page_size(kind)
    }
}

/// Page size each report endpoint is queried with.
pub fn report_page_size(kind: ReportKind) -> u32 {
    match kind {
        ReportKind::Daily => 20,
        ReportKind::Weekly | ReportKind::Analysis => 10,
    }
}

// ── Envelope ──────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("{endpoint} answered with code {code}: {message}")]
    Api {
        endpoint: &'static str,
        code: i64,
        message: String,
    },
}

/// Unwrap `{"code": 200, "content": ...}`; any other code is an API error.
fn open_envelope(endpoint: &'static str, mut body: Value) -> Result<Value, RemoteError> {
    let code = body.get("code").and_then(Value::as_i64).unwrap_or(-1);
    if code != 200 {
        let message = ["message", "msg"]
            .iter()
            .find_map(|k| body.get(*k).and_then(Value::as_str))
            .unwrap_or_default()
            .to_string();
        return Err(RemoteError::Api { endpoint, code, message });
    }
    Ok(body.get_mut("content").map(Value::take).unwrap_or(Value::Null))
}

fn take_list(content: &mut Value) -> Vec<Value> {
    match content.get_mut("list").map(Value::take) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

// ── Portal client ─────────────────────────────────────────────────────────────

const MARKETS_ENDPOINT: &str = "priceQuotationController/getTodayMarketByProvinceCode";
const LISTINGS_ENDPOINT: &str = "priceQuotationController/pageList";

/// Request shape of one report listing endpoint.
struct ReportEndpoint {
    path: &'static str,
    method: Method,
}

fn report_endpoint(kind: ReportKind) -> ReportEndpoint {
    match kind {
        ReportKind::Daily => ReportEndpoint { path: "FarmDaily/list", method: Method::POST },
        ReportKind::Weekly => ReportEndpoint { path: "farmWeekly/pageList", method: Method::GET },
        ReportKind::Analysis => ReportEndpoint {
            path: "portal-analysis-report/selectListByPage",
            method: Method::GET,
        },
    }
}

pub struct AgriApi {
    client: FetchClient,
    base_url: String,
    price_policy: RwLock<FetchPolicy>,
}

impl AgriApi {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        Ok(Self {
            client: FetchClient::new(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            price_policy: RwLock::new(FetchPolicy::default()),
        })
    }

    fn price_policy(&self) -> FetchPolicy {
        *self.price_policy.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path)
    }

    async fn call(
        &self,
        endpoint: &'static str,
        method: Method,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<Value, RemoteError> {
        self.call_with(FetchPolicy::default(), endpoint, method, body, query).await
    }

    async fn call_with(
        &self,
        policy: FetchPolicy,
        endpoint: &'static str,
        method: Method,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<Value, RemoteError> {
        let raw = self
            .client
            .fetch_with(policy, method, &self.url(endpoint), body, query)
            .await?;
        open_envelope(endpoint, raw)
    }
}

#[async_trait]
impl PriceSource for AgriApi {
    async fn fetch_markets(&self, province_code: &str) -> Result<Vec<MarketSummary>> {
        let content = self
            .call_with(
                self.price_policy(),
                MARKETS_ENDPOINT,
                Method::POST,
                None,
                &[("code", province_code.to_string())],
            )
            .await
            .with_context(|| format!("Failed to list markets of province {province_code}"))?;

        let markets = match content {
            Value::Array(items) => items
                .iter()
                .map(|m| MarketSummary {
                    market_id: coerce_string(m.get("marketId")),
                    market_name: coerce_string(m.get("marketName")),
                })
                .collect(),
            _ => Vec::new(),
        };
        debug!("Province {}: {} markets", province_code, markets.len());
        Ok(markets)
    }

    async fn fetch_listings(
        &self,
        market_id: &str,
        start: NaiveDate,
        end: NaiveDate,
        page_size: u32,
    ) -> Result<Vec<Value>> {
        let body = json!({
            "marketId": market_id,
            "pageNum": 1,
            "pageSize": page_size,
            "order": "desc",
            "key": "",
            "varietyTypeId": "",
            "varietyId": "",
            "startDate": start.format("%Y-%m-%d").to_string(),
            "endDate": end.format("%Y-%m-%d").to_string(),
        });

        let mut content = self
            .call_with(self.price_policy(), LISTINGS_ENDPOINT, Method::POST, Some(&body), &[])
            .await
            .with_context(|| format!("Failed to fetch listings of market {market_id}"))?;
        Ok(take_list(&mut content))
    }

    fn set_fetch_policy(&self, policy: FetchPolicy) {
        debug!("Price fetch policy: {:?}", policy);
        *self.price_policy.write().unwrap_or_else(PoisonError::into_inner) = policy;
    }
}

#[async_trait]
impl ReportSource for AgriApi {
    async fn fetch_report_page(&self, kind: ReportKind, page: u32, page_size: u32) -> Result<ReportPage> {
        let endpoint = report_endpoint(kind);

        let mut content = match kind {
            ReportKind::Daily => {
                let body = json!({ "pageNum": page, "pageSize": page_size });
                self.call(endpoint.path, endpoint.method, Some(&body), &[]).await
            }
            ReportKind::Weekly => {
                let query = [("pageNum", page.to_string()), ("pageSize", page_size.to_string())];
                self.call(endpoint.path, endpoint.method, None, &query).await
            }
            ReportKind::Analysis => {
                let query = [
                    ("pageable", "true".to_string()),
                    ("pageSize", page_size.to_string()),
                    ("pageNum", page.to_string()),
                ];
                self.call(endpoint.path, endpoint.method, None, &query).await
            }
        }
        .with_context(|| format!("Failed to fetch {} page {}", kind.name(), page))?;

        let total_pages = coerce_f64(content.get("pages")).max(0.0) as u32;
        Ok(ReportPage {
            items: take_list(&mut content),
            total_pages,
        })
    }
}
