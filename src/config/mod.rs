use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Top-level application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub price_crawler: PriceCrawlerConfig,
    #[serde(default)]
    pub report_crawler: ReportCrawlerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { field, reason: reason.into() }
}

/// Remote portal + fetch client configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_retry_times")]
    pub retry_times: u32,

    /// Backoff before retry `n` (from 0) is `backoff_base_ms * 2^n`.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Upper bound of the random jitter added to every politeness delay.
    #[serde(default)]
    pub jitter_ms: u64,

    /// Hosts whose certificate chain is not verified. The portal serves a
    /// self-signed chain in some deployments; every other host is verified.
    #[serde(default = "default_insecure_tls_hosts")]
    pub insecure_tls_hosts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Province {
    pub code: String,
    pub name: String,
}

/// Price crawl worker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PriceCrawlerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_price_interval_minutes")]
    pub interval_minutes: u64,

    #[serde(default = "default_price_error_cooldown_secs")]
    pub error_cooldown_secs: u64,

    /// Only the first `province_limit` provinces are visited per run.
    #[serde(default = "default_province_limit")]
    pub province_limit: usize,

    #[serde(default = "default_markets_per_province")]
    pub markets_per_province: usize,

    #[serde(default = "default_price_page_size")]
    pub page_size: u32,

    #[serde(default = "default_market_delay_secs")]
    pub market_delay_secs: f64,

    #[serde(default = "default_province_delay_secs")]
    pub province_delay_secs: f64,

    /// Replaces `api.timeout_secs` for price requests when set.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// Replaces `api.retry_times` for price requests when set.
    #[serde(default)]
    pub retry_times: Option<u32>,

    #[serde(default = "default_provinces")]
    pub provinces: Vec<Province>,
}

/// Report crawl worker configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReportCrawlerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// `false` = quick crawl, first page of every report type only.
    #[serde(default = "default_true")]
    pub full_crawl: bool,

    #[serde(default = "default_max_reports_per_type")]
    pub max_reports_per_type: usize,

    #[serde(default = "default_report_interval_hours")]
    pub interval_hours: u64,

    #[serde(default = "default_report_error_cooldown_secs")]
    pub error_cooldown_secs: u64,

    #[serde(default = "default_page_delay_secs")]
    pub page_delay_secs: f64,

    #[serde(default = "default_type_delay_secs")]
    pub type_delay_secs: f64,

    #[serde(default = "default_detail_pause_every")]
    pub detail_pause_every: usize,

    #[serde(default = "default_detail_pause_ms")]
    pub detail_pause_ms: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    #[serde(default = "default_backup_dir")]
    pub backup_dir: PathBuf,

    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,

    /// Price rows with a trade date older than this are dropped by the cleanup job.
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days: i64,

    #[serde(default = "default_export_limit")]
    pub export_limit: usize,
}

/// Scheduler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    #[serde(default = "default_cleanup_interval_hours")]
    pub cleanup_interval_hours: u64,

    #[serde(default = "default_backup_interval_hours")]
    pub backup_interval_hours: u64,
}

// ── Defaults ─────────────────────────────────────────────────────────────────

fn default_base_url() -> String {
    "https://pfsc.agri.cn/api".to_string()
}
fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_retry_times() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    1000
}
fn default_insecure_tls_hosts() -> Vec<String> {
    vec!["pfsc.agri.cn".to_string()]
}
fn default_true() -> bool {
    true
}
fn default_price_interval_minutes() -> u64 {
    30
}
fn default_price_error_cooldown_secs() -> u64 {
    60
}
fn default_province_limit() -> usize {
    5
}
fn default_markets_per_province() -> usize {
    3
}
fn default_price_page_size() -> u32 {
    20
}
fn default_market_delay_secs() -> f64 {
    2.0
}
fn default_province_delay_secs() -> f64 {
    3.0
}
fn default_max_reports_per_type() -> usize {
    1000
}
fn default_report_interval_hours() -> u64 {
    6
}
fn default_report_error_cooldown_secs() -> u64 {
    300
}
fn default_page_delay_secs() -> f64 {
    2.0
}
fn default_type_delay_secs() -> f64 {
    3.0
}
fn default_detail_pause_every() -> usize {
    10
}
fn default_detail_pause_ms() -> u64 {
    1000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}
fn default_backup_dir() -> PathBuf {
    PathBuf::from("data/backups")
}
fn default_backup_retention() -> usize {
    10
}
fn default_cleanup_days() -> i64 {
    30
}
fn default_export_limit() -> usize {
    10_000
}
fn default_tick_ms() -> u64 {
    1000
}
fn default_cleanup_interval_hours() -> u64 {
    24
}
fn default_backup_interval_hours() -> u64 {
    6
}

fn default_provinces() -> Vec<Province> {
    [
        ("110000", "北京市"),
        ("120000", "天津市"),
        ("130000", "河北省"),
        ("140000", "山西省"),
        ("150000", "内蒙古自治区"),
        ("210000", "辽宁省"),
        ("220000", "吉林省"),
        ("230000", "黑龙江省"),
        ("310000", "上海市"),
        ("320000", "江苏省"),
        ("330000", "浙江省"),
        ("340000", "安徽省"),
        ("350000", "福建省"),
        ("360000", "江西省"),
        ("370000", "山东省"),
        ("410000", "河南省"),
        ("420000", "湖北省"),
        ("430000", "湖南省"),
        ("440000", "广东省"),
        ("450000", "广西壮族自治区"),
        ("460000", "海南省"),
        ("500000", "重庆市"),
        ("510000", "四川省"),
        ("520000", "贵州省"),
        ("530000", "云南省"),
        ("540000", "西藏自治区"),
        ("610000", "陕西省"),
        ("620000", "甘肃省"),
        ("630000", "青海省"),
        ("640000", "宁夏回族自治区"),
        ("650000", "新疆维吾尔自治区"),
    ]
    .into_iter()
    .map(|(code, name)| Province { code: code.to_string(), name: name.to_string() })
    .collect()
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            retry_times: default_retry_times(),
            backoff_base_ms: default_backoff_base_ms(),
            jitter_ms: 0,
            insecure_tls_hosts: default_insecure_tls_hosts(),
        }
    }
}

impl Default for PriceCrawlerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_minutes: default_price_interval_minutes(),
            error_cooldown_secs: default_price_error_cooldown_secs(),
            province_limit: default_province_limit(),
            markets_per_province: default_markets_per_province(),
            page_size: default_price_page_size(),
            market_delay_secs: default_market_delay_secs(),
            province_delay_secs: default_province_delay_secs(),
            timeout_secs: None,
            retry_times: None,
            provinces: default_provinces(),
        }
    }
}

impl Default for ReportCrawlerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            full_crawl: true,
            max_reports_per_type: default_max_reports_per_type(),
            interval_hours: default_report_interval_hours(),
            error_cooldown_secs: default_report_error_cooldown_secs(),
            page_delay_secs: default_page_delay_secs(),
            type_delay_secs: default_type_delay_secs(),
            detail_pause_every: default_detail_pause_every(),
            detail_pause_ms: default_detail_pause_ms(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            backup_dir: default_backup_dir(),
            backup_retention: default_backup_retention(),
            cleanup_days: default_cleanup_days(),
            export_limit: default_export_limit(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tick_ms: default_tick_ms(),
            cleanup_interval_hours: default_cleanup_interval_hours(),
            backup_interval_hours: default_backup_interval_hours(),
        }
    }
}

// ── Derived durations ────────────────────────────────────────────────────────

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl PriceCrawlerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_minutes * 60)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    pub fn market_delay(&self) -> Duration {
        Duration::from_secs_f64(self.market_delay_secs)
    }

    pub fn province_delay(&self) -> Duration {
        Duration::from_secs_f64(self.province_delay_secs)
    }
}

impl ReportCrawlerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_hours * 3600)
    }

    pub fn error_cooldown(&self) -> Duration {
        Duration::from_secs(self.error_cooldown_secs)
    }

    pub fn page_delay(&self) -> Duration {
        Duration::from_secs_f64(self.page_delay_secs)
    }

    pub fn type_delay(&self) -> Duration {
        Duration::from_secs_f64(self.type_delay_secs)
    }

    pub fn detail_pause(&self) -> Duration {
        Duration::from_millis(self.detail_pause_ms)
    }
}

impl SchedulerConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours * 3600)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval_hours * 3600)
    }
}

// ── Validation ───────────────────────────────────────────────────────────────

const MAX_DELAY_SECS: f64 = 3600.0;
const MAX_TIMEOUT_SECS: u64 = 3600;
const MAX_RETRY_TIMES: u64 = 20;
const MAX_BACKOFF_BASE_MS: u64 = 60_000;
const MAX_INTERVAL_MINUTES: u64 = 7 * 24 * 60;
const MAX_INTERVAL_HOURS: u64 = 365 * 24;
const MAX_COOLDOWN_SECS: u64 = 24 * 3600;
const MAX_TICK_MS: u64 = 60_000;
const MAX_PAUSE_MS: u64 = 3_600_000;

fn check_delay(field: &'static str, secs: f64) -> Result<(), ConfigError> {
    if !secs.is_finite() || !(0.0..=MAX_DELAY_SECS).contains(&secs) {
        return Err(invalid(
            field,
            format!("expected 0 to {MAX_DELAY_SECS} seconds, got {secs}"),
        ));
    }
    Ok(())
}

fn check_positive(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(invalid(field, "must be greater than zero"));
    }
    Ok(())
}

fn check_range(field: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if !(min..=max).contains(&value) {
        return Err(invalid(field, format!("must be between {min} and {max}, got {value}")));
    }
    Ok(())
}

impl ApiConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let url = url::Url::parse(&self.base_url)
            .map_err(|e| invalid("api.base_url", e.to_string()))?;
        if url.host_str().is_none() {
            return Err(invalid("api.base_url", "missing host"));
        }
        check_range("api.timeout_secs", self.timeout_secs, 1, MAX_TIMEOUT_SECS)?;
        check_range("api.retry_times", u64::from(self.retry_times), 1, MAX_RETRY_TIMES)?;
        check_range("api.backoff_base_ms", self.backoff_base_ms, 0, MAX_BACKOFF_BASE_MS)?;
        check_range("api.jitter_ms", self.jitter_ms, 0, MAX_PAUSE_MS)?;
        Ok(())
    }
}

impl PriceCrawlerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("price_crawler.interval_minutes", self.interval_minutes, 1, MAX_INTERVAL_MINUTES)?;
        check_range("price_crawler.error_cooldown_secs", self.error_cooldown_secs, 0, MAX_COOLDOWN_SECS)?;
        check_positive("price_crawler.page_size", u64::from(self.page_size))?;
        if let Some(t) = self.timeout_secs {
            check_range("price_crawler.timeout_secs", t, 1, MAX_TIMEOUT_SECS)?;
        }
        if let Some(r) = self.retry_times {
            check_range("price_crawler.retry_times", u64::from(r), 1, MAX_RETRY_TIMES)?;
        }
        check_delay("price_crawler.market_delay_secs", self.market_delay_secs)?;
        check_delay("price_crawler.province_delay_secs", self.province_delay_secs)?;
        if self.provinces.is_empty() {
            return Err(invalid("price_crawler.provinces", "at least one province is required"));
        }
        if let Some(p) = self.provinces.iter().find(|p| p.code.trim().is_empty()) {
            return Err(invalid("price_crawler.provinces", format!("province `{}` has no code", p.name)));
        }
        Ok(())
    }

    /// Returns a copy with every `Some` override applied, validated as a whole.
    pub fn merged(&self, overrides: &PriceCrawlerOverrides) -> Result<Self, ConfigError> {
        let mut next = self.clone();
        if let Some(v) = overrides.enabled {
            next.enabled = v;
        }
        if let Some(v) = overrides.interval_minutes {
            next.interval_minutes = v;
        }
        if let Some(v) = overrides.province_limit {
            next.province_limit = v;
        }
        if let Some(v) = overrides.markets_per_province {
            next.markets_per_province = v;
        }
        if let Some(v) = overrides.page_size {
            next.page_size = v;
        }
        if let Some(v) = overrides.market_delay_secs {
            next.market_delay_secs = v;
        }
        if let Some(v) = overrides.province_delay_secs {
            next.province_delay_secs = v;
        }
        if let Some(v) = overrides.timeout_secs {
            next.timeout_secs = Some(v);
        }
        if let Some(v) = overrides.retry_times {
            next.retry_times = Some(v);
        }
        next.validate()?;
        Ok(next)
    }
}

/// Partial update accepted by `update_price_crawl_config`.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PriceCrawlerOverrides {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<u64>,
    pub province_limit: Option<usize>,
    pub markets_per_province: Option<usize>,
    pub page_size: Option<u32>,
    pub market_delay_secs: Option<f64>,
    pub province_delay_secs: Option<f64>,
    pub timeout_secs: Option<u64>,
    pub retry_times: Option<u32>,
}

impl ReportCrawlerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("report_crawler.interval_hours", self.interval_hours, 1, MAX_INTERVAL_HOURS)?;
        check_range("report_crawler.error_cooldown_secs", self.error_cooldown_secs, 0, MAX_COOLDOWN_SECS)?;
        check_range("report_crawler.detail_pause_ms", self.detail_pause_ms, 0, MAX_PAUSE_MS)?;
        check_positive("report_crawler.max_reports_per_type", self.max_reports_per_type as u64)?;
        check_delay("report_crawler.page_delay_secs", self.page_delay_secs)?;
        check_delay("report_crawler.type_delay_secs", self.type_delay_secs)?;
        Ok(())
    }
}

impl StorageConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_positive("storage.backup_retention", self.backup_retention as u64)?;
        check_positive("storage.export_limit", self.export_limit as u64)?;
        if self.cleanup_days <= 0 {
            return Err(invalid("storage.cleanup_days", "must be greater than zero"));
        }
        Ok(())
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_range("scheduler.tick_ms", self.tick_ms, 1, MAX_TICK_MS)?;
        check_range("scheduler.cleanup_interval_hours", self.cleanup_interval_hours, 1, MAX_INTERVAL_HOURS)?;
        check_range("scheduler.backup_interval_hours", self.backup_interval_hours, 1, MAX_INTERVAL_HOURS)?;
        Ok(())
    }
}

// ── Loader ───────────────────────────────────────────────────────────────────

impl AppConfig {
    /// Load configuration from file + environment overrides
    pub fn load() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let builder = config::Config::builder()
            .add_source(
                config::File::with_name("config/default")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(
                config::File::with_name("config/local")
                    .required(false)
                    .format(config::FileFormat::Toml),
            )
            .add_source(config::Environment::with_prefix("AGRI").separator("__"));

        Self::from_builder(builder)
    }

    fn from_builder(
        builder: config::ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<Self, ConfigError> {
        let app_cfg: AppConfig = builder.build()?.try_deserialize()?;
        app_cfg.validate()?;
        Ok(app_cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.api.validate()?;
        self.price_crawler.validate()?;
        self.report_crawler.validate()?;
        self.storage.validate()?;
        self.scheduler.validate()?;
        Ok(())
    }
}
