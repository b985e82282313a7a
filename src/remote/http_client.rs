use crate::config::ApiConfig;
use anyhow::{Context, Result};
use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, HeaderMap, HeaderValue, ORIGIN, REFERER};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio_retry::RetryIf;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    /// Connection, TLS, timeout or body-read failure.
    Transport,
    /// Any status other than 200.
    Status,
    /// 200 with nothing in the body.
    EmptyBody,
    /// Body present but not JSON.
    Decode,
}

impl FetchErrorKind {
    fn is_retryable(self) -> bool {
        matches!(self, FetchErrorKind::Transport | FetchErrorKind::Status)
    }
}

impl fmt::Display for FetchErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FetchErrorKind::Transport => "transport error",
            FetchErrorKind::Status => "bad status",
            FetchErrorKind::EmptyBody => "empty response",
            FetchErrorKind::Decode => "undecodable response",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
#[error("{kind} from {url} after {attempts} attempt(s): {detail}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub url: String,
    pub attempts: u32,
    pub status: Option<StatusCode>,
    detail: String,
}

impl FetchError {
    fn new(kind: FetchErrorKind, url: &str, detail: impl Into<String>) -> Self {
        Self {
            kind,
            url: url.to_string(),
            attempts: 1,
            status: None,
            detail: detail.into(),
        }
    }
}

/// Per-call overrides of the client's timeout and attempt count.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchPolicy {
    pub timeout: Option<Duration>,
    pub retry_times: Option<u32>,
}

/// JSON-over-HTTP client with bounded retries and exponential backoff.
///
/// Two connection pools are kept: one verifying certificates, one that does
/// not. The second is only used for hosts named in
/// `ApiConfig::insecure_tls_hosts`.
pub struct FetchClient {
    strict: reqwest::Client,
    relaxed: reqwest::Client,
    insecure_hosts: Vec<String>,
    retry_times: u32,
    backoff_base: Duration,
}

impl FetchClient {
    pub fn new(config: &ApiConfig) -> Result<Self> {
        let headers = default_headers(&config.base_url)?;

        let builder = || {
            reqwest::Client::builder()
                .user_agent(config.user_agent.as_str())
                .timeout(config.timeout())
                .default_headers(headers.clone())
                .gzip(true)
                .cookie_store(true)
        };

        let strict = builder().build().context("Failed to build HTTP client")?;
        let relaxed = builder()
            .danger_accept_invalid_certs(true)
            .build()
            .context("Failed to build relaxed-TLS HTTP client")?;

        Ok(Self {
            strict,
            relaxed,
            insecure_hosts: config
                .insecure_tls_hosts
                .iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .collect(),
            retry_times: config.retry_times.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        })
    }

    fn client_for(&self, url: &str) -> &reqwest::Client {
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_ascii_lowercase));
        match host {
            Some(h) if self.insecure_hosts.iter().any(|allowed| *allowed == h) => &self.relaxed,
            _ => &self.strict,
        }
    }

    /// Sleeps between attempts: `base * 2^n` for n = 0.. up to `retry_times - 1` entries.
    fn backoff_schedule(&self, retry_times: u32) -> impl Iterator<Item = Duration> + use<> {
        let base = self.backoff_base;
        (0..retry_times.max(1) - 1).map(move |n| base.saturating_mul(1u32 << n.min(16)))
    }

    /// Issue one logical request, retrying transport and status failures.
    pub async fn fetch(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<Value, FetchError> {
        self.fetch_with(FetchPolicy::default(), method, url, body, query).await
    }

    /// [`fetch`](Self::fetch) with the timeout and attempt count taken from
    /// `policy` where it sets them.
    pub async fn fetch_with(
        &self,
        policy: FetchPolicy,
        method: Method,
        url: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
    ) -> Result<Value, FetchError> {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let method = &method;
        let retry_times = policy.retry_times.unwrap_or(self.retry_times);

        let outcome = RetryIf::spawn(
            self.backoff_schedule(retry_times),
            move || {
                let n = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("{} {} (attempt {})", method, url, n);
                self.send_once(method, url, body, query, policy.timeout)
            },
            |e: &FetchError| {
                warn!("Request to {} failed: {} ({})", e.url, e.kind, e.detail);
                e.kind.is_retryable()
            },
        )
        .await;

        outcome.map_err(|mut e| {
            e.attempts = counter.load(Ordering::Relaxed);
            e
        })
    }

    async fn send_once(
        &self,
        method: &Method,
        url: &str,
        body: Option<&Value>,
        query: &[(&str, String)],
        timeout: Option<Duration>,
    ) -> Result<Value, FetchError> {
        let mut req = self.client_for(url).request(method.clone(), url);
        if let Some(timeout) = timeout {
            req = req.timeout(timeout);
        }
        if !query.is_empty() {
            req = req.query(query);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| FetchError::new(FetchErrorKind::Transport, url, e.to_string()))?;

        let status = resp.status();
        if status != StatusCode::OK {
            let mut err = FetchError::new(FetchErrorKind::Status, url, format!("HTTP {status}"));
            err.status = Some(status);
            return Err(err);
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(|e| FetchError::new(FetchErrorKind::Transport, url, e.to_string()))?;

        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Err(FetchError::new(FetchErrorKind::EmptyBody, url, "no content"));
        }

        serde_json::from_slice(&bytes)
            .map_err(|e| FetchError::new(FetchErrorKind::Decode, url, e.to_string()))
    }
}

/// Headers the portal expects from its own front-end.
fn default_headers(base_url: &str) -> Result<HeaderMap> {
    let origin = url::Url::parse(base_url)
        .with_context(|| format!("Invalid base URL {base_url}"))?
        .origin()
        .ascii_serialization();

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain, */*"));
    headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("zh-CN,zh;q=0.9,en;q=0.8"));
    headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json;charset=UTF-8"));
    headers.insert(ORIGIN, HeaderValue::from_str(&origin).context("Bad origin header")?);
    headers.insert(
        REFERER,
        HeaderValue::from_str(&format!("{origin}/")).context("Bad referer header")?,
    );
    Ok(headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_config(retry_times: u32) -> ApiConfig {
        ApiConfig {
            base_url: "http://127.0.0.1".into(),
            timeout_secs: 5,
            retry_times,
            backoff_base_ms: 0,
            ..ApiConfig::default()
        }
    }

    /// Answers every request with the same canned response and counts requests.
    async fn canned_server(status_line: &'static str, body: &'static str) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else { break };
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    let mut chunk = [0u8; 1024];
                    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                        match sock.read(&mut chunk).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => buf.extend_from_slice(&chunk[..n]),
                        }
                    }
                    let resp = format!(
                        "HTTP/1.1 {status_line}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = sock.write_all(resp.as_bytes()).await;
                    let _ = sock.shutdown().await;
                });
            }
        });

        (format!("http://{addr}/api/test"), hits)
    }

    #[tokio::test]
    async fn transport_failure_uses_exactly_retry_times_attempts() {
        // Bind then drop to get a port nobody listens on.
        let addr = {
            let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap()
        };
        let client = FetchClient::new(&test_config(3)).unwrap();

        let err = client
            .fetch(Method::GET, &format!("http://{addr}/x"), None, &[])
            .await
            .unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::Transport);
        assert_eq!(err.attempts, 3);
    }

    #[tokio::test]
    async fn non_200_status_is_retried_then_reported() {
        let (url, hits) = canned_server("503 Service Unavailable", "").await;
        let client = FetchClient::new(&test_config(4)).unwrap();

        let err = client.fetch(Method::GET, &url, None, &[]).await.unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::Status);
        assert_eq!(err.status, Some(StatusCode::SERVICE_UNAVAILABLE));
        assert_eq!(err.attempts, 4);
        assert_eq!(hits.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn empty_body_is_an_error_not_an_empty_success() {
        let (url, hits) = canned_server("200 OK", "").await;
        let client = FetchClient::new(&test_config(3)).unwrap();

        let err = client.fetch(Method::GET, &url, None, &[]).await.unwrap_err();

        assert_eq!(err.kind, FetchErrorKind::EmptyBody);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let (url, _) = canned_server("200 OK", "<html>maintenance</html>").await;
        let client = FetchClient::new(&test_config(3)).unwrap();

        let err = client.fetch(Method::GET, &url, None, &[]).await.unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Decode);
        assert_eq!(err.attempts, 1);
    }

    #[tokio::test]
    async fn valid_empty_list_is_a_success() {
        let (url, _) = canned_server("200 OK", r#"{"code":200,"content":[]}"#).await;
        let client = FetchClient::new(&test_config(3)).unwrap();

        let value = client
            .fetch(Method::GET, &url, None, &[("code", "110000".to_string())])
            .await
            .unwrap();
        assert_eq!(value["content"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn policy_overrides_attempt_count() {
        let (url, hits) = canned_server("502 Bad Gateway", "").await;
        let client = FetchClient::new(&test_config(4)).unwrap();
        let policy = FetchPolicy {
            timeout: Some(Duration::from_secs(2)),
            retry_times: Some(2),
        };

        let err = client
            .fetch_with(policy, Method::GET, &url, None, &[])
            .await
            .unwrap_err();
        assert_eq!(err.attempts, 2);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn policy_timeout_applies_per_request() {
        // Accepts connections and never answers.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((sock, _)) = listener.accept().await {
                held.push(sock);
            }
        });
        let client = FetchClient::new(&test_config(1)).unwrap();
        let policy = FetchPolicy {
            timeout: Some(Duration::from_millis(100)),
            retry_times: None,
        };

        let started = std::time::Instant::now();
        let err = client
            .fetch_with(policy, Method::GET, &format!("http://{addr}/slow"), None, &[])
            .await
            .unwrap_err();
        assert_eq!(err.kind, FetchErrorKind::Transport);
        assert!(started.elapsed() < Duration::from_secs(3));
    }

    #[test]
    fn backoff_doubles_from_base() {
        let mut cfg = test_config(4);
        cfg.backoff_base_ms = 1000;
        let client = FetchClient::new(&cfg).unwrap();
        let delays: Vec<_> = client.backoff_schedule(4).collect();
        assert_eq!(
            delays,
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
    }

    #[test]
    fn relaxed_tls_is_scoped_to_listed_hosts() {
        let client = FetchClient::new(&ApiConfig::default()).unwrap();
        assert!(std::ptr::eq(client.client_for("https://pfsc.agri.cn/api/x"), &client.relaxed));
        assert!(std::ptr::eq(client.client_for("https://PFSC.agri.cn/api/x"), &client.relaxed));
        assert!(std::ptr::eq(client.client_for("https://example.com/api/x"), &client.strict));
        assert!(std::ptr::eq(client.client_for("https://evil.pfsc.agri.cn.example/"), &client.strict));
    }
}
