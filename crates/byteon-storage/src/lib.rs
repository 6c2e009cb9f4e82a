//! HTTP fetch utilities for CSV registration exports.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{self, HeaderMap, HeaderValue};
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "byteon-storage";

/// Some export endpoints reject non-browser clients.
pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// HTTP status of the failed response, when the origin answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            FetchError::HttpStatus { status, .. } => Some(*status),
            FetchError::Request(err) => err.status().map(|s| s.as_u16()),
        }
    }
}

/// Anything that can produce the raw text of a CSV export.
#[async_trait]
pub trait CsvSource: Send + Sync {
    async fn fetch_csv(&self, url: &str) -> Result<String, FetchError>;
}

/// Fetches exports straight from the origin: no client cache, no retries.
#[derive(Debug, Clone)]
pub struct CsvFetcher {
    client: reqwest::Client,
}

impl CsvFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static("no-cache, no-store, max-age=0"),
        );
        headers.insert(header::PRAGMA, HeaderValue::from_static("no-cache"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("text/csv, text/plain, */*"));

        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent)
            .default_headers(headers)
            .build()
            .context("building reqwest client")?;

        Ok(Self { client })
    }

    pub async fn fetch_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("csv_fetch", url);
        async {
            let resp = self.client.get(url).send().await?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: resp.url().to_string(),
                });
            }
            let body = resp.text().await?;
            debug!(bytes = body.len(), "fetched export");
            Ok::<_, FetchError>(body)
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl CsvSource for CsvFetcher {
    async fn fetch_csv(&self, url: &str) -> Result<String, FetchError> {
        self.fetch_text(url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        http::{HeaderMap as AxumHeaders, StatusCode},
        routing::get,
        Router,
    };
    use tokio::net::TcpListener;

    async fn spawn_server(router: Router) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        format!("http://{addr}")
    }

    async fn echo_headers(headers: AxumHeaders) -> String {
        let get = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string()
        };
        format!(
            "cache_control,pragma,user_agent\n{},{},{}\n",
            get("cache-control").replace(',', ";"),
            get("pragma"),
            get("user-agent").replace(',', ";"),
        )
    }

    #[tokio::test]
    async fn fetch_sends_no_cache_and_browser_agent() {
        let base = spawn_server(Router::new().route("/export.csv", get(echo_headers))).await;
        let fetcher = CsvFetcher::new(HttpClientConfig::default()).expect("fetcher");

        let body = fetcher
            .fetch_csv(&format!("{base}/export.csv"))
            .await
            .expect("fetch");

        let row = body.lines().nth(1).expect("data row");
        assert!(row.starts_with("no-cache; no-store"), "{row}");
        assert!(row.contains(",no-cache,"), "{row}");
        assert!(row.contains("Mozilla/5.0"), "{row}");
    }

    #[tokio::test]
    async fn non_success_status_is_reported_with_code() {
        let base = spawn_server(Router::new().route(
            "/broken.csv",
            get(|| async { (StatusCode::INTERNAL_SERVER_ERROR, "boom") }),
        ))
        .await;
        let fetcher = CsvFetcher::new(HttpClientConfig::default()).expect("fetcher");

        let err = fetcher
            .fetch_csv(&format!("{base}/broken.csv"))
            .await
            .expect_err("500 must fail");

        assert_eq!(err.status(), Some(500));
        assert!(matches!(err, FetchError::HttpStatus { status: 500, .. }));
    }

    #[tokio::test]
    async fn unreachable_origin_is_a_request_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let fetcher = CsvFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .expect("fetcher");

        let err = fetcher
            .fetch_csv(&format!("http://{addr}/gone.csv"))
            .await
            .expect_err("closed port must fail");
        assert!(matches!(err, FetchError::Request(_)));
        assert_eq!(err.status(), None);
    }

    #[tokio::test]
    async fn slow_origin_hits_request_timeout() {
        let base = spawn_server(Router::new().route(
            "/slow.csv",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                "name,email\nAda,a@x.com\n"
            }),
        ))
        .await;
        let fetcher = CsvFetcher::new(HttpClientConfig {
            timeout: Duration::from_millis(200),
            ..Default::default()
        })
        .expect("fetcher");

        let started = tokio::time::Instant::now();
        let err = fetcher
            .fetch_csv(&format!("{base}/slow.csv"))
            .await
            .expect_err("slow origin must time out");

        assert!(started.elapsed() < Duration::from_secs(4));
        assert!(matches!(&err, FetchError::Request(inner) if inner.is_timeout()), "{err:?}");
        assert_eq!(err.status(), None);
    }
}
