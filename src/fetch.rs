//! The Segment Fetcher: the thin HTTP collaborator that downloads manifest
//! text and segment bytes, with retry/error-categorization and an optional
//! bandwidth limiter.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use bytes::Bytes;
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::error::{ConverterError, Result};

type DirectRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
    governor::middleware::NoOpMiddleware,
>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(60);
const MAX_RETRIES: usize = 4;

fn is_transient(e: &ConverterError) -> bool {
    matches!(e, ConverterError::NetworkTimeout(_))
}

fn network_error(why: &str, e: reqwest::Error) -> ConverterError {
    if e.is_timeout() {
        ConverterError::NetworkTimeout(format!("{why}: {e}"))
    } else if e.is_connect() {
        ConverterError::NetworkConnect(format!("{why}: {e}"))
    } else {
        ConverterError::Network(format!("{why}: {e}"))
    }
}

/// The async collaborator a `StreamSession` uses to retrieve manifest text
/// and segment bytes. Kept as an object-safe trait (via `async-trait`) so
/// the session loop's tests can inject a fake implementation without
/// standing up a real HTTP server, and so `StreamManager` can hold one
/// shared `Arc<dyn SegmentFetcher>` across every session.
#[async_trait]
pub trait SegmentFetcher: Send + Sync {
    async fn fetch_text(&self, url: &str, extra_headers: &[(String, String)]) -> Result<String>;
    async fn fetch_bytes(&self, url: &str, extra_headers: &[(String, String)]) -> Result<Bytes>;
}

fn build_header_map(headers: &[(String, String)]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let header_name = HeaderName::try_from(name.as_str())
            .map_err(|e| ConverterError::Configuration(format!("invalid header name {name}: {e}")))?;
        let header_value = HeaderValue::from_str(value)
            .map_err(|e| ConverterError::Configuration(format!("invalid header value for {name}: {e}")))?;
        map.insert(header_name, header_value);
    }
    Ok(map)
}

/// `reqwest`-backed fetcher with per-socket connect/read timeouts, bounded
/// retries on transient failures, and an optional bandwidth throttle shared
/// across every request it makes.
pub struct HttpFetcher {
    client: reqwest::Client,
    bw_limiter: Option<Arc<DirectRateLimiter>>,
}

impl HttpFetcher {
    /// Build a fetcher carrying the given extra headers on every request.
    pub fn new(headers: &[(String, String)]) -> Result<Self> {
        let default_headers = build_header_map(headers)?;
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(READ_TIMEOUT)
            .default_headers(default_headers)
            .build()
            .map_err(|e| ConverterError::Configuration(format!("building HTTP client: {e}")))?;
        Ok(HttpFetcher { client, bw_limiter: None })
    }

    /// Throttle all subsequent downloads to roughly `bytes_per_sec`,
    /// expressed internally in kB/s cells since `governor`'s quota is a u32.
    pub fn with_rate_limit(mut self, bytes_per_sec: u32) -> Self {
        let kb = NonZeroU32::new((bytes_per_sec / 1024).max(1)).unwrap();
        let quota = Quota::per_second(kb);
        self.bw_limiter = Some(Arc::new(RateLimiter::direct(quota)));
        self
    }

    async fn throttle(&self, len: usize) {
        if let Some(limiter) = &self.bw_limiter {
            let cells = NonZeroU32::new(((len / 1024) as u32).max(1)).unwrap();
            if limiter.until_n_ready(cells).await.is_err() {
                warn!("requested download chunk exceeds bandwidth limiter burst size");
            }
        }
    }

    async fn get_bytes(&self, url: &str, extra_headers: &[(String, String)]) -> Result<Bytes> {
        let extra = build_header_map(extra_headers)?;
        let fetch = || async {
            let resp = self
                .client
                .get(url)
                .headers(extra.clone())
                .send()
                .await
                .map_err(|e| network_error("requesting", e))?;
            let resp = resp.error_for_status().map_err(|e| network_error("response status", e))?;
            resp.bytes().await.map_err(|e| network_error("reading body", e))
        };

        let bytes = fetch
            .retry(ExponentialBuilder::default().with_max_times(MAX_RETRIES))
            .when(is_transient)
            .notify(|err, dur| warn!("retrying {url} after {dur:?}: {err}"))
            .await?;

        self.throttle(bytes.len()).await;
        debug!(url, bytes = bytes.len(), "fetched");
        Ok(bytes)
    }
}

#[async_trait]
impl SegmentFetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str, extra_headers: &[(String, String)]) -> Result<String> {
        let bytes = self.get_bytes(url, extra_headers).await?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| ConverterError::Parsing(format!("non-UTF8 response from {url}: {e}")))
    }

    async fn fetch_bytes(&self, url: &str, extra_headers: &[(String, String)]) -> Result<Bytes> {
        self.get_bytes(url, extra_headers).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification_matches_timeout_only() {
        assert!(is_transient(&ConverterError::NetworkTimeout("x".into())));
        assert!(!is_transient(&ConverterError::Network("x".into())));
        assert!(!is_transient(&ConverterError::Parsing("x".into())));
    }

    #[tokio::test]
    async fn invalid_header_name_is_rejected() {
        let result = HttpFetcher::new(&[("Bad Header Name".to_string(), "v".to_string())]);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn valid_headers_build_a_client() {
        let result = HttpFetcher::new(&[("X-Test".to_string(), "1".to_string())]);
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn invalid_extra_header_is_rejected_per_request() {
        let fetcher = HttpFetcher::new(&[]).unwrap();
        let result = fetcher
            .get_bytes("http://127.0.0.1:0/unreachable", &[("Bad Header".to_string(), "v".to_string())])
            .await;
        assert!(result.is_err());
    }
}
