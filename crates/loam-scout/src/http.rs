//! HTTP transport behind the static-HTML browser. One client per browser
//! context; transient failures are retried with exponential pauses and
//! response bodies are capped.

use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    /// Pause before the `retry`-th retry (1-based): `base * 2^(retry-1)`, capped.
    pub fn pause(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base.saturating_mul(factor).min(self.cap)
    }
}

#[derive(Debug, Clone)]
pub struct FetchSettings {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_body_bytes: usize,
    pub retry: RetryPolicy,
}

impl Default for FetchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            max_body_bytes: 8 * 1024 * 1024,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedPage {
    /// Final URL after redirects.
    pub url: String,
    pub status: u16,
    pub html: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("`{url}` is not an http(s) url")]
    UnsupportedUrl { url: String },
    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },
    #[error("{url} answered {status}")]
    Status {
        url: String,
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("{url} sent more than {limit} bytes")]
    TooLarge { url: String, limit: usize },
}

impl FetchError {
    /// Failures worth another attempt: throttling, server errors, timeouts
    /// and refused connections.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { source, .. } => source.is_timeout() || source.is_connect(),
            Self::Status { status, .. } => matches!(*status, 408 | 429 | 500..=599),
            Self::UnsupportedUrl { .. } | Self::TooLarge { .. } => false,
        }
    }

    fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PageFetcher {
    client: reqwest::Client,
    settings: FetchSettings,
}

impl PageFetcher {
    pub fn new(settings: FetchSettings) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(settings.timeout);
        if let Some(user_agent) = &settings.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client, settings })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        let parsed = Url::parse(url)
            .ok()
            .filter(|u| matches!(u.scheme(), "http" | "https"))
            .ok_or_else(|| FetchError::UnsupportedUrl { url: url.to_string() })?;
        let host = parsed.host_str().unwrap_or_default().to_string();

        async {
            let policy = self.settings.retry;
            let mut retry = 0;
            loop {
                match self.fetch_once(&parsed).await {
                    Err(err) if err.is_transient() && retry < policy.attempts => {
                        retry += 1;
                        let pause = err
                            .retry_after()
                            .unwrap_or_else(|| policy.pause(retry))
                            .min(policy.cap);
                        debug!(error = %err, retry, ?pause, "retrying fetch");
                        tokio::time::sleep(pause).await;
                    }
                    outcome => return outcome,
                }
            }
        }
        .instrument(info_span!("http_fetch", %host, url))
        .await
    }

    async fn fetch_once(&self, url: &Url) -> Result<FetchedPage, FetchError> {
        let transport = |source: reqwest::Error| FetchError::Transport {
            url: url.to_string(),
            source,
        };
        let mut response = self.client.get(url.clone()).send().await.map_err(transport)?;
        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::Status {
                retry_after: retry_after(response.headers()),
                url: final_url,
                status: status.as_u16(),
            });
        }

        let limit = self.settings.max_body_bytes;
        let too_large = || FetchError::TooLarge {
            url: final_url.clone(),
            limit,
        };
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(too_large());
        }
        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(transport)? {
            if body.len() + chunk.len() > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }

        Ok(FetchedPage {
            html: String::from_utf8_lossy(&body).into_owned(),
            url: final_url,
            status: status.as_u16(),
        })
    }
}

/// Only the delta-seconds form; HTTP dates fall back to the policy pause.
fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn response(status_line: &str, extra_headers: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status_line}\r\n{extra_headers}Content-Type: text/html\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    /// Answer one connection per canned response, in order.
    async fn serve(responses: Vec<String>) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        tokio::spawn(async move {
            for canned in responses {
                let (mut stream, _) = listener.accept().await.unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = stream.read(&mut buf).await.unwrap();
                    if n == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..n]);
                }
                counter.fetch_add(1, Ordering::SeqCst);
                stream.write_all(canned.as_bytes()).await.unwrap();
                stream.shutdown().await.unwrap();
            }
        });
        (base, hits)
    }

    #[tokio::test]
    async fn unavailable_page_is_retried_until_it_loads() {
        let (base, hits) = serve(vec![
            response("503 Service Unavailable", "Retry-After: 0\r\n", ""),
            response("200 OK", "", "<p>hello</p>"),
        ])
        .await;
        let fetcher = PageFetcher::new(FetchSettings::default()).unwrap();

        let page = fetcher.fetch(&format!("{base}/share/1")).await.unwrap();
        assert_eq!(page.status, 200);
        assert_eq!(page.html, "<p>hello</p>");
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn missing_page_fails_without_retrying() {
        let (base, hits) = serve(vec![response("404 Not Found", "", "gone")]).await;
        let fetcher = PageFetcher::new(FetchSettings::default()).unwrap();

        let err = fetcher.fetch(&format!("{base}/missing")).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }), "{err}");
        assert!(!err.is_transient());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn oversized_body_is_refused() {
        let (base, _) = serve(vec![response("200 OK", "", "<p>far too long</p>")]).await;
        let fetcher = PageFetcher::new(FetchSettings {
            max_body_bytes: 8,
            ..FetchSettings::default()
        })
        .unwrap();

        let err = fetcher.fetch(&base).await.unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 8, .. }), "{err}");
    }

    #[tokio::test]
    async fn non_http_urls_are_rejected_before_any_request() {
        let fetcher = PageFetcher::new(FetchSettings::default()).unwrap();
        for url in ["ftp://example.com/file", "not a url", "file:///etc/hosts"] {
            let err = fetcher.fetch(url).await.unwrap_err();
            assert!(matches!(err, FetchError::UnsupportedUrl { .. }), "{url}: {err}");
        }
    }

    #[test]
    fn pauses_double_and_stop_at_the_cap() {
        let policy = RetryPolicy {
            attempts: 5,
            base: Duration::from_millis(100),
            cap: Duration::from_millis(350),
        };
        assert_eq!(policy.pause(1), Duration::from_millis(100));
        assert_eq!(policy.pause(2), Duration::from_millis(200));
        assert_eq!(policy.pause(3), Duration::from_millis(350));
        assert_eq!(policy.pause(40), Duration::from_millis(350));
    }

    #[test]
    fn throttling_and_server_errors_are_transient() {
        let status = |status| FetchError::Status {
            url: "https://chatgpt.com/share/1".into(),
            status,
            retry_after: None,
        };
        assert!(status(429).is_transient());
        assert!(status(502).is_transient());
        assert!(status(408).is_transient());
        assert!(!status(403).is_transient());
        assert!(!status(404).is_transient());
        assert!(!FetchError::TooLarge {
            url: String::new(),
            limit: 1
        }
        .is_transient());
    }

    #[test]
    fn retry_after_reads_delta_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, " 7 ".parse().unwrap());
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, "Wed, 21 Oct 2026 07:28:00 GMT".parse().unwrap());
        assert_eq!(retry_after(&headers), None);
    }
}
