//! Rate-limited HTTP fetching with exponential backoff.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info_span, warn, Instrument};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    /// Overrides the client-wide timeout for this request.
    pub timeout: Option<Duration>,
}

impl FetchRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            timeout: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after {attempts} attempts: {source}")]
    Request {
        attempts: usize,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url} after {attempts} attempts")]
    HttpStatus {
        status: u16,
        url: String,
        attempts: usize,
    },
    #[error("invalid request for {url}: {reason}")]
    InvalidRequest { url: String, reason: String },
}

/// Anything that can turn a [`FetchRequest`] into a response body.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError>;
}

/// Enforces a minimum gap between consecutive outbound requests.
///
/// The lock is held across the sleep, so concurrent callers queue up behind
/// each other instead of all waking at once.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_request: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    pub async fn wait(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let ready_at = previous + self.min_interval;
            if ready_at > Instant::now() {
                tokio::time::sleep_until(ready_at).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound (exclusive) of the random extra delay added to each wait.
    pub jitter: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            jitter: Duration::from_millis(250),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    pub fn jittered_delay(&self, attempt_index: usize) -> Duration {
        let jitter_ms = self.jitter.as_millis() as u64;
        let extra = if jitter_ms == 0 {
            0
        } else {
            (Uuid::new_v4().as_u128() % jitter_ms as u128) as u64
        };
        self.delay_for_attempt(attempt_index) + Duration::from_millis(extra)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub min_request_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
            min_request_interval: Duration::from_millis(1500),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    limiter: Arc<RateLimiter>,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let limiter = Arc::new(RateLimiter::new(config.min_request_interval));
        Self::with_rate_limiter(config, limiter)
    }

    /// Builds a fetcher that shares `limiter` with other fetchers of the same session.
    pub fn with_rate_limiter(config: HttpClientConfig, limiter: Arc<RateLimiter>) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            limiter,
            backoff: config.backoff,
        })
    }

    pub fn rate_limiter(&self) -> Arc<RateLimiter> {
        Arc::clone(&self.limiter)
    }

    async fn fetch_with_retries(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0usize;
        loop {
            self.limiter.wait().await;

            let mut builder = self.client.get(&request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name.as_str(), value.as_str());
            }
            if let Some(timeout) = request.timeout {
                builder = builder.timeout(timeout);
            }

            let retry_reason = match builder.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();
                    if status.is_success() {
                        match resp.bytes().await {
                            Ok(body) => {
                                debug!(status = status.as_u16(), bytes = body.len(), "fetched");
                                return Ok(FetchedResponse {
                                    status: status.as_u16(),
                                    final_url,
                                    body: body.to_vec(),
                                });
                            }
                            Err(err) if attempt >= self.backoff.max_retries => {
                                return Err(FetchError::Request {
                                    attempts: attempt + 1,
                                    source: err,
                                });
                            }
                            Err(err) => err.to_string(),
                        }
                    } else if attempt >= self.backoff.max_retries {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                            attempts: attempt + 1,
                        });
                    } else {
                        status_reason(status)
                    }
                }
                Err(err) if err.is_builder() => {
                    return Err(FetchError::InvalidRequest {
                        url: request.url.clone(),
                        reason: err.to_string(),
                    });
                }
                Err(err) if attempt >= self.backoff.max_retries => {
                    return Err(FetchError::Request {
                        attempts: attempt + 1,
                        source: err,
                    });
                }
                Err(err) => err.to_string(),
            };

            let delay = self.backoff.jittered_delay(attempt);
            warn!(attempt, ?delay, reason = %retry_reason, "retrying fetch");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn status_reason(status: StatusCode) -> String {
    format!("http status {}", status.as_u16())
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url = %request.url);
        self.fetch_with_retries(request).instrument(span).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use axum::extract::State;
    use axum::http::StatusCode as ServerStatus;
    use axum::routing::get;
    use axum::Router;

    #[derive(Clone)]
    struct Board {
        hits: Arc<AtomicUsize>,
        failures_before_ok: usize,
    }

    async fn board(State(board): State<Board>) -> (ServerStatus, &'static str) {
        let hit = board.hits.fetch_add(1, Ordering::SeqCst);
        if hit < board.failures_before_ok {
            (ServerStatus::SERVICE_UNAVAILABLE, "busy")
        } else {
            (ServerStatus::OK, "<table><tr><td>Acme</td></tr></table>")
        }
    }

    /// Serves `/board`, failing with 503 for the first `failures_before_ok` hits.
    async fn spawn_board(failures_before_ok: usize) -> (String, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let app = Router::new().route("/board", get(board)).with_state(Board {
            hits: Arc::clone(&hits),
            failures_before_ok,
        });
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{addr}/board"), hits)
    }

    fn quick_fetcher(max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(5),
            user_agent: Some("ipo-storage-test".into()),
            min_request_interval: Duration::ZERO,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter: Duration::ZERO,
            },
        })
        .unwrap()
    }

    #[tokio::test]
    async fn server_errors_are_retried_until_success() {
        let (url, hits) = spawn_board(2).await;
        let response = quick_fetcher(3).fetch(&FetchRequest::get(&url)).await.unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(response.body, b"<table><tr><td>Acme</td></tr></table>".to_vec());
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_report_every_attempt() {
        let (url, hits) = spawn_board(usize::MAX).await;
        let err = quick_fetcher(2).fetch(&FetchRequest::get(&url)).await.unwrap_err();
        match err {
            FetchError::HttpStatus { status, attempts, .. } => {
                assert_eq!(status, 503);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unreachable_host_is_a_request_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = quick_fetcher(1)
            .fetch(&FetchRequest::get(format!("http://{addr}/board")))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Request { attempts: 2, .. }));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter: Duration::ZERO,
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
        assert_eq!(policy.jittered_delay(1), Duration::from_millis(200));
    }

    #[test]
    fn jitter_stays_below_its_bound() {
        let policy = BackoffPolicy {
            max_retries: 1,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter: Duration::from_millis(50),
        };
        for _ in 0..200 {
            let delay = policy.jittered_delay(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_spaces_consecutive_requests() {
        let limiter = RateLimiter::new(Duration::from_millis(100));
        let started = Instant::now();
        limiter.wait().await;
        limiter.wait().await;
        limiter.wait().await;
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[tokio::test(start_paused = true)]
    async fn limiter_is_shared_across_tasks() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_millis(50)));
        let started = Instant::now();
        let handles = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move { limiter.wait().await })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(started.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_does_not_wait() {
        let limiter = RateLimiter::new(Duration::from_secs(10));
        let started = Instant::now();
        limiter.wait().await;
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn request_builder_collects_headers() {
        let req = FetchRequest::get("https://example.test/ipo")
            .with_header("Accept", "text/html")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(req.headers, vec![("Accept".to_string(), "text/html".to_string())]);
        assert_eq!(req.timeout, Some(Duration::from_secs(5)));
    }
}
