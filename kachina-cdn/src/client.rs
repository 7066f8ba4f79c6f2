//! HTTP client for range downloads
//!
//! One shared client carries every download of an install run: connection
//! pool, keep-alive, retry with exponential backoff and jitter, and the
//! range-request plumbing the update engine multiplexes over.

use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::{CONTENT_RANGE, CONTENT_TYPE, RANGE, RETRY_AFTER};
use reqwest::{Client, Response, StatusCode};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};
use crate::multipart::{boundary_from_content_type, parse_byteranges};

/// Default maximum retries per request
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default initial backoff in milliseconds
const DEFAULT_INITIAL_BACKOFF_MS: u64 = 100;

/// Default maximum backoff in milliseconds
const DEFAULT_MAX_BACKOFF_MS: u64 = 10_000;

/// Default backoff multiplier
const DEFAULT_BACKOFF_MULTIPLIER: f64 = 2.0;

/// Default jitter factor (0.0 to 1.0)
const DEFAULT_JITTER_FACTOR: f64 = 0.1;

/// Default connection/header timeout
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// Default whole-body timeout
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 180;

/// Throughput floor for the stall detector
pub const STALL_BYTES_PER_SEC: u64 = 4096;

/// Window the throughput must stay under the floor to count as stalled
pub const STALL_WINDOW_SECS: u64 = 30;

/// HTTP client for range downloads
#[derive(Debug, Clone)]
pub struct HttpClient {
    /// Underlying client with connection pooling
    client: Client,
    /// Maximum number of retries
    max_retries: u32,
    /// Initial backoff duration in milliseconds
    initial_backoff_ms: u64,
    /// Maximum backoff duration in milliseconds
    max_backoff_ms: u64,
    /// Backoff multiplier
    backoff_multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    jitter_factor: f64,
    /// Custom user agent string
    user_agent: Option<String>,
}

impl HttpClient {
    /// Create a client with default configuration
    pub fn new() -> Result<Self> {
        Self::builder().build()
    }

    /// Create a builder for configuring the client
    pub fn builder() -> HttpClientBuilder {
        HttpClientBuilder::new()
    }

    /// Calculate backoff duration with exponential backoff and jitter
    pub fn calculate_backoff(&self, attempt: u32) -> Duration {
        let base = self.initial_backoff_ms as f64 * self.backoff_multiplier.powi(attempt as i32);
        let capped = base.min(self.max_backoff_ms as f64);

        let jitter_range = capped * self.jitter_factor;
        let jitter = rand::random::<f64>() * 2.0 * jitter_range - jitter_range;
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }

    /// Execute a GET with retry, optionally carrying a Range header
    async fn execute_with_retry(&self, url: &str, range: Option<&str>) -> Result<Response> {
        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = self.calculate_backoff(attempt - 1);
                debug!("retry attempt {attempt} after {backoff:?} backoff");
                sleep(backoff).await;
            }

            trace!("GET {url} (attempt {}, range {range:?})", attempt + 1);

            let mut request = self.client.get(url);
            if let Some(range) = range {
                request = request.header(RANGE, range);
            }
            if let Some(ref user_agent) = self.user_agent {
                request = request.header("User-Agent", user_agent);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    trace!("response status: {status}");

                    if status.is_success() {
                        return Ok(response);
                    }

                    if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.max_retries {
                        let retry_after = response
                            .headers()
                            .get(RETRY_AFTER)
                            .and_then(|v| v.to_str().ok())
                            .and_then(|s| s.parse::<u64>().ok())
                            .unwrap_or(60);
                        warn!("rate limited (attempt {}): retry after {retry_after}s", attempt + 1);
                        last_error = Some(Error::RateLimited {
                            retry_after_secs: retry_after,
                        });
                        continue;
                    }

                    if status.is_server_error() && attempt < self.max_retries {
                        warn!("server error {status} (attempt {}), will retry", attempt + 1);
                        last_error = Some(Error::invalid_response(format!("server error {status}")));
                        continue;
                    }

                    // 416 means our range math raced a republished file;
                    // worth one more try. Other 4xx are terminal.
                    if status == StatusCode::RANGE_NOT_SATISFIABLE && attempt < self.max_retries {
                        warn!("range not satisfiable (attempt {}), will retry", attempt + 1);
                        last_error = Some(Error::RangeNotSupported {
                            status: status.as_u16(),
                        });
                        continue;
                    }

                    if status == StatusCode::NOT_FOUND {
                        return Err(Error::NotFound {
                            url: url.to_string(),
                        });
                    }

                    return Err(Error::invalid_response(format!("HTTP status {status}")));
                }
                Err(e) => {
                    let retriable = e.is_connect() || e.is_timeout() || e.is_request();
                    if retriable && attempt < self.max_retries {
                        warn!("request failed (attempt {}): {e}, will retry", attempt + 1);
                        last_error = Some(Error::Http(e));
                    } else {
                        debug!("request failed (attempt {}): {e}, not retrying", attempt + 1);
                        return Err(Error::Http(e));
                    }
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::invalid_response("all retry attempts failed")))
    }

    /// Plain GET without a range
    pub async fn get(&self, url: &str) -> Result<Response> {
        self.execute_with_retry(url, None).await
    }

    /// POST a JSON body, without retry (the request is not idempotent)
    pub async fn post_json(&self, url: &str, body: &serde_json::Value) -> Result<Response> {
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .body(body.to_string())
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Error::invalid_response(format!(
                "HTTP status {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// DELETE a resource, without retry
    pub async fn delete(&self, url: &str) -> Result<Response> {
        let response = self.client.delete(url).send().await?;
        if !response.status().is_success() {
            return Err(Error::invalid_response(format!(
                "HTTP status {}",
                response.status()
            )));
        }
        Ok(response)
    }

    /// Fetch a byte range, returning the validated body
    pub async fn get_range(&self, url: &str, offset: u64, length: u64) -> Result<Bytes> {
        let response = self.get_range_response(url, offset, length).await?;
        let body = response.bytes().await?;
        if body.len() as u64 != length {
            return Err(Error::IncompleteRange {
                expected: length,
                received: body.len() as u64,
            });
        }
        Ok(body)
    }

    /// Fetch a byte range, returning the response for streaming
    ///
    /// The response has been validated to be `206 Partial Content` with a
    /// matching `Content-Range`; the caller drives `bytes_stream()`.
    pub async fn get_range_response(
        &self,
        url: &str,
        offset: u64,
        length: u64,
    ) -> Result<Response> {
        let range = format!("bytes={}-{}", offset, offset + length - 1);
        let response = self.execute_with_retry(url, Some(&range)).await?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::RangeNotSupported {
                status: response.status().as_u16(),
            });
        }
        if let Some(header) = response.headers().get(CONTENT_RANGE) {
            let value = header.to_str().unwrap_or_default().to_string();
            if parse_content_range(&value)
                .is_none_or(|(start, end, _)| start != offset || end + 1 != offset + length)
            {
                return Err(Error::InvalidContentRange { header: value });
            }
        }
        Ok(response)
    }

    /// Probe a range that may overrun the file, learning the total size
    ///
    /// Servers clamp `bytes=0-255` on a shorter file to what exists; this
    /// variant accepts the clamped body and returns it together with the
    /// total size announced by `Content-Range`.
    pub async fn get_range_with_total(
        &self,
        url: &str,
        offset: u64,
        max_length: u64,
    ) -> Result<(Bytes, u64)> {
        let range = format!("bytes={}-{}", offset, offset + max_length - 1);
        let response = self.execute_with_retry(url, Some(&range)).await?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::RangeNotSupported {
                status: response.status().as_u16(),
            });
        }
        let header = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::invalid_response("range response without Content-Range"))?;
        let (start, _, total) = parse_content_range(&header)
            .ok_or_else(|| Error::InvalidContentRange { header })?;
        if start != offset {
            return Err(Error::invalid_response("range response starts at wrong offset"));
        }

        let body = response.bytes().await?;
        Ok((body, total))
    }

    /// Fetch the last `length` bytes via a suffix range
    ///
    /// Returns the tail bytes and the total file size announced by
    /// `Content-Range`.
    pub async fn get_suffix(&self, url: &str, length: u64) -> Result<(Bytes, u64)> {
        let range = format!("bytes=-{length}");
        let response = self.execute_with_retry(url, Some(&range)).await?;

        if response.status() != StatusCode::PARTIAL_CONTENT {
            return Err(Error::RangeNotSupported {
                status: response.status().as_u16(),
            });
        }
        let header = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::invalid_response("suffix range without Content-Range"))?;
        let (_, _, total) = parse_content_range(&header)
            .ok_or_else(|| Error::InvalidContentRange { header })?;

        let body = response.bytes().await?;
        Ok((body, total))
    }

    /// Fetch several ranges in one request when the server cooperates
    ///
    /// Issues a multi-range request and parses a `multipart/byteranges`
    /// body; a server answering with a plain `206` or `200` instead gets
    /// per-range single requests as fallback. Results come back in the
    /// order of `ranges`.
    pub async fn get_ranges(&self, url: &str, ranges: &[(u64, u64)]) -> Result<Vec<Bytes>> {
        if ranges.is_empty() {
            return Ok(Vec::new());
        }
        if ranges.len() == 1 {
            let (offset, length) = ranges[0];
            return Ok(vec![self.get_range(url, offset, length).await?]);
        }

        let spec = ranges
            .iter()
            .map(|(offset, length)| format!("{}-{}", offset, offset + length - 1))
            .collect::<Vec<_>>()
            .join(",");
        let response = self
            .execute_with_retry(url, Some(&format!("bytes={spec}")))
            .await?;

        let multipart_boundary = (response.status() == StatusCode::PARTIAL_CONTENT)
            .then(|| {
                response
                    .headers()
                    .get(CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .and_then(boundary_from_content_type)
            })
            .flatten();

        match multipart_boundary {
            Some(boundary) => {
                let body = response.bytes().await?;
                let parts = parse_byteranges(&body, &boundary)?;
                ranges
                    .iter()
                    .map(|(offset, length)| {
                        parts
                            .iter()
                            .find(|(part_offset, data)| {
                                *part_offset == *offset && data.len() as u64 == *length
                            })
                            .map(|(_, data)| Bytes::copy_from_slice(data))
                            .ok_or_else(|| {
                                Error::invalid_multipart(format!(
                                    "missing part for range {offset}+{length}"
                                ))
                            })
                    })
                    .collect()
            }
            None => {
                debug!("multipart not supported, falling back to single range requests");
                let mut out = Vec::with_capacity(ranges.len());
                for (offset, length) in ranges {
                    out.push(self.get_range(url, *offset, *length).await?);
                }
                Ok(out)
            }
        }
    }
}

/// Parse `bytes START-END/TOTAL`; returns `(start, end, total)`
pub fn parse_content_range(value: &str) -> Option<(u64, u64, u64)> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some((
        start.parse().ok()?,
        end.parse().ok()?,
        total.parse().ok()?,
    ))
}

/// Tracks per-stream throughput to surface sustained stalls
///
/// The pipeline calls [`StallGuard::note`] per received chunk; once the
/// moving window holds less than the floor for the whole window, the
/// guard reports the stream dead rather than letting it hang forever.
#[derive(Debug)]
pub struct StallGuard {
    window_start: Instant,
    bytes_in_window: u64,
}

impl StallGuard {
    /// Start tracking a fresh stream
    pub fn new() -> Self {
        Self {
            window_start: Instant::now(),
            bytes_in_window: 0,
        }
    }

    /// Record received bytes and check the stall condition
    pub fn note(&mut self, bytes: u64) -> Result<()> {
        self.bytes_in_window += bytes;
        let elapsed = self.window_start.elapsed();
        if elapsed.as_secs() >= STALL_WINDOW_SECS {
            let floor = STALL_BYTES_PER_SEC * elapsed.as_secs();
            if self.bytes_in_window < floor {
                return Err(Error::Stalled {
                    threshold_bytes_per_sec: STALL_BYTES_PER_SEC,
                    window_secs: STALL_WINDOW_SECS,
                });
            }
            self.window_start = Instant::now();
            self.bytes_in_window = 0;
        }
        Ok(())
    }
}

impl Default for StallGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for configuring the HTTP client
#[derive(Debug, Clone)]
pub struct HttpClientBuilder {
    connect_timeout_secs: u64,
    request_timeout_secs: u64,
    pool_max_idle_per_host: usize,
    max_retries: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
    backoff_multiplier: f64,
    jitter_factor: f64,
    user_agent: Option<String>,
}

impl HttpClientBuilder {
    /// Create a new builder with default values
    pub fn new() -> Self {
        Self {
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            pool_max_idle_per_host: 20,
            max_retries: DEFAULT_MAX_RETRIES,
            initial_backoff_ms: DEFAULT_INITIAL_BACKOFF_MS,
            max_backoff_ms: DEFAULT_MAX_BACKOFF_MS,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            jitter_factor: DEFAULT_JITTER_FACTOR,
            user_agent: None,
        }
    }

    /// Set connection timeout in seconds
    pub fn connect_timeout(mut self, secs: u64) -> Self {
        self.connect_timeout_secs = secs;
        self
    }

    /// Set whole-body timeout in seconds
    pub fn request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout_secs = secs;
        self
    }

    /// Set maximum idle connections per host
    pub fn pool_max_idle_per_host(mut self, max: usize) -> Self {
        self.pool_max_idle_per_host = max;
        self
    }

    /// Set maximum retries
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set initial backoff in milliseconds
    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    /// Set maximum backoff in milliseconds
    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    /// Set backoff multiplier
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Set jitter factor (0.0 to 1.0)
    pub fn jitter_factor(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Set a custom user agent string
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Build the client
    pub fn build(self) -> Result<HttpClient> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .timeout(Duration::from_secs(self.request_timeout_secs))
            .pool_max_idle_per_host(self.pool_max_idle_per_host)
            .build()?;

        Ok(HttpClient {
            client,
            max_retries: self.max_retries,
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
            backoff_multiplier: self.backoff_multiplier,
            jitter_factor: self.jitter_factor,
            user_agent: self.user_agent,
        })
    }
}

impl Default for HttpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}
