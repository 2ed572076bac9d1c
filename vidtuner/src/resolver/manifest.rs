use std::time::Duration;

use futures::future::BoxFuture;
use reqwest::Url;
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::ResolverConfig;

#[derive(Debug, Clone, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Transport(String),
    #[error("HTTP {0}")]
    Status(u16),
    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/**
    Fetches manifest bodies as text.
*/
pub trait ManifestFetcher: Send + Sync {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<String, FetchError>>;
}

/**
    Plain HTTP GET manifest fetcher.
*/
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ManifestFetcher for HttpFetcher {
    fn fetch<'a>(&'a self, url: &'a Url) -> BoxFuture<'a, Result<String, FetchError>> {
        Box::pin(async move {
            let response = self
                .client
                .get(url.clone())
                .send()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))?;

            if !response.status().is_success() {
                return Err(FetchError::Status(response.status().as_u16()));
            }

            response
                .text()
                .await
                .map_err(|e| FetchError::Transport(e.to_string()))
        })
    }
}

/**
    Bounded retry with escalating delays between attempts.
*/
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: usize,
    /// Delay after the n-th failed attempt; the last delay repeats if there are fewer delays than attempts
    pub delays: Vec<Duration>,
    /// Per-attempt timeout
    pub timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ResolverConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            delays: config.retry_delays(),
            timeout: config.fetch_timeout(),
        }
    }

    fn delay_after(&self, attempt: usize) -> Duration {
        self.delays
            .get(attempt.saturating_sub(1))
            .or(self.delays.last())
            .copied()
            .unwrap_or_default()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ResolverConfig::default())
    }
}

/**
    Fetch `url`, retrying any failure until the attempt budget is spent.

    Only the last attempt's error is returned.
*/
pub async fn fetch_with_retry(
    fetcher: &dyn ManifestFetcher,
    url: &Url,
    policy: &RetryPolicy,
) -> Result<String, FetchError> {
    let mut attempt = 0;

    loop {
        attempt += 1;

        let result = match tokio::time::timeout(policy.timeout, fetcher.fetch(url)).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout(policy.timeout)),
        };

        match result {
            Ok(body) => {
                debug!(%url, attempt, bytes = body.len(), "fetched manifest");
                return Ok(body);
            }
            Err(e) if attempt >= policy.attempts => return Err(e),
            Err(e) => {
                let delay = policy.delay_after(attempt);
                warn!(%url, attempt, ?delay, "manifest fetch failed, retrying: {e}");
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/**
    Parse a manifest body into fully qualified stream addresses.

    Lines starting with `#` and blank lines are skipped. Relative lines are
    resolved against the manifest's scheme, authority and first path
    directory. The result is reversed relative to manifest order, so the
    last listed variant comes first.
*/
pub fn parse_manifest(manifest_url: &Url, body: &str) -> Vec<Url> {
    let origin = origin(manifest_url);
    let base = base_prefix(manifest_url, &origin);

    let mut streams: Vec<Url> = body
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let qualified = if Url::parse(line).is_ok() {
                line.to_string()
            } else if line.starts_with('/') {
                format!("{origin}{line}")
            } else {
                format!("{base}{line}")
            };

            match Url::parse(&qualified) {
                Ok(url) => Some(url),
                Err(e) => {
                    warn!(line, "skipping invalid manifest entry: {e}");
                    None
                }
            }
        })
        .collect();

    streams.reverse();
    streams
}

// scheme://[user@]host[:port]
fn origin(url: &Url) -> String {
    let mut origin = format!("{}://", url.scheme());
    if !url.username().is_empty() {
        origin.push_str(url.username());
        if let Some(password) = url.password() {
            origin.push(':');
            origin.push_str(password);
        }
        origin.push('@');
    }
    origin.push_str(url.host_str().unwrap_or_default());
    if let Some(port) = url.port() {
        origin.push_str(&format!(":{port}"));
    }
    origin
}

// origin + "/" + first directory of the path, if the path has one
fn base_prefix(url: &Url, origin: &str) -> String {
    let segments: Vec<&str> = url
        .path_segments()
        .map(|segments| segments.collect())
        .unwrap_or_default();

    match segments.as_slice() {
        [first, _, ..] => format!("{origin}/{first}/"),
        _ => format!("{origin}/"),
    }
}
