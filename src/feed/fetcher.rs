//! Feed fetch client.
//!
//! One bounded HTTP GET per call. Retries are left to the next scheduler
//! tick.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;

use crate::config::FetchConfig;
use crate::{Result, RssaggError};

/// Retrieves raw feed bytes for a URL.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    /// Fetch the body at `url`.
    ///
    /// Fails with [`RssaggError::Transport`] on network failure, timeout,
    /// non-2xx status or an oversized body.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// HTTP fetcher sharing one connection pool across pipelines.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: Client,
    max_feed_size: u64,
}

impl HttpFetcher {
    /// Create a fetcher from configuration.
    pub fn new(config: &FetchConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.as_str())
            .build()
            .map_err(|e| RssaggError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_feed_size: config.max_feed_size_bytes,
        })
    }

    /// Create a fetcher with a custom total timeout and default limits.
    pub fn with_timeout(timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RssaggError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            max_feed_size: FetchConfig::default().max_feed_size_bytes,
        })
    }

    fn too_large(&self, size: u64) -> RssaggError {
        RssaggError::Transport(format!(
            "feed too large: {} bytes (max {} bytes)",
            size, self.max_feed_size
        ))
    }
}

#[async_trait]
impl FeedFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let mut response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                RssaggError::Transport(format!("request timed out: {}", e))
            } else {
                RssaggError::Transport(format!("failed to fetch feed: {}", e))
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(RssaggError::Transport(format!("HTTP error: {}", status)));
        }

        if let Some(content_length) = response.content_length() {
            if content_length > self.max_feed_size {
                return Err(self.too_large(content_length));
            }
        }

        // Chunked bodies carry no length up front; stop reading at the limit.
        let mut body = Vec::new();
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|e| RssaggError::Transport(format!("failed to read response: {}", e)))?
        {
            let received = (body.len() + chunk.len()) as u64;
            if received > self.max_feed_size {
                return Err(self.too_large(received));
            }
            body.extend_from_slice(&chunk);
        }

        Ok(body)
    }
}

/// Validate a source URL at registration time.
///
/// Only absolute `http`/`https` URLs with a host are accepted.
pub fn validate_url(url: &str) -> Result<()> {
    let parsed =
        url::Url::parse(url).map_err(|e| RssaggError::Validation(format!("invalid URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(RssaggError::Validation(format!(
                "unsupported URL scheme: {}",
                scheme
            )));
        }
    }

    if parsed.host().is_none() {
        return Err(RssaggError::Validation("URL has no host".to_string()));
    }

    Ok(())
}
