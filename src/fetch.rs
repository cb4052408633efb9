use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use thiserror::Error;
use url::Url;

use crate::quota::{QuotaSignal, QuotaTracker};

/// Errors a single fetch can produce. None of these are retried here;
/// retry policy belongs to the caller, and a capture session performs a
/// single best-effort pass anyway.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL is not https. A hard policy, not a transport failure: the
    /// mirror must not be seeded with unencrypted or spoofable content.
    #[error("scheme not allowed for {url}: only https is permitted")]
    SchemeNotAllowed { url: String },

    /// Network, TLS, or HTTP status failure.
    #[error("transport failure for {url}: {reason}")]
    Transport { url: String, reason: String },

    /// The payload could not be decoded as the expected text type.
    #[error("response body for {url} is not valid utf-8 text")]
    Decode { url: String },

    /// The session's download budget is exhausted; no request was made.
    #[error("download quota exhausted")]
    QuotaExceeded,
}

/// Raw response from the transport collaborator. Status is passed through
/// unjudged; the fetcher decides what counts as a failure.
#[derive(Debug, Clone)]
pub struct TransportResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

/// The HTTPS GET collaborator the fetcher adapts over.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Transport: Send + Sync {
    async fn get(&self, url: &Url) -> Result<TransportResponse>;
}

/// Production transport backed by reqwest.
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(user_agent: &str, timeout: Duration) -> Result<Self> {
        let client = ClientBuilder::new()
            .use_rustls_tls()
            .user_agent(user_agent.to_string())
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn get(&self, url: &Url) -> Result<TransportResponse> {
        let response = self.client.get(url.as_str()).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?.to_vec();
        Ok(TransportResponse { status, body })
    }
}

/// Performs one HTTPS GET with scheme enforcement and quota accounting.
pub struct Fetcher {
    transport: Arc<dyn Transport>,
    quota: Arc<QuotaTracker>,
}

impl Fetcher {
    pub fn new(transport: Arc<dyn Transport>, quota: Arc<QuotaTracker>) -> Self {
        Self { transport, quota }
    }

    pub fn quota(&self) -> &QuotaTracker {
        &self.quota
    }

    /// Fetches `url` and returns the raw body bytes.
    ///
    /// The byte count is reported to the quota tracker before returning. A
    /// transfer already in flight when the hard cap is crossed is still
    /// returned once; every subsequent call is refused with `QuotaExceeded`
    /// until the tracker is reset.
    pub async fn fetch(&self, url: &Url) -> Result<Vec<u8>, FetchError> {
        if url.scheme() != "https" {
            return Err(FetchError::SchemeNotAllowed {
                url: url.to_string(),
            });
        }

        if self.quota.is_exhausted() {
            return Err(FetchError::QuotaExceeded);
        }

        tracing::debug!(url = %url, "fetching");
        let response = self
            .transport
            .get(url)
            .await
            .map_err(|e| FetchError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            })?;

        if !(200..300).contains(&response.status) {
            return Err(FetchError::Transport {
                url: url.to_string(),
                reason: format!("HTTP {}", response.status),
            });
        }

        let signal = self.quota.report(response.body.len() as u64);
        if signal == QuotaSignal::Exceeded {
            tracing::warn!(url = %url, "transfer completed past the hard cap; further fetches will be refused");
        }

        Ok(response.body)
    }

    /// Fetches `url` and decodes the body as UTF-8 text.
    pub async fn fetch_text(&self, url: &Url) -> Result<String, FetchError> {
        let bytes = self.fetch(url).await?;
        String::from_utf8(bytes).map_err(|_| FetchError::Decode {
            url: url.to_string(),
        })
    }
}
