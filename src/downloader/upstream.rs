//! HTTP seam to the upstream download and product-metadata endpoints.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::config::Credentials;

#[derive(Debug, Error)]
pub enum UpstreamError {
    /// 404/410: the product is no longer retrievable. Terminal.
    #[error("product gone upstream (status {0})")]
    Gone(u16),
    /// 401/403: credential or configuration problem. Fatal, not retried.
    #[error("upstream rejected credentials (status {0})")]
    Unauthorized(u16),
    /// Any other non-success status. Transient.
    #[error("upstream returned status {0}")]
    Status(u16),
    /// Connection errors, timeouts, resets, partial bodies. Transient.
    #[error("upstream request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// Unexpected metadata shape. Transient (upstream may repair it).
    #[error("unexpected upstream response: {0}")]
    Decode(String),
}

impl UpstreamError {
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            UpstreamError::Status(_) | UpstreamError::Network(_) | UpstreamError::Decode(_)
        )
    }
}

/// Upstream operations the download worker depends on.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Fetch the authoritative MD5 (hex) for a product.
    async fn fetch_checksum(&self, image_id: &str) -> Result<String, UpstreamError>;

    /// Fetch the product archive body.
    async fn download(&self, download_url: &str) -> Result<Bytes, UpstreamError>;
}

/// Alternate download host used when IntHub2 routing is enabled.
#[derive(Debug, Clone)]
pub struct Inthub2Routing {
    pub url: String,
    pub credentials: Credentials,
}

/// HTTP client for the upstream catalog metadata and zipper endpoints.
pub struct HttpUpstreamClient {
    client: reqwest::Client,
    checksum_url: String,
    credentials: Credentials,
    inthub2: Option<Inthub2Routing>,
}

impl HttpUpstreamClient {
    /// # Arguments
    /// * `checksum_url` - Base URL of the product metadata API
    /// * `credentials` - Default (SciHub) download credentials
    /// * `inthub2` - When set, download URLs are rewritten to this host and
    ///   its credentials are used instead
    /// * `timeout_secs` - Per-request timeout in seconds
    pub fn new(
        checksum_url: String,
        credentials: Credentials,
        inthub2: Option<Inthub2Routing>,
        timeout_secs: u64,
    ) -> Result<Self, UpstreamError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            checksum_url,
            credentials,
            inthub2,
        })
    }

    fn classify(status: StatusCode) -> Option<UpstreamError> {
        if status.is_success() {
            return None;
        }
        Some(match status.as_u16() {
            404 | 410 => UpstreamError::Gone(status.as_u16()),
            401 | 403 => UpstreamError::Unauthorized(status.as_u16()),
            code => UpstreamError::Status(code),
        })
    }

    /// The URL and credentials to download with, after optional IntHub2
    /// rewriting.
    fn routed(&self, download_url: &str) -> Result<(String, &Credentials), UpstreamError> {
        let Some(inthub2) = &self.inthub2 else {
            return Ok((download_url.to_string(), &self.credentials));
        };

        let mut url = Url::parse(download_url)
            .map_err(|e| UpstreamError::Decode(format!("bad download url: {e}")))?;
        let inthub2_url = Url::parse(&inthub2.url)
            .map_err(|e| UpstreamError::Decode(format!("bad inthub2 url: {e}")))?;
        url.set_host(inthub2_url.host_str())
            .map_err(|e| UpstreamError::Decode(format!("bad inthub2 host: {e}")))?;

        Ok((url.to_string(), &inthub2.credentials))
    }
}

#[async_trait]
impl UpstreamApi for HttpUpstreamClient {
    async fn fetch_checksum(&self, image_id: &str) -> Result<String, UpstreamError> {
        let url = format!("{}/odata/v1/Products({})", self.checksum_url, image_id);
        let response = self.client.get(&url).send().await?;

        if let Some(err) = Self::classify(response.status()) {
            return Err(err);
        }

        let body: ChecksumResponse = response
            .json()
            .await
            .map_err(|e| UpstreamError::Decode(format!("checksum response: {e}")))?;

        body.value
            .first()
            .and_then(|product| {
                product
                    .checksum
                    .iter()
                    .find(|entry| entry.algorithm == "MD5")
            })
            .map(|entry| entry.value.clone())
            .ok_or_else(|| {
                UpstreamError::Decode(format!("no MD5 checksum for product {}", image_id))
            })
    }

    async fn download(&self, download_url: &str) -> Result<Bytes, UpstreamError> {
        let (url, credentials) = self.routed(download_url)?;
        debug!("Downloading {}", url);

        let response = self
            .client
            .get(&url)
            .basic_auth(&credentials.username, Some(&credentials.password))
            .send()
            .await?;

        if let Some(err) = Self::classify(response.status()) {
            return Err(err);
        }

        // A body cut short surfaces as a reqwest error here, i.e. transient
        Ok(response.bytes().await?)
    }
}

#[derive(Debug, Deserialize)]
struct ChecksumResponse {
    #[serde(default)]
    value: Vec<ChecksumProduct>,
}

#[derive(Debug, Deserialize)]
struct ChecksumProduct {
    #[serde(rename = "Checksum", default)]
    checksum: Vec<ChecksumEntry>,
}

#[derive(Debug, Deserialize)]
struct ChecksumEntry {
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "Algorithm")]
    algorithm: String,
}
