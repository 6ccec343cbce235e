//! Catalog search against the upstream OData products API.

mod client;

pub use client::HttpCatalogClient;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use thiserror::Error;

/// One product from a catalog page, carrying everything the downloader needs.
#[derive(Debug, Clone)]
pub struct SearchResult {
    pub image_id: String,
    pub filename: String,
    pub tile_id: String,
    pub size: i64,
    /// Upstream MD5 (hex) when the catalog carried one.
    pub checksum: Option<String>,
    pub begin_position: DateTime<Utc>,
    pub end_position: DateTime<Utc>,
    pub ingestion_date: DateTime<Utc>,
    pub download_url: String,
}

/// One page of search results plus the advertised total for the query.
#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub total: Option<i64>,
    pub results: Vec<SearchResult>,
}

#[derive(Debug, Error)]
pub enum SearchError {
    /// 5xx responses, retried with backoff before surfacing.
    #[error("catalog returned status {0}")]
    Upstream(u16),
    /// 4xx responses, fatal for the invocation.
    #[error("catalog rejected the request with status {0}")]
    Rejected(u16),
    #[error("catalog request failed: {0}")]
    Network(#[from] reqwest::Error),
    #[error("unexpected catalog response: {0}")]
    Decode(String),
}

impl SearchError {
    pub fn is_retryable(&self) -> bool {
        match self {
            SearchError::Upstream(_) | SearchError::Network(_) => true,
            SearchError::Rejected(_) | SearchError::Decode(_) => false,
        }
    }
}

/// Paged catalog search for one publication day and platform.
#[async_trait]
pub trait CatalogSearch: Send + Sync {
    /// Fetch the page `[skip, skip+top)` of products published on `day` by
    /// `platform`, most recently published first.
    async fn search_page(
        &self,
        day: NaiveDate,
        platform: &str,
        skip: i64,
        top: i64,
    ) -> Result<SearchPage, SearchError>;
}
