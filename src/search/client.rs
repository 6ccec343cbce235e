//! HTTP client for the CDSE OData products catalog.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::Deserialize;
use tracing::{debug, warn};

use super::{CatalogSearch, SearchError, SearchPage, SearchResult};
use crate::tiles::parse_tile_id;

/// In-process retry schedule for transient catalog failures: `2^n` seconds
/// starting at 2s, 7 attempts in total.
const BACKOFF_BASE_SECS: u64 = 2;
const MAX_ATTEMPTS: u32 = 7;

/// Client for the upstream catalog search API.
#[derive(Clone)]
pub struct HttpCatalogClient {
    client: reqwest::Client,
    search_url: String,
    zipper_url: String,
}

impl HttpCatalogClient {
    /// # Arguments
    /// * `search_url` - Base URL of the catalog API (e.g. `https://catalogue.dataspace.copernicus.eu`)
    /// * `zipper_url` - Base URL download links are built against
    /// * `timeout_secs` - Per-request timeout in seconds
    pub fn new(
        search_url: String,
        zipper_url: String,
        timeout_secs: u64,
    ) -> Result<Self, SearchError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;

        Ok(Self {
            client,
            search_url,
            zipper_url,
        })
    }

    async fn request_page(
        &self,
        day: NaiveDate,
        platform: &str,
        skip: i64,
        top: i64,
    ) -> Result<SearchPage, SearchError> {
        let url = format!("{}/odata/v1/Products", self.search_url);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("$filter", build_filter(day, platform).as_str()),
                ("$orderby", "PublicationDate desc"),
                ("$count", "true"),
                ("$top", &top.to_string()),
                ("$skip", &skip.to_string()),
            ])
            .send()
            .await?;

        let status = response.status();
        if status.is_server_error() {
            return Err(SearchError::Upstream(status.as_u16()));
        }
        if !status.is_success() {
            return Err(SearchError::Rejected(status.as_u16()));
        }

        let page: ODataPage = response.json().await?;
        let results = page
            .value
            .into_iter()
            .map(|product| self.to_search_result(product))
            .collect();

        Ok(SearchPage {
            total: page.count,
            results,
        })
    }

    fn to_search_result(&self, product: ODataProduct) -> SearchResult {
        let tile_id = parse_tile_id(&product.name).unwrap_or_default();
        let checksum = product
            .checksum
            .iter()
            .find(|entry| entry.algorithm == "MD5")
            .map(|entry| entry.value.clone());
        let download_url = format!("{}/odata/v1/Products({})/$value", self.zipper_url, product.id);

        SearchResult {
            image_id: product.id,
            filename: product.name,
            tile_id,
            size: product.content_length,
            checksum,
            begin_position: product.content_date.start,
            end_position: product.content_date.end,
            ingestion_date: product.publication_date,
            download_url,
        }
    }
}

#[async_trait]
impl CatalogSearch for HttpCatalogClient {
    async fn search_page(
        &self,
        day: NaiveDate,
        platform: &str,
        skip: i64,
        top: i64,
    ) -> Result<SearchPage, SearchError> {
        let mut attempt = 0;
        loop {
            match self.request_page(day, platform, skip, top).await {
                Ok(page) => {
                    debug!(
                        "Catalog page for {}/{}: skip={} results={} total={:?}",
                        day,
                        platform,
                        skip,
                        page.results.len(),
                        page.total
                    );
                    return Ok(page);
                }
                Err(e) if e.is_retryable() && attempt + 1 < MAX_ATTEMPTS => {
                    let delay = Duration::from_secs(BACKOFF_BASE_SECS << attempt);
                    warn!(
                        "Catalog request for {}/{} failed (attempt {}/{}): {}, retrying in {:?}",
                        day,
                        platform,
                        attempt + 1,
                        MAX_ATTEMPTS,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// OData filter for one publication day and platform.
///
/// The publication window is the half-open UTC day `[00:00, 24:00)`; the
/// platform is matched through the product name prefix (`S2A_...`).
fn build_filter(day: NaiveDate, platform: &str) -> String {
    let next_day = day.checked_add_days(Days::new(1)).unwrap_or(day);
    format!(
        "Collection/Name eq 'SENTINEL-2' \
         and contains(Name,'MSIL1C') \
         and startswith(Name,'{}') \
         and PublicationDate ge {}T00:00:00.000Z \
         and PublicationDate lt {}T00:00:00.000Z",
        platform,
        day.format("%Y-%m-%d"),
        next_day.format("%Y-%m-%d")
    )
}

#[derive(Debug, Deserialize)]
struct ODataPage {
    #[serde(rename = "@odata.count")]
    count: Option<i64>,
    #[serde(default)]
    value: Vec<ODataProduct>,
}

#[derive(Debug, Deserialize)]
struct ODataProduct {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "ContentLength")]
    content_length: i64,
    #[serde(rename = "ContentDate")]
    content_date: ODataContentDate,
    #[serde(rename = "PublicationDate")]
    publication_date: DateTime<Utc>,
    #[serde(rename = "Checksum", default)]
    checksum: Vec<ODataChecksum>,
}

#[derive(Debug, Deserialize)]
struct ODataContentDate {
    #[serde(rename = "Start")]
    start: DateTime<Utc>,
    #[serde(rename = "End")]
    end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct ODataChecksum {
    #[serde(rename = "Value")]
    value: String,
    #[serde(rename = "Algorithm")]
    algorithm: String,
}
