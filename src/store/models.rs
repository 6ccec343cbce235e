//! Data models for the granule persistence layer.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

/// A Sentinel-2 product tracked by the pipeline.
///
/// Created once by the link fetcher (poll page or push event) and mutated by
/// the download worker through conditional updates; never deleted.
#[derive(Debug, Clone)]
pub struct Granule {
    /// Upstream product identifier.
    pub id: String,
    /// Product file name.
    pub filename: String,
    /// MGRS tile code (5 characters, e.g. `31UFU`).
    pub tile_id: String,
    /// Product size on upstream, in bytes.
    pub size: i64,
    /// Upstream-declared MD5 checksum (hex). Empty until known.
    pub checksum: String,
    /// Acquisition start.
    pub begin_position: DateTime<Utc>,
    /// Acquisition end.
    pub end_position: DateTime<Utc>,
    /// UTC day upstream published the product.
    pub ingestion_date: NaiveDate,
    /// Upstream download endpoint.
    pub download_url: String,
    /// Terminal success flag.
    pub downloaded: bool,
    /// Download lease, held by at most one worker.
    pub in_progress: bool,
    /// Object-store URI, set when `downloaded` is true.
    pub uploaded_granule_file_location: Option<String>,
    /// Lease acquisition time (Unix seconds).
    pub download_started: Option<i64>,
    /// Success time (Unix seconds).
    pub download_finished: Option<i64>,
    /// Number of failed attempts so far.
    pub download_retries: i32,
    /// Upstream reports the product is no longer retrievable.
    pub expired: bool,
}

/// The admission-time subset of a granule row.
#[derive(Debug, Clone)]
pub struct NewGranule {
    pub id: String,
    pub filename: String,
    pub tile_id: String,
    pub size: i64,
    pub checksum: String,
    pub begin_position: DateTime<Utc>,
    pub end_position: DateTime<Utc>,
    pub ingestion_date: NaiveDate,
    pub download_url: String,
}

/// Per-day discovery progress for one `(date, platform)` pair.
#[derive(Debug, Clone, Serialize)]
pub struct GranuleCount {
    pub date: NaiveDate,
    pub platform: String,
    /// Total results the catalog advertises for the day.
    pub available_links: i64,
    /// Links processed so far (including filtered-out tiles).
    pub fetched_links: i64,
    /// Unix seconds of the last fetch touching this row.
    pub last_fetched_time: i64,
}

/// Outcome of a conditional download-lease claim.
#[derive(Debug)]
pub enum ClaimOutcome {
    /// The lease was acquired; carries the fresh row.
    Claimed(Box<Granule>),
    /// No row with this id exists.
    NotFound,
    /// The granule has already been downloaded.
    AlreadyDownloaded,
    /// Another worker holds a live lease.
    InProgress,
}

/// `status` table key for the last time any link was fetched.
pub const LAST_LINK_FETCHED_TIME_KEY: &str = "last_linked_fetched_time";

/// `status` table key for the last time any file was downloaded.
pub const LAST_FILE_DOWNLOADED_TIME_KEY: &str = "last_file_downloaded_time";

/// `status` table key holding the paging cursor for one `(date, platform)`.
pub fn fetch_cursor_key(date: NaiveDate, platform: &str) -> String {
    format!("link_fetcher_cursor:{}:{}", date.format("%Y-%m-%d"), platform)
}
