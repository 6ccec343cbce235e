//! Environment-driven configuration and credential loading.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::downloader::DEFAULT_MAX_RETRIES;
use crate::queue::DEFAULT_VISIBILITY_TIMEOUT_SECS;

pub const DEFAULT_SEARCH_URL: &str = "https://catalogue.dataspace.copernicus.eu";
pub const DEFAULT_ZIPPER_URL: &str = "https://zipper.dataspace.copernicus.eu";
pub const DEFAULT_INTHUB2_URL: &str = "https://inthub2.copernicus.eu";

/// A username/password pair for an upstream service.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// Load credentials for `prefix` (e.g. `SCIHUB`).
    ///
    /// Reads `{prefix}_CREDENTIALS_FILE` (a JSON file with `username` and
    /// `password` fields, the shape secrets are provisioned in) when set,
    /// falling back to the `{prefix}_USERNAME`/`{prefix}_PASSWORD` pair.
    pub fn from_env(prefix: &str) -> Result<Self> {
        if let Ok(path) = std::env::var(format!("{prefix}_CREDENTIALS_FILE")) {
            let contents = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read credentials file {path}"))?;
            let credentials: Credentials = serde_json::from_str(&contents)
                .with_context(|| format!("Malformed credentials file {path}"))?;
            return Ok(credentials);
        }

        let username = std::env::var(format!("{prefix}_USERNAME"));
        let password = std::env::var(format!("{prefix}_PASSWORD"));
        match (username, password) {
            (Ok(username), Ok(password)) => Ok(Credentials { username, password }),
            _ => bail!(
                "Missing credentials: set {prefix}_CREDENTIALS_FILE or {prefix}_USERNAME and {prefix}_PASSWORD"
            ),
        }
    }
}

/// Everything the pipeline reads from the environment.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding granules.db and queue.db.
    pub db_dir: PathBuf,
    /// Bucket name recorded in uploaded object locations.
    pub upload_bucket: String,
    /// Filesystem root the upload bucket is mounted at.
    pub upload_root: PathBuf,
    /// Route downloads through IntHub2 with its credentials.
    pub use_inthub2: bool,
    /// Whether the download worker pool runs at all.
    pub enable_downloading: bool,
    pub max_download_retries: i32,
    /// Path to the MGRS tile allowlist file.
    pub accepted_tile_ids_path: PathBuf,
    /// Push events older than this many days of acquisition are ignored.
    pub subscription_recency_days: i64,
    /// Size of the download worker pool.
    pub download_concurrency: usize,
    /// Queue visibility timeout, also the lease staleness threshold.
    pub visibility_timeout_secs: i64,
    pub search_url: String,
    pub zipper_url: String,
    pub inthub2_url: String,
    /// Per-request timeout against upstream services.
    pub http_timeout_secs: u64,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        Ok(AppConfig {
            db_dir: PathBuf::from(env_or("DB_DIR", ".")),
            upload_bucket: env_or("UPLOAD_BUCKET", "sentinel-2-granules"),
            upload_root: PathBuf::from(env_or("UPLOAD_ROOT", "storage")),
            use_inthub2: env_bool("USE_INTHUB2", false)?,
            enable_downloading: env_bool("ENABLE_DOWNLOADING", true)?,
            max_download_retries: env_parse("MAX_DOWNLOAD_RETRIES", DEFAULT_MAX_RETRIES)?,
            accepted_tile_ids_path: PathBuf::from(env_or(
                "ACCEPTED_TILE_IDS_FILENAME",
                "allowed_tiles.txt",
            )),
            subscription_recency_days: env_parse("SUBSCRIPTION_RECENCY_DAYS", 30)?,
            download_concurrency: env_parse("DOWNLOAD_CONCURRENCY", 15)?,
            visibility_timeout_secs: env_parse(
                "VISIBILITY_TIMEOUT_SECS",
                DEFAULT_VISIBILITY_TIMEOUT_SECS,
            )?,
            search_url: env_or("SEARCH_URL", DEFAULT_SEARCH_URL),
            zipper_url: env_or("ZIPPER_URL", DEFAULT_ZIPPER_URL),
            inthub2_url: env_or("INTHUB2_URL", DEFAULT_INTHUB2_URL),
            http_timeout_secs: env_parse("HTTP_TIMEOUT_SECS", 900)?,
        })
    }

    pub fn granule_db_path(&self) -> PathBuf {
        self.db_dir.join("granules.db")
    }

    pub fn queue_db_path(&self) -> PathBuf {
        self.db_dir.join("queue.db")
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_bool(name: &str, default: bool) -> Result<bool> {
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => match value.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => bail!("{} must be a boolean, got {:?}", name, other),
        },
    }
}

fn env_parse<T>(name: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .parse()
            .with_context(|| format!("{} must be a valid number, got {:?}", name, value)),
    }
}
