//! Granule persistence layer.
//!
//! SQLite-backed storage for granules, per-day discovery counts and the
//! small key-value status table. All cross-worker coordination goes through
//! this store; lease and success transitions are conditional updates that
//! report whether a row actually changed.

mod models;
mod schema;

pub use models::{
    fetch_cursor_key, ClaimOutcome, Granule, GranuleCount, NewGranule,
    LAST_FILE_DOWNLOADED_TIME_KEY, LAST_LINK_FETCHED_TIME_KEY,
};
pub use schema::GRANULE_DB_VERSIONED_SCHEMAS;

use anyhow::{bail, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{Connection, OptionalExtension};
use std::path::Path;
use std::sync::{Arc, Mutex};

use crate::sqlite_persistence::open_database;

/// Storage operations shared by the fetcher, downloader and requeuer.
pub trait GranuleStore: Send + Sync {
    // === Granules ===

    /// Conditionally insert a granule. Returns true when a new row was
    /// created, false when the id already existed (idempotent no-op).
    fn insert_granule(&self, granule: &NewGranule) -> Result<bool>;

    /// Get a granule by id.
    fn get_granule(&self, id: &str) -> Result<Option<Granule>>;

    /// Atomically acquire the download lease for a granule.
    ///
    /// Succeeds when the granule is not downloaded and either unleased or
    /// holding a lease older than `lease_timeout_secs`.
    fn try_claim_download(&self, id: &str, lease_timeout_secs: i64) -> Result<ClaimOutcome>;

    /// Commit a successful download. Fails if the caller no longer holds the
    /// lease.
    fn finish_download(&self, id: &str, location: &str) -> Result<()>;

    /// Release the lease without recording an attempt (retry cap reached).
    fn release_lease(&self, id: &str) -> Result<()>;

    /// Release the lease and increment the retry counter. Returns the new
    /// counter value.
    fn record_failed_attempt(&self, id: &str) -> Result<i32>;

    /// Mark the granule as no longer retrievable upstream.
    fn mark_expired(&self, id: &str) -> Result<()>;

    /// Overwrite the stored checksum with a fresher upstream value.
    fn update_checksum(&self, id: &str, checksum: &str) -> Result<()>;

    /// All granules for an ingestion date that were never downloaded.
    fn undownloaded_for_date(&self, date: NaiveDate) -> Result<Vec<Granule>>;

    // === Per-day counts ===

    /// Load the count row for `(date, platform)`, creating a zeroed one when
    /// absent.
    fn get_or_create_count(&self, date: NaiveDate, platform: &str) -> Result<GranuleCount>;

    /// Overwrite `available_links` for `(date, platform)`.
    fn set_available_links(&self, date: NaiveDate, platform: &str, total: i64) -> Result<()>;

    /// Add to `fetched_links` and refresh `last_fetched_time`.
    fn add_fetched_links(&self, date: NaiveDate, platform: &str, fetched: i64) -> Result<()>;

    // === Status key-value ===

    fn get_status(&self, key: &str) -> Result<Option<String>>;

    fn set_status(&self, key: &str, value: &str) -> Result<()>;
}

/// SQLite-backed granule store (granules.db).
pub struct SqliteGranuleStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteGranuleStore {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = open_database(db_path.as_ref(), GRANULE_DB_VERSIONED_SCHEMAS)?;
        Ok(SqliteGranuleStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    #[cfg(test)]
    pub fn in_memory() -> Result<Self> {
        use anyhow::Context;

        let conn = Connection::open_in_memory()?;
        GRANULE_DB_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(SqliteGranuleStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn row_to_granule(row: &rusqlite::Row) -> rusqlite::Result<Granule> {
        Ok(Granule {
            id: row.get("id")?,
            filename: row.get("filename")?,
            tile_id: row.get("tileid")?,
            size: row.get("size")?,
            checksum: row.get("checksum")?,
            begin_position: ts_to_datetime(row.get("beginposition")?),
            end_position: ts_to_datetime(row.get("endposition")?),
            ingestion_date: parse_date(&row.get::<_, String>("ingestiondate")?),
            download_url: row.get("download_url")?,
            downloaded: row.get("downloaded")?,
            in_progress: row.get("in_progress")?,
            uploaded_granule_file_location: row.get("uploaded_granule_file_location")?,
            download_started: row.get("download_started")?,
            download_finished: row.get("download_finished")?,
            download_retries: row.get("download_retries")?,
            expired: row.get("expired")?,
        })
    }

    fn now() -> i64 {
        Utc::now().timestamp()
    }
}

fn ts_to_datetime(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or(DateTime::UNIX_EPOCH)
}

fn parse_date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap_or_default()
}

fn date_str(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

impl GranuleStore for SqliteGranuleStore {
    fn insert_granule(&self, granule: &NewGranule) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"INSERT INTO granule (
                id, filename, tileid, size, checksum,
                beginposition, endposition, ingestiondate, download_url
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(id) DO NOTHING"#,
            rusqlite::params![
                granule.id,
                granule.filename,
                granule.tile_id,
                granule.size,
                granule.checksum,
                granule.begin_position.timestamp(),
                granule.end_position.timestamp(),
                date_str(granule.ingestion_date),
                granule.download_url,
            ],
        )?;
        Ok(changed > 0)
    }

    fn get_granule(&self, id: &str) -> Result<Option<Granule>> {
        let conn = self.conn.lock().unwrap();
        let granule = conn
            .prepare("SELECT * FROM granule WHERE id = ?1")?
            .query_row([id], Self::row_to_granule)
            .optional()?;
        Ok(granule)
    }

    fn try_claim_download(&self, id: &str, lease_timeout_secs: i64) -> Result<ClaimOutcome> {
        let conn = self.conn.lock().unwrap();
        let now = Self::now();
        let stale_cutoff = now - lease_timeout_secs;

        let claimed = conn.execute(
            r#"UPDATE granule
               SET in_progress = 1, download_started = ?1
               WHERE id = ?2
                 AND downloaded = 0
                 AND (in_progress = 0
                      OR download_started IS NULL
                      OR download_started <= ?3)"#,
            rusqlite::params![now, id, stale_cutoff],
        )?;

        if claimed > 0 {
            let granule = conn
                .prepare("SELECT * FROM granule WHERE id = ?1")?
                .query_row([id], Self::row_to_granule)?;
            return Ok(ClaimOutcome::Claimed(Box::new(granule)));
        }

        let state: Option<bool> = conn
            .query_row("SELECT downloaded FROM granule WHERE id = ?1", [id], |row| {
                row.get(0)
            })
            .optional()?;

        Ok(match state {
            None => ClaimOutcome::NotFound,
            Some(true) => ClaimOutcome::AlreadyDownloaded,
            Some(false) => ClaimOutcome::InProgress,
        })
    }

    fn finish_download(&self, id: &str, location: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            r#"UPDATE granule
               SET downloaded = 1,
                   in_progress = 0,
                   download_finished = ?1,
                   uploaded_granule_file_location = ?2
               WHERE id = ?3 AND in_progress = 1"#,
            rusqlite::params![Self::now(), location, id],
        )?;
        if changed == 0 {
            bail!("Granule {} was not leased by this worker at commit time", id);
        }
        Ok(())
    }

    fn release_lease(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE granule SET in_progress = 0 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    fn record_failed_attempt(&self, id: &str) -> Result<i32> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE granule
               SET in_progress = 0, download_retries = download_retries + 1
               WHERE id = ?1"#,
            [id],
        )?;
        let retries = conn.query_row(
            "SELECT download_retries FROM granule WHERE id = ?1",
            [id],
            |row| row.get(0),
        )?;
        Ok(retries)
    }

    fn mark_expired(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE granule SET expired = 1, in_progress = 0 WHERE id = ?1",
            [id],
        )?;
        Ok(())
    }

    fn update_checksum(&self, id: &str, checksum: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE granule SET checksum = ?1 WHERE id = ?2",
            rusqlite::params![checksum, id],
        )?;
        Ok(())
    }

    fn undownloaded_for_date(&self, date: NaiveDate) -> Result<Vec<Granule>> {
        let conn = self.conn.lock().unwrap();
        let granules = conn
            .prepare(
                r#"SELECT * FROM granule
                   WHERE ingestiondate = ?1 AND downloaded = 0
                   ORDER BY id"#,
            )?
            .query_map([date_str(date)], Self::row_to_granule)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(granules)
    }

    fn get_or_create_count(&self, date: NaiveDate, platform: &str) -> Result<GranuleCount> {
        let conn = self.conn.lock().unwrap();
        let date_string = date_str(date);

        let existing = conn
            .prepare(
                r#"SELECT available_links, fetched_links, last_fetched_time
                   FROM granule_count WHERE date = ?1 AND platform = ?2"#,
            )?
            .query_row(rusqlite::params![date_string, platform], |row| {
                Ok(GranuleCount {
                    date,
                    platform: platform.to_string(),
                    available_links: row.get(0)?,
                    fetched_links: row.get(1)?,
                    last_fetched_time: row.get(2)?,
                })
            })
            .optional()?;

        if let Some(count) = existing {
            return Ok(count);
        }

        let now = Self::now();
        conn.execute(
            r#"INSERT INTO granule_count (date, platform, available_links, fetched_links, last_fetched_time)
               VALUES (?1, ?2, 0, 0, ?3)"#,
            rusqlite::params![date_string, platform, now],
        )?;

        Ok(GranuleCount {
            date,
            platform: platform.to_string(),
            available_links: 0,
            fetched_links: 0,
            last_fetched_time: now,
        })
    }

    fn set_available_links(&self, date: NaiveDate, platform: &str, total: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE granule_count SET available_links = ?1
               WHERE date = ?2 AND platform = ?3"#,
            rusqlite::params![total, date_str(date), platform],
        )?;
        Ok(())
    }

    fn add_fetched_links(&self, date: NaiveDate, platform: &str, fetched: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"UPDATE granule_count
               SET fetched_links = fetched_links + ?1, last_fetched_time = ?2
               WHERE date = ?3 AND platform = ?4"#,
            rusqlite::params![fetched, Self::now(), date_str(date), platform],
        )?;
        Ok(())
    }

    fn get_status(&self, key: &str) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        let value = conn
            .query_row("SELECT value FROM status WHERE key_name = ?1", [key], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(value)
    }

    fn set_status(&self, key: &str, value: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"INSERT INTO status (key_name, value) VALUES (?1, ?2)
               ON CONFLICT(key_name) DO UPDATE SET value = excluded.value"#,
            rusqlite::params![key, value],
        )?;
        Ok(())
    }
}
