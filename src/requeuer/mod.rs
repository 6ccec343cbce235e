//! Operator-triggered backfill: re-admit undownloaded granules for one
//! ingestion date to the download queue.

use chrono::NaiveDate;
use serde::Serialize;
use tracing::info;

use crate::queue::{DownloadMessage, DownloadQueue};
use crate::store::GranuleStore;

#[derive(Debug, Clone, Serialize)]
pub struct RequeuedGranule {
    pub id: String,
    pub filename: String,
}

/// Full report of a requeue run, returned in both modes.
#[derive(Debug, Clone, Serialize)]
pub struct RequeueReport {
    pub dry_run: bool,
    pub ingestion_date: String,
    pub count: usize,
    pub granules: Vec<RequeuedGranule>,
}

/// Find all granules with `ingestiondate = date` and `downloaded = false`
/// and, unless `dry_run`, publish one download message per granule.
///
/// Retry counters are deliberately left untouched: a granule past the retry
/// cap stays abandoned until an operator lowers its counter by hand.
pub fn requeue_missing_granules(
    store: &dyn GranuleStore,
    queue: &dyn DownloadQueue,
    date: NaiveDate,
    dry_run: bool,
) -> anyhow::Result<RequeueReport> {
    let missing = store.undownloaded_for_date(date)?;

    if !dry_run {
        for granule in &missing {
            queue.publish(&DownloadMessage {
                id: granule.id.clone(),
                download_url: granule.download_url.clone(),
            })?;
        }
    }

    info!(
        "Requeue for {}: {} undownloaded granules{}",
        date,
        missing.len(),
        if dry_run { " (dry run)" } else { "" }
    );

    Ok(RequeueReport {
        dry_run,
        ingestion_date: date.format("%Y-%m-%d").to_string(),
        count: missing.len(),
        granules: missing
            .into_iter()
            .map(|granule| RequeuedGranule {
                id: granule.id,
                filename: granule.filename,
            })
            .collect(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::SqliteDownloadQueue;
    use crate::store::{NewGranule, SqliteGranuleStore};
    use chrono::{TimeZone, Utc};

    fn seed(store: &SqliteGranuleStore, id: &str, date: NaiveDate) {
        store
            .insert_granule(&NewGranule {
                id: id.to_string(),
                filename: format!("{id}.SAFE"),
                tile_id: "31UFU".to_string(),
                size: 1,
                checksum: String::new(),
                begin_position: Utc.with_ymd_and_hms(2023, 6, 10, 0, 0, 0).unwrap(),
                end_position: Utc.with_ymd_and_hms(2023, 6, 10, 0, 0, 0).unwrap(),
                ingestion_date: date,
                download_url: format!("https://zipper.example.com/Products({id})/$value"),
            })
            .unwrap();
    }

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 6, 10).unwrap()
    }

    #[test]
    fn test_dry_run_reports_without_publishing() {
        let store = SqliteGranuleStore::in_memory().unwrap();
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        for id in ["a", "b", "c"] {
            seed(&store, id, date());
        }

        let report = requeue_missing_granules(&store, &queue, date(), true).unwrap();

        assert!(report.dry_run);
        assert_eq!(report.count, 3);
        assert_eq!(report.granules.len(), 3);
        assert_eq!(report.ingestion_date, "2023-06-10");
        assert_eq!(queue.visible_len().unwrap(), 0);
    }

    #[test]
    fn test_live_run_publishes_one_message_per_granule() {
        let store = SqliteGranuleStore::in_memory().unwrap();
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        for id in ["a", "b", "c"] {
            seed(&store, id, date());
        }

        let report = requeue_missing_granules(&store, &queue, date(), false).unwrap();

        assert!(!report.dry_run);
        assert_eq!(report.count, 3);
        assert_eq!(queue.visible_len().unwrap(), 3);
    }

    #[test]
    fn test_downloaded_and_other_day_granules_are_excluded() {
        let store = SqliteGranuleStore::in_memory().unwrap();
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        seed(&store, "a", date());
        seed(&store, "b", date());
        seed(&store, "other", NaiveDate::from_ymd_opt(2023, 6, 11).unwrap());

        store.try_claim_download("b", 900).unwrap();
        store.finish_download("b", "bucket/k").unwrap();

        let report = requeue_missing_granules(&store, &queue, date(), false).unwrap();
        assert_eq!(report.count, 1);
        assert_eq!(report.granules[0].id, "a");
    }

    #[test]
    fn test_requeue_does_not_reset_retries() {
        let store = SqliteGranuleStore::in_memory().unwrap();
        let queue = SqliteDownloadQueue::in_memory().unwrap();
        seed(&store, "a", date());
        store.try_claim_download("a", 900).unwrap();
        store.record_failed_attempt("a").unwrap();

        requeue_missing_granules(&store, &queue, date(), false).unwrap();

        assert_eq!(store.get_granule("a").unwrap().unwrap().download_retries, 1);
    }

    #[test]
    fn test_empty_day_yields_empty_report() {
        let store = SqliteGranuleStore::in_memory().unwrap();
        let queue = SqliteDownloadQueue::in_memory().unwrap();

        let report = requeue_missing_granules(&store, &queue, date(), false).unwrap();
        assert_eq!(report.count, 0);
        assert!(report.granules.is_empty());
    }
}
