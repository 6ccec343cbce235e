//! Download worker: drains the to-download queue, fetches granule archives,
//! validates checksums, uploads to the object store and commits state
//! transitions.

mod upstream;

pub use upstream::{HttpUpstreamClient, Inthub2Routing, UpstreamApi, UpstreamError};

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::object_store::ObjectStore;
use crate::queue::{DownloadMessage, DownloadQueue};
use crate::store::{ClaimOutcome, Granule, GranuleStore, LAST_FILE_DOWNLOADED_TIME_KEY};

/// Default cap on failed attempts before a granule is abandoned.
pub const DEFAULT_MAX_RETRIES: i32 = 10;

/// How one message was resolved.
#[derive(Debug)]
pub enum DownloadOutcome {
    /// Granule archived; carries the object-store location.
    Completed { location: String },
    /// Nothing to do; the message is simply consumed.
    Skipped(SkipReason),
    /// Transient failure: retry accounted for and the message re-published.
    Requeued { retries: i32 },
    /// Upstream no longer serves the product; terminal.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotFound,
    AlreadyDownloaded,
    LeaseHeld,
    RetryCapReached,
}

/// Processes to-download messages one at a time.
///
/// Every transition is anchored in the granule row: the lease
/// (`in_progress`) is acquired with a conditional update, and only the
/// holder commits success, retry accounting or expiry.
pub struct DownloadWorker {
    store: Arc<dyn GranuleStore>,
    queue: Arc<dyn DownloadQueue>,
    upstream: Arc<dyn UpstreamApi>,
    object_store: Arc<dyn ObjectStore>,
    max_retries: i32,
    lease_timeout_secs: i64,
}

impl DownloadWorker {
    pub fn new(
        store: Arc<dyn GranuleStore>,
        queue: Arc<dyn DownloadQueue>,
        upstream: Arc<dyn UpstreamApi>,
        object_store: Arc<dyn ObjectStore>,
        max_retries: i32,
        lease_timeout_secs: i64,
    ) -> Self {
        Self {
            store,
            queue,
            upstream,
            object_store,
            max_retries,
            lease_timeout_secs,
        }
    }

    /// Handle one queue message to completion.
    ///
    /// `Ok` means the message may be deleted from the queue, whatever the
    /// outcome. `Err` is a hard failure (misconfiguration, database error):
    /// the message is left inflight and the broker redelivers it after the
    /// visibility timeout.
    pub async fn process_message(&self, message: &DownloadMessage) -> Result<DownloadOutcome> {
        let granule = match self
            .store
            .try_claim_download(&message.id, self.lease_timeout_secs)?
        {
            ClaimOutcome::Claimed(granule) => granule,
            ClaimOutcome::NotFound => {
                warn!("Granule {} not found, dropping message", message.id);
                return Ok(DownloadOutcome::Skipped(SkipReason::NotFound));
            }
            ClaimOutcome::AlreadyDownloaded => {
                info!("Granule {} already downloaded", message.id);
                return Ok(DownloadOutcome::Skipped(SkipReason::AlreadyDownloaded));
            }
            ClaimOutcome::InProgress => {
                info!("Granule {} is leased by another worker", message.id);
                return Ok(DownloadOutcome::Skipped(SkipReason::LeaseHeld));
            }
        };

        if granule.download_retries >= self.max_retries {
            self.store.release_lease(&granule.id)?;
            warn!(
                "Granule {} abandoned after {} failed attempts",
                granule.id, granule.download_retries
            );
            return Ok(DownloadOutcome::Skipped(SkipReason::RetryCapReached));
        }

        let checksum = match self.upstream.fetch_checksum(&granule.id).await {
            Ok(checksum) => {
                if checksum != granule.checksum {
                    self.store.update_checksum(&granule.id, &checksum)?;
                }
                checksum
            }
            Err(e) => return self.resolve_upstream_error(message, &granule, e, "checksum fetch"),
        };

        let body = match self.upstream.download(&message.download_url).await {
            Ok(body) => body,
            Err(e) => return self.resolve_upstream_error(message, &granule, e, "download"),
        };

        let key = format!(
            "{}/{}",
            granule.begin_position.date_naive().format("%Y-%m-%d"),
            granule.filename
        );
        let location = match self.object_store.put_object(&key, &body, &checksum) {
            Ok(location) => location,
            Err(e) if e.is_transient() => {
                warn!("Upload of granule {} failed: {}", granule.id, e);
                return self.requeue(message);
            }
            Err(e) => {
                return Err(e).with_context(|| format!("Upload of granule {} failed", granule.id))
            }
        };

        self.store.finish_download(&granule.id, &location)?;
        if let Err(e) = self
            .store
            .set_status(LAST_FILE_DOWNLOADED_TIME_KEY, &Utc::now().to_rfc3339())
        {
            error!("Failed to update last file downloaded time: {}", e);
        }

        info!("Successfully downloaded granule {} to {}", granule.id, location);
        Ok(DownloadOutcome::Completed { location })
    }

    fn resolve_upstream_error(
        &self,
        message: &DownloadMessage,
        granule: &Granule,
        error: UpstreamError,
        stage: &str,
    ) -> Result<DownloadOutcome> {
        match error {
            UpstreamError::Gone(status) => {
                warn!(
                    "Granule {} no longer retrievable upstream (status {})",
                    granule.id, status
                );
                self.store.mark_expired(&granule.id)?;
                Ok(DownloadOutcome::Expired)
            }
            e if e.is_transient() => {
                warn!("Granule {} {} failed: {}", granule.id, stage, e);
                self.requeue(message)
            }
            e => Err(e).with_context(|| format!("Granule {} {} failed", granule.id, stage)),
        }
    }

    /// Transient-failure bookkeeping: release the lease, count the attempt
    /// and put the same message back on the queue. The inflight copy is then
    /// consumed so the broker does not double-account.
    fn requeue(&self, message: &DownloadMessage) -> Result<DownloadOutcome> {
        let retries = self.store.record_failed_attempt(&message.id)?;
        self.queue.publish(message)?;
        Ok(DownloadOutcome::Requeued { retries })
    }

    /// Drain the queue until shutdown. One message at a time; parallelism
    /// comes from running several workers.
    pub async fn run(
        &self,
        shutdown: CancellationToken,
        visibility_timeout_secs: i64,
        idle_delay: Duration,
    ) {
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.queue.receive(visibility_timeout_secs) {
                Ok(Some(received)) => match self.process_message(&received.message).await {
                    Ok(outcome) => {
                        if let Err(e) = self.queue.delete(&received.receipt) {
                            error!("Failed to delete consumed message: {}", e);
                        }
                        if let DownloadOutcome::Requeued { retries } = outcome {
                            info!(
                                "Granule {} requeued (attempt {})",
                                received.message.id, retries
                            );
                        }
                    }
                    Err(e) => {
                        // Left inflight; the visibility timeout redelivers it
                        error!(
                            "Hard failure processing granule {}: {:#}",
                            received.message.id, e
                        );
                    }
                },
                Ok(None) => {
                    tokio::select! {
                        _ = tokio::time::sleep(idle_delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
                Err(e) => {
                    error!("Queue receive failed: {}", e);
                    tokio::select! {
                        _ = tokio::time::sleep(idle_delay) => {}
                        _ = shutdown.cancelled() => break,
                    }
                }
            }
        }

        info!("Download worker stopped");
    }
}

/// Spawn a fixed-size pool of workers draining the queue.
pub fn spawn_worker_pool(
    worker: Arc<DownloadWorker>,
    concurrency: usize,
    visibility_timeout_secs: i64,
    shutdown: CancellationToken,
) -> Vec<tokio::task::JoinHandle<()>> {
    info!("Starting {} download workers", concurrency);
    (0..concurrency)
        .map(|_| {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker
                    .run(shutdown, visibility_timeout_secs, Duration::from_secs(1))
                    .await;
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{md5_hex, FsObjectStore};
    use crate::queue::SqliteDownloadQueue;
    use crate::store::{NewGranule, SqliteGranuleStore};
    use async_trait::async_trait;
    use bytes::Bytes;
    use chrono::{NaiveDate, TimeZone};
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BODY: &[u8] = b"sentinel-2 archive bytes";

    #[derive(Clone, Copy)]
    enum StubResponse {
        Ok,
        Gone,
        ServerError,
        Unauthorized,
    }

    struct StubUpstream {
        checksum: String,
        checksum_response: StubResponse,
        body: Bytes,
        download_response: StubResponse,
        download_calls: AtomicUsize,
    }

    impl StubUpstream {
        fn serving(body: &[u8]) -> Self {
            StubUpstream {
                checksum: md5_hex(body),
                checksum_response: StubResponse::Ok,
                body: Bytes::copy_from_slice(body),
                download_response: StubResponse::Ok,
                download_calls: AtomicUsize::new(0),
            }
        }

        fn error_for(response: StubResponse) -> Option<UpstreamError> {
            match response {
                StubResponse::Ok => None,
                StubResponse::Gone => Some(UpstreamError::Gone(404)),
                StubResponse::ServerError => Some(UpstreamError::Status(503)),
                StubResponse::Unauthorized => Some(UpstreamError::Unauthorized(401)),
            }
        }
    }

    #[async_trait]
    impl UpstreamApi for StubUpstream {
        async fn fetch_checksum(&self, _image_id: &str) -> Result<String, UpstreamError> {
            match Self::error_for(self.checksum_response) {
                Some(err) => Err(err),
                None => Ok(self.checksum.clone()),
            }
        }

        async fn download(&self, _download_url: &str) -> Result<Bytes, UpstreamError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            match Self::error_for(self.download_response) {
                Some(err) => Err(err),
                None => Ok(self.body.clone()),
            }
        }
    }

    struct Fixture {
        store: Arc<SqliteGranuleStore>,
        queue: Arc<SqliteDownloadQueue>,
        upstream: Arc<StubUpstream>,
        _dir: tempfile::TempDir,
        worker: DownloadWorker,
    }

    fn fixture(upstream: StubUpstream) -> Fixture {
        let store = Arc::new(SqliteGranuleStore::in_memory().unwrap());
        let queue = Arc::new(SqliteDownloadQueue::in_memory().unwrap());
        let upstream = Arc::new(upstream);
        let dir = tempfile::tempdir().unwrap();
        let object_store = Arc::new(FsObjectStore::new(
            dir.path().to_path_buf(),
            "upload-bucket".to_string(),
        ));

        let worker = DownloadWorker::new(
            store.clone(),
            queue.clone(),
            upstream.clone(),
            object_store,
            DEFAULT_MAX_RETRIES,
            900,
        );

        Fixture {
            store,
            queue,
            upstream,
            _dir: dir,
            worker,
        }
    }

    fn seed_granule(store: &SqliteGranuleStore, id: &str) -> DownloadMessage {
        let granule = NewGranule {
            id: id.to_string(),
            filename: format!("S2B_MSIL1C_20250127T105309_N0511_R051_T31UFU_{id}.SAFE"),
            tile_id: "31UFU".to_string(),
            size: BODY.len() as i64,
            checksum: md5_hex(BODY),
            begin_position: chrono::Utc.with_ymd_and_hms(2025, 1, 27, 10, 53, 9).unwrap(),
            end_position: chrono::Utc.with_ymd_and_hms(2025, 1, 27, 10, 53, 9).unwrap(),
            ingestion_date: NaiveDate::from_ymd_opt(2025, 1, 27).unwrap(),
            download_url: format!("https://zipper.example.com/odata/v1/Products({id})/$value"),
        };
        store.insert_granule(&granule).unwrap();
        DownloadMessage {
            id: granule.id,
            download_url: granule.download_url,
        }
    }

    #[tokio::test]
    async fn test_successful_download() {
        let f = fixture(StubUpstream::serving(BODY));
        let message = seed_granule(&f.store, "g1");

        let outcome = f.worker.process_message(&message).await.unwrap();
        let DownloadOutcome::Completed { location } = outcome else {
            panic!("expected Completed, got {:?}", outcome);
        };
        assert_eq!(
            location,
            "upload-bucket/2025-01-27/S2B_MSIL1C_20250127T105309_N0511_R051_T31UFU_g1.SAFE"
        );

        let granule = f.store.get_granule("g1").unwrap().unwrap();
        assert!(granule.downloaded);
        assert!(!granule.in_progress);
        assert!(granule.download_finished.is_some());
        assert_eq!(granule.download_retries, 0);
        assert_eq!(
            granule.uploaded_granule_file_location.as_deref(),
            Some(location.as_str())
        );
    }

    #[tokio::test]
    async fn test_replaying_message_after_success_is_noop() {
        let f = fixture(StubUpstream::serving(BODY));
        let message = seed_granule(&f.store, "g1");

        f.worker.process_message(&message).await.unwrap();
        let outcome = f.worker.process_message(&message).await.unwrap();

        assert!(matches!(
            outcome,
            DownloadOutcome::Skipped(SkipReason::AlreadyDownloaded)
        ));
        assert_eq!(f.upstream.download_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_checksum_mismatch_requeues() {
        let mut upstream = StubUpstream::serving(BODY);
        // Upstream declares a checksum that does not match the body
        upstream.checksum = md5_hex(b"other bytes");
        let f = fixture(upstream);
        let message = seed_granule(&f.store, "g1");

        let outcome = f.worker.process_message(&message).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Requeued { retries: 1 }));

        let granule = f.store.get_granule("g1").unwrap().unwrap();
        assert!(!granule.downloaded);
        assert!(!granule.in_progress);
        assert_eq!(granule.download_retries, 1);
        assert!(granule.uploaded_granule_file_location.is_none());
        // One re-published copy is on the queue
        assert_eq!(f.queue.visible_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_checksum_drift_is_persisted() {
        let mut upstream = StubUpstream::serving(BODY);
        upstream.checksum = md5_hex(BODY);
        let f = fixture(upstream);
        let message = seed_granule(&f.store, "g1");
        // Stored checksum differs from what upstream now declares
        f.store.update_checksum("g1", "00000000000000000000000000000000").unwrap();

        f.worker.process_message(&message).await.unwrap();

        let granule = f.store.get_granule("g1").unwrap().unwrap();
        assert_eq!(granule.checksum, md5_hex(BODY));
    }

    #[tokio::test]
    async fn test_retry_cap_drops_message_without_network_call() {
        let f = fixture(StubUpstream::serving(BODY));
        let message = seed_granule(&f.store, "g1");
        for _ in 0..DEFAULT_MAX_RETRIES {
            f.store.try_claim_download("g1", 0).unwrap();
            f.store.record_failed_attempt("g1").unwrap();
        }

        let outcome = f.worker.process_message(&message).await.unwrap();
        assert!(matches!(
            outcome,
            DownloadOutcome::Skipped(SkipReason::RetryCapReached)
        ));
        assert_eq!(f.upstream.download_calls.load(Ordering::SeqCst), 0);

        let granule = f.store.get_granule("g1").unwrap().unwrap();
        assert!(!granule.in_progress);
        assert!(!granule.downloaded);
        assert!(!granule.expired);
        assert_eq!(granule.download_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(f.queue.visible_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unknown_granule_is_skipped() {
        let f = fixture(StubUpstream::serving(BODY));
        let message = DownloadMessage {
            id: "missing".to_string(),
            download_url: "https://zipper.example.com/x".to_string(),
        };

        let outcome = f.worker.process_message(&message).await.unwrap();
        assert!(matches!(
            outcome,
            DownloadOutcome::Skipped(SkipReason::NotFound)
        ));
    }

    #[tokio::test]
    async fn test_leased_granule_is_skipped() {
        let f = fixture(StubUpstream::serving(BODY));
        let message = seed_granule(&f.store, "g1");
        f.store.try_claim_download("g1", 900).unwrap();

        let outcome = f.worker.process_message(&message).await.unwrap();
        assert!(matches!(
            outcome,
            DownloadOutcome::Skipped(SkipReason::LeaseHeld)
        ));
    }

    #[tokio::test]
    async fn test_gone_upstream_marks_expired() {
        let mut upstream = StubUpstream::serving(BODY);
        upstream.download_response = StubResponse::Gone;
        let f = fixture(upstream);
        let message = seed_granule(&f.store, "g1");

        let outcome = f.worker.process_message(&message).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Expired));

        let granule = f.store.get_granule("g1").unwrap().unwrap();
        assert!(granule.expired);
        assert!(!granule.in_progress);
        assert!(!granule.downloaded);
        // No requeue for expired granules
        assert_eq!(f.queue.visible_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_server_error_requeues() {
        let mut upstream = StubUpstream::serving(BODY);
        upstream.download_response = StubResponse::ServerError;
        let f = fixture(upstream);
        let message = seed_granule(&f.store, "g1");

        let outcome = f.worker.process_message(&message).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Requeued { retries: 1 }));
        assert_eq!(f.queue.visible_len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unauthorized_is_a_hard_failure() {
        let mut upstream = StubUpstream::serving(BODY);
        upstream.download_response = StubResponse::Unauthorized;
        let f = fixture(upstream);
        let message = seed_granule(&f.store, "g1");

        assert!(f.worker.process_message(&message).await.is_err());
        // No retry accounting for hard failures; the broker redelivers
        let granule = f.store.get_granule("g1").unwrap().unwrap();
        assert_eq!(granule.download_retries, 0);
        assert_eq!(f.queue.visible_len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_checksum_fetch_gone_marks_expired() {
        let mut upstream = StubUpstream::serving(BODY);
        upstream.checksum_response = StubResponse::Gone;
        let f = fixture(upstream);
        let message = seed_granule(&f.store, "g1");

        let outcome = f.worker.process_message(&message).await.unwrap();
        assert!(matches!(outcome, DownloadOutcome::Expired));
        assert_eq!(f.upstream.download_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_worker_loop_processes_and_stops() {
        let f = fixture(StubUpstream::serving(BODY));
        let message = seed_granule(&f.store, "g1");
        f.queue.publish(&message).unwrap();

        let shutdown = CancellationToken::new();
        let worker = Arc::new(f.worker);
        let handle = {
            let worker = worker.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                worker.run(shutdown, 900, Duration::from_millis(10)).await;
            })
        };

        // Give the worker a moment to drain the message, then stop it
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown.cancel();
        handle.await.unwrap();

        assert!(f.store.get_granule("g1").unwrap().unwrap().downloaded);
        assert_eq!(f.queue.visible_len().unwrap(), 0);
    }
}
