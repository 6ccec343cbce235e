//! Link discovery: paged catalog polling and shared granule admission.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use tracing::info;

use crate::queue::{DownloadMessage, DownloadQueue};
use crate::search::{CatalogSearch, SearchResult};
use crate::store::{fetch_cursor_key, GranuleStore, NewGranule, LAST_LINK_FETCHED_TIME_KEY};

/// Page size for catalog queries.
pub const PAGE_SIZE: i64 = 100;

/// Result of one polling step, reported back to the orchestrator.
#[derive(Debug, Clone, Serialize)]
pub struct FetchOutcome {
    pub query_date: String,
    pub platform: String,
    /// False while more pages remain; the orchestrator re-invokes until true.
    pub completed: bool,
}

/// Polling-mode link fetcher.
///
/// Each `fetch_step` call processes one catalog page for a `(date, platform)`
/// pair and advances the persisted cursor. A crash between the page request
/// and the cursor update costs one page of re-work, which admission
/// idempotence makes safe.
pub struct LinkFetcher {
    store: Arc<dyn GranuleStore>,
    queue: Arc<dyn DownloadQueue>,
    catalog: Arc<dyn CatalogSearch>,
    accepted_tile_ids: HashSet<String>,
    page_size: i64,
}

impl LinkFetcher {
    pub fn new(
        store: Arc<dyn GranuleStore>,
        queue: Arc<dyn DownloadQueue>,
        catalog: Arc<dyn CatalogSearch>,
        accepted_tile_ids: HashSet<String>,
    ) -> Self {
        Self {
            store,
            queue,
            catalog,
            accepted_tile_ids,
            page_size: PAGE_SIZE,
        }
    }

    #[cfg(test)]
    fn with_page_size(mut self, page_size: i64) -> Self {
        self.page_size = page_size;
        self
    }

    /// Process one catalog page for `(day, platform)`.
    pub async fn fetch_step(&self, day: NaiveDate, platform: &str) -> Result<FetchOutcome> {
        let count = self.store.get_or_create_count(day, platform)?;
        let cursor_key = fetch_cursor_key(day, platform);
        let cursor: i64 = self
            .store
            .get_status(&cursor_key)?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);

        let page = self
            .catalog
            .search_page(day, platform, cursor, self.page_size)
            .await?;

        if let Some(total) = page.total {
            if total > count.available_links {
                self.store.set_available_links(day, platform, total)?;
            }
        }

        if page.results.is_empty() {
            info!(
                "Link fetching completed for {}/{}: {} links fetched",
                day, platform, cursor
            );
            return Ok(FetchOutcome {
                query_date: day.format("%Y-%m-%d").to_string(),
                platform: platform.to_string(),
                completed: true,
            });
        }

        let fetched = page.results.len() as i64;
        let accepted: Vec<SearchResult> = page
            .results
            .into_iter()
            .filter(|result| self.accepted_tile_ids.contains(&result.tile_id))
            .collect();

        let admitted = admit_search_results(
            self.store.as_ref(),
            self.queue.as_ref(),
            &accepted,
        )?;

        self.store.add_fetched_links(day, platform, fetched)?;
        self.store
            .set_status(LAST_LINK_FETCHED_TIME_KEY, &Utc::now().to_rfc3339())?;
        self.store
            .set_status(&cursor_key, &(cursor + fetched).to_string())?;

        info!(
            "Fetched links for {}/{}: page of {} at offset {}, {} accepted, {} admitted",
            day,
            platform,
            fetched,
            cursor,
            accepted.len(),
            admitted
        );

        Ok(FetchOutcome {
            query_date: day.format("%Y-%m-%d").to_string(),
            platform: platform.to_string(),
            completed: false,
        })
    }
}

/// Admit search results: one conditional insert per granule, and one queue
/// message for each row that was actually created.
///
/// The message is published after the row is durably committed; a crash in
/// between leaves a row with no message, which the requeuer repairs. An
/// already-present id is a complete no-op (no reinsert, no re-publish).
pub fn admit_search_results(
    store: &dyn GranuleStore,
    queue: &dyn DownloadQueue,
    results: &[SearchResult],
) -> Result<usize> {
    let mut admitted = 0;
    for result in results {
        let granule = NewGranule {
            id: result.image_id.clone(),
            filename: result.filename.clone(),
            tile_id: result.tile_id.clone(),
            size: result.size,
            checksum: result.checksum.clone().unwrap_or_default(),
            begin_position: result.begin_position,
            end_position: result.end_position,
            ingestion_date: result.ingestion_date.date_naive(),
            download_url: result.download_url.clone(),
        };

        let inserted = store
            .insert_granule(&granule)
            .with_context(|| format!("Failed to admit granule {}", result.image_id))?;

        if inserted {
            queue.publish(&DownloadMessage {
                id: result.image_id.clone(),
                download_url: result.download_url.clone(),
            })?;
            admitted += 1;
        } else {
            info!("{} already in database, not admitting", result.image_id);
        }
    }
    Ok(admitted)
}
