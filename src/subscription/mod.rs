//! Push-mode link ingestion: the upstream event system POSTs one granule
//! descriptor per event, guarded by HTTP Basic auth.

use std::collections::HashSet;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use axum_extra::headers::authorization::Basic;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::fetcher::admit_search_results;
use crate::queue::DownloadQueue;
use crate::search::SearchResult;
use crate::store::GranuleStore;
use crate::tiles::parse_tile_id;

/// Credentials and filtering settings for the push endpoint.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    pub username: String,
    pub password: String,
    /// Events whose acquisition start is older than this are ignored,
    /// suppressing reprocessed archive material.
    pub recency_days: i64,
}

pub struct SubscriptionState {
    pub store: Arc<dyn GranuleStore>,
    pub queue: Arc<dyn DownloadQueue>,
    pub accepted_tile_ids: HashSet<String>,
    pub config: SubscriptionConfig,
}

pub fn subscription_router(state: Arc<SubscriptionState>) -> Router {
    Router::new()
        .route("/events", post(post_event))
        .with_state(state)
}

/// What happened to one push event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    Admitted,
    AlreadyPresent,
    AcquisitionTooOld,
    TileNotAccepted,
}

#[derive(Serialize)]
struct EventResponse {
    disposition: Disposition,
}

async fn post_event(
    State(state): State<Arc<SubscriptionState>>,
    auth: Option<TypedHeader<Authorization<Basic>>>,
    Json(envelope): Json<PushEnvelope>,
) -> Response {
    let authorized = auth
        .map(|TypedHeader(auth)| credentials_match(&auth, &state.config))
        .unwrap_or(false);
    if !authorized {
        warn!("Rejected push event: bad credentials");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let result = match parse_push_result(&envelope) {
        Ok(result) => result,
        Err(reason) => {
            warn!("Rejected push event: {}", reason);
            return (StatusCode::BAD_REQUEST, reason).into_response();
        }
    };

    match evaluate_notification(&state, &result, Utc::now()) {
        Ok(disposition) => {
            info!("Push event for {}: {:?}", result.image_id, disposition);
            (StatusCode::OK, Json(EventResponse { disposition })).into_response()
        }
        Err(e) => {
            warn!("Failed to process push event for {}: {:#}", result.image_id, e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Filter and admit one parsed push event.
pub fn evaluate_notification(
    state: &SubscriptionState,
    result: &SearchResult,
    now: DateTime<Utc>,
) -> anyhow::Result<Disposition> {
    let oldest_accepted = now - Duration::days(state.config.recency_days);
    if result.begin_position < oldest_accepted {
        return Ok(Disposition::AcquisitionTooOld);
    }

    if !state.accepted_tile_ids.contains(&result.tile_id) {
        return Ok(Disposition::TileNotAccepted);
    }

    let admitted = admit_search_results(
        state.store.as_ref(),
        state.queue.as_ref(),
        std::slice::from_ref(result),
    )?;

    Ok(if admitted > 0 {
        Disposition::Admitted
    } else {
        Disposition::AlreadyPresent
    })
}

fn credentials_match(auth: &Authorization<Basic>, config: &SubscriptionConfig) -> bool {
    // Compared through digests so the comparison does not short-circuit on
    // the first differing byte
    digest_eq(auth.username(), &config.username) && digest_eq(auth.password(), &config.password)
}

fn digest_eq(left: &str, right: &str) -> bool {
    Sha256::digest(left.as_bytes()) == Sha256::digest(right.as_bytes())
}

// === Push event payload (CDSE subscription schema) ===

#[derive(Debug, Deserialize)]
pub struct PushEnvelope {
    pub value: PushProduct,
}

#[derive(Debug, Deserialize)]
pub struct PushProduct {
    #[serde(rename = "Id")]
    pub id: String,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "Locations", default)]
    pub locations: Vec<PushLocation>,
    #[serde(rename = "ContentDate")]
    pub content_date: PushContentDate,
    #[serde(rename = "PublicationDate")]
    pub publication_date: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PushLocation {
    #[serde(rename = "FormatType")]
    pub format_type: String,
    #[serde(rename = "DownloadLink")]
    pub download_link: String,
    #[serde(rename = "ContentLength")]
    pub content_length: i64,
    #[serde(rename = "Checksum", default)]
    pub checksum: Vec<PushChecksum>,
}

#[derive(Debug, Deserialize)]
pub struct PushContentDate {
    #[serde(rename = "Start")]
    pub start: DateTime<Utc>,
    #[serde(rename = "End")]
    pub end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct PushChecksum {
    #[serde(rename = "Value")]
    pub value: String,
    #[serde(rename = "Algorithm")]
    pub algorithm: String,
}

/// Map a push envelope onto the shared search-result shape.
///
/// The payload must carry exactly one `Extracted` location, and that
/// location must declare an MD5 checksum.
pub fn parse_push_result(envelope: &PushEnvelope) -> Result<SearchResult, String> {
    let product = &envelope.value;

    let extracted: Vec<&PushLocation> = product
        .locations
        .iter()
        .filter(|location| location.format_type == "Extracted")
        .collect();
    let [location] = extracted.as_slice() else {
        return Err(format!(
            "Got {} 'Extracted' links, expected just 1",
            extracted.len()
        ));
    };

    let checksum = location
        .checksum
        .iter()
        .find(|entry| entry.algorithm == "MD5")
        .map(|entry| entry.value.clone())
        .ok_or_else(|| "No MD5 checksum on 'Extracted' location".to_string())?;

    Ok(SearchResult {
        image_id: product.id.clone(),
        filename: product.name.clone(),
        tile_id: parse_tile_id(&product.name).unwrap_or_default(),
        size: location.content_length,
        checksum: Some(checksum),
        begin_position: product.content_date.start,
        end_position: product.content_date.end,
        ingestion_date: product.publication_date,
        download_url: location.download_link.clone(),
    })
}
