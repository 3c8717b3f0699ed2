//! Prices API
//!
//! - GET /api/prices - Latest resolved quote per tracked instrument
//! - GET /api/prices/:instrument/history - Stored quotes since a time

use axum::{
    extract::{Path, Query, State},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

use crate::api::ApiResponse;
use crate::error::{AppError, Result};
use crate::types::{Instrument, PriceQuote};
use crate::AppState;

const DEFAULT_HISTORY_HOURS: i64 = 24;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(get_prices))
        .route("/:instrument/history", get(get_history))
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    /// RFC 3339 lower bound; defaults to the last 24 hours.
    since: Option<String>,
    limit: Option<usize>,
}

/// GET /api/prices
async fn get_prices(State(state): State<AppState>) -> Result<Json<ApiResponse<Vec<PriceQuote>>>> {
    let tracked: Vec<Instrument> = state.symbols.tracked().cloned().collect();
    let mut latest = state.prices.latest_quotes(&tracked)?;

    let quotes = tracked.iter().filter_map(|i| latest.remove(i)).collect();
    Ok(Json(ApiResponse::new(quotes)))
}

/// GET /api/prices/:instrument/history
async fn get_history(
    State(state): State<AppState>,
    Path(instrument): Path<String>,
    Query(params): Query<HistoryQuery>,
) -> Result<Json<ApiResponse<Vec<PriceQuote>>>> {
    let instrument = Instrument::new(&instrument);
    if !state.symbols.is_tracked(&instrument) {
        return Err(AppError::NotFound(format!("{} is not tracked", instrument)));
    }

    let since = match params.since.as_deref() {
        Some(raw) => parse_since(raw)?,
        None => Utc::now() - Duration::hours(DEFAULT_HISTORY_HOURS),
    };

    let quotes = state.prices.history(&instrument, since, params.limit)?;
    Ok(Json(ApiResponse::new(quotes)))
}

/// Parse an RFC 3339 `since` query value.
pub(crate) fn parse_since(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| AppError::BadRequest(format!("invalid since {:?}: {}", raw, e)))
}
