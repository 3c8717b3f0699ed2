//! Dashboard API
//!
//! - GET /api/dashboard - Full dashboard payload (never fails)
//! - GET /api/portfolio - Portfolio snapshot

use axum::{extract::State, routing::get, Json, Router};

use crate::api::ApiResponse;
use crate::error::Result;
use crate::types::{DashboardPayload, PortfolioSnapshot};
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(get_dashboard))
}

pub fn portfolio_router() -> Router<AppState> {
    Router::new().route("/", get(get_portfolio))
}

/// GET /api/dashboard
async fn get_dashboard(State(state): State<AppState>) -> Json<ApiResponse<DashboardPayload>> {
    Json(ApiResponse::new(state.projector.build()))
}

/// GET /api/portfolio
///
/// Unlike the dashboard this surfaces ledger failures as 503.
async fn get_portfolio(State(state): State<AppState>) -> Result<Json<ApiResponse<PortfolioSnapshot>>> {
    let snapshot = state.accountant.snapshot()?;
    Ok(Json(ApiResponse::new(snapshot)))
}
