pub mod dashboard;
pub mod health;
pub mod ingest;
pub mod prices;
pub mod trades;

use crate::AppState;
use axum::Router;
use serde::Serialize;

/// Envelope for successful responses.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self { data }
    }
}

/// Create the API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(health::router())
        .nest("/api/ingest", ingest::router())
        .nest("/api/dashboard", dashboard::router())
        .nest("/api/portfolio", dashboard::portfolio_router())
        .nest("/api/prices", prices::router())
        .nest("/api/trades", trades::router())
}
