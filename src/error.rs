use crate::types::PriceSource;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Failure of a single HTTP attempt.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),
}

/// All retry attempts for a request failed.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{url} failed after {attempts} attempts: {last_error}")]
pub struct TransientFetchFailure {
    pub url: String,
    pub attempts: u32,
    pub last_error: FetchError,
}

/// Reasons a feed adapter produced no data for a cycle.
#[derive(Error, Debug)]
pub enum FeedError {
    #[error(transparent)]
    Transient(#[from] TransientFetchFailure),

    #[error("{feed}: unexpected payload: {detail}")]
    UpstreamSchema { feed: PriceSource, detail: String },

    #[error("{feed}: upstream error: {message}")]
    Upstream { feed: PriceSource, message: String },

    #[error("{feed}: timed out after {secs}s")]
    Timeout { feed: PriceSource, secs: u64 },
}

/// Price store failures.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store write failed for {key}: {reason}")]
    WriteFailure { key: String, reason: String },

    #[error("Stored row is corrupt: {0}")]
    Corrupt(String),

    #[error("Store backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

/// Trade ledger failures.
#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Malformed ledger event {trade_id}: {reason}")]
    Malformed { trade_id: String, reason: String },

    #[error("Ledger backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for LedgerError {
    fn from(e: rusqlite::Error) -> Self {
        LedgerError::Backend(e.to_string())
    }
}

/// Invalid configuration values.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value}")]
    Invalid { key: String, value: String },

    #[error("Native id {native} mapped twice for {feed}")]
    DuplicateMapping { feed: PriceSource, native: String },
}

/// Application error types.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Store(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
            AppError::Ledger(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()),
        };

        let body = Json(json!({
            "error": message,
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, AppError>;
