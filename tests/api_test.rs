//! Router-level tests: routing, status codes and response envelopes

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use serde_json::Value;
use std::sync::Arc;
use tally::config::{Config, RetryPolicy};
use tally::error::FetchError;
use tally::services::{MemoryLedger, MemoryPriceStore, TradeLedger};
use tally::sources::Transport;
use tally::types::{Instrument, RawTradeRecord};
use tally::{api, AppState};
use tower::ServiceExt;

struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    async fn get(&self, _url: &str, _headers: &[(String, String)]) -> Result<String, FetchError> {
        Err(FetchError::Network("connection refused".to_string()))
    }
}

fn app(ledger: Arc<MemoryLedger>) -> Router {
    let config = Config {
        tracked_crypto: vec![Instrument::new("BTC")],
        tracked_forex: vec![Instrument::new("GBPUSD")],
        retry: RetryPolicy::immediate(1),
        ..Config::default()
    };
    let state = AppState::build(
        config,
        Arc::new(OfflineTransport),
        Arc::new(MemoryPriceStore::new()),
        ledger,
        None,
    )
    .unwrap();
    Router::new().merge(api::router()).with_state(state)
}

async fn call(app: Router, method: Method, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().method(method).uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn test_health() {
    let (status, body) = call(app(Arc::new(MemoryLedger::new())), Method::GET, "/api/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["trackedInstruments"], 2);
}

#[tokio::test]
async fn test_ingest_reports_failed_sources() {
    let (status, body) = call(app(Arc::new(MemoryLedger::new())), Method::POST, "/api/ingest").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["savedCount"], 0);
    let sources = body["data"]["sources"].as_array().unwrap();
    assert!(sources.iter().all(|s| s["error"].is_string()));
}

#[tokio::test]
async fn test_dashboard_renders_without_data() {
    let (status, body) = call(app(Arc::new(MemoryLedger::new())), Method::GET, "/api/dashboard").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["stale"], true);
    assert_eq!(body["data"]["portfolioSummary"]["currentBalance"], "50");
}

#[tokio::test]
async fn test_trades_and_portfolio() {
    let ledger = Arc::new(MemoryLedger::new());
    ledger
        .append(&RawTradeRecord {
            trade_id: Some("t1".to_string()),
            symbol: Some("BTC".to_string()),
            action: Some("SELL".to_string()),
            quantity: Some("0.01".to_string()),
            price: Some("65000".to_string()),
            timestamp: Some("2024-05-01T08:00:00Z".to_string()),
            status: Some("CLOSED".to_string()),
            pnl: Some("1.5".to_string()),
            ..Default::default()
        })
        .unwrap();

    let (status, body) = call(app(ledger.clone()), Method::GET, "/api/trades").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["entries"][0]["tradeId"], "t1");
    assert_eq!(body["data"]["malformed"], 0);

    let (status, body) = call(app(ledger), Method::GET, "/api/portfolio").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["currentBalance"], "51.5");
    assert_eq!(body["data"]["winRate"], 100.0);
}

#[tokio::test]
async fn test_bad_requests() {
    let (status, body) = call(
        app(Arc::new(MemoryLedger::new())),
        Method::GET,
        "/api/trades?since=yesterday",
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], 400);

    let (status, _) = call(
        app(Arc::new(MemoryLedger::new())),
        Method::GET,
        "/api/prices/DOGE/history",
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
