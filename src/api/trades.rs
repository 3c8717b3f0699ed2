//! Trades API
//!
//! - GET /api/trades - Normalized ledger events, optionally since a time

use axum::{
    extract::{Query, State},
    routing::get,
    Json, Router,
};
use serde::Deserialize;

use crate::api::prices::parse_since;
use crate::api::ApiResponse;
use crate::error::Result;
use crate::types::LedgerRead;
use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_trades))
}

#[derive(Debug, Deserialize)]
pub struct TradesQuery {
    since: Option<String>,
}

/// GET /api/trades
async fn list_trades(
    State(state): State<AppState>,
    Query(params): Query<TradesQuery>,
) -> Result<Json<ApiResponse<LedgerRead>>> {
    let read = match params.since.as_deref() {
        Some(raw) => state.ledger.read_since(parse_since(raw)?)?,
        None => state.ledger.read_all()?,
    };
    Ok(Json(ApiResponse::new(read)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::state_with;
    use crate::services::{MemoryLedger, MemoryPriceStore, TradeLedger};
    use crate::types::RawTradeRecord;
    use std::sync::Arc;

    fn record(id: &str, timestamp: &str) -> RawTradeRecord {
        RawTradeRecord {
            trade_id: Some(id.to_string()),
            symbol: Some("ETH".to_string()),
            action: Some("BUY".to_string()),
            quantity: Some("1".to_string()),
            price: Some("2000".to_string()),
            timestamp: Some(timestamp.to_string()),
            status: Some("EXECUTED".to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_trades_since_filters_and_counts_malformed() {
        let ledger = Arc::new(MemoryLedger::new());
        ledger.append(&record("old", "2024-01-01T00:00:00Z")).unwrap();
        ledger.append(&record("new", "2024-02-01T00:00:00Z")).unwrap();
        ledger.append(&record("bad", "not a time")).unwrap();
        let state = state_with(Arc::new(MemoryPriceStore::new()), ledger);

        let Json(all) = list_trades(State(state.clone()), Query(TradesQuery { since: None }))
            .await
            .unwrap();
        assert_eq!(all.data.entries.len(), 2);
        assert_eq!(all.data.malformed, 1);

        let Json(recent) = list_trades(
            State(state),
            Query(TradesQuery {
                since: Some("2024-01-15T00:00:00Z".to_string()),
            }),
        )
        .await
        .unwrap();
        assert_eq!(recent.data.entries.len(), 1);
        assert_eq!(recent.data.entries[0].event.trade_id, "new");
    }
}
