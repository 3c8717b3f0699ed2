use super::{Instrument, MarketType, PortfolioSnapshot, PriceQuote, PriceSource, TradeEvent};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Current resolved price for one tracked instrument.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketPrice {
    pub instrument: Instrument,
    pub market_type: MarketType,
    pub source: PriceSource,
    pub price: Decimal,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bid: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ask: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spread: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_pct_24h: Option<Decimal>,
    pub timestamp: DateTime<Utc>,
    pub age_seconds: i64,
    pub stale: bool,
}

impl MarketPrice {
    pub fn from_quote(quote: &PriceQuote, now: DateTime<Utc>, stale_after_secs: i64) -> Self {
        let age_seconds = (now - quote.timestamp).num_seconds().max(0);
        Self {
            instrument: quote.instrument.clone(),
            market_type: quote.instrument.market_type(),
            source: quote.source,
            price: quote.price,
            bid: quote.bid,
            ask: quote.ask,
            spread: quote.spread,
            volume: quote.volume,
            change_24h: quote.change_24h,
            change_pct_24h: quote.change_pct_24h,
            timestamp: quote.timestamp,
            age_seconds,
            stale: age_seconds > stale_after_secs,
        }
    }
}

/// Largest 24h mover in either direction.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Mover {
    pub instrument: Instrument,
    pub price: Decimal,
    pub change_pct_24h: Decimal,
}

/// One stored point of an instrument's recent price series.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PricePoint {
    pub timestamp: DateTime<Utc>,
    pub price: Decimal,
    pub source: PriceSource,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceHistory {
    pub instrument: Instrument,
    pub points: Vec<PricePoint>,
}

/// Alert categories surfaced on the dashboard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    PortfolioDown,
    NoRecentTrades,
    StaleData,
    MalformedLedgerEvents,
    LedgerUnavailable,
    PriceStoreUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Info,
    Warning,
    Critical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub message: String,
}

impl Alert {
    pub fn new(kind: AlertKind, level: AlertLevel, message: impl Into<String>) -> Self {
        Self {
            kind,
            level,
            message: message.into(),
        }
    }
}

/// Read contract consumed by the dashboard.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DashboardPayload {
    pub portfolio_summary: PortfolioSnapshot,
    pub market_prices: Vec<MarketPrice>,
    pub top_gainer: Option<Mover>,
    pub top_loser: Option<Mover>,
    pub recent_trades: Vec<TradeEvent>,
    pub price_history: Vec<PriceHistory>,
    pub alerts: Vec<Alert>,
    pub last_update: DateTime<Utc>,
    /// Age of the freshest stored quote; `None` when nothing is stored.
    pub data_age_seconds: Option<i64>,
    pub stale: bool,
}

// =============================================================================
// Ingestion
// =============================================================================

/// Outcome of one adapter during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReport {
    pub source: PriceSource,
    pub fetched: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary returned by an ingestion cycle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestionSummary {
    pub run_id: uuid::Uuid,
    pub message: String,
    pub total_fetched: usize,
    /// Newly inserted rows; duplicates are not counted.
    pub saved_count: usize,
    pub duplicate_count: usize,
    pub failed_writes: Vec<String>,
    pub sources: Vec<SourceReport>,
    pub timestamp: DateTime<Utc>,
    pub tracked_instruments: Vec<Instrument>,
}

impl IngestionSummary {
    /// Sources that produced an error this cycle.
    pub fn failed_sources(&self) -> impl Iterator<Item = &SourceReport> {
        self.sources.iter().filter(|r| r.error.is_some())
    }
}
