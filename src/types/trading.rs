use super::{Instrument, MarketType, PriceSource};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

// =============================================================================
// Ledger Events
// =============================================================================

/// Trade direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeAction {
    Buy,
    Sell,
}

impl fmt::Display for TradeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TradeAction::Buy => write!(f, "BUY"),
            TradeAction::Sell => write!(f, "SELL"),
        }
    }
}

/// Normalized trade status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeStatus {
    Open,
    Closed,
}

/// A normalized, immutable ledger event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeEvent {
    pub trade_id: String,
    pub instrument: Instrument,
    pub action: TradeAction,
    pub quantity: Decimal,
    pub price: Decimal,
    pub timestamp: DateTime<Utc>,
    pub status: TradeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pnl: Option<Decimal>,
    /// Trade id of the opening leg this event closes, when recorded.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_by: Option<String>,
    pub market_type: MarketType,
}

/// Role of an event in position accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegKind {
    /// Establishes an open position.
    Opening,
    /// Realizes profit or loss.
    Closing,
    /// Counted as a trade but affects no other aggregate.
    Unclassified,
}

impl TradeEvent {
    /// The single place deciding whether an event opens or closes a position.
    pub fn classify(&self) -> LegKind {
        let realized = self.pnl.is_some();
        if realized && (self.action == TradeAction::Sell || self.status == TradeStatus::Closed) {
            LegKind::Closing
        } else if self.action == TradeAction::Buy && self.status != TradeStatus::Closed {
            LegKind::Opening
        } else {
            LegKind::Unclassified
        }
    }
}

/// Ledger event together with its append sequence number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub seq: i64,
    #[serde(flatten)]
    pub event: TradeEvent,
}

/// Result of reading the ledger: well-formed entries plus the number of
/// rows that could not be normalized.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerRead {
    pub entries: Vec<LedgerEntry>,
    pub malformed: usize,
    /// Highest sequence number read, malformed rows included.
    pub last_seq: i64,
}

/// Legacy ledger row as written by the trade producer.
///
/// Numbers may arrive as strings or JSON numbers, status is free text and
/// pnl may be missing, null, empty or the literal `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawTradeRecord {
    #[serde(default, deserialize_with = "lenient_string")]
    pub trade_id: Option<String>,
    #[serde(default, alias = "instrument", deserialize_with = "lenient_string")]
    pub symbol: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub action: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub quantity: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub price: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub timestamp: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub pnl: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub original_trade_id: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub market_type: Option<String>,
}

impl RawTradeRecord {
    /// Build a raw row from a typed event (used by producers and tests).
    pub fn from_event(event: &TradeEvent) -> Self {
        Self {
            trade_id: Some(event.trade_id.clone()),
            symbol: Some(event.instrument.to_string()),
            action: Some(event.action.to_string()),
            quantity: Some(event.quantity.to_string()),
            price: Some(event.price.to_string()),
            timestamp: Some(event.timestamp.to_rfc3339()),
            status: Some(match event.status {
                TradeStatus::Open => "OPEN".to_string(),
                TradeStatus::Closed => "CLOSED".to_string(),
            }),
            pnl: event.pnl.map(|p| p.to_string()),
            original_trade_id: event.opened_by.clone(),
            market_type: Some(event.market_type.to_string()),
        }
    }
}

/// Accept strings, numbers, booleans or null and keep the textual form.
fn lenient_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(match value {
        None | Some(serde_json::Value::Null) => None,
        Some(serde_json::Value::String(s)) => Some(s),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        Some(serde_json::Value::Bool(b)) => Some(b.to_string()),
        Some(other) => Some(other.to_string()),
    })
}

// =============================================================================
// Derived Portfolio State
// =============================================================================

/// An open position reconstructed from an unmatched opening leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Position {
    pub trade_id: String,
    pub instrument: Instrument,
    pub quantity: Decimal,
    pub entry_price: Decimal,
    pub entry_time: DateTime<Utc>,
    pub current_price: Decimal,
    /// Source of `current_price`; `None` when it fell back to the entry price.
    pub price_source: Option<PriceSource>,
    pub cost_basis: Decimal,
    pub position_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub unrealized_pnl_pct: f64,
}

/// Profit factor, undefined when there are no losing trades.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ProfitFactor {
    Ratio(Decimal),
    Undefined,
}

impl Serialize for ProfitFactor {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            ProfitFactor::Ratio(value) => Serialize::serialize(value, serializer),
            ProfitFactor::Undefined => serializer.serialize_str("N/A"),
        }
    }
}

/// Risk metrics derived from the realized equity curve.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RiskMetrics {
    pub sharpe_ratio: f64,
    /// Largest peak-to-trough decline, as a non-positive percentage.
    pub max_drawdown: f64,
    /// Standard deviation of per-trade returns, in percent.
    pub volatility: f64,
    /// 5th percentile of daily returns, in percent.
    #[serde(rename = "dailyVaR")]
    pub daily_var: f64,
}

/// Point-in-time portfolio aggregate recomputed from the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioSnapshot {
    pub initial_balance: Decimal,
    pub current_balance: Decimal,
    pub realized_pnl: Decimal,
    pub unrealized_pnl: Decimal,
    pub portfolio_value: Decimal,
    #[serde(rename = "totalPnL")]
    pub total_pnl: Decimal,
    pub total_return_pct: f64,
    pub win_rate: f64,
    pub open_positions: Vec<Position>,
    pub total_trades: usize,
    pub closed_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub largest_win: Decimal,
    pub largest_loss: Decimal,
    pub best_streak: u32,
    pub worst_streak: u32,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: ProfitFactor,
    pub expectancy: Decimal,
    pub risk: RiskMetrics,
    pub malformed_events: usize,
}
