//! Append-only trade ledger and normalization of legacy ledger rows.

use crate::error::LedgerError;
use crate::sources::unix_to_utc;
use crate::types::{
    Instrument, LedgerEntry, LedgerRead, MarketType, RawTradeRecord, TradeAction, TradeEvent,
    TradeStatus,
};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;
use std::sync::RwLock;
use tracing::warn;

/// Ordered, append-only sequence of trade events.
///
/// Rows are stored in their legacy wire shape and normalized on read.
pub trait TradeLedger: Send + Sync {
    /// Append a row; returns its sequence number.
    fn append(&self, record: &RawTradeRecord) -> Result<i64, LedgerError>;

    /// Entries with a sequence number greater than `seq`, in ledger order.
    fn read_after(&self, seq: i64) -> Result<LedgerRead, LedgerError>;

    fn read_all(&self) -> Result<LedgerRead, LedgerError> {
        self.read_after(0)
    }

    /// Entries whose trade timestamp is at or after `since`.
    fn read_since(&self, since: DateTime<Utc>) -> Result<LedgerRead, LedgerError> {
        let mut read = self.read_all()?;
        read.entries.retain(|e| e.event.timestamp >= since);
        Ok(read)
    }
}

/// Normalize a batch of stored rows, skipping and counting malformed ones.
pub fn normalize_rows(rows: impl IntoIterator<Item = (i64, RawTradeRecord)>) -> LedgerRead {
    let mut read = LedgerRead::default();
    for (seq, raw) in rows {
        read.last_seq = read.last_seq.max(seq);
        match normalize(&raw) {
            Ok(event) => read.entries.push(LedgerEntry { seq, event }),
            Err(e) => {
                warn!("Skipping ledger row {}: {}", seq, e);
                read.malformed += 1;
            }
        }
    }
    read
}

/// Convert one legacy row into a typed event.
pub fn normalize(raw: &RawTradeRecord) -> Result<TradeEvent, LedgerError> {
    let trade_id = non_empty(raw.trade_id.as_deref())
        .ok_or_else(|| malformed("<missing>", "missing tradeId"))?
        .to_string();
    let bad = |reason: String| malformed(&trade_id, &reason);

    let instrument = non_empty(raw.symbol.as_deref())
        .map(Instrument::new)
        .ok_or_else(|| bad("missing symbol".to_string()))?;

    let action = match non_empty(raw.action.as_deref()).map(str::to_uppercase).as_deref() {
        Some("BUY") => TradeAction::Buy,
        Some("SELL") => TradeAction::Sell,
        other => return Err(bad(format!("unknown action {:?}", other))),
    };

    let quantity = positive_decimal(raw.quantity.as_deref())
        .ok_or_else(|| bad(format!("invalid quantity {:?}", raw.quantity)))?;
    let price = positive_decimal(raw.price.as_deref())
        .ok_or_else(|| bad(format!("invalid price {:?}", raw.price)))?;
    if quantity.checked_mul(price).is_none() {
        return Err(bad(format!("notional {} x {} out of range", quantity, price)));
    }

    let timestamp = raw
        .timestamp
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| bad(format!("invalid timestamp {:?}", raw.timestamp)))?;

    let status = parse_status(raw.status.as_deref())
        .ok_or_else(|| bad(format!("unknown status {:?}", raw.status)))?;

    let pnl = match non_empty(raw.pnl.as_deref()) {
        None => None,
        Some(text) if is_null_literal(text) => None,
        Some(text) => Some(parse_decimal(text).ok_or_else(|| bad(format!("invalid pnl {:?}", text)))?),
    };

    let market_type = match non_empty(raw.market_type.as_deref()).map(str::to_lowercase).as_deref() {
        Some("crypto") => MarketType::Crypto,
        Some("forex") => MarketType::Forex,
        _ => instrument.market_type(),
    };

    Ok(TradeEvent {
        trade_id,
        instrument,
        action,
        quantity,
        price,
        timestamp,
        status,
        pnl,
        opened_by: non_empty(raw.original_trade_id.as_deref()).map(str::to_string),
        market_type,
    })
}

fn malformed(trade_id: &str, reason: &str) -> LedgerError {
    LedgerError::Malformed {
        trade_id: trade_id.to_string(),
        reason: reason.to_string(),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn is_null_literal(text: &str) -> bool {
    matches!(text.to_lowercase().as_str(), "none" | "null" | "nan")
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}

fn positive_decimal(text: Option<&str>) -> Option<Decimal> {
    non_empty(text)
        .and_then(parse_decimal)
        .filter(|d| *d > Decimal::ZERO)
}

/// Legacy producers wrote `EXECUTED` for fills; only `CLOSED` (any case)
/// marks a closed leg.
fn parse_status(status: Option<&str>) -> Option<TradeStatus> {
    match non_empty(status).map(str::to_uppercase).as_deref() {
        None | Some("OPEN") | Some("EXECUTED") | Some("FILLED") => Some(TradeStatus::Open),
        Some("CLOSED") => Some(TradeStatus::Closed),
        Some(_) => None,
    }
}

/// RFC 3339, naive ISO-8601 (taken as UTC), or unix seconds/milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, format) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    if let Ok(n) = raw.parse::<i64>() {
        return unix_to_utc(n);
    }
    let value = raw.parse::<f64>().ok().filter(|f| f.is_finite())?;
    let millis = if value > 100_000_000_000.0 { value } else { value * 1000.0 };
    Utc.timestamp_millis_opt(millis.round() as i64).single()
}

/// In-memory ledger.
#[derive(Default)]
pub struct MemoryLedger {
    rows: RwLock<Vec<(i64, RawTradeRecord)>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger pre-filled with typed events.
    pub fn from_events<'a>(events: impl IntoIterator<Item = &'a TradeEvent>) -> Result<Self, LedgerError> {
        let ledger = Self::new();
        for event in events {
            ledger.append(&RawTradeRecord::from_event(event))?;
        }
        Ok(ledger)
    }
}

impl TradeLedger for MemoryLedger {
    fn append(&self, record: &RawTradeRecord) -> Result<i64, LedgerError> {
        let mut rows = self
            .rows
            .write()
            .map_err(|_| LedgerError::Backend("ledger lock poisoned".to_string()))?;
        let seq = rows.last().map(|(seq, _)| seq + 1).unwrap_or(1);
        rows.push((seq, record.clone()));
        Ok(seq)
    }

    fn read_after(&self, seq: i64) -> Result<LedgerRead, LedgerError> {
        let rows = self
            .rows
            .read()
            .map_err(|_| LedgerError::Backend("ledger lock poisoned".to_string()))?;
        Ok(normalize_rows(
            rows.iter().filter(|(s, _)| *s > seq).cloned(),
        ))
    }
}
