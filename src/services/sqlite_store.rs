//! SQLite persistence for canonical quotes, the trade ledger and portfolio
//! checkpoints.
//!
//! - `price_quotes`: one row per (instrument, timestamp, source); decimals as TEXT
//! - `trades`: ledger rows in their legacy string shape, ordered by `seq`
//! - `portfolio_checkpoints`: a single fold-state row

use crate::error::{LedgerError, StoreError};
use crate::services::ledger::{normalize_rows, TradeLedger};
use crate::services::portfolio::{Checkpoint, CheckpointStore};
use crate::services::price_store::{PriceStore, UpsertOutcome};
use crate::types::{resolve_latest, Instrument, LedgerRead, PriceQuote, PriceSource, RawTradeRecord};
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

const QUOTE_COLUMNS: &str = "instrument, timestamp_ms, source, price, bid, ask, spread, volume,
     market_cap, high_24h, low_24h, change_24h, change_pct_24h";

/// Quote row as stored, before decimal parsing.
struct QuoteRow {
    instrument: String,
    timestamp_ms: i64,
    source: String,
    decimals: [Option<String>; 10],
}

impl QuoteRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let mut decimals: [Option<String>; 10] = Default::default();
        for (i, slot) in decimals.iter_mut().enumerate() {
            *slot = row.get(3 + i)?;
        }
        Ok(Self {
            instrument: row.get(0)?,
            timestamp_ms: row.get(1)?,
            source: row.get(2)?,
            decimals,
        })
    }

    fn into_quote(self) -> Result<PriceQuote, StoreError> {
        let corrupt = |what: &str| {
            StoreError::Corrupt(format!(
                "{} for {}@{}/{}",
                what, self.instrument, self.timestamp_ms, self.source
            ))
        };

        let source = PriceSource::parse(&self.source).ok_or_else(|| corrupt("unknown source"))?;
        let timestamp = Utc
            .timestamp_millis_opt(self.timestamp_ms)
            .single()
            .ok_or_else(|| corrupt("bad timestamp"))?;

        let mut parsed: [Option<Decimal>; 10] = [None; 10];
        for (slot, text) in parsed.iter_mut().zip(self.decimals.iter()) {
            if let Some(text) = text {
                *slot = Some(Decimal::from_str(text).map_err(|_| corrupt("bad decimal"))?);
            }
        }
        let [price, bid, ask, spread, volume, market_cap, high, low, change, change_pct] = parsed;
        let price = price.ok_or_else(|| corrupt("missing price"))?;

        let mut quote = PriceQuote::new(Instrument::new(&self.instrument), source, price, timestamp)
            .with_volume(volume)
            .with_market_cap(market_cap)
            .with_range_24h(high, low)
            .with_change_24h(change, change_pct);
        quote.bid = bid;
        quote.ask = ask;
        quote.spread = spread;
        Ok(quote)
    }
}

/// SQLite store for quotes, ledger and checkpoints.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create a new SQLite store at the given path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, rusqlite::Error> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        info!("SQLite store initialized");
        Ok(store)
    }

    /// Create an in-memory SQLite store (for testing).
    pub fn new_in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("In-memory SQLite store initialized");
        Ok(store)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, String> {
        self.conn
            .lock()
            .map_err(|_| "connection lock poisoned".to_string())
    }

    /// Initialize database schema.
    fn init_schema(&self) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        conn.execute(
            "CREATE TABLE IF NOT EXISTS price_quotes (
                instrument TEXT NOT NULL,
                timestamp_ms INTEGER NOT NULL,
                source TEXT NOT NULL,
                price TEXT NOT NULL,
                bid TEXT,
                ask TEXT,
                spread TEXT,
                volume TEXT,
                market_cap TEXT,
                high_24h TEXT,
                low_24h TEXT,
                change_24h TEXT,
                change_pct_24h TEXT,
                PRIMARY KEY (instrument, timestamp_ms, source)
            )",
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_quotes_timestamp ON price_quotes(timestamp_ms DESC)",
            [],
        )?;

        // Ledger rows keep the producer's string encoding
        conn.execute(
            "CREATE TABLE IF NOT EXISTS trades (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                trade_id TEXT,
                symbol TEXT,
                action TEXT,
                quantity TEXT,
                price TEXT,
                timestamp TEXT,
                status TEXT,
                pnl TEXT,
                original_trade_id TEXT,
                market_type TEXT
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS portfolio_checkpoints (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                seq INTEGER NOT NULL,
                state_json TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
            [],
        )?;

        info!("SQLite schema initialized");
        Ok(())
    }

    fn query_quotes(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<PriceQuote>, StoreError> {
        let conn = self.lock().map_err(StoreError::Backend)?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, QuoteRow::from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        rows.into_iter().map(QuoteRow::into_quote).collect()
    }

    /// Total stored quotes.
    pub fn quote_count(&self) -> Result<usize, StoreError> {
        let conn = self.lock().map_err(StoreError::Backend)?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM price_quotes", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

// ========== Price Quote Methods ==========

impl PriceStore for SqliteStore {
    fn upsert(&self, quote: &PriceQuote) -> Result<UpsertOutcome, StoreError> {
        let key = quote.key();
        let write_failure = |reason: String| StoreError::WriteFailure {
            key: key.to_string(),
            reason,
        };
        let conn = self.lock().map_err(write_failure)?;

        let text = |d: Option<Decimal>| d.map(|v| v.to_string());
        let changed = conn
            .execute(
                &format!(
                    "INSERT INTO price_quotes ({})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
                     ON CONFLICT(instrument, timestamp_ms, source) DO NOTHING",
                    QUOTE_COLUMNS
                ),
                params![
                    key.instrument.as_str(),
                    key.timestamp_ms,
                    key.source.to_string(),
                    quote.price.to_string(),
                    text(quote.bid),
                    text(quote.ask),
                    text(quote.spread),
                    text(quote.volume),
                    text(quote.market_cap),
                    text(quote.high_24h),
                    text(quote.low_24h),
                    text(quote.change_24h),
                    text(quote.change_pct_24h),
                ],
            )
            .map_err(|e| {
                error!("Failed to store quote {}: {}", key, e);
                write_failure(e.to_string())
            })?;

        Ok(if changed == 0 {
            UpsertOutcome::Duplicate
        } else {
            UpsertOutcome::Inserted
        })
    }

    fn latest_for(&self, instrument: &Instrument) -> Result<Option<PriceQuote>, StoreError> {
        let candidates = self.query_quotes(
            &format!(
                "SELECT {} FROM price_quotes
                 WHERE instrument = ?1
                   AND timestamp_ms = (SELECT MAX(timestamp_ms) FROM price_quotes WHERE instrument = ?1)",
                QUOTE_COLUMNS
            ),
            params![instrument.as_str()],
        )?;
        Ok(resolve_latest(&candidates).cloned())
    }

    fn history(
        &self,
        instrument: &Instrument,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<PriceQuote>, StoreError> {
        // LIMIT -1 means no limit in SQLite
        let limit = limit.map(|l| l as i64).unwrap_or(-1);
        let mut quotes = self.query_quotes(
            &format!(
                "SELECT {} FROM price_quotes
                 WHERE instrument = ?1 AND timestamp_ms >= ?2
                 ORDER BY timestamp_ms DESC, source DESC
                 LIMIT ?3",
                QUOTE_COLUMNS
            ),
            params![instrument.as_str(), since.timestamp_millis(), limit],
        )?;
        quotes.reverse();
        Ok(quotes)
    }

    fn freshest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.lock().map_err(StoreError::Backend)?;
        let max: Option<i64> =
            conn.query_row("SELECT MAX(timestamp_ms) FROM price_quotes", [], |row| row.get(0))?;
        Ok(max.and_then(|ms| Utc.timestamp_millis_opt(ms).single()))
    }
}

// ========== Ledger Methods ==========

impl TradeLedger for SqliteStore {
    fn append(&self, record: &RawTradeRecord) -> Result<i64, LedgerError> {
        let conn = self.lock().map_err(LedgerError::Backend)?;
        conn.execute(
            "INSERT INTO trades
             (trade_id, symbol, action, quantity, price, timestamp, status, pnl,
              original_trade_id, market_type)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.trade_id,
                record.symbol,
                record.action,
                record.quantity,
                record.price,
                record.timestamp,
                record.status,
                record.pnl,
                record.original_trade_id,
                record.market_type,
            ],
        )?;
        let seq = conn.last_insert_rowid();
        debug!("Appended ledger row {} ({:?})", seq, record.trade_id);
        Ok(seq)
    }

    fn read_after(&self, seq: i64) -> Result<LedgerRead, LedgerError> {
        let conn = self.lock().map_err(LedgerError::Backend)?;
        let mut stmt = conn.prepare(
            "SELECT seq, trade_id, symbol, action, quantity, price, timestamp, status, pnl,
                    original_trade_id, market_type
             FROM trades WHERE seq > ?1 ORDER BY seq",
        )?;
        let rows = stmt
            .query_map(params![seq], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    RawTradeRecord {
                        trade_id: row.get(1)?,
                        symbol: row.get(2)?,
                        action: row.get(3)?,
                        quantity: row.get(4)?,
                        price: row.get(5)?,
                        timestamp: row.get(6)?,
                        status: row.get(7)?,
                        pnl: row.get(8)?,
                        original_trade_id: row.get(9)?,
                        market_type: row.get(10)?,
                    },
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(normalize_rows(rows))
    }
}

// ========== Checkpoint Methods ==========

impl CheckpointStore for SqliteStore {
    fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        let conn = self.lock().map_err(StoreError::Backend)?;
        let json: Option<String> = conn
            .query_row(
                "SELECT state_json FROM portfolio_checkpoints WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        json.map(|j| serde_json::from_str(&j).map_err(|e| StoreError::Corrupt(e.to_string())))
            .transpose()
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let json = serde_json::to_string(checkpoint).map_err(|e| StoreError::Backend(e.to_string()))?;
        let conn = self.lock().map_err(StoreError::Backend)?;
        conn.execute(
            "INSERT INTO portfolio_checkpoints (id, seq, state_json, updated_at)
             VALUES (1, ?1, ?2, ?3)
             ON CONFLICT(id) DO UPDATE SET
                seq = excluded.seq,
                state_json = excluded.state_json,
                updated_at = excluded.updated_at",
            params![checkpoint.seq, json, Utc::now().timestamp_millis()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::portfolio::PortfolioFold;
    use chrono::Duration;
    use rust_decimal_macros::dec;

    fn quote(source: PriceSource, at: DateTime<Utc>, price: Decimal) -> PriceQuote {
        PriceQuote::new(Instrument::new("BTC"), source, price, at)
            .with_synthetic_spread(dec!(0.0005))
            .with_volume(Some(dec!(123.45)))
    }

    #[test]
    fn test_quote_upsert_is_idempotent() {
        let store = SqliteStore::new_in_memory().unwrap();
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let q = quote(PriceSource::CoinGecko, at, dec!(50000));

        assert_eq!(store.upsert(&q).unwrap(), UpsertOutcome::Inserted);
        assert_eq!(store.upsert(&q).unwrap(), UpsertOutcome::Duplicate);
        assert_eq!(store.quote_count().unwrap(), 1);

        let stored = store.latest_for(&Instrument::new("BTC")).unwrap().unwrap();
        assert_eq!(stored, q);
    }

    #[test]
    fn test_latest_resolves_ties_by_priority() {
        let store = SqliteStore::new_in_memory().unwrap();
        let at = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        store.upsert(&quote(PriceSource::CoinGecko, at, dec!(1))).unwrap();
        store.upsert(&quote(PriceSource::Binance, at, dec!(2))).unwrap();
        store
            .upsert(&quote(PriceSource::CoinGecko, at - Duration::seconds(60), dec!(3)))
            .unwrap();

        let latest = store.latest_for(&Instrument::new("BTC")).unwrap().unwrap();
        assert_eq!(latest.source, PriceSource::Binance);
        assert_eq!(store.freshest_timestamp().unwrap(), Some(at));
    }

    #[test]
    fn test_history_window() {
        let store = SqliteStore::new_in_memory().unwrap();
        let start = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        for i in 0..5 {
            store
                .upsert(&quote(PriceSource::Binance, start + Duration::minutes(i), Decimal::from(i + 1)))
                .unwrap();
        }
        let btc = Instrument::new("BTC");

        let recent = store.history(&btc, start + Duration::minutes(2), None).unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].price, dec!(3));

        let limited = store.history(&btc, start, Some(2)).unwrap();
        let prices: Vec<Decimal> = limited.iter().map(|q| q.price).collect();
        assert_eq!(prices, vec![dec!(4), dec!(5)]);
    }

    #[test]
    fn test_ledger_round_trip_with_malformed_rows() {
        let store = SqliteStore::new_in_memory().unwrap();
        let good: RawTradeRecord = serde_json::from_str(
            r#"{"tradeId":"a","symbol":"BTC","action":"BUY","quantity":"1","price":"10",
                "timestamp":"2024-01-05T10:30:00","status":"EXECUTED"}"#,
        )
        .unwrap();
        let bad = RawTradeRecord {
            trade_id: Some("b".to_string()),
            ..Default::default()
        };

        assert_eq!(store.append(&good).unwrap(), 1);
        assert_eq!(store.append(&bad).unwrap(), 2);

        let read = store.read_all().unwrap();
        assert_eq!(read.entries.len(), 1);
        assert_eq!(read.malformed, 1);
        assert_eq!(read.entries[0].seq, 1);
        assert!(store.read_after(2).unwrap().entries.is_empty());
    }

    #[test]
    fn test_checkpoint_round_trip() {
        let store = SqliteStore::new_in_memory().unwrap();
        assert!(store.load_checkpoint().unwrap().is_none());

        let checkpoint = Checkpoint {
            seq: 7,
            state: PortfolioFold::new(dec!(50)),
        };
        store.save_checkpoint(&checkpoint).unwrap();
        store.save_checkpoint(&checkpoint).unwrap();
        assert_eq!(store.load_checkpoint().unwrap(), Some(checkpoint));
    }
}
