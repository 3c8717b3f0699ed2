//! Read-only assembly of the dashboard payload.

use crate::services::ledger::TradeLedger;
use crate::services::portfolio::{compute_snapshot, PortfolioAccountant};
use crate::services::price_store::PriceStore;
use crate::services::SymbolTable;
use crate::types::{
    Alert, AlertKind, AlertLevel, DashboardPayload, Instrument, LedgerRead, MarketPrice, Mover,
    PortfolioSnapshot, PriceHistory, PricePoint, TradeEvent,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::warn;

const RECENT_TRADES_LIMIT: usize = 20;
const RECENT_TRADES_DAYS: i64 = 7;
const HISTORY_POINTS: usize = 100;
const HISTORY_HOURS: i64 = 24;
const PORTFOLIO_DOWN_PCT: f64 = -10.0;

/// Last payload parts that were read successfully.
#[derive(Default)]
struct LastKnown {
    snapshot: Option<PortfolioSnapshot>,
    market_prices: Vec<MarketPrice>,
}

/// Builds the dashboard payload from the accountant and the stores.
///
/// Never fails: read errors become alerts and the last successfully read
/// data (or empty data) is served instead.
pub struct DashboardProjector {
    accountant: Arc<PortfolioAccountant>,
    prices: Arc<dyn PriceStore>,
    ledger: Arc<dyn TradeLedger>,
    symbols: Arc<SymbolTable>,
    stale_threshold_secs: i64,
    last_known: Mutex<LastKnown>,
}

impl DashboardProjector {
    pub fn new(
        accountant: Arc<PortfolioAccountant>,
        prices: Arc<dyn PriceStore>,
        ledger: Arc<dyn TradeLedger>,
        symbols: Arc<SymbolTable>,
        stale_threshold_secs: i64,
    ) -> Self {
        Self {
            accountant,
            prices,
            ledger,
            symbols,
            stale_threshold_secs,
            last_known: Mutex::new(LastKnown::default()),
        }
    }

    pub fn build(&self) -> DashboardPayload {
        self.build_at(Utc::now())
    }

    pub fn build_at(&self, now: DateTime<Utc>) -> DashboardPayload {
        let mut alerts = Vec::new();
        let tracked: Vec<Instrument> = self.symbols.tracked().cloned().collect();

        let portfolio_summary = self.portfolio(&mut alerts);
        let market_prices = self.market_prices(&tracked, now, &mut alerts);
        let recent_trades = self.recent_trades(now, &mut alerts);
        let price_history = self.price_history(&tracked, now);

        let freshest = match self.prices.freshest_timestamp() {
            Ok(ts) => ts,
            Err(_) => market_prices.iter().map(|p| p.timestamp).max(),
        };
        let data_age_seconds = freshest.map(|ts| (now - ts).num_seconds().max(0));
        let stale = data_age_seconds.map_or(true, |age| age > self.stale_threshold_secs);

        if portfolio_summary.total_return_pct < PORTFOLIO_DOWN_PCT {
            alerts.push(Alert::new(
                AlertKind::PortfolioDown,
                AlertLevel::Critical,
                format!(
                    "Portfolio down {:.2}% from initial balance",
                    portfolio_summary.total_return_pct.abs()
                ),
            ));
        }
        if stale {
            let message = match data_age_seconds {
                Some(age) => format!("Latest market data is {} seconds old", age),
                None => "No market data has been stored yet".to_string(),
            };
            alerts.push(Alert::new(AlertKind::StaleData, AlertLevel::Warning, message));
        }
        if portfolio_summary.malformed_events > 0 {
            alerts.push(Alert::new(
                AlertKind::MalformedLedgerEvents,
                AlertLevel::Warning,
                format!(
                    "{} ledger events could not be read and were skipped",
                    portfolio_summary.malformed_events
                ),
            ));
        }

        let (top_gainer, top_loser) = top_movers(&market_prices);

        DashboardPayload {
            portfolio_summary,
            market_prices,
            top_gainer,
            top_loser,
            recent_trades,
            price_history,
            alerts,
            last_update: now,
            data_age_seconds,
            stale,
        }
    }

    fn portfolio(&self, alerts: &mut Vec<Alert>) -> PortfolioSnapshot {
        match self.accountant.snapshot() {
            Ok(snapshot) => {
                if let Ok(mut last) = self.last_known.lock() {
                    last.snapshot = Some(snapshot.clone());
                }
                snapshot
            }
            Err(e) => {
                warn!("Serving last known portfolio, ledger unavailable: {}", e);
                alerts.push(Alert::new(
                    AlertKind::LedgerUnavailable,
                    AlertLevel::Critical,
                    format!("Trade ledger unavailable: {}", e),
                ));
                self.last_known
                    .lock()
                    .ok()
                    .and_then(|last| last.snapshot.clone())
                    .unwrap_or_else(|| {
                        compute_snapshot(
                            &LedgerRead::default(),
                            &HashMap::new(),
                            self.accountant.initial_balance(),
                        )
                    })
            }
        }
    }

    fn market_prices(
        &self,
        tracked: &[Instrument],
        now: DateTime<Utc>,
        alerts: &mut Vec<Alert>,
    ) -> Vec<MarketPrice> {
        match self.prices.latest_quotes(tracked) {
            Ok(quotes) => {
                let prices: Vec<MarketPrice> = tracked
                    .iter()
                    .filter_map(|i| quotes.get(i))
                    .map(|q| MarketPrice::from_quote(q, now, self.stale_threshold_secs))
                    .collect();
                if let Ok(mut last) = self.last_known.lock() {
                    last.market_prices = prices.clone();
                }
                prices
            }
            Err(e) => {
                warn!("Serving last known prices, price store unavailable: {}", e);
                alerts.push(Alert::new(
                    AlertKind::PriceStoreUnavailable,
                    AlertLevel::Critical,
                    format!("Price store unavailable: {}", e),
                ));
                self.last_known
                    .lock()
                    .map(|last| {
                        last.market_prices
                            .iter()
                            .map(|p| refresh_age(p, now, self.stale_threshold_secs))
                            .collect()
                    })
                    .unwrap_or_default()
            }
        }
    }

    fn recent_trades(&self, now: DateTime<Utc>, alerts: &mut Vec<Alert>) -> Vec<TradeEvent> {
        let since = now - Duration::days(RECENT_TRADES_DAYS);
        match self.ledger.read_since(since) {
            Ok(read) => {
                let mut events: Vec<TradeEvent> = read.entries.into_iter().map(|e| e.event).collect();
                if events.is_empty() {
                    alerts.push(Alert::new(
                        AlertKind::NoRecentTrades,
                        AlertLevel::Info,
                        format!("No trades in the last {} days", RECENT_TRADES_DAYS),
                    ));
                }
                events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
                events.truncate(RECENT_TRADES_LIMIT);
                events
            }
            Err(e) => {
                warn!("Recent trades unavailable: {}", e);
                if !alerts.iter().any(|a| a.kind == AlertKind::LedgerUnavailable) {
                    alerts.push(Alert::new(
                        AlertKind::LedgerUnavailable,
                        AlertLevel::Critical,
                        format!("Trade ledger unavailable: {}", e),
                    ));
                }
                Vec::new()
            }
        }
    }

    fn price_history(&self, tracked: &[Instrument], now: DateTime<Utc>) -> Vec<PriceHistory> {
        let since = now - Duration::hours(HISTORY_HOURS);
        tracked
            .iter()
            .filter_map(|instrument| {
                let quotes = match self.prices.history(instrument, since, Some(HISTORY_POINTS)) {
                    Ok(quotes) => quotes,
                    Err(e) => {
                        warn!("History for {} unavailable: {}", instrument, e);
                        return None;
                    }
                };
                if quotes.is_empty() {
                    return None;
                }
                Some(PriceHistory {
                    instrument: instrument.clone(),
                    points: quotes
                        .into_iter()
                        .map(|q| PricePoint {
                            timestamp: q.timestamp,
                            price: q.price,
                            source: q.source,
                        })
                        .collect(),
                })
            })
            .collect()
    }
}

fn refresh_age(price: &MarketPrice, now: DateTime<Utc>, stale_after_secs: i64) -> MarketPrice {
    let mut price = price.clone();
    price.age_seconds = (now - price.timestamp).num_seconds().max(0);
    price.stale = price.age_seconds > stale_after_secs;
    price
}

/// Best and worst 24h change among prices that report one.
fn top_movers(prices: &[MarketPrice]) -> (Option<Mover>, Option<Mover>) {
    let with_change: Vec<Mover> = prices
        .iter()
        .filter_map(|p| {
            p.change_pct_24h.map(|pct| Mover {
                instrument: p.instrument.clone(),
                price: p.price,
                change_pct_24h: pct,
            })
        })
        .collect();

    let gainer = with_change.iter().max_by_key(|m| m.change_pct_24h).cloned();
    let loser = with_change.iter().min_by_key(|m| m.change_pct_24h).cloned();
    (gainer, loser)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{LedgerError, StoreError};
    use crate::services::ledger::MemoryLedger;
    use crate::services::price_store::{MemoryPriceStore, UpsertOutcome};
    use crate::types::{PriceQuote, PriceSource, RawTradeRecord};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    fn projector(
        prices: Arc<dyn PriceStore>,
        ledger: Arc<dyn TradeLedger>,
    ) -> DashboardProjector {
        let symbols = Arc::new(
            SymbolTable::new(vec![Instrument::new("BTC"), Instrument::new("ETH")]).unwrap(),
        );
        let accountant = Arc::new(PortfolioAccountant::new(ledger.clone(), prices.clone(), dec!(50)));
        DashboardProjector::new(accountant, prices, ledger, symbols, 900)
    }

    fn quote(code: &str, age_secs: i64, pct: rust_decimal::Decimal) -> PriceQuote {
        PriceQuote::new(
            Instrument::new(code),
            PriceSource::Binance,
            dec!(100),
            now() - Duration::seconds(age_secs),
        )
        .with_change_24h(None, Some(pct))
    }

    #[test]
    fn test_fresh_payload() {
        let store = Arc::new(MemoryPriceStore::new());
        store.upsert(&quote("BTC", 60, dec!(3.5))).unwrap();
        store.upsert(&quote("ETH", 30, dec!(-1.2))).unwrap();

        let payload = projector(store, Arc::new(MemoryLedger::new())).build_at(now());
        assert_eq!(payload.market_prices.len(), 2);
        assert_eq!(payload.data_age_seconds, Some(30));
        assert!(!payload.stale);
        assert_eq!(payload.top_gainer.unwrap().instrument.as_str(), "BTC");
        assert_eq!(payload.top_loser.unwrap().instrument.as_str(), "ETH");
        assert_eq!(payload.price_history.len(), 2);
        assert!(payload.alerts.iter().any(|a| a.kind == AlertKind::NoRecentTrades));
        assert!(!payload.alerts.iter().any(|a| a.kind == AlertKind::StaleData));
    }

    #[test]
    fn test_empty_store_is_stale_not_error() {
        let payload = projector(Arc::new(MemoryPriceStore::new()), Arc::new(MemoryLedger::new()))
            .build_at(now());
        assert!(payload.stale);
        assert_eq!(payload.data_age_seconds, None);
        assert!(payload.market_prices.is_empty());
        assert!(payload.alerts.iter().any(|a| a.kind == AlertKind::StaleData));
    }

    #[test]
    fn test_recent_trades_newest_first_and_capped() {
        let ledger = Arc::new(MemoryLedger::new());
        for i in 0..25 {
            let ts = now() - Duration::hours(i);
            ledger
                .append(&RawTradeRecord {
                    trade_id: Some(format!("t{}", i)),
                    symbol: Some("BTC".to_string()),
                    action: Some("BUY".to_string()),
                    quantity: Some("1".to_string()),
                    price: Some("10".to_string()),
                    timestamp: Some(ts.to_rfc3339()),
                    ..Default::default()
                })
                .unwrap();
        }
        // Older than the window
        ledger
            .append(&RawTradeRecord {
                trade_id: Some("old".to_string()),
                symbol: Some("BTC".to_string()),
                action: Some("BUY".to_string()),
                quantity: Some("1".to_string()),
                price: Some("10".to_string()),
                timestamp: Some((now() - Duration::days(30)).to_rfc3339()),
                ..Default::default()
            })
            .unwrap();

        let payload = projector(Arc::new(MemoryPriceStore::new()), ledger).build_at(now());
        assert_eq!(payload.recent_trades.len(), 20);
        assert_eq!(payload.recent_trades[0].trade_id, "t0");
        assert_eq!(payload.portfolio_summary.total_trades, 26);
        assert!(!payload.alerts.iter().any(|a| a.kind == AlertKind::NoRecentTrades));
    }

    struct BrokenLedger;

    impl TradeLedger for BrokenLedger {
        fn append(&self, _record: &RawTradeRecord) -> Result<i64, LedgerError> {
            Err(LedgerError::Backend("offline".to_string()))
        }

        fn read_after(&self, _seq: i64) -> Result<LedgerRead, LedgerError> {
            Err(LedgerError::Backend("offline".to_string()))
        }
    }

    struct BrokenStore;

    impl PriceStore for BrokenStore {
        fn upsert(&self, _quote: &PriceQuote) -> Result<UpsertOutcome, StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }

        fn latest_for(&self, _instrument: &Instrument) -> Result<Option<PriceQuote>, StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }

        fn history(
            &self,
            _instrument: &Instrument,
            _since: DateTime<Utc>,
            _limit: Option<usize>,
        ) -> Result<Vec<PriceQuote>, StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }

        fn freshest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            Err(StoreError::Backend("offline".to_string()))
        }
    }

    #[test]
    fn test_backend_failures_become_alerts() {
        let payload = projector(Arc::new(BrokenStore), Arc::new(BrokenLedger)).build_at(now());

        let kinds: Vec<AlertKind> = payload.alerts.iter().map(|a| a.kind).collect();
        assert_eq!(
            kinds.iter().filter(|k| **k == AlertKind::LedgerUnavailable).count(),
            1
        );
        assert!(kinds.contains(&AlertKind::PriceStoreUnavailable));
        assert!(kinds.contains(&AlertKind::StaleData));
        assert_eq!(payload.portfolio_summary.current_balance, dec!(50));
    }
}
