//! Portfolio accounting as a left fold over ledger events.
//!
//! [`PortfolioFold`] consumes events in timestamp order (ties by ledger
//! sequence) and keeps everything a snapshot needs. Its state is serializable so it can be checkpointed with
//! the ledger sequence number it covers; resuming from a checkpoint and
//! applying the remaining events gives the same snapshot as a full pass.

use crate::error::{LedgerError, StoreError};
use crate::services::ledger::TradeLedger;
use crate::services::price_store::PriceStore;
use crate::types::{
    Instrument, LedgerEntry, LedgerRead, LegKind, PortfolioSnapshot, Position, PriceQuote,
    ProfitFactor, RiskMetrics, TradeEvent,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// An opening leg not yet matched by a closing leg.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OpenLeg {
    trade_id: String,
    instrument: Instrument,
    quantity: Decimal,
    entry_price: Decimal,
    entry_time: DateTime<Utc>,
}

/// Running pnl of one UTC day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DayPnl {
    start_balance: Decimal,
    pnl: Decimal,
}

/// Fold state over the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioFold {
    initial_balance: Decimal,
    balance: Decimal,
    last_seq: i64,
    total_trades: usize,
    closed_trades: usize,
    winning_trades: usize,
    losing_trades: usize,
    malformed_events: usize,
    gross_profit: Decimal,
    gross_loss: Decimal,
    largest_win: Decimal,
    largest_loss: Decimal,
    win_streak: u32,
    loss_streak: u32,
    best_streak: u32,
    worst_streak: u32,
    open_legs: Vec<OpenLeg>,
    /// Balance after each closing leg, starting with the initial balance.
    equity_curve: Vec<Decimal>,
    /// pnl / balance before, per closing leg.
    returns: Vec<Decimal>,
    daily: BTreeMap<NaiveDate, DayPnl>,
    /// Latest timestamp among folded events.
    #[serde(default)]
    latest_timestamp: Option<DateTime<Utc>>,
}

/// Totals a closing leg produces, computed before any state changes.
struct ClosingTotals {
    pnl: Decimal,
    balance: Decimal,
    gross_profit: Decimal,
    gross_loss: Decimal,
    day_pnl: Decimal,
}

impl PortfolioFold {
    pub fn new(initial_balance: Decimal) -> Self {
        Self {
            initial_balance,
            balance: initial_balance,
            last_seq: 0,
            total_trades: 0,
            closed_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            malformed_events: 0,
            gross_profit: Decimal::ZERO,
            gross_loss: Decimal::ZERO,
            largest_win: Decimal::ZERO,
            largest_loss: Decimal::ZERO,
            win_streak: 0,
            loss_streak: 0,
            best_streak: 0,
            worst_streak: 0,
            open_legs: Vec::new(),
            equity_curve: vec![initial_balance],
            returns: Vec::new(),
            daily: BTreeMap::new(),
            latest_timestamp: None,
        }
    }

    pub fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }

    /// Highest ledger sequence number folded so far.
    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    /// Instruments with open legs.
    pub fn open_instruments(&self) -> Vec<Instrument> {
        let mut instruments: Vec<Instrument> =
            self.open_legs.iter().map(|l| l.instrument.clone()).collect();
        instruments.sort();
        instruments.dedup();
        instruments
    }

    /// Fold a whole ledger read, including its malformed count. Entries are
    /// applied in `(timestamp, seq)` order.
    pub fn apply_read(&mut self, read: &LedgerRead) {
        let mut entries: Vec<&LedgerEntry> = read.entries.iter().collect();
        entries.sort_by_key(|e| (e.event.timestamp, e.seq));
        for entry in entries {
            self.apply(entry);
        }
        self.malformed_events += read.malformed;
        self.last_seq = self.last_seq.max(read.last_seq);
    }

    /// Whether `read` can be folded on top of this state with the same
    /// result as a full pass: no new event predates one already folded.
    pub fn continues_with(&self, read: &LedgerRead) -> bool {
        match self.latest_timestamp {
            Some(latest) => read.entries.iter().all(|e| e.event.timestamp >= latest),
            None => true,
        }
    }

    pub fn apply(&mut self, entry: &LedgerEntry) {
        self.last_seq = self.last_seq.max(entry.seq);

        let event = &entry.event;
        self.latest_timestamp = Some(
            self.latest_timestamp
                .map_or(event.timestamp, |t| t.max(event.timestamp)),
        );
        let kind = event.classify();
        let closing = match (kind, event.pnl) {
            (LegKind::Closing, Some(pnl)) => match self.closing_totals(event, pnl) {
                Some(totals) => Some(totals),
                None => {
                    warn!("Skipping trade {}: pnl {} out of range", event.trade_id, pnl);
                    self.malformed_events += 1;
                    return;
                }
            },
            _ => None,
        };

        self.total_trades += 1;

        match kind {
            LegKind::Opening => self.open_legs.push(OpenLeg {
                trade_id: event.trade_id.clone(),
                instrument: event.instrument.clone(),
                quantity: event.quantity,
                entry_price: event.price,
                entry_time: event.timestamp,
            }),
            LegKind::Closing => {
                if let Some(totals) = closing {
                    self.close(event, totals);
                }
            }
            LegKind::Unclassified => {
                debug!("Trade {} neither opens nor closes a position", event.trade_id)
            }
        }
    }

    /// Running totals after a closing leg, or `None` if any would overflow.
    fn closing_totals(&self, event: &TradeEvent, pnl: Decimal) -> Option<ClosingTotals> {
        let day = event.timestamp.date_naive();
        let day_pnl = self.daily.get(&day).map_or(Decimal::ZERO, |d| d.pnl);
        Some(ClosingTotals {
            pnl,
            balance: self.balance.checked_add(pnl)?,
            gross_profit: if pnl > Decimal::ZERO {
                self.gross_profit.checked_add(pnl)?
            } else {
                self.gross_profit
            },
            gross_loss: if pnl < Decimal::ZERO {
                self.gross_loss.checked_add(-pnl)?
            } else {
                self.gross_loss
            },
            day_pnl: day_pnl.checked_add(pnl)?,
        })
    }

    fn close(&mut self, event: &TradeEvent, totals: ClosingTotals) {
        let ClosingTotals {
            pnl,
            balance,
            gross_profit,
            gross_loss,
            day_pnl,
        } = totals;

        let matched = match &event.opened_by {
            Some(id) => self.open_legs.iter().position(|l| &l.trade_id == id),
            None => self
                .open_legs
                .iter()
                .position(|l| l.instrument == event.instrument),
        };
        if let Some(index) = matched {
            self.open_legs.remove(index);
        }

        let balance_before = self.balance;
        self.balance = balance;
        self.gross_profit = gross_profit;
        self.gross_loss = gross_loss;
        self.closed_trades += 1;
        self.equity_curve.push(balance);
        if balance_before > Decimal::ZERO {
            if let Some(ret) = pnl.checked_div(balance_before) {
                self.returns.push(ret);
            }
        }

        self.daily
            .entry(event.timestamp.date_naive())
            .or_insert(DayPnl {
                start_balance: balance_before,
                pnl: Decimal::ZERO,
            })
            .pnl = day_pnl;

        if pnl > Decimal::ZERO {
            self.winning_trades += 1;
            self.largest_win = self.largest_win.max(pnl);
            self.win_streak += 1;
            self.loss_streak = 0;
            self.best_streak = self.best_streak.max(self.win_streak);
        } else if pnl < Decimal::ZERO {
            self.losing_trades += 1;
            self.largest_loss = self.largest_loss.min(pnl);
            self.loss_streak += 1;
            self.win_streak = 0;
            self.worst_streak = self.worst_streak.max(self.loss_streak);
        }
    }

    /// Mark open legs to market and build the snapshot.
    pub fn finish(&self, prices: &HashMap<Instrument, PriceQuote>) -> PortfolioSnapshot {
        let open_positions: Vec<Position> = self
            .open_legs
            .iter()
            .map(|leg| mark_to_market(leg, prices.get(&leg.instrument)))
            .collect();

        let realized_pnl = self.balance.saturating_sub(self.initial_balance);
        let unrealized_pnl = open_positions
            .iter()
            .fold(Decimal::ZERO, |sum, p| sum.saturating_add(p.unrealized_pnl));

        let total_return_pct = percent_of(realized_pnl, self.initial_balance);
        let win_rate = if self.total_trades > 0 {
            self.winning_trades as f64 / self.total_trades as f64 * 100.0
        } else {
            0.0
        };

        let avg_win = average(self.gross_profit, self.winning_trades);
        let avg_loss = average(self.gross_loss, self.losing_trades);
        let profit_factor = match self.gross_profit.checked_div(self.gross_loss) {
            Some(ratio) if self.losing_trades > 0 => ProfitFactor::Ratio(ratio.round_dp(4)),
            _ => ProfitFactor::Undefined,
        };

        PortfolioSnapshot {
            initial_balance: self.initial_balance,
            current_balance: self.balance,
            realized_pnl,
            unrealized_pnl,
            portfolio_value: self.balance.saturating_add(unrealized_pnl),
            total_pnl: realized_pnl,
            total_return_pct,
            win_rate,
            open_positions,
            total_trades: self.total_trades,
            closed_trades: self.closed_trades,
            winning_trades: self.winning_trades,
            losing_trades: self.losing_trades,
            largest_win: self.largest_win,
            largest_loss: self.largest_loss,
            best_streak: self.best_streak,
            worst_streak: self.worst_streak,
            avg_win,
            avg_loss,
            profit_factor,
            expectancy: average(realized_pnl, self.closed_trades),
            risk: self.risk_metrics(),
            malformed_events: self.malformed_events,
        }
    }

    fn risk_metrics(&self) -> RiskMetrics {
        let returns: Vec<f64> = self.returns.iter().map(|r| to_f64(*r)).collect();
        let (mean, std) = mean_and_std(&returns);
        let sharpe_ratio = if returns.len() < 2 || std == 0.0 {
            0.0
        } else {
            mean / std
        };

        let daily_returns: Vec<f64> = self
            .daily
            .values()
            .filter(|d| d.start_balance > Decimal::ZERO)
            .map(|d| percent_of(d.pnl, d.start_balance))
            .collect();

        RiskMetrics {
            sharpe_ratio,
            max_drawdown: max_drawdown(&self.equity_curve),
            volatility: std * 100.0,
            daily_var: percentile(&daily_returns, 5.0),
        }
    }
}

fn mark_to_market(leg: &OpenLeg, quote: Option<&PriceQuote>) -> Position {
    let (current_price, price_source) = match quote {
        Some(q) => (q.price, Some(q.source)),
        None => (leg.entry_price, None),
    };
    let cost_basis = leg.quantity.saturating_mul(leg.entry_price);
    let position_value = leg.quantity.saturating_mul(current_price);
    let unrealized_pnl = position_value.saturating_sub(cost_basis);
    let unrealized_pnl_pct = percent_of(unrealized_pnl, cost_basis);

    Position {
        trade_id: leg.trade_id.clone(),
        instrument: leg.instrument.clone(),
        quantity: leg.quantity,
        entry_price: leg.entry_price,
        entry_time: leg.entry_time,
        current_price,
        price_source,
        cost_basis,
        position_value,
        unrealized_pnl,
        unrealized_pnl_pct,
    }
}

fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

/// `part / whole` in percent; 0 for a non-positive whole or out-of-range ratio.
fn percent_of(part: Decimal, whole: Decimal) -> f64 {
    if whole <= Decimal::ZERO {
        return 0.0;
    }
    part.checked_div(whole)
        .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        .map_or(0.0, to_f64)
}

fn average(total: Decimal, count: usize) -> Decimal {
    if count == 0 {
        Decimal::ZERO
    } else {
        (total / Decimal::from(count)).round_dp(8)
    }
}

/// Mean and population standard deviation.
fn mean_and_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

/// Largest peak-to-trough decline of an equity curve, in percent (<= 0).
pub fn max_drawdown(curve: &[Decimal]) -> f64 {
    let mut peak = match curve.first() {
        Some(first) => *first,
        None => return 0.0,
    };
    let mut worst = 0.0_f64;
    for balance in curve {
        peak = peak.max(*balance);
        if let Some(decline) = balance.checked_sub(peak) {
            worst = worst.min(percent_of(decline, peak));
        }
    }
    worst
}

/// Linear-interpolated percentile (`pct` in 0..=100); 0 for an empty series.
pub fn percentile(values: &[f64], pct: f64) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let rank = pct / 100.0 * (sorted.len() - 1) as f64;
    let lower = rank.floor() as usize;
    let upper = rank.ceil() as usize;
    sorted[lower] + (sorted[upper] - sorted[lower]) * (rank - lower as f64)
}

/// Full recompute of a snapshot from a ledger read.
pub fn compute_snapshot(
    read: &LedgerRead,
    prices: &HashMap<Instrument, PriceQuote>,
    initial_balance: Decimal,
) -> PortfolioSnapshot {
    let mut fold = PortfolioFold::new(initial_balance);
    fold.apply_read(read);
    fold.finish(prices)
}

// =============================================================================
// Checkpoints
// =============================================================================

/// Persisted fold state together with the ledger position it covers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub seq: i64,
    pub state: PortfolioFold,
}

pub trait CheckpointStore: Send + Sync {
    fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError>;
    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct MemoryCheckpoints {
    slot: Mutex<Option<Checkpoint>>,
}

impl CheckpointStore for MemoryCheckpoints {
    fn load_checkpoint(&self) -> Result<Option<Checkpoint>, StoreError> {
        self.slot
            .lock()
            .map(|slot| slot.clone())
            .map_err(|_| StoreError::Backend("checkpoint lock poisoned".to_string()))
    }

    fn save_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StoreError> {
        let mut slot = self
            .slot
            .lock()
            .map_err(|_| StoreError::Backend("checkpoint lock poisoned".to_string()))?;
        *slot = Some(checkpoint.clone());
        Ok(())
    }
}

/// Derives portfolio snapshots from the ledger and the price store.
pub struct PortfolioAccountant {
    ledger: Arc<dyn TradeLedger>,
    prices: Arc<dyn PriceStore>,
    checkpoints: Option<Arc<dyn CheckpointStore>>,
    initial_balance: Decimal,
}

impl PortfolioAccountant {
    pub fn new(ledger: Arc<dyn TradeLedger>, prices: Arc<dyn PriceStore>, initial_balance: Decimal) -> Self {
        Self {
            ledger,
            prices,
            checkpoints: None,
            initial_balance,
        }
    }

    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Fold state covering the whole ledger. Resumes from a checkpoint when
    /// one exists for the same initial balance and every event appended
    /// since is no older than the events it covers; otherwise recomputes.
    pub fn fold(&self) -> Result<PortfolioFold, LedgerError> {
        let resumed = self.checkpoints.as_ref().and_then(|store| match store.load_checkpoint() {
            Ok(Some(cp)) if cp.state.initial_balance() == self.initial_balance => Some(cp),
            Ok(_) => None,
            Err(e) => {
                warn!("Ignoring unreadable portfolio checkpoint: {}", e);
                None
            }
        });

        let (mut fold, read) = match resumed {
            Some(cp) => {
                let read = self.ledger.read_after(cp.seq)?;
                if cp.state.continues_with(&read) {
                    debug!("Resuming portfolio fold from seq {}", cp.seq);
                    (cp.state, read)
                } else {
                    info!("Backdated trades after seq {}, recomputing portfolio", cp.seq);
                    (PortfolioFold::new(self.initial_balance), self.ledger.read_all()?)
                }
            }
            None => (PortfolioFold::new(self.initial_balance), self.ledger.read_all()?),
        };

        let covered = fold.last_seq();
        fold.apply_read(&read);

        if let (Some(store), true) = (&self.checkpoints, fold.last_seq() > covered) {
            let checkpoint = Checkpoint {
                seq: fold.last_seq(),
                state: fold.clone(),
            };
            match store.save_checkpoint(&checkpoint) {
                Ok(()) => info!("Saved portfolio checkpoint at seq {}", checkpoint.seq),
                Err(e) => warn!("Failed to save portfolio checkpoint: {}", e),
            }
        }

        Ok(fold)
    }

    /// Current snapshot. A price store failure degrades open positions to
    /// entry prices; a ledger failure is returned.
    pub fn snapshot(&self) -> Result<PortfolioSnapshot, LedgerError> {
        let fold = self.fold()?;
        let prices = match self.prices.latest_quotes(&fold.open_instruments()) {
            Ok(prices) => prices,
            Err(e) => {
                warn!("Marking positions at entry price, price store unavailable: {}", e);
                HashMap::new()
            }
        };
        Ok(fold.finish(&prices))
    }

    pub fn initial_balance(&self) -> Decimal {
        self.initial_balance
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{MarketType, PriceSource, TradeAction, TradeStatus};
    use chrono::TimeZone;
    use rust_decimal_macros::dec;

    fn entry(seq: i64, action: TradeAction, code: &str, pnl: Option<Decimal>, day: u32) -> LedgerEntry {
        LedgerEntry {
            seq,
            event: TradeEvent {
                trade_id: format!("t{}", seq),
                instrument: Instrument::new(code),
                action,
                quantity: dec!(2),
                price: dec!(10),
                timestamp: Utc.with_ymd_and_hms(2024, 1, day, 12, 0, 0).unwrap(),
                status: TradeStatus::Open,
                pnl,
                opened_by: None,
                market_type: MarketType::Crypto,
            },
        }
    }

    fn read(entries: Vec<LedgerEntry>) -> LedgerRead {
        let last_seq = entries.iter().map(|e| e.seq).max().unwrap_or(0);
        LedgerRead {
            entries,
            malformed: 0,
            last_seq,
        }
    }

    #[test]
    fn test_drawdown_example() {
        let curve = [dec!(50), dec!(55), dec!(48), dec!(60)];
        assert!((max_drawdown(&curve) - (-12.7272727)).abs() < 1e-4);
    }

    #[test]
    fn test_percentile_interpolates() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert!((percentile(&values, 5.0) - 1.2).abs() < 1e-9);
        assert_eq!(percentile(&[], 5.0), 0.0);
    }

    #[test]
    fn test_fifo_matching_closes_oldest_leg() {
        let ledger = read(vec![
            entry(1, TradeAction::Buy, "BTC", None, 1),
            entry(2, TradeAction::Buy, "BTC", None, 2),
            entry(3, TradeAction::Sell, "BTC", Some(dec!(3)), 3),
        ]);
        let snap = compute_snapshot(&ledger, &HashMap::new(), dec!(50));
        assert_eq!(snap.open_positions.len(), 1);
        assert_eq!(snap.open_positions[0].trade_id, "t2");
    }

    #[test]
    fn test_opened_by_matching() {
        let mut close = entry(3, TradeAction::Sell, "BTC", Some(dec!(1)), 3);
        close.event.opened_by = Some("t2".to_string());
        let ledger = read(vec![
            entry(1, TradeAction::Buy, "BTC", None, 1),
            entry(2, TradeAction::Buy, "BTC", None, 2),
            close,
        ]);
        let snap = compute_snapshot(&ledger, &HashMap::new(), dec!(50));
        assert_eq!(snap.open_positions[0].trade_id, "t1");
    }

    #[test]
    fn test_mark_to_market_and_fallback() {
        let ledger = read(vec![
            entry(1, TradeAction::Buy, "BTC", None, 1),
            entry(2, TradeAction::Buy, "ETH", None, 1),
        ]);
        let mut prices = HashMap::new();
        prices.insert(
            Instrument::new("BTC"),
            PriceQuote::new(Instrument::new("BTC"), PriceSource::Binance, dec!(12), Utc::now()),
        );

        let snap = compute_snapshot(&ledger, &prices, dec!(50));
        let btc = &snap.open_positions[0];
        assert_eq!(btc.unrealized_pnl, dec!(4));
        assert_eq!(btc.price_source, Some(PriceSource::Binance));
        assert!((btc.unrealized_pnl_pct - 20.0).abs() < 1e-9);

        let eth = &snap.open_positions[1];
        assert_eq!(eth.current_price, dec!(10));
        assert_eq!(eth.price_source, None);
        assert_eq!(snap.portfolio_value, dec!(54));
        assert_eq!(snap.total_pnl, Decimal::ZERO);
    }

    #[test]
    fn test_streaks_and_averages() {
        let pnls = [dec!(2), dec!(3), dec!(0), dec!(1), dec!(-1), dec!(-2), dec!(4)];
        let entries = pnls
            .iter()
            .enumerate()
            .map(|(i, p)| entry(i as i64 + 1, TradeAction::Sell, "BTC", Some(*p), 1))
            .collect();
        let snap = compute_snapshot(&read(entries), &HashMap::new(), dec!(50));

        assert_eq!(snap.best_streak, 3);
        assert_eq!(snap.worst_streak, 2);
        assert_eq!(snap.largest_win, dec!(4));
        assert_eq!(snap.largest_loss, dec!(-2));
        assert_eq!(snap.avg_win, dec!(2.5));
        assert_eq!(snap.avg_loss, dec!(1.5));
        assert_eq!(snap.profit_factor, ProfitFactor::Ratio(dec!(3.3333)));
        assert_eq!(snap.expectancy, dec!(1));
        assert_eq!(snap.current_balance, dec!(57));
    }

    #[test]
    fn test_no_losses_profit_factor_undefined() {
        let snap = compute_snapshot(
            &read(vec![entry(1, TradeAction::Sell, "BTC", Some(dec!(5)), 1)]),
            &HashMap::new(),
            dec!(50),
        );
        assert_eq!(snap.profit_factor, ProfitFactor::Undefined);
        assert_eq!(snap.largest_loss, Decimal::ZERO);
        assert_eq!(snap.risk.sharpe_ratio, 0.0);
    }

    #[test]
    fn test_unclassified_counts_only_as_trade() {
        let snap = compute_snapshot(
            &read(vec![entry(1, TradeAction::Sell, "BTC", None, 1)]),
            &HashMap::new(),
            dec!(50),
        );
        assert_eq!(snap.total_trades, 1);
        assert_eq!(snap.closed_trades, 0);
        assert!(snap.open_positions.is_empty());
        assert_eq!(snap.current_balance, dec!(50));
    }

    #[test]
    fn test_daily_var_uses_day_start_balance() {
        let ledger = read(vec![
            entry(1, TradeAction::Sell, "BTC", Some(dec!(5)), 1),
            entry(2, TradeAction::Sell, "BTC", Some(dec!(5)), 1),
            entry(3, TradeAction::Sell, "BTC", Some(dec!(-6)), 2),
        ]);
        let snap = compute_snapshot(&ledger, &HashMap::new(), dec!(50));
        // Day 1: +10 on 50 (20%), day 2: -6 on 60 (-10%)
        assert!((snap.risk.daily_var - (-8.5)).abs() < 1e-9);
    }

    #[test]
    fn test_closing_legs_fold_in_timestamp_order() {
        // Appended out of order: +12 on day 3, +5 on day 1, -7 on day 2
        let ledger = read(vec![
            entry(1, TradeAction::Sell, "BTC", Some(dec!(12)), 3),
            entry(2, TradeAction::Sell, "BTC", Some(dec!(5)), 1),
            entry(3, TradeAction::Sell, "BTC", Some(dec!(-7)), 2),
        ]);
        let snap = compute_snapshot(&ledger, &HashMap::new(), dec!(50));

        // Curve 50, 55, 48, 60
        assert!((snap.risk.max_drawdown - (-12.7272727)).abs() < 1e-4);
        assert_eq!(snap.best_streak, 1);
        assert_eq!(snap.current_balance, dec!(60));
    }

    #[test]
    fn test_out_of_range_pnl_is_skipped_and_counted() {
        let huge = Decimal::MAX - dec!(10);
        let ledger = read(vec![
            entry(1, TradeAction::Sell, "BTC", Some(dec!(20)), 1),
            entry(2, TradeAction::Sell, "BTC", Some(huge), 2),
            entry(3, TradeAction::Sell, "BTC", Some(dec!(-5)), 3),
        ]);
        let snap = compute_snapshot(&ledger, &HashMap::new(), dec!(50));

        assert_eq!(snap.malformed_events, 1);
        assert_eq!(snap.total_trades, 2);
        assert_eq!(snap.current_balance, dec!(65));
    }

    #[test]
    fn test_huge_position_value_does_not_panic() {
        let mut buy = entry(1, TradeAction::Buy, "BTC", None, 1);
        buy.event.quantity = dec!(1000000000000000);
        buy.event.price = dec!(1);
        let mut prices = HashMap::new();
        prices.insert(
            Instrument::new("BTC"),
            PriceQuote::new(
                Instrument::new("BTC"),
                PriceSource::Binance,
                dec!(100000000000000000000),
                Utc::now(),
            ),
        );

        let snap = compute_snapshot(&read(vec![buy]), &prices, dec!(50));
        assert_eq!(snap.open_positions[0].position_value, Decimal::MAX);
    }

    #[test]
    fn test_trailing_malformed_rows_counted_once_with_checkpoints() {
        let ledger = Arc::new(crate::services::ledger::MemoryLedger::new());
        ledger
            .append(&crate::types::RawTradeRecord::from_event(
                &entry(1, TradeAction::Sell, "BTC", Some(dec!(1)), 1).event,
            ))
            .unwrap();
        let mut bad = crate::types::RawTradeRecord::from_event(
            &entry(2, TradeAction::Buy, "BTC", None, 2).event,
        );
        bad.quantity = Some("lots".to_string());
        ledger.append(&bad).unwrap();

        let prices = Arc::new(crate::services::price_store::MemoryPriceStore::new());
        let accountant = PortfolioAccountant::new(ledger.clone(), prices, dec!(50))
            .with_checkpoints(Arc::new(MemoryCheckpoints::default()));

        for _ in 0..3 {
            let snap = accountant.snapshot().unwrap();
            assert_eq!(snap.malformed_events, 1);
            assert_eq!(snap.total_trades, 1);
        }
        assert_eq!(accountant.fold().unwrap().last_seq(), 2);
    }

    #[test]
    fn test_skipped_closing_leg_still_blocks_backdated_resume() {
        let mut fold = PortfolioFold::new(dec!(50));
        fold.apply(&entry(1, TradeAction::Sell, "BTC", Some(Decimal::MAX), 3));
        assert_eq!(fold.malformed_events, 1);

        let backdated = read(vec![entry(2, TradeAction::Sell, "BTC", Some(dec!(1)), 2)]);
        assert!(!fold.continues_with(&backdated));
    }

    #[test]
    fn test_backdated_append_forces_full_recompute() {
        let ledger = Arc::new(crate::services::ledger::MemoryLedger::new());
        let prices = Arc::new(crate::services::price_store::MemoryPriceStore::new());
        let accountant = PortfolioAccountant::new(ledger.clone(), prices, dec!(50))
            .with_checkpoints(Arc::new(MemoryCheckpoints::default()));

        for (seq, pnl, day) in [(1, dec!(5), 1), (2, dec!(12), 3)] {
            ledger
                .append(&crate::types::RawTradeRecord::from_event(
                    &entry(seq, TradeAction::Sell, "BTC", Some(pnl), day).event,
                ))
                .unwrap();
        }
        accountant.snapshot().unwrap();

        // Lands between the two folded trades
        ledger
            .append(&crate::types::RawTradeRecord::from_event(
                &entry(3, TradeAction::Sell, "BTC", Some(dec!(-7)), 2).event,
            ))
            .unwrap();

        let resumed = accountant.snapshot().unwrap();
        let full = compute_snapshot(&ledger.read_all().unwrap(), &HashMap::new(), dec!(50));
        assert_eq!(resumed, full);
        assert!((resumed.risk.max_drawdown - (-12.7272727)).abs() < 1e-4);
    }

    #[test]
    fn test_fold_state_round_trips_through_json() {
        let mut fold = PortfolioFold::new(dec!(50));
        fold.apply(&entry(1, TradeAction::Buy, "BTC", None, 1));
        fold.apply(&entry(2, TradeAction::Sell, "ETH", Some(dec!(-1.25)), 2));

        let json = serde_json::to_string(&fold).unwrap();
        let restored: PortfolioFold = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, fold);
    }
}
