use crate::error::StoreError;
use crate::types::{resolve_latest, Instrument, PriceQuote, PriceSource};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};

/// Result of an idempotent write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    /// The key already held a quote; nothing was written.
    Duplicate,
}

/// Canonical quote storage keyed by (instrument, timestamp, source).
pub trait PriceStore: Send + Sync {
    /// Insert the quote unless its key already exists.
    fn upsert(&self, quote: &PriceQuote) -> Result<UpsertOutcome, StoreError>;

    /// Current quote for an instrument: most recent timestamp, then source priority.
    fn latest_for(&self, instrument: &Instrument) -> Result<Option<PriceQuote>, StoreError>;

    /// Stored quotes at or after `since`, oldest first. With a limit, only the
    /// most recent `limit` quotes are returned.
    fn history(
        &self,
        instrument: &Instrument,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<PriceQuote>, StoreError>;

    /// Timestamp of the newest quote across all instruments.
    fn freshest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError>;

    /// Current quote for each instrument that has one.
    fn latest_quotes(
        &self,
        instruments: &[Instrument],
    ) -> Result<HashMap<Instrument, PriceQuote>, StoreError> {
        let mut out = HashMap::with_capacity(instruments.len());
        for instrument in instruments {
            if let Some(quote) = self.latest_for(instrument)? {
                out.insert(instrument.clone(), quote);
            }
        }
        Ok(out)
    }
}

type SeriesKey = (i64, PriceSource);

/// In-memory price store.
#[derive(Default)]
pub struct MemoryPriceStore {
    series: DashMap<Instrument, BTreeMap<SeriesKey, PriceQuote>>,
}

impl MemoryPriceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total stored quotes.
    pub fn len(&self) -> usize {
        self.series.iter().map(|entry| entry.value().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl PriceStore for MemoryPriceStore {
    fn upsert(&self, quote: &PriceQuote) -> Result<UpsertOutcome, StoreError> {
        let key = (quote.timestamp.timestamp_millis(), quote.source);
        let mut series = self.series.entry(quote.instrument.clone()).or_default();
        if series.contains_key(&key) {
            return Ok(UpsertOutcome::Duplicate);
        }
        series.insert(key, quote.clone());
        Ok(UpsertOutcome::Inserted)
    }

    fn latest_for(&self, instrument: &Instrument) -> Result<Option<PriceQuote>, StoreError> {
        let Some(series) = self.series.get(instrument) else {
            return Ok(None);
        };
        let newest_ts = match series.keys().next_back() {
            Some((ts, _)) => *ts,
            None => return Ok(None),
        };
        let candidates = series.range((newest_ts, PriceSource::CoinGecko)..).map(|(_, q)| q);
        Ok(resolve_latest(candidates).cloned())
    }

    fn history(
        &self,
        instrument: &Instrument,
        since: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<PriceQuote>, StoreError> {
        let Some(series) = self.series.get(instrument) else {
            return Ok(Vec::new());
        };
        let since_ms = since.timestamp_millis();
        let mut points: Vec<PriceQuote> = series
            .iter()
            .filter(|((ts, _), _)| *ts >= since_ms)
            .map(|(_, q)| q.clone())
            .collect();
        if let Some(limit) = limit {
            let skip = points.len().saturating_sub(limit);
            points.drain(..skip);
        }
        Ok(points)
    }

    fn freshest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self
            .series
            .iter()
            .filter_map(|entry| entry.value().values().next_back().map(|q| q.timestamp))
            .max())
    }
}
