pub mod binance;
pub mod coingecko;
pub mod exchangerate;
pub mod fixer;
pub mod transport;

pub use binance::BinanceAdapter;
pub use coingecko::CoinGeckoAdapter;
pub use exchangerate::ExchangeRateAdapter;
pub use fixer::FixerAdapter;
pub use transport::{Fetcher, HttpTransport, Transport};

use crate::config::Config;
use crate::error::FeedError;
use crate::services::SymbolTable;
use crate::types::{Instrument, MarketType, PriceQuote, PriceSource};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// What one adapter produced for a cycle. A failed source yields no quotes
/// and a recorded error.
#[derive(Debug, Clone)]
pub struct FeedOutcome {
    pub source: PriceSource,
    pub quotes: Vec<PriceQuote>,
    pub error: Option<String>,
}

impl FeedOutcome {
    pub fn failed(source: PriceSource, error: impl ToString) -> Self {
        Self {
            source,
            quotes: Vec::new(),
            error: Some(error.to_string()),
        }
    }
}

/// Upstream price feed producing canonical quotes for tracked instruments.
#[async_trait]
pub trait FeedAdapter: Send + Sync {
    fn source(&self) -> PriceSource;

    /// Fetch and parse one snapshot. `as_of` stamps quotes whose payload
    /// carries no update time.
    async fn fetch(&self, as_of: DateTime<Utc>) -> Result<Vec<PriceQuote>, FeedError>;

    /// Like [`FeedAdapter::fetch`] but never fails: errors become an empty
    /// outcome carrying the error text.
    async fn fetch_quotes(&self, as_of: DateTime<Utc>) -> FeedOutcome {
        match self.fetch(as_of).await {
            Ok(quotes) => {
                debug!("{} produced {} quotes", self.source(), quotes.len());
                FeedOutcome {
                    source: self.source(),
                    quotes,
                    error: None,
                }
            }
            Err(e) => {
                warn!("{} skipped this cycle: {}", self.source(), e);
                FeedOutcome::failed(self.source(), e)
            }
        }
    }
}

/// Build the adapters enabled by configuration.
pub fn build_adapters(
    config: &Config,
    fetcher: Fetcher,
    symbols: Arc<SymbolTable>,
) -> Vec<Arc<dyn FeedAdapter>> {
    let mut adapters: Vec<Arc<dyn FeedAdapter>> = vec![
        Arc::new(CoinGeckoAdapter::new(
            fetcher.clone(),
            symbols.clone(),
            config.coingecko_api_key.clone(),
        )),
        Arc::new(BinanceAdapter::new(
            fetcher.clone(),
            symbols.clone(),
            config.binance_api_key.clone(),
        )),
    ];

    match &config.fixer_api_key {
        Some(key) => adapters.push(Arc::new(FixerAdapter::new(
            fetcher.clone(),
            symbols.clone(),
            key.clone(),
        ))),
        None => info!("FIXER_API_KEY not set, Fixer feed disabled"),
    }

    if config.exchangerate_enabled {
        adapters.push(Arc::new(ExchangeRateAdapter::new(fetcher, symbols)));
    }

    adapters
}

/// Parse a JSON body, mapping shape mismatches to a schema error.
pub(crate) fn parse_payload<T: DeserializeOwned>(feed: PriceSource, body: &str) -> Result<T, FeedError> {
    serde_json::from_str(body).map_err(|e| FeedError::UpstreamSchema {
        feed,
        detail: e.to_string(),
    })
}

/// Convert a unix timestamp (seconds or milliseconds) to UTC.
pub(crate) fn unix_to_utc(value: i64) -> Option<DateTime<Utc>> {
    if value > 100_000_000_000 {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// Currencies to request from a rate table quoted against `base`.
pub(crate) fn counter_currencies(symbols: &SymbolTable, base: &str) -> Vec<String> {
    let mut codes: Vec<String> = symbols
        .tracked_in(MarketType::Forex)
        .iter()
        .filter_map(|pair| {
            let (b, q) = pair.pair_parts()?;
            if b == base {
                Some(q.to_string())
            } else if q == base {
                Some(b.to_string())
            } else {
                None
            }
        })
        .collect();
    codes.sort();
    codes.dedup();
    codes
}

/// Turn a `base -> currency` rate table into quotes for tracked pairs.
///
/// Each rate yields the direct pair `BASE+CODE`; the inverse `CODE+BASE` is
/// synthesized through the symbol table. Only tracked pairs are emitted.
pub(crate) fn rate_table_quotes(
    symbols: &SymbolTable,
    feed: PriceSource,
    base: &str,
    rates: &HashMap<String, Decimal>,
    timestamp: DateTime<Utc>,
) -> Vec<PriceQuote> {
    let mut quotes = Vec::new();
    let mut codes: Vec<&String> = rates.keys().collect();
    codes.sort();

    for code in codes {
        let rate = rates[code];
        if code.eq_ignore_ascii_case(base) || rate <= Decimal::ZERO {
            continue;
        }
        let direct = PriceQuote::new(Instrument::pair(base, code), feed, rate, timestamp)
            .with_synthetic_spread(feed.synthetic_half_spread());

        if let Some(inverse) = symbols.reciprocal(&direct) {
            if symbols.is_tracked(&inverse.instrument) {
                quotes.push(inverse);
            }
        }
        if symbols.is_tracked(&direct.instrument) {
            quotes.push(direct);
        }
    }

    quotes
}
