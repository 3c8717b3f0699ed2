//! Canonical instrument codes and per-source native identifiers.

use crate::error::ConfigError;
use crate::types::{Instrument, MarketType, PriceQuote, PriceSource};
use rust_decimal::Decimal;
use std::collections::{BTreeSet, HashMap};

/// Decimal places kept for synthesized reciprocal rates.
pub const RECIPROCAL_DP: u32 = 10;

/// Canonical code to CoinGecko id mapping.
pub const COINGECKO_IDS: &[(&str, &str)] = &[
    ("BTC", "bitcoin"),
    ("ETH", "ethereum"),
    ("ADA", "cardano"),
    ("DOT", "polkadot"),
    ("SOL", "solana"),
    ("LINK", "chainlink"),
    ("AVAX", "avalanche-2"),
    ("MATIC", "matic-network"),
    ("UNI", "uniswap"),
    ("LTC", "litecoin"),
    ("BCH", "bitcoin-cash"),
    ("XRP", "ripple"),
    ("BNB", "binancecoin"),
    ("DOGE", "dogecoin"),
    ("SHIB", "shiba-inu"),
    ("TRX", "tron"),
    ("ATOM", "cosmos"),
    ("XLM", "stellar"),
    ("NEAR", "near"),
    ("APT", "aptos"),
];

/// Quote asset Binance spot tickers are tracked against.
pub const BINANCE_QUOTE_ASSET: &str = "USDT";

/// Immutable bidirectional mapping between canonical instruments and each
/// source's native identifiers.
///
/// Only the forward table is ever supplied; the reverse table is derived
/// from it once, at construction.
#[derive(Debug, Clone)]
pub struct SymbolTable {
    forward: HashMap<PriceSource, HashMap<Instrument, String>>,
    reverse: HashMap<PriceSource, HashMap<String, Instrument>>,
    tracked: BTreeSet<Instrument>,
}

impl SymbolTable {
    /// Build the default table for the given tracked instruments.
    ///
    /// CoinGecko ids come from [`COINGECKO_IDS`]; Binance tickers are the
    /// tracked crypto codes suffixed with [`BINANCE_QUOTE_ASSET`].
    pub fn new(tracked: impl IntoIterator<Item = Instrument>) -> Result<Self, ConfigError> {
        let tracked: Vec<Instrument> = tracked.into_iter().collect();

        let mut entries: Vec<(PriceSource, Instrument, String)> = COINGECKO_IDS
            .iter()
            .map(|(code, id)| (PriceSource::CoinGecko, Instrument::new(code), id.to_string()))
            .collect();
        entries.extend(
            tracked
                .iter()
                .filter(|i| i.market_type() == MarketType::Crypto)
                .map(|i| {
                    (
                        PriceSource::Binance,
                        i.clone(),
                        format!("{}{}", i, BINANCE_QUOTE_ASSET),
                    )
                }),
        );

        Self::from_entries(entries, tracked)
    }

    /// Build a table from explicit forward entries `(source, canonical, native)`.
    pub fn from_entries(
        entries: impl IntoIterator<Item = (PriceSource, Instrument, String)>,
        tracked: impl IntoIterator<Item = Instrument>,
    ) -> Result<Self, ConfigError> {
        let mut forward: HashMap<PriceSource, HashMap<Instrument, String>> = HashMap::new();
        for (source, instrument, native) in entries {
            forward.entry(source).or_default().insert(instrument, native);
        }

        let mut reverse: HashMap<PriceSource, HashMap<String, Instrument>> = HashMap::new();
        for (source, table) in &forward {
            let rev = reverse.entry(*source).or_default();
            for (instrument, native) in table {
                let key = native.to_lowercase();
                if rev.insert(key, instrument.clone()).is_some() {
                    return Err(ConfigError::DuplicateMapping {
                        feed: *source,
                        native: native.clone(),
                    });
                }
            }
        }

        Ok(Self {
            forward,
            reverse,
            tracked: tracked.into_iter().collect(),
        })
    }

    /// Native identifier of `instrument` at `source`, if mapped.
    pub fn to_native(&self, source: PriceSource, instrument: &Instrument) -> Option<&str> {
        self.forward
            .get(&source)
            .and_then(|t| t.get(instrument))
            .map(String::as_str)
    }

    /// Canonical instrument for a native identifier. Unknown identifiers pass
    /// through uppercased.
    pub fn to_canonical(&self, source: PriceSource, native: &str) -> Instrument {
        self.reverse
            .get(&source)
            .and_then(|t| t.get(&native.to_lowercase()))
            .cloned()
            .unwrap_or_else(|| Instrument::new(native))
    }

    /// Native identifiers of every tracked instrument the source maps.
    pub fn tracked_natives(&self, source: PriceSource) -> Vec<&str> {
        self.tracked
            .iter()
            .filter_map(|i| self.to_native(source, i))
            .collect()
    }

    pub fn is_tracked(&self, instrument: &Instrument) -> bool {
        self.tracked.contains(instrument)
    }

    pub fn tracked(&self) -> impl Iterator<Item = &Instrument> {
        self.tracked.iter()
    }

    /// Tracked instruments of one market, in canonical order.
    pub fn tracked_in(&self, market: MarketType) -> Vec<Instrument> {
        self.tracked
            .iter()
            .filter(|i| i.market_type() == market)
            .cloned()
            .collect()
    }

    /// Synthesize the quote/base pair for a base/quote currency quote.
    ///
    /// The rate becomes `1/R`. When the source quote carries a spread it is
    /// scaled to the reciprocal rate (`spread / R^2`) and kept symmetric
    /// around the new rate. Returns `None` for non-pair instruments and
    /// non-positive rates.
    pub fn reciprocal(&self, quote: &PriceQuote) -> Option<PriceQuote> {
        let (base, counter) = quote.instrument.pair_parts()?;
        if quote.price <= Decimal::ZERO {
            return None;
        }

        let rate = (Decimal::ONE / quote.price).round_dp(RECIPROCAL_DP);
        let inverted = PriceQuote::new(
            Instrument::pair(counter, base),
            quote.source,
            rate,
            quote.timestamp,
        );

        Some(match quote.spread {
            Some(spread) => {
                let scaled = (spread * rate * rate).round_dp(RECIPROCAL_DP);
                let half = scaled / Decimal::TWO;
                inverted.with_bid_ask(rate - half, rate + half)
            }
            None => inverted,
        })
    }
}
