use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Fiat currency codes recognised as halves of a currency-pair instrument.
pub const FIAT_CURRENCIES: &[&str] = &[
    "USD", "EUR", "GBP", "JPY", "CHF", "AUD", "CAD", "NZD", "CNY", "HKD", "SEK", "NOK", "DKK",
    "SGD", "MXN", "ZAR", "INR", "KRW", "BRL", "PLN", "TRY",
];

/// Market an instrument trades in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Crypto,
    Forex,
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarketType::Crypto => write!(f, "crypto"),
            MarketType::Forex => write!(f, "forex"),
        }
    }
}

/// Stable canonical instrument code (e.g. `BTC`, `EURUSD`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Instrument(String);

impl Instrument {
    pub fn new(code: impl AsRef<str>) -> Self {
        Self(code.as_ref().trim().to_uppercase())
    }

    /// Build a currency pair from its base and quote codes.
    pub fn pair(base: &str, quote: &str) -> Self {
        Self::new(format!("{}{}", base, quote))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Split a currency pair into (base, quote). `None` for non-pair codes.
    pub fn pair_parts(&self) -> Option<(&str, &str)> {
        if self.0.len() != 6 || !self.0.chars().all(|c| c.is_ascii_alphabetic()) {
            return None;
        }
        let (base, quote) = self.0.split_at(3);
        if FIAT_CURRENCIES.contains(&base) && FIAT_CURRENCIES.contains(&quote) {
            Some((base, quote))
        } else {
            None
        }
    }

    pub fn market_type(&self) -> MarketType {
        if self.pair_parts().is_some() {
            MarketType::Forex
        } else {
            MarketType::Crypto
        }
    }
}

impl fmt::Display for Instrument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Instrument {
    fn from(code: &str) -> Self {
        Self::new(code)
    }
}

/// Upstream price source identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    CoinGecko,
    Binance,
    Fixer,
    #[serde(rename = "exchangerate")]
    ExchangeRateApi,
}

impl PriceSource {
    pub const ALL: [PriceSource; 4] = [
        PriceSource::CoinGecko,
        PriceSource::Binance,
        PriceSource::Fixer,
        PriceSource::ExchangeRateApi,
    ];

    /// Tie-break priority when two sources quote the same instrument at the
    /// same instant (higher wins).
    pub fn priority(&self) -> u32 {
        match self {
            PriceSource::Binance => 10,
            PriceSource::CoinGecko => 7,
            PriceSource::Fixer => 9,
            PriceSource::ExchangeRateApi => 6,
        }
    }

    /// Half-width of the synthetic spread applied when the source does not
    /// report bid/ask, as a fraction of the price.
    pub fn synthetic_half_spread(&self) -> Decimal {
        match self {
            PriceSource::CoinGecko => Decimal::new(5, 4),
            PriceSource::Binance => Decimal::new(5, 4),
            PriceSource::Fixer => Decimal::new(2, 4),
            PriceSource::ExchangeRateApi => Decimal::new(3, 4),
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "coingecko" => Some(PriceSource::CoinGecko),
            "binance" => Some(PriceSource::Binance),
            "fixer" | "fixer.io" => Some(PriceSource::Fixer),
            "exchangerate" | "exchangerateapi" => Some(PriceSource::ExchangeRateApi),
            _ => None,
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PriceSource::CoinGecko => write!(f, "coingecko"),
            PriceSource::Binance => write!(f, "binance"),
            PriceSource::Fixer => write!(f, "fixer"),
            PriceSource::ExchangeRateApi => write!(f, "exchangerate"),
        }
    }
}

/// A canonical price observation from one source.
///
/// Written once by the price store and never mutated afterwards. When both
/// `bid` and `ask` are present, `spread == ask - bid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceQuote {
    pub instrument: Instrument,
    pub source: PriceSource,
    pub timestamp: DateTime<Utc>,
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
    pub market_cap: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub high_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub low_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_24h: Option<Decimal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_pct_24h: Option<Decimal>,
}

impl PriceQuote {
    /// Quote carrying a source-provided last-trade price.
    pub fn new(
        instrument: Instrument,
        source: PriceSource,
        price: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            instrument,
            source,
            timestamp,
            price,
            bid: None,
            ask: None,
            spread: None,
            volume: None,
            market_cap: None,
            high_24h: None,
            low_24h: None,
            change_24h: None,
            change_pct_24h: None,
        }
    }

    /// Quote built from bid/ask only; the price is the midpoint.
    pub fn from_bid_ask(
        instrument: Instrument,
        source: PriceSource,
        bid: Decimal,
        ask: Decimal,
        timestamp: DateTime<Utc>,
    ) -> Self {
        let mid = (bid + ask) / Decimal::TWO;
        Self::new(instrument, source, mid, timestamp).with_bid_ask(bid, ask)
    }

    /// Attach bid/ask, keeping the existing (last-trade) price.
    pub fn with_bid_ask(mut self, bid: Decimal, ask: Decimal) -> Self {
        self.bid = Some(bid);
        self.ask = Some(ask);
        self.spread = Some(ask - bid);
        self
    }

    /// Apply a symmetric synthetic spread of `half` (fraction of price) on
    /// each side. The price stays the midpoint.
    pub fn with_synthetic_spread(self, half: Decimal) -> Self {
        let offset = self.price * half;
        let (bid, ask) = (self.price - offset, self.price + offset);
        self.with_bid_ask(bid, ask)
    }

    pub fn with_volume(mut self, volume: Option<Decimal>) -> Self {
        self.volume = volume;
        self
    }

    pub fn with_market_cap(mut self, market_cap: Option<Decimal>) -> Self {
        self.market_cap = market_cap;
        self
    }

    pub fn with_range_24h(mut self, high: Option<Decimal>, low: Option<Decimal>) -> Self {
        self.high_24h = high;
        self.low_24h = low;
        self
    }

    pub fn with_change_24h(mut self, change: Option<Decimal>, change_pct: Option<Decimal>) -> Self {
        self.change_24h = change;
        self.change_pct_24h = change_pct;
        self
    }

    /// Key under which the quote is stored.
    pub fn key(&self) -> QuoteKey {
        QuoteKey {
            instrument: self.instrument.clone(),
            timestamp_ms: self.timestamp.timestamp_millis(),
            source: self.source,
        }
    }

    /// Ordering used to pick a single current quote: most recent timestamp
    /// first, then higher source priority.
    pub fn freshness_cmp(&self, other: &PriceQuote) -> Ordering {
        self.timestamp
            .cmp(&other.timestamp)
            .then_with(|| self.source.priority().cmp(&other.source.priority()))
    }
}

/// Idempotence key of a stored quote.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QuoteKey {
    pub instrument: Instrument,
    pub timestamp_ms: i64,
    pub source: PriceSource,
}

impl fmt::Display for QuoteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.instrument, self.timestamp_ms, self.source)
    }
}

/// Pick the freshest quote among candidates for one instrument.
pub fn resolve_latest<'a, I>(quotes: I) -> Option<&'a PriceQuote>
where
    I: IntoIterator<Item = &'a PriceQuote>,
{
    quotes.into_iter().max_by(|a, b| a.freshness_cmp(b))
}
