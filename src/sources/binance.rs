use super::{parse_payload, unix_to_utc, FeedAdapter, Fetcher};
use crate::error::FeedError;
use crate::services::symbols::BINANCE_QUOTE_ASSET;
use crate::services::SymbolTable;
use crate::types::{PriceQuote, PriceSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;

const BINANCE_API_URL: &str = "https://api.binance.com";

/// 24h rolling ticker statistics.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceTicker {
    symbol: String,
    last_price: Decimal,
    #[serde(default)]
    bid_price: Option<Decimal>,
    #[serde(default)]
    ask_price: Option<Decimal>,
    #[serde(default)]
    volume: Option<Decimal>,
    #[serde(default)]
    high_price: Option<Decimal>,
    #[serde(default)]
    low_price: Option<Decimal>,
    #[serde(default)]
    price_change: Option<Decimal>,
    #[serde(default)]
    price_change_percent: Option<Decimal>,
    #[serde(default)]
    close_time: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum BinanceResponse {
    Error { code: i64, msg: String },
    Tickers(Vec<BinanceTicker>),
}

/// Binance spot `ticker/24hr` feed, filtered to tracked USDT pairs.
pub struct BinanceAdapter {
    fetcher: Fetcher,
    symbols: Arc<SymbolTable>,
    api_key: Option<String>,
    base_url: String,
}

impl BinanceAdapter {
    pub fn new(fetcher: Fetcher, symbols: Arc<SymbolTable>, api_key: Option<String>) -> Self {
        Self {
            fetcher,
            symbols,
            api_key,
            base_url: BINANCE_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn to_quote(&self, ticker: BinanceTicker, as_of: DateTime<Utc>) -> Option<PriceQuote> {
        if !ticker.symbol.ends_with(BINANCE_QUOTE_ASSET) {
            return None;
        }
        let instrument = self.symbols.to_canonical(PriceSource::Binance, &ticker.symbol);
        if !self.symbols.is_tracked(&instrument) || ticker.last_price <= Decimal::ZERO {
            return None;
        }

        let timestamp = ticker.close_time.and_then(unix_to_utc).unwrap_or(as_of);
        let quote = PriceQuote::new(instrument, PriceSource::Binance, ticker.last_price, timestamp);
        let quote = match (ticker.bid_price, ticker.ask_price) {
            (Some(bid), Some(ask)) if bid > Decimal::ZERO && ask >= bid => quote.with_bid_ask(bid, ask),
            _ => quote.with_synthetic_spread(PriceSource::Binance.synthetic_half_spread()),
        };

        Some(
            quote
                .with_volume(ticker.volume)
                .with_range_24h(ticker.high_price, ticker.low_price)
                .with_change_24h(ticker.price_change, ticker.price_change_percent),
        )
    }
}

#[async_trait]
impl FeedAdapter for BinanceAdapter {
    fn source(&self) -> PriceSource {
        PriceSource::Binance
    }

    async fn fetch(&self, as_of: DateTime<Utc>) -> Result<Vec<PriceQuote>, FeedError> {
        if self.symbols.tracked_natives(PriceSource::Binance).is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/api/v3/ticker/24hr", self.base_url);
        let headers: Vec<(String, String)> = self
            .api_key
            .iter()
            .map(|key| ("X-MBX-APIKEY".to_string(), key.clone()))
            .collect();

        let body = self.fetcher.fetch(&url, &headers).await?;
        let tickers = match parse_payload::<BinanceResponse>(self.source(), &body)? {
            BinanceResponse::Error { code, msg } => {
                return Err(FeedError::Upstream {
                    feed: self.source(),
                    message: format!("{} ({})", msg, code),
                })
            }
            BinanceResponse::Tickers(tickers) => tickers,
        };

        debug!("Binance returned {} tickers", tickers.len());
        let mut quotes: Vec<PriceQuote> = tickers
            .into_iter()
            .filter_map(|t| self.to_quote(t, as_of))
            .collect();
        quotes.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        Ok(quotes)
    }
}
