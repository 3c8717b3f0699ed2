use super::{parse_payload, unix_to_utc, FeedAdapter, Fetcher};
use crate::error::FeedError;
use crate::services::SymbolTable;
use crate::types::{PriceQuote, PriceSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

const COINGECKO_API_URL: &str = "https://api.coingecko.com/api/v3";

#[derive(Debug, Deserialize)]
struct CoinGeckoPrice {
    #[serde(default)]
    usd: Option<Decimal>,
    #[serde(default)]
    usd_market_cap: Option<Decimal>,
    #[serde(default)]
    usd_24h_vol: Option<Decimal>,
    #[serde(default)]
    usd_24h_change: Option<Decimal>,
    #[serde(default)]
    last_updated_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CoinGeckoStatus {
    #[serde(default)]
    error_code: Option<i64>,
    #[serde(default)]
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CoinGeckoResponse {
    Error { status: CoinGeckoStatus },
    Prices(HashMap<String, CoinGeckoPrice>),
}

/// CoinGecko `simple/price` feed for tracked crypto assets.
pub struct CoinGeckoAdapter {
    fetcher: Fetcher,
    symbols: Arc<SymbolTable>,
    api_key: Option<String>,
    base_url: String,
}

impl CoinGeckoAdapter {
    pub fn new(fetcher: Fetcher, symbols: Arc<SymbolTable>, api_key: Option<String>) -> Self {
        Self {
            fetcher,
            symbols,
            api_key,
            base_url: COINGECKO_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    fn url(&self, ids: &[&str]) -> String {
        format!(
            "{}/simple/price?ids={}&vs_currencies=usd&include_market_cap=true\
             &include_24hr_vol=true&include_24hr_change=true&include_last_updated_at=true",
            self.base_url,
            ids.join(",")
        )
    }

    fn headers(&self) -> Vec<(String, String)> {
        self.api_key
            .iter()
            .map(|key| ("x-cg-demo-api-key".to_string(), key.clone()))
            .collect()
    }
}

#[async_trait]
impl FeedAdapter for CoinGeckoAdapter {
    fn source(&self) -> PriceSource {
        PriceSource::CoinGecko
    }

    async fn fetch(&self, as_of: DateTime<Utc>) -> Result<Vec<PriceQuote>, FeedError> {
        let mut ids = self.symbols.tracked_natives(PriceSource::CoinGecko);
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        ids.sort();

        let body = self.fetcher.fetch(&self.url(&ids), &self.headers()).await?;

        let prices = match parse_payload::<CoinGeckoResponse>(self.source(), &body)? {
            CoinGeckoResponse::Error { status } => {
                return Err(FeedError::Upstream {
                    feed: self.source(),
                    message: format!(
                        "{} ({})",
                        status.error_message.unwrap_or_else(|| "unknown error".to_string()),
                        status.error_code.unwrap_or_default()
                    ),
                })
            }
            CoinGeckoResponse::Prices(prices) => prices,
        };

        let mut quotes = Vec::with_capacity(prices.len());
        for (id, data) in prices {
            let instrument = self.symbols.to_canonical(PriceSource::CoinGecko, &id);
            if !self.symbols.is_tracked(&instrument) {
                debug!("CoinGecko: ignoring untracked id {}", id);
                continue;
            }
            let Some(price) = data.usd else {
                debug!("CoinGecko: no usd price for {}", id);
                continue;
            };

            let timestamp = data.last_updated_at.and_then(unix_to_utc).unwrap_or(as_of);
            let quote = PriceQuote::new(instrument, PriceSource::CoinGecko, price, timestamp)
                .with_synthetic_spread(PriceSource::CoinGecko.synthetic_half_spread())
                .with_volume(data.usd_24h_vol)
                .with_market_cap(data.usd_market_cap)
                .with_change_24h(None, data.usd_24h_change);
            quotes.push(quote);
        }

        quotes.sort_by(|a, b| a.instrument.cmp(&b.instrument));
        Ok(quotes)
    }
}
