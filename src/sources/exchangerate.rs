use super::{counter_currencies, parse_payload, rate_table_quotes, unix_to_utc, FeedAdapter, Fetcher};
use crate::error::FeedError;
use crate::services::SymbolTable;
use crate::types::{PriceQuote, PriceSource};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

const EXCHANGERATE_API_URL: &str = "https://api.exchangerate-api.com";
const BASE_CURRENCY: &str = "USD";

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ExchangeRateResponse {
    Error {
        result: String,
        #[serde(rename = "error-type")]
        error_type: String,
    },
    Rates {
        base: String,
        #[serde(default)]
        time_last_updated: Option<i64>,
        rates: HashMap<String, Decimal>,
    },
}

/// Keyless ExchangeRate-API `v4/latest` feed.
pub struct ExchangeRateAdapter {
    fetcher: Fetcher,
    symbols: Arc<SymbolTable>,
    base_url: String,
}

impl ExchangeRateAdapter {
    pub fn new(fetcher: Fetcher, symbols: Arc<SymbolTable>) -> Self {
        Self {
            fetcher,
            symbols,
            base_url: EXCHANGERATE_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl FeedAdapter for ExchangeRateAdapter {
    fn source(&self) -> PriceSource {
        PriceSource::ExchangeRateApi
    }

    async fn fetch(&self, as_of: DateTime<Utc>) -> Result<Vec<PriceQuote>, FeedError> {
        let wanted = counter_currencies(&self.symbols, BASE_CURRENCY);
        if wanted.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!("{}/v4/latest/{}", self.base_url, BASE_CURRENCY);
        let body = self.fetcher.fetch(&url, &[]).await?;

        match parse_payload::<ExchangeRateResponse>(self.source(), &body)? {
            ExchangeRateResponse::Error { result, error_type } => Err(FeedError::Upstream {
                feed: self.source(),
                message: format!("{}: {}", result, error_type),
            }),
            ExchangeRateResponse::Rates {
                base,
                time_last_updated,
                mut rates,
            } => {
                if !base.eq_ignore_ascii_case(BASE_CURRENCY) {
                    return Err(FeedError::UpstreamSchema {
                        feed: self.source(),
                        detail: format!("expected base {}, got {}", BASE_CURRENCY, base),
                    });
                }
                // The endpoint returns every currency it knows
                rates.retain(|code, _| wanted.iter().any(|w| w == code));
                let timestamp = time_last_updated.and_then(unix_to_utc).unwrap_or(as_of);
                Ok(rate_table_quotes(
                    &self.symbols,
                    self.source(),
                    BASE_CURRENCY,
                    &rates,
                    timestamp,
                ))
            }
        }
    }
}
