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

const FIXER_API_URL: &str = "https://data.fixer.io/api";
const BASE_CURRENCY: &str = "USD";

#[derive(Debug, Deserialize)]
struct FixerErrorBody {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    info: Option<String>,
    #[serde(default, rename = "type")]
    kind: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FixerResponse {
    Error {
        error: FixerErrorBody,
    },
    Rates {
        #[serde(default)]
        timestamp: Option<i64>,
        base: String,
        rates: HashMap<String, Decimal>,
    },
}

/// Fixer `latest` rates, quoted against USD. Requires an access key.
pub struct FixerAdapter {
    fetcher: Fetcher,
    symbols: Arc<SymbolTable>,
    api_key: String,
    base_url: String,
}

impl FixerAdapter {
    pub fn new(fetcher: Fetcher, symbols: Arc<SymbolTable>, api_key: String) -> Self {
        Self {
            fetcher,
            symbols,
            api_key,
            base_url: FIXER_API_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl FeedAdapter for FixerAdapter {
    fn source(&self) -> PriceSource {
        PriceSource::Fixer
    }

    async fn fetch(&self, as_of: DateTime<Utc>) -> Result<Vec<PriceQuote>, FeedError> {
        let currencies = counter_currencies(&self.symbols, BASE_CURRENCY);
        if currencies.is_empty() {
            return Ok(Vec::new());
        }

        let url = format!(
            "{}/latest?access_key={}&base={}&symbols={}",
            self.base_url,
            self.api_key,
            BASE_CURRENCY,
            currencies.join(",")
        );
        let body = self.fetcher.fetch(&url, &[]).await?;

        match parse_payload::<FixerResponse>(self.source(), &body)? {
            FixerResponse::Error { error } => Err(FeedError::Upstream {
                feed: self.source(),
                message: format!(
                    "{} ({})",
                    error
                        .info
                        .or(error.kind)
                        .unwrap_or_else(|| "unknown error".to_string()),
                    error.code.unwrap_or_default()
                ),
            }),
            FixerResponse::Rates {
                timestamp,
                base,
                rates,
            } => {
                if !base.eq_ignore_ascii_case(BASE_CURRENCY) {
                    return Err(FeedError::UpstreamSchema {
                        feed: self.source(),
                        detail: format!("expected base {}, got {}", BASE_CURRENCY, base),
                    });
                }
                let timestamp = timestamp.and_then(unix_to_utc).unwrap_or(as_of);
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryPolicy;
    use crate::sources::transport::MockTransport;
    use crate::types::Instrument;
    use rust_decimal_macros::dec;

    fn adapter(mock: MockTransport) -> FixerAdapter {
        let symbols = SymbolTable::new(vec![Instrument::new("EURUSD"), Instrument::new("USDJPY")]).unwrap();
        FixerAdapter::new(
            Fetcher::new(Arc::new(mock), RetryPolicy::immediate(1)),
            Arc::new(symbols),
            "secret".to_string(),
        )
        .with_base_url("https://fx.test")
    }

    #[test]
    fn test_default_endpoint_is_https() {
        let plain = FixerAdapter::new(
            Fetcher::new(Arc::new(MockTransport::new()), RetryPolicy::immediate(1)),
            Arc::new(SymbolTable::new(vec![Instrument::new("EURUSD")]).unwrap()),
            "secret".to_string(),
        );
        assert!(plain.base_url.starts_with("https://"));
    }

    #[tokio::test]
    async fn test_rates_become_pairs() {
        let mut mock = MockTransport::new();
        mock.expect_get()
            .withf(|url, _| url == "https://fx.test/latest?access_key=secret&base=USD&symbols=EUR,JPY")
            .returning(|_, _| {
                Ok(r#"{"success":true,"timestamp":1700000000,"base":"USD","date":"2023-11-14",
                       "rates":{"EUR":0.8,"JPY":150}}"#
                    .to_string())
            });

        let quotes = adapter(mock).fetch(Utc::now()).await.unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes[0].instrument.as_str(), "EURUSD");
        assert_eq!(quotes[0].price, dec!(1.25));
        assert_eq!(quotes[1].instrument.as_str(), "USDJPY");
        // 0.02% each side
        assert_eq!(quotes[1].spread, Some(dec!(0.06)));
        assert_eq!(quotes[1].timestamp.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_error_envelope() {
        let mut mock = MockTransport::new();
        mock.expect_get().returning(|_, _| {
            Ok(r#"{"success":false,"error":{"code":101,"type":"invalid_access_key","info":"bad key"}}"#
                .to_string())
        });

        let outcome = adapter(mock).fetch_quotes(Utc::now()).await;
        assert!(outcome.quotes.is_empty());
        assert_eq!(outcome.error.as_deref(), Some("fixer: upstream error: bad key (101)"));
    }
}
