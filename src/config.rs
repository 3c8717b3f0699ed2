use crate::error::ConfigError;
use crate::types::Instrument;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Default tracked crypto assets.
pub const DEFAULT_CRYPTO: &[&str] = &[
    "BTC", "ETH", "ADA", "DOT", "SOL", "LINK", "AVAX", "MATIC", "UNI", "LTC", "BCH", "XRP", "BNB",
    "DOGE", "SHIB",
];

/// Default tracked currency pairs.
pub const DEFAULT_FOREX: &[&str] = &[
    "EURUSD", "GBPUSD", "USDJPY", "USDCHF", "AUDUSD", "USDCAD", "NZDUSD",
];

/// Exponential backoff policy for outbound requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1000),
            multiplier: 2,
        }
    }
}

impl RetryPolicy {
    /// Policy without delays, for tests and one-shot tools.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            multiplier: 1,
        }
    }

    /// Delay to wait before `attempt` (1-based). The first attempt has none.
    pub fn delay_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let factor = self.multiplier.saturating_pow(attempt - 2);
        self.base_delay.saturating_mul(factor)
    }
}

/// Server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    /// SQLite database file path.
    pub database_path: String,
    pub coingecko_api_key: Option<String>,
    pub binance_api_key: Option<String>,
    /// Fixer requires a key; without one the adapter is not built.
    pub fixer_api_key: Option<String>,
    pub exchangerate_enabled: bool,
    pub initial_balance: Decimal,
    pub tracked_crypto: Vec<Instrument>,
    pub tracked_forex: Vec<Instrument>,
    pub retry: RetryPolicy,
    pub ingest_concurrency: usize,
    pub adapter_timeout: Duration,
    pub stale_threshold_secs: i64,
    /// In-process ingestion interval; `None` leaves scheduling to an external trigger.
    pub ingest_interval_secs: Option<u64>,
    pub portfolio_checkpoints: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3001,
            database_path: "tally.db".to_string(),
            coingecko_api_key: None,
            binance_api_key: None,
            fixer_api_key: None,
            exchangerate_enabled: true,
            initial_balance: Decimal::from(50),
            tracked_crypto: DEFAULT_CRYPTO.iter().map(|s| Instrument::new(s)).collect(),
            tracked_forex: DEFAULT_FOREX.iter().map(|s| Instrument::new(s)).collect(),
            retry: RetryPolicy::default(),
            ingest_concurrency: 4,
            adapter_timeout: Duration::from_secs(20),
            stale_threshold_secs: 900,
            ingest_interval_secs: None,
            portfolio_checkpoints: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let retry = RetryPolicy {
            max_attempts: parse_env("RETRY_MAX_ATTEMPTS").unwrap_or(defaults.retry.max_attempts),
            base_delay: parse_env("RETRY_BASE_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry.base_delay),
            multiplier: parse_env("RETRY_MULTIPLIER").unwrap_or(defaults.retry.multiplier),
        };

        Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_env("PORT").unwrap_or(defaults.port),
            database_path: env::var("DATABASE_PATH").unwrap_or(defaults.database_path),
            coingecko_api_key: non_empty_env("COINGECKO_API_KEY"),
            binance_api_key: non_empty_env("BINANCE_API_KEY"),
            fixer_api_key: non_empty_env("FIXER_API_KEY"),
            exchangerate_enabled: env::var("EXCHANGERATE_ENABLED")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(defaults.exchangerate_enabled),
            initial_balance: parse_env("INITIAL_BALANCE").unwrap_or(defaults.initial_balance),
            tracked_crypto: list_env("TRACKED_CRYPTO").unwrap_or(defaults.tracked_crypto),
            tracked_forex: list_env("TRACKED_FOREX").unwrap_or(defaults.tracked_forex),
            retry,
            ingest_concurrency: parse_env("INGEST_CONCURRENCY").unwrap_or(defaults.ingest_concurrency),
            adapter_timeout: parse_env("ADAPTER_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.adapter_timeout),
            stale_threshold_secs: parse_env("STALE_THRESHOLD_SECS")
                .unwrap_or(defaults.stale_threshold_secs),
            ingest_interval_secs: parse_env("INGEST_INTERVAL_SECS").filter(|secs| *secs > 0),
            portfolio_checkpoints: env::var("PORTFOLIO_CHECKPOINTS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.portfolio_checkpoints),
        }
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.initial_balance <= Decimal::ZERO {
            return Err(ConfigError::Invalid {
                key: "INITIAL_BALANCE".to_string(),
                value: self.initial_balance.to_string(),
            });
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "RETRY_MAX_ATTEMPTS".to_string(),
                value: "0".to_string(),
            });
        }
        if self.ingest_concurrency == 0 {
            return Err(ConfigError::Invalid {
                key: "INGEST_CONCURRENCY".to_string(),
                value: "0".to_string(),
            });
        }
        if let Some(bad) = self.tracked_forex.iter().find(|i| i.pair_parts().is_none()) {
            return Err(ConfigError::Invalid {
                key: "TRACKED_FOREX".to_string(),
                value: bad.to_string(),
            });
        }
        Ok(())
    }

    /// All tracked instruments, crypto first.
    pub fn tracked_instruments(&self) -> Vec<Instrument> {
        self.tracked_crypto
            .iter()
            .chain(self.tracked_forex.iter())
            .cloned()
            .collect()
    }
}

fn parse_env<T: FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

fn non_empty_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn list_env(key: &str) -> Option<Vec<Instrument>> {
    let raw = env::var(key).ok()?;
    let list: Vec<Instrument> = raw
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(Instrument::new)
        .collect();
    if list.is_empty() {
        None
    } else {
        Some(list)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delays_double() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay_before(1), Duration::ZERO);
        assert_eq!(policy.delay_before(2), Duration::from_millis(1000));
        assert_eq!(policy.delay_before(3), Duration::from_millis(2000));
        assert_eq!(policy.delay_before(4), Duration::from_millis(4000));
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.tracked_instruments().len(), DEFAULT_CRYPTO.len() + DEFAULT_FOREX.len());
    }

    #[test]
    fn test_validate_rejects_non_positive_balance() {
        let config = Config {
            initial_balance: Decimal::ZERO,
            ..Config::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_validate_rejects_non_pair_forex() {
        let config = Config {
            tracked_forex: vec![Instrument::new("BTCUSD")],
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
