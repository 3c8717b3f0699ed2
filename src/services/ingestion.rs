use crate::error::FeedError;
use crate::services::price_store::{PriceStore, UpsertOutcome};
use crate::services::SymbolTable;
use crate::sources::{FeedAdapter, FeedOutcome};
use crate::types::{IngestionSummary, PriceQuote, SourceReport};
use chrono::{DateTime, Utc};
use futures_util::{stream, FutureExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

const DEFAULT_CONCURRENCY: usize = 4;
const DEFAULT_ADAPTER_TIMEOUT: Duration = Duration::from_secs(20);

/// Result of writing one quote.
enum WriteResult {
    Saved,
    Duplicate,
    Failed(String),
}

/// Runs every feed adapter for a tick and persists what they return.
pub struct IngestionService {
    adapters: Vec<Arc<dyn FeedAdapter>>,
    store: Arc<dyn PriceStore>,
    symbols: Arc<SymbolTable>,
    concurrency: usize,
    adapter_timeout: Duration,
}

impl IngestionService {
    pub fn new(
        adapters: Vec<Arc<dyn FeedAdapter>>,
        store: Arc<dyn PriceStore>,
        symbols: Arc<SymbolTable>,
    ) -> Self {
        Self {
            adapters,
            store,
            symbols,
            concurrency: DEFAULT_CONCURRENCY,
            adapter_timeout: DEFAULT_ADAPTER_TIMEOUT,
        }
    }

    pub fn with_limits(mut self, concurrency: usize, adapter_timeout: Duration) -> Self {
        self.concurrency = concurrency.max(1);
        self.adapter_timeout = adapter_timeout;
        self
    }

    /// Run one ingestion cycle. Never fails: source and write failures are
    /// reported in the summary.
    pub async fn run_cycle(&self) -> IngestionSummary {
        let run_id = Uuid::new_v4();
        let started = Utc::now();
        info!("Ingestion cycle {} starting with {} sources", run_id, self.adapters.len());

        let outcomes = self.fetch_all(started).await;

        let mut total_fetched = 0;
        let mut saved_count = 0;
        let mut duplicate_count = 0;
        let mut failed_writes = Vec::new();
        let mut sources = Vec::with_capacity(outcomes.len());

        for outcome in outcomes {
            total_fetched += outcome.quotes.len();
            for quote in &outcome.quotes {
                match self.write(quote) {
                    WriteResult::Saved => saved_count += 1,
                    WriteResult::Duplicate => duplicate_count += 1,
                    WriteResult::Failed(reason) => failed_writes.push(reason),
                }
            }
            sources.push(SourceReport {
                source: outcome.source,
                fetched: outcome.quotes.len(),
                error: outcome.error,
            });
        }

        let healthy = sources.iter().filter(|r| r.error.is_none()).count();
        let message = format!(
            "Fetched {} quotes from {}/{} sources, saved {}",
            total_fetched,
            healthy,
            sources.len(),
            saved_count
        );
        info!(
            "Ingestion cycle {} done: {} ({} duplicates, {} failed writes)",
            run_id,
            message,
            duplicate_count,
            failed_writes.len()
        );

        IngestionSummary {
            run_id,
            message,
            total_fetched,
            saved_count,
            duplicate_count,
            failed_writes,
            sources,
            timestamp: started,
            tracked_instruments: self.symbols.tracked().cloned().collect(),
        }
    }

    /// Fetch from all adapters with bounded concurrency and a per-adapter
    /// timeout. Outcomes are returned in adapter order.
    async fn fetch_all(&self, as_of: DateTime<Utc>) -> Vec<FeedOutcome> {
        let limit = self.adapter_timeout;
        let adapters: Vec<Arc<dyn FeedAdapter>> = self.adapters.clone();

        let fetches: Vec<_> = adapters
            .into_iter()
            .enumerate()
            .map(|(index, adapter)| fetch_one(index, adapter, as_of, limit).boxed())
            .collect();

        let mut outcomes: Vec<(usize, FeedOutcome)> = stream::iter(fetches)
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        outcomes.sort_by_key(|(index, _)| *index);
        outcomes.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Upsert with a single retry.
    fn write(&self, quote: &PriceQuote) -> WriteResult {
        let mut last_error = String::new();
        for attempt in 1..=2 {
            match self.store.upsert(quote) {
                Ok(UpsertOutcome::Inserted) => return WriteResult::Saved,
                Ok(UpsertOutcome::Duplicate) => return WriteResult::Duplicate,
                Err(e) => {
                    warn!("Write attempt {} for {} failed: {}", attempt, quote.key(), e);
                    last_error = e.to_string();
                }
            }
        }
        error!("Giving up on {}: {}", quote.key(), last_error);
        WriteResult::Failed(last_error)
    }

    /// Run cycles forever on a fixed interval.
    pub async fn run_forever(self: Arc<Self>, interval: Duration) {
        info!("Starting ingestion loop every {:?}", interval);
        loop {
            let summary = self.run_cycle().await;
            for report in summary.failed_sources() {
                warn!("{} failed last cycle: {:?}", report.source, report.error);
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Run one adapter under `limit`, turning a timeout into a failed outcome.
async fn fetch_one(
    index: usize,
    adapter: Arc<dyn FeedAdapter>,
    as_of: DateTime<Utc>,
    limit: Duration,
) -> (usize, FeedOutcome) {
    let source = adapter.source();
    let outcome = match tokio::time::timeout(limit, adapter.fetch_quotes(as_of)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            let err = FeedError::Timeout {
                feed: source,
                secs: limit.as_secs(),
            };
            warn!("{}", err);
            FeedOutcome::failed(source, err)
        }
    };
    (index, outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StoreError;
    use crate::services::price_store::MemoryPriceStore;
    use crate::types::{Instrument, PriceSource};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use rust_decimal_macros::dec;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StaticAdapter {
        source: PriceSource,
        codes: Vec<&'static str>,
        delay: Option<Duration>,
        fail: bool,
    }

    #[async_trait]
    impl FeedAdapter for StaticAdapter {
        fn source(&self) -> PriceSource {
            self.source
        }

        async fn fetch(&self, _as_of: DateTime<Utc>) -> Result<Vec<PriceQuote>, FeedError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if self.fail {
                return Err(FeedError::Upstream {
                    feed: self.source,
                    message: "down".to_string(),
                });
            }
            let at = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
            Ok(self
                .codes
                .iter()
                .map(|c| PriceQuote::new(Instrument::new(c), self.source, dec!(1), at))
                .collect())
        }
    }

    fn adapter(source: PriceSource, codes: Vec<&'static str>) -> Arc<dyn FeedAdapter> {
        Arc::new(StaticAdapter {
            source,
            codes,
            delay: None,
            fail: false,
        })
    }

    fn symbols() -> Arc<SymbolTable> {
        Arc::new(SymbolTable::new(vec![Instrument::new("BTC"), Instrument::new("ETH")]).unwrap())
    }

    #[tokio::test]
    async fn test_failing_source_does_not_block_others() {
        let failing: Arc<dyn FeedAdapter> = Arc::new(StaticAdapter {
            source: PriceSource::CoinGecko,
            codes: vec![],
            delay: None,
            fail: true,
        });
        let store = Arc::new(MemoryPriceStore::new());
        let service = IngestionService::new(
            vec![failing, adapter(PriceSource::Binance, vec!["BTC", "ETH"])],
            store.clone(),
            symbols(),
        );

        let summary = service.run_cycle().await;
        assert_eq!(summary.total_fetched, 2);
        assert_eq!(summary.saved_count, 2);
        assert_eq!(summary.failed_sources().count(), 1);
        assert_eq!(summary.sources[0].source, PriceSource::CoinGecko);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_rerun_counts_duplicates_not_saves() {
        let store = Arc::new(MemoryPriceStore::new());
        let service = IngestionService::new(
            vec![
                adapter(PriceSource::Binance, vec!["BTC"]),
                adapter(PriceSource::CoinGecko, vec!["BTC"]),
            ],
            store.clone(),
            symbols(),
        );

        let first = service.run_cycle().await;
        assert_eq!(first.saved_count, 2);

        let second = service.run_cycle().await;
        assert_eq!(second.saved_count, 0);
        assert_eq!(second.duplicate_count, 2);
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_slow_source_times_out() {
        let slow: Arc<dyn FeedAdapter> = Arc::new(StaticAdapter {
            source: PriceSource::Fixer,
            codes: vec!["EURUSD"],
            delay: Some(Duration::from_secs(5)),
            fail: false,
        });
        let service = IngestionService::new(
            vec![slow, adapter(PriceSource::Binance, vec!["BTC"])],
            Arc::new(MemoryPriceStore::new()),
            symbols(),
        )
        .with_limits(2, Duration::from_millis(50));

        let summary = service.run_cycle().await;
        assert_eq!(summary.saved_count, 1);
        let fixer = &summary.sources[0];
        assert_eq!(fixer.fetched, 0);
        assert!(fixer.error.as_deref().unwrap().contains("timed out"));
    }

    /// Fails the first `failures` writes, then delegates.
    struct FlakyStore {
        inner: MemoryPriceStore,
        failures: AtomicUsize,
    }

    impl PriceStore for FlakyStore {
        fn upsert(&self, quote: &PriceQuote) -> Result<UpsertOutcome, StoreError> {
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(StoreError::Backend("disk full".to_string()));
            }
            self.inner.upsert(quote)
        }

        fn latest_for(&self, instrument: &Instrument) -> Result<Option<PriceQuote>, StoreError> {
            self.inner.latest_for(instrument)
        }

        fn history(
            &self,
            instrument: &Instrument,
            since: DateTime<Utc>,
            limit: Option<usize>,
        ) -> Result<Vec<PriceQuote>, StoreError> {
            self.inner.history(instrument, since, limit)
        }

        fn freshest_timestamp(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
            self.inner.freshest_timestamp()
        }
    }

    #[tokio::test]
    async fn test_write_retried_once_then_recorded() {
        // First quote fails twice (recorded), second quote succeeds
        let store = Arc::new(FlakyStore {
            inner: MemoryPriceStore::new(),
            failures: AtomicUsize::new(2),
        });
        let service = IngestionService::new(
            vec![adapter(PriceSource::Binance, vec!["BTC", "ETH"])],
            store.clone(),
            symbols(),
        );

        let summary = service.run_cycle().await;
        assert_eq!(summary.saved_count, 1);
        assert_eq!(summary.failed_writes.len(), 1);

        // A single transient failure is absorbed by the retry
        store.failures.store(1, Ordering::SeqCst);
        let summary = service.run_cycle().await;
        assert_eq!(summary.saved_count, 1);
        assert!(summary.failed_writes.is_empty());
    }
}
