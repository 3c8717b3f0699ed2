//! Tally - market-data normalization and paper portfolio accounting server

pub mod api;
pub mod config;
pub mod error;
pub mod services;
pub mod sources;
pub mod types;

use config::Config;
use error::ConfigError;
use services::{
    CheckpointStore, DashboardProjector, IngestionService, PortfolioAccountant, PriceStore,
    SymbolTable, TradeLedger,
};
use sources::{build_adapters, Fetcher, Transport};
use std::sync::Arc;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub symbols: Arc<SymbolTable>,
    pub prices: Arc<dyn PriceStore>,
    pub ledger: Arc<dyn TradeLedger>,
    pub ingestion: Arc<IngestionService>,
    pub accountant: Arc<PortfolioAccountant>,
    pub projector: Arc<DashboardProjector>,
}

impl AppState {
    /// Wire the services over the given stores. Adapters talk to upstream
    /// feeds through `transport`.
    pub fn build(
        config: Config,
        transport: Arc<dyn Transport>,
        prices: Arc<dyn PriceStore>,
        ledger: Arc<dyn TradeLedger>,
        checkpoints: Option<Arc<dyn CheckpointStore>>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let symbols = Arc::new(SymbolTable::new(config.tracked_instruments())?);
        let fetcher = Fetcher::new(transport, config.retry);
        let adapters = build_adapters(&config, fetcher, symbols.clone());

        let ingestion = Arc::new(
            IngestionService::new(adapters, prices.clone(), symbols.clone())
                .with_limits(config.ingest_concurrency, config.adapter_timeout),
        );

        let mut accountant =
            PortfolioAccountant::new(ledger.clone(), prices.clone(), config.initial_balance);
        if let Some(store) = checkpoints {
            accountant = accountant.with_checkpoints(store);
        }
        let accountant = Arc::new(accountant);

        let projector = Arc::new(DashboardProjector::new(
            accountant.clone(),
            prices.clone(),
            ledger.clone(),
            symbols.clone(),
            config.stale_threshold_secs,
        ));

        Ok(Self {
            config,
            symbols,
            prices,
            ledger,
            ingestion,
            accountant,
            projector,
        })
    }
}
