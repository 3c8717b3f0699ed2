pub mod dashboard;
pub mod ingestion;
pub mod ledger;
pub mod portfolio;
pub mod price_store;
pub mod sqlite_store;
pub mod symbols;

pub use dashboard::DashboardProjector;
pub use ingestion::IngestionService;
pub use ledger::{MemoryLedger, TradeLedger};
pub use portfolio::{
    compute_snapshot, Checkpoint, CheckpointStore, MemoryCheckpoints, PortfolioAccountant,
    PortfolioFold,
};
pub use price_store::{MemoryPriceStore, PriceStore, UpsertOutcome};
pub use sqlite_store::SqliteStore;
pub use symbols::SymbolTable;
