use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tally::config::Config;
use tally::services::{CheckpointStore, SqliteStore};
use tally::sources::HttpTransport;
use tally::{api, AppState};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tally=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env();
    let one_shot = std::env::args().nth(1).as_deref() == Some("ingest");

    // Open the database that backs quotes, the ledger and checkpoints
    let store = Arc::new(SqliteStore::new(&config.database_path)?);
    let checkpoints = config
        .portfolio_checkpoints
        .then(|| store.clone() as Arc<dyn CheckpointStore>);

    let state = AppState::build(
        config,
        Arc::new(HttpTransport::new()?),
        store.clone(),
        store,
        checkpoints,
    )?;

    if one_shot {
        let summary = state.ingestion.run_cycle().await;
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    let config = state.config.clone();
    info!("Starting Tally server on {}:{}", config.host, config.port);

    // Optional in-process ingestion loop
    if let Some(secs) = config.ingest_interval_secs {
        let ingestion = state.ingestion.clone();
        tokio::spawn(ingestion.run_forever(Duration::from_secs(secs)));
    }

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Build the router
    let app = Router::new()
        .merge(api::router())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    // Start the server
    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Tally server listening on {}", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
