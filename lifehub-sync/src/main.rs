//! lifehub-sync - Job correlation and entity merge service
//!
//! Tracks background generation jobs against the domain entities they
//! affect, keeps live previews in sync over SSE, and drives entity
//! de-duplication merges with consistent reference rewriting.
//!
//! - Port: 5810
//! - Talks to the UI via HTTP REST + SSE; workers report back via
//!   POST /jobs/{id}/status

use anyhow::Result;
use lifehub_common::config::TomlConfig;
use lifehub_common::events::EventBus;
use std::path::Path;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use lifehub_sync::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting lifehub-sync service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = TomlConfig::load()?;
    info!("Port: {}", config.port);

    let db_path = Path::new(&config.database_path);
    info!("Database: {}", db_path.display());
    let db_pool = lifehub_sync::db::init_database_pool(db_path).await?;
    info!("Database connection established");

    let event_bus = EventBus::new(config.event_bus_capacity);
    info!("Event bus initialized (capacity {})", config.event_bus_capacity);

    let state = AppState::new(db_pool, event_bus, &config);
    let app = lifehub_sync::build_router(state);

    let listener = tokio::net::TcpListener::bind(("127.0.0.1", config.port)).await?;
    info!("Listening on http://127.0.0.1:{}", config.port);
    info!("Health check: http://127.0.0.1:{}/health", config.port);

    axum::serve(listener, app).await?;

    Ok(())
}
