use std::sync::Arc;

use agrodispatch::config::DispatchConfig;
use agrodispatch::dispatch::{DispatchService, RoutingTable};
use agrodispatch::{database, logging};
use tracing::info;

const DEFAULT_DATABASE_URL: &str = "sqlite:dispatch.db?mode=rwc";
const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8420";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    logging::init();

    let config = DispatchConfig::from_env();
    let database_url =
        std::env::var("DATABASE_URL").unwrap_or_else(|_| DEFAULT_DATABASE_URL.to_string());
    let bind_addr =
        std::env::var("DISPATCH_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());

    let pool = database::init_pool(&database_url).await?;
    database::run_migrations(&pool).await?;

    let service = Arc::new(DispatchService::new(pool, config, RoutingTable::default()).await?);
    service.start();

    let app = agrodispatch::api::router(service.clone());
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "dispatch API listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    service.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
