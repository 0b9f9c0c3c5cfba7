mod capabilities;
mod config;
mod dto;
mod error;
mod monitor;
mod routes;
mod state;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use nimbus_compute::ComputeService;
use nimbus_compute::addresses::AddressPool;
use nimbus_compute::catalog::Catalog;
use nimbus_compute::tracker::ResourceTracker;
use nimbus_infra::VirtDriver;
use nimbus_infra::simulated::SimulatedDriver;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use crate::config::AppConfig;
use crate::routes::api_router;
use crate::state::AppState;

#[tokio::main]
async fn main() {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = AppConfig::from_env();

    // Catalog
    let catalog = Catalog::from_seed(config.catalog_seed()).expect("failed to seed catalog");
    tracing::info!(
        flavors = catalog.list_flavors().len(),
        images = catalog.list_images().len(),
        "catalog ready"
    );

    // Virtualization driver
    let driver = Arc::new(SimulatedDriver::new());
    tracing::info!(driver = driver.name(), "virtualization driver ready");

    let tracker = ResourceTracker::new(config.host);
    tracing::info!(limits = ?tracker.usage().limits, network = %config.address_pool, "host ready");

    let compute = ComputeService::new(
        catalog,
        driver,
        tracker,
        AddressPool::new(config.address_pool),
        config.lifecycle(),
    );

    monitor::spawn_audit(compute.clone(), config.audit_interval_secs.get());
    tracing::info!(interval_secs = config.audit_interval_secs.get(), "guest audit started");

    let state = AppState::new(compute, config.capabilities.clone());
    let app = api_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .expect("failed to bind listener");

    tracing::info!(addr = %config.listen_addr, "starting compute API");

    axum::serve(listener, app).await.expect("server error");
}
