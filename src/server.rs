//! ==============================================================================
//! server.rs - json api over the device state
//! ==============================================================================
//!
//! routes:
//!     GET /api/health                 feed status and ingest counters
//!     GET /api/devices                every device with its latest reading
//!     GET /api/devices/:id            latest reading, "no data yet" if none
//!     GET /api/devices/:id/history    readings, optional ?from=&to= (unix ms)
//!
//! read-only: nothing here mutates device state.
//!
//! ==============================================================================

use std::future::Future;

use anyhow::Result;
use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::get,
    Router,
};
use serde::Serialize;
use tower_http::cors::CorsLayer;

use crate::domain::{DeviceSummary, Reading, TimeRange};
use crate::facade::QueryFacade;
use crate::ingest::StatsSnapshot;

pub const NO_DATA_YET: &str = "no data yet";

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    devices: usize,
    ingest: StatsSnapshot,
}

#[derive(Serialize)]
struct CurrentResponse {
    device_id: String,
    reading: Option<Reading>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
}

pub fn router(facade: QueryFacade) -> Router {
    Router::new()
        .route("/api/health", get(health_handler))
        .route("/api/devices", get(devices_handler))
        .route("/api/devices/:id", get(current_handler))
        .route("/api/devices/:id/history", get(history_handler))
        .layer(CorsLayer::permissive())
        .with_state(facade)
}

/// serve until `shutdown` resolves
pub async fn run_server(
    listener: tokio::net::TcpListener,
    facade: QueryFacade,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    axum::serve(listener, router(facade))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

async fn health_handler(State(facade): State<QueryFacade>) -> Json<HealthResponse> {
    let ingest = facade.stats();
    Json(HealthResponse {
        status: if ingest.connected { "ok" } else { "degraded" },
        devices: facade.device_count().await,
        ingest,
    })
}

async fn devices_handler(State(facade): State<QueryFacade>) -> Json<Vec<DeviceSummary>> {
    Json(facade.all_devices().await)
}

async fn current_handler(State(facade): State<QueryFacade>, Path(device_id): Path<String>) -> Json<CurrentResponse> {
    let reading = facade.current(&device_id).await;
    let message = reading.is_none().then_some(NO_DATA_YET);
    Json(CurrentResponse {
        device_id,
        reading,
        message,
    })
}

async fn history_handler(
    State(facade): State<QueryFacade>,
    Path(device_id): Path<String>,
    Query(range): Query<TimeRange>,
) -> Json<Vec<Reading>> {
    Json(facade.history(&device_id, range).await)
}
