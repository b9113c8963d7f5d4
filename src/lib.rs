//! weather-hub: decodes LoRaWAN weather-sensor uplinks from an mqtt feed,
//! keeps the latest and historical readings per device, and serves them.
//!
//! ```text
//! broker -> feed -> ingest -> codec -> store (+ sqlite history) -> facade -> api
//! ```

pub mod codec;
pub mod config;
pub mod domain;
pub mod error;
pub mod facade;
pub mod feed;
pub mod ingest;
pub mod persistence;
pub mod server;
pub mod store;

use std::sync::Arc;

use anyhow::Context;

use config::HubConfig;
use facade::QueryFacade;
use ingest::{IngestStats, UplinkHandler};
use persistence::SqliteHistory;
use store::DeviceStateStore;

/// everything the hub's tasks share, built once at startup
#[derive(Clone)]
pub struct HubContext {
    pub config: Arc<HubConfig>,
    pub store: DeviceStateStore,
    pub stats: Arc<IngestStats>,
}

impl HubContext {
    /// Build the store (and open the sqlite history if one is configured).
    pub fn build(config: HubConfig) -> anyhow::Result<Self> {
        let mut store = DeviceStateStore::new();
        if let Some(path) = &config.storage.sqlite_path {
            let history = SqliteHistory::open(path)
                .with_context(|| format!("failed to open history database {}", path.display()))?;
            store = store.with_persistence(Arc::new(history));
        }

        Ok(Self {
            config: Arc::new(config),
            store,
            stats: Arc::default(),
        })
    }

    pub fn uplink_handler(&self) -> UplinkHandler {
        UplinkHandler::new(self.store.clone(), self.stats.clone()).show_sensor_data(self.config.logging.show_sensor_data)
    }

    pub fn facade(&self) -> QueryFacade {
        let locations = self
            .config
            .devices
            .iter()
            .filter_map(|(id, device)| device.location.clone().map(|loc| (id.clone(), loc)))
            .collect();
        QueryFacade::new(self.store.clone(), self.stats.clone()).with_locations(locations)
    }
}
