//! read side of the hub
//!
//! answers from the in-memory store first. when a durable history is
//! attached it also covers devices and readings from before the last restart.
//! an unknown device is an empty answer, never an error.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::domain::{DeviceSummary, Reading, TimeRange};
use crate::ingest::{IngestStats, StatsSnapshot};
use crate::store::DeviceStateStore;

#[derive(Clone)]
pub struct QueryFacade {
    store: DeviceStateStore,
    stats: Arc<IngestStats>,
    locations: Arc<BTreeMap<String, String>>,
}

impl QueryFacade {
    pub fn new(store: DeviceStateStore, stats: Arc<IngestStats>) -> Self {
        Self {
            store,
            stats,
            locations: Arc::default(),
        }
    }

    /// device id -> location, as configured
    pub fn with_locations(mut self, locations: BTreeMap<String, String>) -> Self {
        self.locations = Arc::new(locations);
        self
    }

    pub async fn current(&self, device_id: &str) -> Option<Reading> {
        if let Some(reading) = self.store.get_latest(device_id) {
            return Some(reading);
        }
        let history = self.store.persistence()?;
        match history.latest(device_id).await {
            Ok(reading) => reading,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "history lookup failed");
                None
            }
        }
    }

    /// every device with data, live or durable, sorted by id
    pub async fn all_devices(&self) -> Vec<DeviceSummary> {
        let mut latest: BTreeMap<String, Reading> = BTreeMap::new();

        if let Some(history) = self.store.persistence() {
            match history.devices().await {
                Ok(ids) => {
                    for id in ids {
                        match history.latest(&id).await {
                            Ok(Some(reading)) => {
                                latest.insert(id, reading);
                            }
                            Ok(None) => {}
                            Err(e) => tracing::warn!(device_id = %id, error = %e, "history lookup failed"),
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "history device listing failed"),
            }
        }
        // live state wins over what was persisted
        for reading in self.store.snapshot() {
            latest.insert(reading.device_id.clone(), reading);
        }

        latest
            .into_iter()
            .map(|(device_id, reading)| DeviceSummary {
                location: self.locations.get(&device_id).cloned(),
                device_id,
                latest: Some(reading),
            })
            .collect()
    }

    /// number of devices with data, live or durable
    pub async fn device_count(&self) -> usize {
        let mut ids = self.store.list_devices();
        if let Some(history) = self.store.persistence() {
            match history.devices().await {
                Ok(durable) => ids.extend(durable),
                Err(e) => tracing::warn!(error = %e, "history device listing failed"),
            }
        }
        ids.len()
    }

    /// chronological readings of one device inside `range`
    ///
    /// durable rows older than the first reading this process decoded come
    /// from earlier runs. everything from then on is answered from memory,
    /// which also holds readings whose durable write failed.
    pub async fn history(&self, device_id: &str, range: TimeRange) -> Vec<Reading> {
        let live = self.store.get_history(device_id, range);
        let Some(history) = self.store.persistence() else {
            return live;
        };

        let durable = match history.history(device_id, range).await {
            Ok(readings) => readings,
            Err(e) => {
                tracing::warn!(device_id, error = %e, "history query failed, answering from memory");
                return live;
            }
        };

        let mut merged: Vec<Reading> = match self.store.first_observed_at(device_id) {
            Some(live_since) => durable.into_iter().filter(|r| r.observed_at_ms < live_since).collect(),
            None => durable,
        };
        merged.extend(live);
        merged
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }
}
