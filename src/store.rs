//! ==============================================================================
//! store.rs - in-memory device state
//! ==============================================================================
//!
//! purpose:
//!     holds the latest reading and the full reading history of every device
//!     the hub has successfully decoded at least once.
//!
//! locking:
//!     one `std::sync::Mutex` over the whole map. critical sections are a map
//!     lookup plus a push; the lock is never held across an `.await`, so the
//!     optional history write happens strictly after the guard is dropped.
//!
//! relationships:
//!     - written by: ingest.rs (one upsert per accepted uplink)
//!     - read by: facade.rs
//!     - forwards to: persistence.rs (best effort)
//!
//! ==============================================================================

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::domain::{Reading, TimeRange};
use crate::persistence::PersistenceAdapter;

/// latest reading plus everything before it, oldest first
#[derive(Clone, Debug)]
struct DeviceState {
    latest: Reading,
    history: Vec<Reading>,
}

impl DeviceState {
    fn new(reading: Reading) -> Self {
        Self {
            latest: reading.clone(),
            history: vec![reading],
        }
    }

    fn record(&mut self, reading: Reading) {
        self.history.push(reading.clone());
        self.latest = reading;
    }
}

/// shared handle to the device map
///
/// cloning is cheap; all clones see the same devices.
#[derive(Clone, Default)]
pub struct DeviceStateStore {
    devices: Arc<Mutex<HashMap<String, DeviceState>>>,
    history: Option<Arc<dyn PersistenceAdapter>>,
}

impl DeviceStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// mirror every upsert into a durable history
    pub fn with_persistence(mut self, history: Arc<dyn PersistenceAdapter>) -> Self {
        self.history = Some(history);
        self
    }

    pub fn persistence(&self) -> Option<&Arc<dyn PersistenceAdapter>> {
        self.history.as_ref()
    }

    // a panic while holding the guard cannot leave a half-written entry
    // (record() only pushes then assigns), so a poisoned map is still usable
    fn lock(&self) -> MutexGuard<'_, HashMap<String, DeviceState>> {
        self.devices.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a reading as the device's latest and append it to its history.
    ///
    /// Readers see either the previous reading or this one, never a mix.
    /// A failed history write is logged and does not undo the in-memory update.
    pub async fn upsert(&self, device_id: &str, reading: Reading) {
        let forward = self.history.as_ref().map(|_| reading.clone());

        {
            let mut devices = self.lock();
            match devices.get_mut(device_id) {
                Some(state) => state.record(reading),
                None => {
                    devices.insert(device_id.to_string(), DeviceState::new(reading));
                }
            }
        }

        if let (Some(history), Some(reading)) = (&self.history, forward) {
            if let Err(e) = history.append(device_id, &reading).await {
                tracing::warn!(device_id, error = %e, "history write failed, keeping in-memory state");
            }
        }
    }

    pub fn get_latest(&self, device_id: &str) -> Option<Reading> {
        self.lock().get(device_id).map(|state| state.latest.clone())
    }

    /// chronological snapshot of the readings inside `range`
    pub fn get_history(&self, device_id: &str, range: TimeRange) -> Vec<Reading> {
        self.lock()
            .get(device_id)
            .map(|state| {
                state
                    .history
                    .iter()
                    .filter(|r| range.contains(r.observed_at_ms))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// timestamp of the oldest reading held in memory for a device
    pub fn first_observed_at(&self, device_id: &str) -> Option<u64> {
        self.lock()
            .get(device_id)
            .and_then(|state| state.history.first())
            .map(|r| r.observed_at_ms)
    }

    pub fn list_devices(&self) -> BTreeSet<String> {
        self.lock().keys().cloned().collect()
    }

    pub fn device_count(&self) -> usize {
        self.lock().len()
    }

    /// latest reading of every device, sorted by device id
    pub fn snapshot(&self) -> Vec<Reading> {
        let mut latest: Vec<Reading> = self.lock().values().map(|state| state.latest.clone()).collect();
        latest.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        latest
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PersistError;
    use crate::persistence::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn reading(device_id: &str, temp: f64, ts: u64) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            temperature_celsius: temp,
            humidity_percent: 50.0,
            battery_volts: None,
            observed_at_ms: ts,
        }
    }

    /// history backend that always fails, counting attempts
    #[derive(Default)]
    struct BrokenHistory {
        attempts: AtomicUsize,
    }

    impl PersistenceAdapter for BrokenHistory {
        fn append<'a>(&'a self, _device_id: &'a str, _reading: &'a Reading) -> BoxFuture<'a, Result<(), PersistError>> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            Box::pin(async { Err(PersistError::Backend("disk full".to_string())) })
        }

        fn latest<'a>(&'a self, _device_id: &'a str) -> BoxFuture<'a, Result<Option<Reading>, PersistError>> {
            Box::pin(async { Err(PersistError::Shutdown) })
        }

        fn history<'a>(&'a self, _device_id: &'a str, _range: TimeRange) -> BoxFuture<'a, Result<Vec<Reading>, PersistError>> {
            Box::pin(async { Err(PersistError::Shutdown) })
        }

        fn devices(&self) -> BoxFuture<'_, Result<Vec<String>, PersistError>> {
            Box::pin(async { Err(PersistError::Shutdown) })
        }

        fn prune(&self, _older_than_ms: u64) -> BoxFuture<'_, Result<u64, PersistError>> {
            Box::pin(async { Err(PersistError::Shutdown) })
        }
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let store = DeviceStateStore::new();
        assert!(store.get_latest("eui-a").is_none());

        store.upsert("eui-a", reading("eui-a", 10.0, 1)).await;
        store.upsert("eui-a", reading("eui-a", 11.0, 2)).await;

        assert_eq!(store.get_latest("eui-a").unwrap().temperature_celsius, 11.0);
        let temps: Vec<f64> = store
            .get_history("eui-a", TimeRange::ALL)
            .iter()
            .map(|r| r.temperature_celsius)
            .collect();
        assert_eq!(temps, vec![10.0, 11.0]);
    }

    #[tokio::test]
    async fn test_replay_appends_without_changing_latest() {
        let store = DeviceStateStore::new();
        let r = reading("eui-a", 20.0, 100);

        store.upsert("eui-a", r.clone()).await;
        let before = store.get_latest("eui-a");
        store.upsert("eui-a", r.clone()).await;

        assert_eq!(store.get_latest("eui-a"), before);
        assert_eq!(store.get_history("eui-a", TimeRange::ALL), vec![r.clone(), r]);
    }

    #[tokio::test]
    async fn test_history_range_filter() {
        let store = DeviceStateStore::new();
        for ts in [1000, 2000, 3000] {
            store.upsert("eui-a", reading("eui-a", 1.0, ts)).await;
        }

        assert_eq!(store.get_history("eui-a", TimeRange::between(1500, 3000)).len(), 2);
        assert!(store.get_history("eui-a", TimeRange::between(4000, 5000)).is_empty());
        assert!(store.get_history("eui-unknown", TimeRange::ALL).is_empty());
    }

    #[tokio::test]
    async fn test_devices_are_independent() {
        let store = DeviceStateStore::new();
        store.upsert("eui-a", reading("eui-a", 1.0, 1)).await;
        store.upsert("eui-b", reading("eui-b", 2.0, 2)).await;

        let devices: Vec<String> = store.list_devices().into_iter().collect();
        assert_eq!(devices, vec!["eui-a".to_string(), "eui-b".to_string()]);
        assert_eq!(store.get_history("eui-a", TimeRange::ALL).len(), 1);
        assert_eq!(store.device_count(), 2);
        assert_eq!(store.first_observed_at("eui-b"), Some(2));
        assert_eq!(store.first_observed_at("eui-c"), None);

        let snapshot = store.snapshot();
        assert_eq!(snapshot[0].device_id, "eui-a");
        assert_eq!(snapshot[1].device_id, "eui-b");
    }

    #[tokio::test]
    async fn test_persistence_failure_keeps_memory_state() {
        let broken = Arc::new(BrokenHistory::default());
        let store = DeviceStateStore::new().with_persistence(broken.clone());

        store.upsert("eui-a", reading("eui-a", 12.5, 1)).await;

        assert_eq!(broken.attempts.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_latest("eui-a").unwrap().temperature_celsius, 12.5);
    }

    #[tokio::test]
    async fn test_upsert_mirrors_to_sqlite() {
        let dir = tempfile::tempdir().unwrap();
        let history = Arc::new(crate::persistence::SqliteHistory::open(dir.path().join("store.db")).unwrap());
        let store = DeviceStateStore::new().with_persistence(history.clone());

        store.upsert("eui-a", reading("eui-a", 7.0, 1)).await;
        store.upsert("eui-a", reading("eui-a", 8.0, 2)).await;

        let durable = history.history("eui-a", TimeRange::ALL).await.unwrap();
        assert_eq!(durable, store.get_history("eui-a", TimeRange::ALL));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_upserts_for_distinct_devices() {
        let store = DeviceStateStore::new();
        let mut tasks = Vec::new();

        for d in 0..8 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                let id = format!("eui-{d}");
                for ts in 0..50u64 {
                    store.upsert(&id, reading(&id, ts as f64, ts)).await;
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(store.device_count(), 8);
        for d in 0..8 {
            let id = format!("eui-{d}");
            let history = store.get_history(&id, TimeRange::ALL);
            assert_eq!(history.len(), 50);
            // per-device order is preserved
            assert!(history.windows(2).all(|w| w[0].observed_at_ms < w[1].observed_at_ms));
            assert_eq!(store.get_latest(&id).unwrap().observed_at_ms, 49);
        }
    }
}
