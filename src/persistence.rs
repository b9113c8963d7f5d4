//! ==============================================================================
//! persistence.rs - durable per-device reading history
//! ==============================================================================
//!
//! purpose:
//!     append-only history of every accepted reading, keyed by device id, so
//!     trends survive a hub restart.
//!
//! design:
//!     `SqliteHistory` owns a dedicated os thread holding the
//!     `rusqlite::Connection`. async callers send a `DbCommand` over a bounded
//!     `std::sync::mpsc::sync_channel` and await a `tokio::sync::oneshot`
//!     reply. the async executor never blocks on sqlite, and the writer thread
//!     never awaits.
//!
//! relationships:
//!     - used by: store.rs (best-effort append after each upsert)
//!     - used by: facade.rs (history queries that outlive the process)
//!     - used by: main.rs (retention pruning task)
//!
//! ==============================================================================

use std::future::Future;
use std::path::Path;
use std::pin::Pin;

use rusqlite::{params, Connection};

use crate::domain::{Reading, TimeRange};
use crate::error::PersistError;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// durable history contract
///
/// implementations must accept concurrent appends for distinct devices.
pub trait PersistenceAdapter: Send + Sync {
    fn append<'a>(&'a self, device_id: &'a str, reading: &'a Reading) -> BoxFuture<'a, Result<(), PersistError>>;

    fn latest<'a>(&'a self, device_id: &'a str) -> BoxFuture<'a, Result<Option<Reading>, PersistError>>;

    /// chronological, oldest first
    fn history<'a>(&'a self, device_id: &'a str, range: TimeRange) -> BoxFuture<'a, Result<Vec<Reading>, PersistError>>;

    fn devices(&self) -> BoxFuture<'_, Result<Vec<String>, PersistError>>;

    /// delete readings observed before `older_than_ms`, returns rows removed
    fn prune(&self, older_than_ms: u64) -> BoxFuture<'_, Result<u64, PersistError>>;
}

// ==============================================================================
// writer thread commands
// ==============================================================================

type Reply<T> = tokio::sync::oneshot::Sender<Result<T, PersistError>>;

enum DbCommand {
    Append { device_id: String, json: String, observed_at: i64, reply: Reply<()> },
    Latest { device_id: String, reply: Reply<Option<Reading>> },
    History { device_id: String, from: Option<i64>, to: Option<i64>, reply: Reply<Vec<Reading>> },
    Devices { reply: Reply<Vec<String>> },
    Prune { cutoff: i64, reply: Reply<u64> },
}

/// sqlite-backed history
///
/// `Clone` only clones the channel handle. the writer thread exits when the
/// last clone is dropped.
#[derive(Clone)]
pub struct SqliteHistory {
    tx: std::sync::mpsc::SyncSender<DbCommand>,
}

impl SqliteHistory {
    /// Opens (or creates) the database at `path` and starts the writer thread.
    ///
    /// Schema and WAL mode are set up synchronously, before any async caller
    /// can reach the connection.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, PersistError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS readings (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                device_id    TEXT    NOT NULL,
                reading_json TEXT    NOT NULL,
                observed_at  INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_readings_device_time
                ON readings(device_id, observed_at);",
        )?;

        let (tx, rx) = std::sync::mpsc::sync_channel::<DbCommand>(64);
        std::thread::Builder::new()
            .name("hub-sqlite".to_string())
            .spawn(move || run_db_thread(conn, rx))
            .map_err(|e| PersistError::Backend(e.to_string()))?;

        Ok(Self { tx })
    }

    async fn call<T>(&self, cmd: impl FnOnce(Reply<T>) -> DbCommand) -> Result<T, PersistError> {
        let (reply_tx, reply_rx) = tokio::sync::oneshot::channel();
        // blocks only while the 64-slot queue is full
        self.tx.send(cmd(reply_tx)).map_err(|_| PersistError::Shutdown)?;
        reply_rx.await.map_err(|_| PersistError::Shutdown)?
    }
}

fn to_sql_ts(ms: u64) -> Result<i64, PersistError> {
    i64::try_from(ms).map_err(|_| PersistError::Backend(format!("timestamp {ms} overflows i64")))
}

fn run_db_thread(conn: Connection, rx: std::sync::mpsc::Receiver<DbCommand>) {
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DbCommand::Append { device_id, json, observed_at, reply } => {
                let result = conn
                    .prepare_cached("INSERT INTO readings (device_id, reading_json, observed_at) VALUES (?1, ?2, ?3)")
                    .and_then(|mut stmt| stmt.execute(params![device_id, json, observed_at]))
                    .map(|_| ())
                    .map_err(PersistError::from);
                let _ = reply.send(result);
            }
            DbCommand::Latest { device_id, reply } => {
                let result = query_readings(
                    &conn,
                    "SELECT reading_json FROM readings WHERE device_id = ?1
                     ORDER BY observed_at DESC, id DESC LIMIT 1",
                    params![device_id],
                )
                .map(|mut rows| rows.pop());
                let _ = reply.send(result);
            }
            DbCommand::History { device_id, from, to, reply } => {
                let result = query_readings(
                    &conn,
                    "SELECT reading_json FROM readings
                     WHERE device_id = ?1
                       AND (?2 IS NULL OR observed_at >= ?2)
                       AND (?3 IS NULL OR observed_at <= ?3)
                     ORDER BY observed_at ASC, id ASC",
                    params![device_id, from, to],
                );
                let _ = reply.send(result);
            }
            DbCommand::Devices { reply } => {
                let result = conn
                    .prepare_cached("SELECT DISTINCT device_id FROM readings ORDER BY device_id")
                    .and_then(|mut stmt| {
                        let ids = stmt
                            .query_map([], |row| row.get::<_, String>(0))?
                            .collect::<Result<Vec<_>, _>>();
                        ids
                    })
                    .map_err(PersistError::from);
                let _ = reply.send(result);
            }
            DbCommand::Prune { cutoff, reply } => {
                let result = conn
                    .prepare_cached("DELETE FROM readings WHERE observed_at < ?1")
                    .and_then(|mut stmt| stmt.execute(params![cutoff]))
                    .map(|n| n as u64)
                    .map_err(PersistError::from);
                let _ = reply.send(result);
            }
        }
    }
}

fn query_readings(conn: &Connection, sql: &str, params: impl rusqlite::Params) -> Result<Vec<Reading>, PersistError> {
    let mut stmt = conn.prepare_cached(sql)?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;

    let mut readings = Vec::with_capacity(rows.len());
    for json in rows {
        match serde_json::from_str::<Reading>(&json) {
            Ok(reading) => readings.push(reading),
            Err(e) => tracing::warn!("sqlite: skipping corrupted history row: {e}"),
        }
    }
    Ok(readings)
}

impl PersistenceAdapter for SqliteHistory {
    fn append<'a>(&'a self, device_id: &'a str, reading: &'a Reading) -> BoxFuture<'a, Result<(), PersistError>> {
        Box::pin(async move {
            let json = serde_json::to_string(reading)?;
            let observed_at = to_sql_ts(reading.observed_at_ms)?;
            let device_id = device_id.to_string();
            self.call(|reply| DbCommand::Append { device_id, json, observed_at, reply }).await
        })
    }

    fn latest<'a>(&'a self, device_id: &'a str) -> BoxFuture<'a, Result<Option<Reading>, PersistError>> {
        Box::pin(async move {
            let device_id = device_id.to_string();
            self.call(|reply| DbCommand::Latest { device_id, reply }).await
        })
    }

    fn history<'a>(&'a self, device_id: &'a str, range: TimeRange) -> BoxFuture<'a, Result<Vec<Reading>, PersistError>> {
        Box::pin(async move {
            let from = range.from_ms.map(to_sql_ts).transpose()?;
            let to = range.to_ms.map(to_sql_ts).transpose()?;
            let device_id = device_id.to_string();
            self.call(|reply| DbCommand::History { device_id, from, to, reply }).await
        })
    }

    fn devices(&self) -> BoxFuture<'_, Result<Vec<String>, PersistError>> {
        Box::pin(async move { self.call(|reply| DbCommand::Devices { reply }).await })
    }

    fn prune(&self, older_than_ms: u64) -> BoxFuture<'_, Result<u64, PersistError>> {
        Box::pin(async move {
            let cutoff = to_sql_ts(older_than_ms)?;
            self.call(|reply| DbCommand::Prune { cutoff, reply }).await
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reading(device_id: &str, temp: f64, ts: u64) -> Reading {
        Reading {
            device_id: device_id.to_string(),
            temperature_celsius: temp,
            humidity_percent: 40.0,
            battery_volts: Some(3.1),
            observed_at_ms: ts,
        }
    }

    #[tokio::test]
    async fn test_append_and_latest() {
        let dir = tempfile::tempdir().unwrap();
        let history = SqliteHistory::open(dir.path().join("test.db")).unwrap();

        history.append("eui-a", &reading("eui-a", 17.0, 1000)).await.unwrap();
        history.append("eui-a", &reading("eui-a", 18.5, 2000)).await.unwrap();
        history.append("eui-b", &reading("eui-b", 9.0, 1500)).await.unwrap();

        let latest = history.latest("eui-a").await.unwrap().unwrap();
        assert_eq!(latest.temperature_celsius, 18.5);
        assert_eq!(latest.battery_volts, Some(3.1));
        assert!(history.latest("eui-missing").await.unwrap().is_none());

        assert_eq!(history.devices().await.unwrap(), vec!["eui-a".to_string(), "eui-b".to_string()]);
    }

    #[tokio::test]
    async fn test_history_range_is_chronological() {
        let dir = tempfile::tempdir().unwrap();
        let history = SqliteHistory::open(dir.path().join("range.db")).unwrap();

        for ts in [5000u64, 1000, 3000, 2000, 4000] {
            history.append("eui-a", &reading("eui-a", ts as f64 / 100.0, ts)).await.unwrap();
        }

        let all = history.history("eui-a", TimeRange::ALL).await.unwrap();
        let stamps: Vec<u64> = all.iter().map(|r| r.observed_at_ms).collect();
        assert_eq!(stamps, vec![1000, 2000, 3000, 4000, 5000]);

        let window = history.history("eui-a", TimeRange::between(2000, 4000)).await.unwrap();
        assert_eq!(window.len(), 3);

        // same query again sees the same rows
        let again = history.history("eui-a", TimeRange::between(2000, 4000)).await.unwrap();
        assert_eq!(window, again);
    }

    #[tokio::test]
    async fn test_duplicates_are_kept() {
        let dir = tempfile::tempdir().unwrap();
        let history = SqliteHistory::open(dir.path().join("dup.db")).unwrap();

        let r = reading("eui-a", 20.0, 1000);
        history.append("eui-a", &r).await.unwrap();
        history.append("eui-a", &r).await.unwrap();

        assert_eq!(history.history("eui-a", TimeRange::ALL).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_prune() {
        let dir = tempfile::tempdir().unwrap();
        let history = SqliteHistory::open(dir.path().join("prune.db")).unwrap();

        history.append("eui-a", &reading("eui-a", 1.0, 1000)).await.unwrap();
        history.append("eui-b", &reading("eui-b", 2.0, 2000)).await.unwrap();
        history.append("eui-a", &reading("eui-a", 3.0, 3000)).await.unwrap();

        assert_eq!(history.prune(2500).await.unwrap(), 2);
        assert_eq!(history.devices().await.unwrap(), vec!["eui-a".to_string()]);
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reopen.db");

        {
            let history = SqliteHistory::open(&path).unwrap();
            history.append("eui-a", &reading("eui-a", 21.0, 1000)).await.unwrap();
        }

        let history = SqliteHistory::open(&path).unwrap();
        let latest = history.latest("eui-a").await.unwrap().unwrap();
        assert_eq!(latest.temperature_celsius, 21.0);
    }
}
