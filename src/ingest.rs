//! ==============================================================================
//! ingest.rs - uplink feed to device state pipeline
//! ==============================================================================
//!
//! purpose:
//!     owns the feed, tracks whether it is connected, and turns every inbound
//!     uplink envelope into a stored reading.
//!
//! feed states:
//!
//! ```text
//!     ┌──────────────┐   ConnAck    ┌───────────┐
//!     │ Disconnected │ ───────────> │ Connected │ ──┐ message: handle,
//!     └──────────────┘ <─────────── └───────────┘ <─┘ state unchanged
//!            ▲    error/disconnect,
//!            │    backoff then poll again
//!            └── start
//!
//!     before the first ConnAck, `max_startup_attempts` consecutive failures
//!     are fatal (bad credentials look exactly like this). after that the
//!     ingestor retries forever.
//!
//!     the backoff only resets once a session has delivered a message, so a
//!     broker that accepts and immediately drops us is polled ever more slowly.
//! ```
//!
//! message handling:
//!     one message at a time, in feed order, so per-device order is kept.
//!     a bad message is logged and dropped; it never stops the loop.
//!
//! relationships:
//!     - uses: feed.rs (UplinkFeed), codec.rs (decode), store.rs (upsert)
//!     - used by: main.rs (spawned as a background task)
//!
//! ==============================================================================

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::watch;

use crate::codec;
use crate::config::ReconnectConfig;
use crate::domain::{now_ms, Reading};
use crate::error::{EnvelopeError, IngestError, TransportError};
use crate::feed::{FeedEvent, UplinkFeed};
use crate::store::DeviceStateStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    Disconnected,
    Connected,
}

/// what happened to one inbound message
#[derive(Debug)]
pub enum Outcome {
    Stored(Reading),
    /// not an uplink (join accepts, downlink acks, ...)
    Ignored,
    Rejected(IngestError),
}

// ==============================================================================
// counters
// ==============================================================================

/// ingest counters, shared with the api
#[derive(Debug, Default)]
pub struct IngestStats {
    connected: AtomicBool,
    received: AtomicU64,
    stored: AtomicU64,
    ignored: AtomicU64,
    rejected: AtomicU64,
    reconnects: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub connected: bool,
    pub received: u64,
    pub stored: u64,
    pub ignored: u64,
    pub rejected: u64,
    pub reconnects: u64,
}

impl IngestStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            ignored: self.ignored.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
        }
    }

    fn count(&self, outcome: &Outcome) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let counter = match outcome {
            Outcome::Stored(_) => &self.stored,
            Outcome::Ignored => &self.ignored,
            Outcome::Rejected(_) => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

// ==============================================================================
// backoff
// ==============================================================================

/// doubling delay, capped
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max, current: initial }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(config.initial_delay(), config.max_delay())
    }

    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

// ==============================================================================
// envelope parsing
// ==============================================================================

/// device id and raw frame bytes of an uplink envelope, `None` for non-uplinks
///
/// shape: `{"end_device_ids": {"device_id": ..}, "uplink_message": {"frm_payload": "<base64>"}}`
pub fn parse_envelope(body: &[u8]) -> Result<Option<(String, Vec<u8>)>, EnvelopeError> {
    let envelope: Value = serde_json::from_slice(body)?;

    let Some(uplink) = envelope.get("uplink_message") else {
        return Ok(None);
    };

    let device_id = envelope
        .pointer("/end_device_ids/device_id")
        .and_then(Value::as_str)
        .filter(|id| !id.trim().is_empty())
        .ok_or(EnvelopeError::MissingDeviceId)?;

    let frm_payload = uplink
        .get("frm_payload")
        .and_then(Value::as_str)
        .ok_or(EnvelopeError::MissingPayload)?;

    let raw = base64::engine::general_purpose::STANDARD.decode(frm_payload)?;
    Ok(Some((device_id.to_string(), raw)))
}

// ==============================================================================
// ingestor
// ==============================================================================

/// decode-and-store step for a single message, shared by value
#[derive(Clone)]
pub struct UplinkHandler {
    store: DeviceStateStore,
    stats: Arc<IngestStats>,
    show_sensor_data: bool,
}

impl UplinkHandler {
    pub fn new(store: DeviceStateStore, stats: Arc<IngestStats>) -> Self {
        Self {
            store,
            stats,
            show_sensor_data: false,
        }
    }

    /// log every stored reading at info level
    pub fn show_sensor_data(mut self, show: bool) -> Self {
        self.show_sensor_data = show;
        self
    }

    /// Decode one inbound message and store the reading.
    ///
    /// Never fails: every problem ends up in the returned [`Outcome`] and in
    /// the log.
    pub async fn handle_message(&self, topic: &str, body: &[u8]) -> Outcome {
        let outcome = match decode_message(body) {
            Ok(Some(reading)) => {
                if self.show_sensor_data {
                    tracing::info!(topic, "{}", reading);
                }
                let device_id = reading.device_id.clone();
                self.store.upsert(&device_id, reading.clone()).await;
                Outcome::Stored(reading)
            }
            Ok(None) => {
                tracing::trace!(topic, "not an uplink, skipping");
                Outcome::Ignored
            }
            Err(e) => {
                tracing::warn!(topic, error = %e, "dropping message");
                Outcome::Rejected(e)
            }
        };
        self.stats.count(&outcome);
        outcome
    }
}

fn decode_message(body: &[u8]) -> Result<Option<Reading>, IngestError> {
    let Some((device_id, raw)) = parse_envelope(body)? else {
        return Ok(None);
    };

    let frame = codec::decode(&raw).map_err(|source| IngestError::Decode {
        source,
        payload_hex: codec::to_hex(&raw),
    })?;

    Ok(Some(frame.into_reading(device_id, now_ms())))
}

/// feed owner and connection state machine
pub struct Ingestor<F: UplinkFeed> {
    feed: F,
    handler: UplinkHandler,
    reconnect: ReconnectConfig,
    state: FeedState,
}

impl<F: UplinkFeed> Ingestor<F> {
    pub fn new(feed: F, handler: UplinkHandler, reconnect: ReconnectConfig) -> Self {
        Self {
            feed,
            handler,
            reconnect,
            state: FeedState::Disconnected,
        }
    }

    pub fn state(&self) -> FeedState {
        self.state
    }

    fn set_state(&mut self, state: FeedState) {
        if self.state != state {
            tracing::debug!(from = ?self.state, to = ?state, "feed state change");
        }
        self.state = state;
        self.handler
            .stats
            .connected
            .store(state == FeedState::Connected, Ordering::Relaxed);
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// The message being handled when shutdown arrives is finished first,
    /// then the feed is closed.
    ///
    /// # Errors
    /// [`TransportError::StartupExhausted`] if the feed never connects.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), TransportError> {
        let mut backoff = Backoff::from_config(&self.reconnect);
        let mut ever_connected = false;
        let mut startup_failures: u32 = 0;
        // a session only counts as healthy once it delivered something
        let mut session_proven = false;

        while !*shutdown.borrow() {
            let event = tokio::select! {
                _ = shutdown.changed() => break,
                event = self.feed.next_event() => event,
            };

            match event {
                Ok(FeedEvent::Connected) => {
                    if ever_connected {
                        self.handler.stats.reconnects.fetch_add(1, Ordering::Relaxed);
                        tracing::info!("feed reconnected");
                    } else {
                        tracing::info!("feed connected");
                    }
                    ever_connected = true;
                    startup_failures = 0;
                    session_proven = false;
                    self.set_state(FeedState::Connected);
                }
                Ok(FeedEvent::Message { topic, payload }) => {
                    if !session_proven {
                        session_proven = true;
                        backoff.reset();
                    }
                    self.handler.handle_message(&topic, &payload).await;
                }
                Ok(FeedEvent::Disconnected) => {
                    self.set_state(FeedState::Disconnected);

                    let delay = backoff.next_delay();
                    tracing::warn!(retry_in_ms = delay.as_millis() as u64, "broker closed the session");
                    if sleep_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                }
                Err(e) => {
                    self.set_state(FeedState::Disconnected);

                    if !ever_connected {
                        startup_failures += 1;
                        if startup_failures >= self.reconnect.max_startup_attempts {
                            tracing::error!(attempts = startup_failures, error = %e, "feed never came up, giving up");
                            return Err(TransportError::StartupExhausted {
                                attempts: startup_failures,
                                last: e.to_string(),
                            });
                        }
                    }

                    let delay = backoff.next_delay();
                    tracing::warn!(error = %e, retry_in_ms = delay.as_millis() as u64, "feed error");
                    if sleep_or_shutdown(&mut shutdown, delay).await {
                        break;
                    }
                }
            }
        }

        tracing::info!("ingestor shutting down");
        if let Err(e) = self.feed.close().await {
            tracing::warn!(error = %e, "feed close failed");
        }
        self.set_state(FeedState::Disconnected);
        Ok(())
    }
}

/// true when shutdown was signalled before `delay` elapsed
async fn sleep_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.changed() => true,
        _ = tokio::time::sleep(delay) => false,
    }
}
