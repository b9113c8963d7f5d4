//! ==============================================================================
//! feed.rs - publish/subscribe feed capability
//! ==============================================================================
//!
//! purpose:
//!     the ingestor only needs "give me the next thing that happened on the
//!     feed" plus a clean way to leave. `UplinkFeed` is that capability;
//!     `MqttFeed` provides it on top of rumqttc, tests provide a scripted fake.
//!
//! rumqttc notes:
//!     - the `EventLoop` does all network io; nothing moves unless it is polled
//!     - after a poll error the next poll reconnects, so backoff between polls
//!       is the caller's job (see ingest.rs)
//!     - subscriptions are re-issued on every ConnAck because the broker may
//!       have dropped our session
//!
//! ==============================================================================

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Packet, QoS};

use crate::config::BrokerConfig;
use crate::error::TransportError;
use crate::persistence::BoxFuture;

/// something the ingestor must react to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedEvent {
    /// handshake done, subscription (re)issued
    Connected,
    /// an application message on the subscribed topic
    Message { topic: String, payload: Vec<u8> },
    /// broker closed the session cleanly
    Disconnected,
}

pub trait UplinkFeed: Send {
    /// Wait for the next feed event.
    ///
    /// An `Err` means the connection is down; calling again attempts to
    /// reconnect.
    fn next_event(&mut self) -> BoxFuture<'_, Result<FeedEvent, TransportError>>;

    /// unsubscribe and disconnect
    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>>;
}

// ==============================================================================
// mqtt implementation
// ==============================================================================

pub struct MqttFeed {
    client: AsyncClient,
    event_loop: EventLoop,
    topic: String,
}

impl MqttFeed {
    /// Build the client. No network traffic happens until the first
    /// [`UplinkFeed::next_event`].
    pub fn new(broker: &BrokerConfig, password: Option<&str>) -> Self {
        let client_id = format!("{}-{}", broker.client_id_prefix, uuid::Uuid::new_v4().simple());
        let mut options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        options.set_keep_alive(Duration::from_secs(broker.keep_alive_secs));

        // network servers authenticate with application id + api key
        if let (Some(username), Some(password)) = (broker.username.as_deref(), password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 20);
        tracing::debug!(host = %broker.host, port = broker.port, "mqtt client created");

        Self {
            client,
            event_loop,
            topic: broker.topic.clone(),
        }
    }

    async fn poll(&mut self) -> Result<FeedEvent, TransportError> {
        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    self.client
                        .subscribe(self.topic.clone(), QoS::AtLeastOnce)
                        .await
                        .map_err(|e| TransportError::Subscribe {
                            topic: self.topic.clone(),
                            reason: e.to_string(),
                        })?;
                    return Ok(FeedEvent::Connected);
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    return Ok(FeedEvent::Message {
                        topic: p.topic,
                        payload: p.payload.to_vec(),
                    });
                }
                Ok(Event::Incoming(Packet::Disconnect)) => return Ok(FeedEvent::Disconnected),
                // pings, acks, outgoing packets
                Ok(_) => {}
                Err(e) => return Err(map_connection_error(e)),
            }
        }
    }

    async fn shutdown(&mut self) -> Result<(), TransportError> {
        self.client
            .unsubscribe(self.topic.clone())
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.client
            .disconnect()
            .await
            .map_err(|e| TransportError::Connection(e.to_string()))?;

        // requests only leave the client once the event loop flushes them
        let flush = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(Duration::from_secs(2), flush).await.is_err() {
            tracing::debug!("mqtt disconnect flush timed out");
        }
        Ok(())
    }
}

fn map_connection_error(e: ConnectionError) -> TransportError {
    match e {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{code:?}")),
        other => TransportError::Connection(other.to_string()),
    }
}

impl UplinkFeed for MqttFeed {
    fn next_event(&mut self) -> BoxFuture<'_, Result<FeedEvent, TransportError>> {
        Box::pin(self.poll())
    }

    fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
        Box::pin(self.shutdown())
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! scripted feed for driving the ingestor without a broker

    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// replays a fixed script, then parks forever (like an idle broker)
    pub struct ScriptedFeed {
        script: VecDeque<Result<FeedEvent, TransportError>>,
        pub closed: Arc<Mutex<bool>>,
        /// number of `next_event` calls so far
        pub polls: Arc<AtomicUsize>,
    }

    impl ScriptedFeed {
        pub fn new(script: Vec<Result<FeedEvent, TransportError>>) -> Self {
            Self {
                script: script.into(),
                closed: Arc::new(Mutex::new(false)),
                polls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl UplinkFeed for ScriptedFeed {
        fn next_event(&mut self) -> BoxFuture<'_, Result<FeedEvent, TransportError>> {
            self.polls.fetch_add(1, Ordering::SeqCst);
            let next = self.script.pop_front();
            Box::pin(async move {
                match next {
                    Some(event) => event,
                    None => std::future::pending().await,
                }
            })
        }

        fn close(&mut self) -> BoxFuture<'_, Result<(), TransportError>> {
            *self.closed.lock().unwrap() = true;
            Box::pin(async { Ok(()) })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refused_maps_to_refused() {
        let err = map_connection_error(ConnectionError::ConnectionRefused(
            rumqttc::ConnectReturnCode::NotAuthorized,
        ));
        assert!(matches!(err, TransportError::Refused(_)));
    }

    #[tokio::test]
    async fn test_client_builds_without_network() {
        let broker = BrokerConfig::default();
        let feed = MqttFeed::new(&broker, Some("secret"));
        assert_eq!(feed.topic, broker.topic);
    }
}
