//! error taxonomy for the ingest path
//!
//! everything except a fatal [`TransportError`] at startup is contained
//! inside the message handler: logged, counted, and the message dropped.

use thiserror::Error;

/// the uplink frame could not be turned into a reading
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("frame too short: {len} bytes, need at least {min}")]
    TooShort { len: usize, min: usize },
}

/// the inbound message is not a usable uplink envelope
#[derive(Error, Debug)]
pub enum EnvelopeError {
    #[error("message body is not json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("envelope has no usable end_device_ids.device_id")]
    MissingDeviceId,

    #[error("uplink has no frm_payload")]
    MissingPayload,

    #[error("frm_payload is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// the feed connection failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// broker answered but refused us (bad credentials, unknown client)
    #[error("broker refused connection: {0}")]
    Refused(String),

    #[error("feed connection error: {0}")]
    Connection(String),

    #[error("subscribe to {topic} failed: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("gave up after {attempts} failed connection attempts: {last}")]
    StartupExhausted { attempts: u32, last: String },
}

/// durable history write or read failed
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("history backend error: {0}")]
    Backend(String),

    /// the writer thread is gone (all handles dropped or it panicked)
    #[error("history backend has shut down")]
    Shutdown,

    #[error("history row serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<rusqlite::Error> for PersistError {
    fn from(e: rusqlite::Error) -> Self {
        PersistError::Backend(e.to_string())
    }
}

/// why a single inbound message was dropped
#[derive(Error, Debug)]
pub enum IngestError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("{source} (payload {payload_hex})")]
    Decode {
        #[source]
        source: DecodeError,
        payload_hex: String,
    },
}
