use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Failures while establishing or holding the connection to the broker.
///
/// These drive the client's retry policy and are never fatal on their own.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("invalid broker address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("handshake failed: {0}")]
    Handshake(#[source] tungstenite::Error),

    #[error("write timed out after {0:?}")]
    WriteTimeout(Duration),

    #[error("no traffic from the broker for {0:?}")]
    Idle(Duration),

    #[error("transport failed: {0}")]
    Transport(#[source] tungstenite::Error),
}

/// Errors surfaced to the presentation layer by [`crate::client::ChatClient`].
#[derive(Debug, Error)]
pub enum ClientError {
    /// A send was attempted while the connection is not established.
    #[error("not connected to the broker")]
    NotConnected,

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("client runtime has shut down")]
    Closed,
}

/// A frame that could not be turned into a protocol event.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("malformed payload: {0}")]
    MalformedPayload(#[source] serde_json::Error),

    #[error("failed to encode frame: {0}")]
    Encode(#[source] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("payload could not be decoded: {reason}")]
pub struct CodecError {
    pub reason: String,
}

impl CodecError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}
