use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::error::ProtocolError;

/// Events a client emits. Each one travels as a single WebSocket text frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientToBroker {
    SendMessage { text: String },
}

/// Events the broker fans out. The payload is relayed exactly as received.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BrokerToClient {
    ReceiveMessage { text: String },
}

pub fn encode_frame<T>(message: &T) -> Result<String, ProtocolError>
where
    T: Serialize,
{
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}

pub fn decode_frame<T>(frame: &str) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
{
    serde_json::from_str(frame.trim()).map_err(ProtocolError::MalformedPayload)
}
