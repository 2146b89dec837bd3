//! Payload transform applied by the client before sending and after receiving.
//!
//! The broker never looks inside payloads, so a codec only has to agree with
//! the codec of the other clients. [`IdentityCodec`] is the default and leaves
//! text untouched.

use crate::error::CodecError;

pub trait PayloadCodec: Send + Sync + 'static {
    /// Turns user text into the payload placed on the wire.
    fn encode(&self, text: &str) -> String;

    /// Recovers user text from a payload received from the broker.
    fn decode(&self, payload: &str) -> Result<String, CodecError>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IdentityCodec;

impl PayloadCodec for IdentityCodec {
    fn encode(&self, text: &str) -> String {
        text.to_string()
    }

    fn decode(&self, payload: &str) -> Result<String, CodecError> {
        Ok(payload.to_string())
    }
}
