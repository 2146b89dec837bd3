//! Minimal real-time message relay.
//!
//! Clients keep one WebSocket connection to a broker; whatever a client sends
//! is broadcast to every connected client, the sender included. Nothing is
//! stored and late joiners get no history.
//!
//! - [`broker`] serves the liveness page and the relay endpoint, one task per
//!   connection.
//! - [`registry`] is the broker's active-connection set and performs fanout.
//! - [`client`] is the client runtime: connect/reconnect, send, and the
//!   ordered list of received messages.
//! - [`state`] holds the client's connection state machine and retry budget.
//! - [`transcript`] synthesizes display messages on arrival.
//! - [`message`] defines the two wire events and their JSON framing.
//! - [`codec`] is the payload transform hook, identity by default.
//! - [`config`] and [`cli`] cover settings; [`console`] is the terminal UI.
//! - [`error`] collects the error types.

pub mod broker;
pub mod cli;
pub mod client;
pub mod codec;
pub mod config;
pub mod console;
pub mod error;
pub mod message;
pub mod registry;
pub mod state;
pub mod transcript;
