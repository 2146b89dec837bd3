use std::{net::SocketAddr, time::Duration};

use clap::{Args, Parser, Subcommand};

use crate::config::{BrokerConfig, ClientConfig, Heartbeat, ReconnectPolicy};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the broker, relaying every message to every connected client.
    Broker(BrokerArgs),
    /// Connect to a broker and chat from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct BrokerArgs {
    /// Socket address the broker should bind to. Use port 0 for an ephemeral port.
    #[arg(long, env = "CHAT_RELAY_LISTEN", default_value = "0.0.0.0:3000")]
    pub listen: SocketAddr,

    /// Messages buffered per client before deliveries to it are dropped.
    #[arg(long, default_value_t = 64)]
    pub outbound_buffer: usize,

    #[command(flatten)]
    pub heartbeat: HeartbeatArgs,
}

/// Liveness settings shared by both ends of a connection.
#[derive(Args, Debug, Clone)]
pub struct HeartbeatArgs {
    /// How often to ping the peer.
    #[arg(long, default_value_t = 25_000)]
    pub ping_interval_ms: u64,

    /// Drop the connection when nothing arrives from the peer for this long.
    #[arg(long, default_value_t = 45_000)]
    pub idle_timeout_ms: u64,

    /// Drop the connection when a single write cannot complete in this time.
    #[arg(long, default_value_t = 10_000)]
    pub write_timeout_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Broker address: loopback, emulator host alias (10.0.2.2) or LAN address.
    #[arg(long, env = "CHAT_RELAY_SERVER", default_value = "http://localhost:3000")]
    pub server: String,

    /// Give up after the first failed connection attempt or dropped connection.
    #[arg(long)]
    pub no_reconnect: bool,

    /// Consecutive failed attempts before giving up.
    #[arg(long, default_value_t = 5)]
    pub reconnect_attempts: u32,

    /// Delay before the first retry; doubles on every further failure.
    #[arg(long, default_value_t = 1000)]
    pub reconnect_delay_ms: u64,

    /// Upper bound for the retry delay.
    #[arg(long, default_value_t = 5000)]
    pub reconnect_delay_max_ms: u64,

    /// Time allowed for a single connection attempt.
    #[arg(long, default_value_t = 20_000)]
    pub connect_timeout_ms: u64,

    #[command(flatten)]
    pub heartbeat: HeartbeatArgs,
}

impl From<HeartbeatArgs> for Heartbeat {
    fn from(args: HeartbeatArgs) -> Self {
        Self {
            ping_interval: Duration::from_millis(args.ping_interval_ms),
            idle_timeout: Duration::from_millis(args.idle_timeout_ms),
            write_timeout: Duration::from_millis(args.write_timeout_ms),
        }
    }
}

impl From<BrokerArgs> for BrokerConfig {
    fn from(args: BrokerArgs) -> Self {
        Self {
            listen: args.listen,
            outbound_buffer: args.outbound_buffer,
            heartbeat: args.heartbeat.into(),
        }
    }
}

impl From<ClientArgs> for ClientConfig {
    fn from(args: ClientArgs) -> Self {
        Self {
            server: args.server,
            reconnect: ReconnectPolicy {
                enabled: !args.no_reconnect,
                max_attempts: args.reconnect_attempts,
                initial_delay: Duration::from_millis(args.reconnect_delay_ms),
                max_delay: Duration::from_millis(args.reconnect_delay_max_ms),
                connect_timeout: Duration::from_millis(args.connect_timeout_ms),
            },
            heartbeat: args.heartbeat.into(),
        }
    }
}
