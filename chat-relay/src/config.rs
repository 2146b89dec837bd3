//! Runtime settings for the broker and the client.
//!
//! Plain structs with `Default`s; [`crate::cli`] fills them from flags and
//! environment variables, tests build them directly.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use url::Url;

use crate::error::ConnectionError;

pub const DEFAULT_PORT: u16 = 3000;

/// Path on which the broker accepts WebSocket upgrades.
pub const WS_PATH: &str = "/ws";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the broker binds. Port 0 picks an ephemeral port.
    pub listen: SocketAddr,
    /// Broadcasts buffered per connection before deliveries to it are dropped.
    pub outbound_buffer: usize,
    pub heartbeat: Heartbeat,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::UNSPECIFIED, DEFAULT_PORT)),
            outbound_buffer: 64,
            heartbeat: Heartbeat::default(),
        }
    }
}

/// Keeps a live connection honest on both ends.
///
/// Each side pings every `ping_interval` and gives the connection up once
/// nothing at all (pongs included) has arrived for `idle_timeout`. A single
/// write that takes longer than `write_timeout` also ends the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub ping_interval: Duration,
    pub idle_timeout: Duration,
    pub write_timeout: Duration,
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(25),
            idle_timeout: Duration::from_secs(45),
            write_timeout: Duration::from_secs(10),
        }
    }
}

/// Bounded retry behaviour of the client runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Consecutive failed attempts, the first one included, before giving up.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound on a single connection attempt.
    pub connect_timeout: Duration,
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Delay before the retry that follows `failed_attempts` failures.
    ///
    /// Doubles from `initial_delay` and never exceeds `max_delay`.
    pub fn delay_for(&self, failed_attempts: u32) -> Duration {
        let factor = 1u32
            .checked_shl(failed_attempts.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.initial_delay
            .saturating_mul(factor)
            .min(self.max_delay)
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: 5,
            initial_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(5000),
            connect_timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Broker address, e.g. `http://localhost:3000` or `ws://10.0.2.2:3000/ws`.
    pub server: String,
    pub reconnect: ReconnectPolicy,
    pub heartbeat: Heartbeat,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server: format!("http://localhost:{DEFAULT_PORT}"),
            reconnect: ReconnectPolicy::default(),
            heartbeat: Heartbeat::default(),
        }
    }
}

impl ClientConfig {
    pub fn websocket_url(&self) -> Result<Url, ConnectionError> {
        websocket_url(&self.server)
    }
}

/// Normalises a broker address into the WebSocket endpoint URL.
///
/// `http`/`https` map onto `ws`/`wss`; an empty path becomes [`WS_PATH`].
pub fn websocket_url(address: &str) -> Result<Url, ConnectionError> {
    let invalid = |reason: String| ConnectionError::InvalidAddress {
        address: address.to_string(),
        reason,
    };

    let mut url = Url::parse(address.trim()).map_err(|err| invalid(err.to_string()))?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(invalid(format!("unsupported scheme '{other}'"))),
    };
    if url.scheme() != scheme {
        url.set_scheme(scheme)
            .map_err(|()| invalid(format!("cannot switch scheme to '{scheme}'")))?;
    }
    if url.host_str().is_none() {
        return Err(invalid("missing host".to_string()));
    }
    if url.path().is_empty() || url.path() == "/" {
        url.set_path(WS_PATH);
    }

    Ok(url)
}
