use std::{future::Future, net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, bail};
use axum::{
    Router,
    extract::{
        ConnectInfo, State, WebSocketUpgrade,
        ws::{CloseFrame, Message, WebSocket, close_code},
    },
    response::{Html, Response},
    routing::get,
};
use tokio::{
    net::TcpListener,
    select,
    sync::mpsc,
    time::{Instant, MissedTickBehavior, interval_at, sleep, timeout},
};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::{BrokerConfig, Heartbeat, WS_PATH},
    message::{BrokerToClient, ClientToBroker, decode_frame, encode_frame},
    registry::{ConnectionId, ConnectionRegistry},
};

const LIVENESS_PAGE: &str =
    "<h1>chat broker is running</h1><p>Connect with `chat-relay client`.</p>";

pub struct Broker {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    heartbeat: Heartbeat,
}

/// Shared by every request handler.
#[derive(Clone)]
struct RelayState {
    registry: Arc<ConnectionRegistry>,
    heartbeat: Heartbeat,
}

impl Broker {
    pub fn new(listener: TcpListener, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            listener,
            registry,
            heartbeat: Heartbeat::default(),
        }
    }

    pub fn with_heartbeat(mut self, heartbeat: Heartbeat) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub async fn bind(config: &BrokerConfig) -> Result<Self> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("failed to bind broker on {}", config.listen))?;
        let registry = Arc::new(ConnectionRegistry::new(config.outbound_buffer));
        Ok(Self::new(listener, registry).with_heartbeat(config.heartbeat))
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        Arc::clone(&self.registry)
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Broker {
            listener,
            registry,
            heartbeat,
        } = self;
        let app = router(Arc::clone(&registry), heartbeat);

        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            shutdown.await;
            handle_shutdown(&registry).await;
        })
        .await
        .context("broker server failed")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

/// HTTP surface of the broker: a liveness page at `/` and the relay at [`WS_PATH`].
pub fn router(registry: Arc<ConnectionRegistry>, heartbeat: Heartbeat) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route(WS_PATH, get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(RelayState {
            registry,
            heartbeat,
        })
}

async fn handle_shutdown(registry: &ConnectionRegistry) {
    let closed = registry.close_all().await;
    info!(connections = closed, "broker shutting down");
}

async fn liveness() -> Html<&'static str> {
    Html(LIVENESS_PAGE)
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<RelayState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, peer, state))
}

async fn handle_connection(socket: WebSocket, peer: SocketAddr, state: RelayState) {
    let RelayState {
        registry,
        heartbeat,
    } = state;
    let (id, outbound) = registry.register().await;
    info!(connection = id, %peer, "client connected");

    if let Err(err) = run_session(socket, id, outbound, &registry, &heartbeat).await {
        warn!(connection = id, %peer, error = ?err, "client connection closed with error");
    }

    registry.remove(id).await;
    info!(connection = id, %peer, "client disconnected");
}

async fn run_session(
    mut socket: WebSocket,
    id: ConnectionId,
    mut outbound: mpsc::Receiver<String>,
    registry: &ConnectionRegistry,
    heartbeat: &Heartbeat,
) -> Result<()> {
    let mut ping = interval_at(
        Instant::now() + heartbeat.ping_interval,
        heartbeat.ping_interval,
    );
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let idle = sleep(heartbeat.idle_timeout);
    tokio::pin!(idle);

    loop {
        select! {
            inbound = socket.recv() => {
                match inbound {
                    Some(message) => {
                        idle.as_mut().reset(Instant::now() + heartbeat.idle_timeout);
                        if !handle_inbound(message?, id, registry).await {
                            break;
                        }
                    }
                    None => break,
                }
            }
            delivery = outbound.recv() => {
                match delivery {
                    Some(frame) => {
                        write_within(&mut socket, Message::Text(frame), heartbeat.write_timeout)
                            .await
                            .context("failed to deliver message")?;
                    }
                    None => {
                        close_for_shutdown(&mut socket, heartbeat.write_timeout).await;
                        break;
                    }
                }
            }
            _ = ping.tick() => {
                write_within(&mut socket, Message::Ping(Vec::new()), heartbeat.write_timeout)
                    .await
                    .context("failed to send ping")?;
            }
            _ = &mut idle => bail!("no traffic for {:?}", heartbeat.idle_timeout),
        }
    }

    Ok(())
}

/// A recipient that stops reading must not pin its session forever.
async fn write_within(socket: &mut WebSocket, message: Message, limit: Duration) -> Result<()> {
    timeout(limit, socket.send(message))
        .await
        .with_context(|| format!("write stalled for {limit:?}"))?
        .context("socket write failed")
}

async fn handle_inbound(message: Message, id: ConnectionId, registry: &ConnectionRegistry) -> bool {
    match message {
        Message::Text(frame) => {
            match decode_frame::<ClientToBroker>(&frame) {
                Ok(ClientToBroker::SendMessage { text }) => relay(text, id, registry).await,
                Err(err) => debug!(connection = id, error = %err, "dropping malformed frame"),
            }
            true
        }
        Message::Binary(bytes) => {
            debug!(connection = id, len = bytes.len(), "dropping binary frame");
            true
        }
        Message::Ping(_) | Message::Pong(_) => true,
        Message::Close(_) => false,
    }
}

async fn relay(text: String, id: ConnectionId, registry: &ConnectionRegistry) {
    let frame = match encode_frame(&BrokerToClient::ReceiveMessage { text }) {
        Ok(frame) => frame,
        Err(err) => {
            warn!(connection = id, error = %err, "failed to encode broadcast");
            return;
        }
    };

    let fanout = registry.broadcast(&frame).await;
    debug!(
        connection = id,
        delivered = fanout.delivered,
        dropped = fanout.dropped,
        "relayed message"
    );
}

async fn close_for_shutdown(socket: &mut WebSocket, limit: Duration) {
    let close = Message::Close(Some(CloseFrame {
        code: close_code::AWAY,
        reason: "broker shutting down".into(),
    }));
    if let Err(err) = write_within(socket, close, limit).await {
        debug!(?err, "failed to send close frame");
    }
}
