use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Context, Result, anyhow};
use chat_relay::{
    broker::Broker,
    client::{ChatClient, ClientEvent, EventStream, SendOutcome},
    codec::PayloadCodec,
    config::{ClientConfig, Heartbeat, ReconnectPolicy},
    error::{ClientError, CodecError, ConnectionError},
    registry::ConnectionRegistry,
    state::ConnectionStatus,
    transcript::DisplayMessage,
};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{WebSocketStream, accept_async};

const EVENT_TIMEOUT: Duration = Duration::from_secs(2);

struct RunningBroker {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: oneshot::Sender<()>,
    server: JoinHandle<()>,
}

impl RunningBroker {
    async fn start_on(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let registry = Arc::new(ConnectionRegistry::new(16));
        let broker = Broker::new(listener, Arc::clone(&registry));

        let (shutdown, shutdown_rx) = oneshot::channel::<()>();
        let server = tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.await;
            };
            let _ = broker.run_until(shutdown).await;
        });

        Ok(Self {
            addr,
            registry,
            shutdown,
            server,
        })
    }

    async fn start() -> Result<Self> {
        Self::start_on("127.0.0.1:0".parse()?).await
    }

    fn client_config(&self) -> ClientConfig {
        ClientConfig {
            server: format!("http://{}", self.addr),
            reconnect: fast_policy(5),
            ..ClientConfig::default()
        }
    }

    async fn wait_for_connections(&self, expected: usize) -> Result<()> {
        timeout(EVENT_TIMEOUT, async {
            while self.registry.len().await != expected {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .map_err(|_| anyhow!("broker never reached {expected} connections"))
    }

    async fn stop(self) {
        let _ = self.shutdown.send(());
        let _ = self.server.await;
    }
}

fn fast_policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        enabled: true,
        max_attempts,
        initial_delay: Duration::from_millis(20),
        max_delay: Duration::from_millis(80),
        connect_timeout: Duration::from_secs(1),
    }
}

/// Completes every WebSocket handshake, then never reads another byte.
struct StalledPeer {
    addr: SocketAddr,
    acceptor: JoinHandle<()>,
}

impl StalledPeer {
    async fn start() -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let acceptor = tokio::spawn(async move {
            let mut held: Vec<WebSocketStream<TcpStream>> = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                if let Ok(socket) = accept_async(stream).await {
                    held.push(socket);
                }
            }
        });
        Ok(Self { addr, acceptor })
    }

    fn client_config(&self, heartbeat: Heartbeat) -> ClientConfig {
        ClientConfig {
            server: format!("http://{}", self.addr),
            reconnect: ReconnectPolicy::disabled(),
            heartbeat,
        }
    }
}

impl Drop for StalledPeer {
    fn drop(&mut self) {
        self.acceptor.abort();
    }
}

async fn closed_port() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

/// Starts a client and consumes its status events up to `Connected`.
async fn connected_client(config: ClientConfig) -> Result<(ChatClient, EventStream)> {
    let (client, mut events) = ChatClient::start(config)?;
    while !next_status(&mut events).await?.is_connected() {}
    Ok((client, events))
}

async fn next_message(events: &mut EventStream) -> Result<DisplayMessage> {
    loop {
        let event = timeout(EVENT_TIMEOUT, events.recv())
            .await
            .context("timed out waiting for a message")?
            .context("event stream closed")?;
        if let ClientEvent::Message(message) = event {
            return Ok(message);
        }
    }
}

async fn next_status(events: &mut EventStream) -> Result<ConnectionStatus> {
    loop {
        let event = timeout(EVENT_TIMEOUT, events.recv())
            .await
            .context("timed out waiting for a status change")?
            .context("event stream closed")?;
        if let ClientEvent::Status(status) = event {
            return Ok(status);
        }
    }
}

fn contents(messages: &[DisplayMessage]) -> Vec<&str> {
    messages
        .iter()
        .map(|message| message.content.as_str())
        .collect()
}

#[tokio::test]
async fn both_clients_receive_one_copy_of_hello() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let (alice, mut alice_events) = connected_client(broker.client_config()).await?;
    let (bob, mut bob_events) = connected_client(broker.client_config()).await?;
    broker.wait_for_connections(2).await?;

    assert_eq!(alice.send("hello").await?, SendOutcome::Sent);

    assert_eq!(next_message(&mut alice_events).await?.content, "hello");
    assert_eq!(next_message(&mut bob_events).await?.content, "hello");

    sleep(Duration::from_millis(100)).await;
    assert_eq!(contents(&alice.messages().await?), ["hello"]);
    assert_eq!(contents(&bob.messages().await?), ["hello"]);

    alice.shutdown().await?;
    bob.shutdown().await?;
    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn text_is_trimmed_and_blank_text_never_leaves() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let (alice, mut alice_events) = connected_client(broker.client_config()).await?;
    broker.wait_for_connections(1).await?;

    assert_eq!(alice.send("").await?, SendOutcome::Skipped);
    assert_eq!(alice.send("   ").await?, SendOutcome::Skipped);
    assert_eq!(alice.send("  hi  ").await?, SendOutcome::Sent);

    assert_eq!(next_message(&mut alice_events).await?.content, "hi");
    sleep(Duration::from_millis(100)).await;
    assert_eq!(contents(&alice.messages().await?), ["hi"]);

    alice.shutdown().await?;
    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn messages_are_appended_in_broadcast_order() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let (alice, mut alice_events) = connected_client(broker.client_config()).await?;
    let (bob, mut bob_events) = connected_client(broker.client_config()).await?;
    broker.wait_for_connections(2).await?;

    alice.send("first").await?;
    alice.send("second").await?;
    alice.send("third").await?;

    for events in [&mut alice_events, &mut bob_events] {
        for expected in ["first", "second", "third"] {
            assert_eq!(next_message(events).await?.content, expected);
        }
    }

    let received = bob.messages().await?;
    assert_eq!(contents(&received), ["first", "second", "third"]);
    assert_ne!(received[0].id, received[1].id);

    alice.shutdown().await?;
    bob.shutdown().await?;
    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn gives_up_after_max_attempts() -> Result<()> {
    let config = ClientConfig {
        server: format!("ws://{}", closed_port().await?),
        reconnect: fast_policy(3),
        ..ClientConfig::default()
    };
    let (client, mut events) = ChatClient::start(config)?;

    let mut statuses = Vec::new();
    loop {
        let status = next_status(&mut events).await?;
        let gave_up = status
            .reason()
            .is_some_and(|reason| reason.starts_with("gave up after 3 attempts"));
        statuses.push(status);
        if gave_up {
            break;
        }
    }

    let attempts = statuses
        .iter()
        .filter(|status| **status == ConnectionStatus::Connecting)
        .count();
    assert_eq!(attempts, 3);
    assert!(matches!(statuses.last(), Some(ConnectionStatus::Error { .. })));

    // Terminal: no further attempts are made.
    sleep(Duration::from_millis(300)).await;
    assert!(events.try_recv().is_err());
    assert!(matches!(client.status(), ConnectionStatus::Error { .. }));
    assert!(matches!(
        client.send("anyone?").await,
        Err(ClientError::NotConnected)
    ));

    client.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn reconnects_after_broker_restart() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let addr = broker.addr;
    let (alice, mut alice_events) = connected_client(broker.client_config()).await?;
    broker.wait_for_connections(1).await?;

    broker.stop().await;
    let status = next_status(&mut alice_events).await?;
    assert!(
        matches!(status, ConnectionStatus::Disconnected { .. }),
        "{status:?}"
    );

    let broker = RunningBroker::start_on(addr).await?;
    let mut status = alice.watch_status();
    timeout(EVENT_TIMEOUT, status.wait_for(ConnectionStatus::is_connected))
        .await
        .context("client never reconnected")??;
    broker.wait_for_connections(1).await?;

    alice.send("back again").await?;
    assert_eq!(next_message(&mut alice_events).await?.content, "back again");

    alice.shutdown().await?;
    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn shutdown_releases_the_connection() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let (alice, _events) = connected_client(broker.client_config()).await?;
    broker.wait_for_connections(1).await?;

    alice.shutdown().await?;
    broker.wait_for_connections(0).await?;

    let (bob, _events) = connected_client(broker.client_config()).await?;
    broker.wait_for_connections(1).await?;
    drop(bob);
    broker.wait_for_connections(0).await?;

    broker.stop().await;
    Ok(())
}

/// Reverses text on the way out and back, standing in for a real cipher.
struct Mirror;

impl PayloadCodec for Mirror {
    fn encode(&self, text: &str) -> String {
        text.chars().rev().collect()
    }

    fn decode(&self, payload: &str) -> Result<String, CodecError> {
        if payload.is_empty() {
            return Err(CodecError::new("empty payload"));
        }
        Ok(payload.chars().rev().collect())
    }
}

#[tokio::test]
async fn codec_transforms_payloads_end_to_end() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let (alice, mut alice_events) = ChatClient::start_with_codec(broker.client_config(), Mirror)?;
    let (observer, mut observer_events) = connected_client(broker.client_config()).await?;
    let mut status = alice.watch_status();
    timeout(EVENT_TIMEOUT, status.wait_for(ConnectionStatus::is_connected)).await??;
    broker.wait_for_connections(2).await?;

    alice.send("secret").await?;

    assert_eq!(next_message(&mut alice_events).await?.content, "secret");
    // A client with the default codec sees the wire payload as-is.
    assert_eq!(next_message(&mut observer_events).await?.content, "terces");

    alice.shutdown().await?;
    observer.shutdown().await?;
    broker.stop().await;
    Ok(())
}

#[tokio::test]
async fn stalled_broker_fails_the_send_instead_of_hanging() -> Result<()> {
    let peer = StalledPeer::start().await?;
    let (client, mut events) = connected_client(peer.client_config(Heartbeat {
        ping_interval: Duration::from_secs(60),
        idle_timeout: Duration::from_secs(120),
        write_timeout: Duration::from_millis(200),
    }))
    .await?;

    // Large frames fill the socket buffers the peer never drains.
    let bulk = "x".repeat(1024 * 1024);
    let failure = timeout(Duration::from_secs(10), async {
        loop {
            if let Err(err) = client.send(&bulk).await {
                return err;
            }
        }
    })
    .await
    .context("send kept succeeding against a stalled peer")?;
    assert!(
        matches!(
            failure,
            ClientError::Connection(ConnectionError::WriteTimeout(_))
        ),
        "{failure:?}"
    );

    let status = next_status(&mut events).await?;
    assert!(
        status
            .reason()
            .is_some_and(|reason| reason.contains("write timed out")),
        "{status:?}"
    );

    // The driver is free again: queries and shutdown answer promptly.
    timeout(EVENT_TIMEOUT, client.messages()).await??;
    assert!(matches!(
        client.send("anyone?").await,
        Err(ClientError::NotConnected)
    ));
    timeout(EVENT_TIMEOUT, client.shutdown()).await??;
    Ok(())
}

#[tokio::test]
async fn silent_broker_is_given_up_after_idle_timeout() -> Result<()> {
    let peer = StalledPeer::start().await?;
    let (client, mut events) = connected_client(peer.client_config(Heartbeat {
        ping_interval: Duration::from_millis(50),
        idle_timeout: Duration::from_millis(300),
        write_timeout: Duration::from_secs(1),
    }))
    .await?;

    let status = next_status(&mut events).await?;
    assert!(
        status
            .reason()
            .is_some_and(|reason| reason.contains("no traffic from the broker")),
        "{status:?}"
    );
    assert!(!client.status().is_connected());

    timeout(EVENT_TIMEOUT, client.shutdown()).await??;
    Ok(())
}

#[tokio::test]
async fn answered_pings_keep_a_quiet_connection_open() -> Result<()> {
    let broker = RunningBroker::start().await?;
    let (alice, mut alice_events) = connected_client(ClientConfig {
        heartbeat: Heartbeat {
            ping_interval: Duration::from_millis(50),
            idle_timeout: Duration::from_millis(300),
            write_timeout: Duration::from_secs(1),
        },
        ..broker.client_config()
    })
    .await?;
    broker.wait_for_connections(1).await?;

    sleep(Duration::from_millis(800)).await;
    assert!(alice.status().is_connected());
    assert!(alice_events.try_recv().is_err());

    alice.shutdown().await?;
    broker.stop().await;
    Ok(())
}
