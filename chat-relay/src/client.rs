//! Client runtime: one connection to the broker, owned by a single driver task.
//!
//! [`ChatClient`] is a cheap handle that talks to the driver over a command
//! queue. The driver handles one thing at a time (a command, a connect
//! result, an inbound frame, or a retry timer), so status and transcript
//! changes are never interleaved. Every change is pushed to the
//! [`EventStream`] in the order it happens.

use std::{pin::Pin, time::Duration};

use futures_util::{SinkExt, StreamExt, future::BoxFuture};
use tokio::{
    net::TcpStream,
    select,
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, Interval, MissedTickBehavior, Sleep, interval_at, sleep, timeout},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{self, Message},
};
use tracing::{debug, info, warn};
use url::Url;

use crate::{
    codec::{IdentityCodec, PayloadCodec},
    config::{ClientConfig, Heartbeat},
    error::{ClientError, ConnectionError},
    message::{BrokerToClient, ClientToBroker, decode_frame, encode_frame},
    state::{ConnectionState, ConnectionStatus, Next},
    transcript::{DisplayMessage, Transcript},
};

const COMMAND_BUFFER: usize = 32;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Pushed to the presentation layer as things happen.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Status(ConnectionStatus),
    Message(DisplayMessage),
}

pub type EventStream = mpsc::UnboundedReceiver<ClientEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// The text was blank after trimming; nothing went on the wire.
    Skipped,
}

enum Command {
    Send {
        text: String,
        respond_to: oneshot::Sender<Result<(), ClientError>>,
    },
    Snapshot {
        respond_to: oneshot::Sender<Vec<DisplayMessage>>,
    },
    Shutdown,
}

pub struct ChatClient {
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<ConnectionStatus>,
    driver: JoinHandle<()>,
}

impl ChatClient {
    /// Starts connecting right away. Must be called from within a Tokio runtime.
    pub fn start(config: ClientConfig) -> Result<(Self, EventStream), ConnectionError> {
        Self::start_with_codec(config, IdentityCodec)
    }

    pub fn start_with_codec<C>(
        config: ClientConfig,
        codec: C,
    ) -> Result<(Self, EventStream), ConnectionError>
    where
        C: PayloadCodec,
    {
        let url = config.websocket_url()?;
        let state = ConnectionState::new(config.reconnect);

        let (command_tx, command_rx) = mpsc::channel(COMMAND_BUFFER);
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(state.status().clone());

        let driver = Driver {
            url,
            codec,
            heartbeat: config.heartbeat,
            state,
            transcript: Transcript::default(),
            commands: command_rx,
            events: event_tx,
            status: status_tx,
        };
        let driver = tokio::spawn(driver.run());

        let client = Self {
            commands: command_tx,
            status: status_rx,
            driver,
        };
        Ok((client, event_rx))
    }

    /// Sends `text` as one message once surrounding whitespace is trimmed.
    ///
    /// Blank text is skipped without error. Fails with
    /// [`ClientError::NotConnected`] unless the connection is established;
    /// failed sends are not retried.
    pub async fn send(&self, text: &str) -> Result<SendOutcome, ClientError> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(SendOutcome::Skipped);
        }

        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(Command::Send {
                text: text.to_string(),
                respond_to,
            })
            .await
            .map_err(|_| ClientError::Closed)?;
        response.await.map_err(|_| ClientError::Closed)??;
        Ok(SendOutcome::Sent)
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.clone()
    }

    /// Snapshot of every message received so far, oldest first.
    pub async fn messages(&self) -> Result<Vec<DisplayMessage>, ClientError> {
        let (respond_to, response) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { respond_to })
            .await
            .map_err(|_| ClientError::Closed)?;
        response.await.map_err(|_| ClientError::Closed)
    }

    /// Closes the connection and waits for the driver to finish.
    ///
    /// Dropping the handle closes the connection too, without waiting.
    pub async fn shutdown(self) -> Result<(), ClientError> {
        let ChatClient {
            commands, driver, ..
        } = self;
        // The driver may already be gone; closing the queue is enough then.
        let _ = commands.send(Command::Shutdown).await;
        drop(commands);
        driver.await.map_err(|_| ClientError::Closed)
    }
}

enum Link {
    Waiting(Pin<Box<Sleep>>),
    Connecting(BoxFuture<'static, Result<Socket, ConnectionError>>),
    Open(Session),
    /// Retries exhausted or disabled. Commands are still answered.
    Stopped,
}

/// An established connection plus its keepalive timers.
struct Session {
    socket: Socket,
    ping: Interval,
    idle: Pin<Box<Sleep>>,
}

impl Session {
    fn new(socket: Socket, heartbeat: &Heartbeat) -> Self {
        let mut ping = interval_at(
            Instant::now() + heartbeat.ping_interval,
            heartbeat.ping_interval,
        );
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

        Self {
            socket,
            ping,
            idle: Box::pin(sleep(heartbeat.idle_timeout)),
        }
    }

    fn touch(&mut self, idle_timeout: Duration) {
        self.idle.as_mut().reset(Instant::now() + idle_timeout);
    }
}

enum Step {
    Command(Option<Command>),
    RetryDue,
    Attempted(Result<Socket, ConnectionError>),
    Frame(Option<Result<Message, tungstenite::Error>>),
    PingDue,
    IdleExpired,
}

struct Driver<C> {
    url: Url,
    codec: C,
    heartbeat: Heartbeat,
    state: ConnectionState,
    transcript: Transcript,
    commands: mpsc::Receiver<Command>,
    events: mpsc::UnboundedSender<ClientEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl<C> Driver<C>
where
    C: PayloadCodec,
{
    async fn run(mut self) {
        let mut link = self.start_attempt();

        loop {
            let step = match &mut link {
                Link::Waiting(delay) => select! {
                    command = self.commands.recv() => Step::Command(command),
                    _ = delay.as_mut() => Step::RetryDue,
                },
                Link::Connecting(attempt) => select! {
                    command = self.commands.recv() => Step::Command(command),
                    result = attempt.as_mut() => Step::Attempted(result),
                },
                Link::Open(session) => select! {
                    command = self.commands.recv() => Step::Command(command),
                    frame = session.socket.next() => Step::Frame(frame),
                    _ = session.ping.tick() => Step::PingDue,
                    _ = session.idle.as_mut() => Step::IdleExpired,
                },
                Link::Stopped => Step::Command(self.commands.recv().await),
            };

            match step {
                Step::Command(None | Some(Command::Shutdown)) => {
                    self.close(link).await;
                    break;
                }
                Step::Command(Some(command)) => self.handle_command(command, &mut link).await,
                Step::RetryDue => link = self.start_attempt(),
                Step::Attempted(Ok(socket)) => {
                    info!(url = %self.url, "connected to broker");
                    self.state.connected();
                    self.publish_status();
                    link = Link::Open(Session::new(socket, &self.heartbeat));
                }
                Step::Attempted(Err(err)) => {
                    warn!(url = %self.url, error = %err, "connection attempt failed");
                    let next = self.state.attempt_failed(&err.to_string());
                    self.publish_status();
                    link = self.schedule(next);
                }
                Step::Frame(frame) => {
                    if let (Some(Ok(_)), Link::Open(session)) = (&frame, &mut link) {
                        session.touch(self.heartbeat.idle_timeout);
                    }
                    if let Some(next) = self.handle_frame(frame) {
                        link = self.schedule(next);
                    }
                }
                Step::PingDue => {
                    // A failed ping already moved the link into the retry path.
                    let _ = self.write(&mut link, Message::Ping(Vec::new())).await;
                }
                Step::IdleExpired => {
                    let err = ConnectionError::Idle(self.heartbeat.idle_timeout);
                    link = self.lose_connection(&err);
                }
            }
        }

        debug!("client driver stopped");
    }

    fn start_attempt(&mut self) -> Link {
        self.state.begin_attempt();
        self.publish_status();
        let attempt = connect(self.url.to_string(), self.state.policy().connect_timeout);
        Link::Connecting(Box::pin(attempt))
    }

    fn schedule(&self, next: Next) -> Link {
        match next {
            Next::Retry(delay) => {
                debug!(?delay, "scheduling reconnect");
                Link::Waiting(Box::pin(sleep(delay)))
            }
            Next::Stop => {
                info!(status = %self.state.status(), "not reconnecting");
                Link::Stopped
            }
        }
    }

    fn lose_connection(&mut self, err: &ConnectionError) -> Link {
        info!(error = %err, "disconnected from broker");
        let next = self.state.connection_lost(&err.to_string());
        self.publish_status();
        self.schedule(next)
    }

    async fn handle_command(&mut self, command: Command, link: &mut Link) {
        match command {
            Command::Send { text, respond_to } => {
                let result = self.transmit(&text, link).await;
                // The caller may have stopped waiting for the answer.
                let _ = respond_to.send(result);
            }
            Command::Snapshot { respond_to } => {
                let _ = respond_to.send(self.transcript.messages().to_vec());
            }
            Command::Shutdown => {}
        }
    }

    async fn transmit(&mut self, text: &str, link: &mut Link) -> Result<(), ClientError> {
        if !matches!(link, Link::Open(_)) {
            return Err(ClientError::NotConnected);
        }

        let frame = encode_frame(&ClientToBroker::SendMessage {
            text: self.codec.encode(text),
        })?;
        self.write(link, Message::Text(frame)).await?;

        debug!(len = text.len(), "message sent");
        Ok(())
    }

    /// Writes one frame within the write timeout.
    ///
    /// Any failure drops the connection and schedules the next step.
    async fn write(&mut self, link: &mut Link, message: Message) -> Result<(), ConnectionError> {
        let Link::Open(session) = link else {
            return Ok(());
        };

        let limit = self.heartbeat.write_timeout;
        let err = match timeout(limit, session.socket.send(message)).await {
            Ok(Ok(())) => return Ok(()),
            Ok(Err(err)) => ConnectionError::Transport(err),
            Err(_) => ConnectionError::WriteTimeout(limit),
        };

        *link = self.lose_connection(&err);
        Err(err)
    }

    /// Returns the follow-up step when the frame ended the connection.
    fn handle_frame(&mut self, frame: Option<Result<Message, tungstenite::Error>>) -> Option<Next> {
        let reason = match frame {
            Some(Ok(Message::Text(text))) => {
                self.receive(&text);
                return None;
            }
            Some(Ok(Message::Binary(bytes))) => {
                warn!(len = bytes.len(), "dropping binary frame from broker");
                return None;
            }
            Some(Ok(Message::Close(close))) => close
                .map(|frame| frame.reason.into_owned())
                .filter(|reason| !reason.is_empty())
                .unwrap_or_else(|| "broker closed the connection".to_string()),
            Some(Ok(_)) => return None,
            Some(Err(err)) => err.to_string(),
            None => "connection closed".to_string(),
        };

        info!(%reason, "disconnected from broker");
        let next = self.state.connection_lost(&reason);
        self.publish_status();
        Some(next)
    }

    fn receive(&mut self, frame: &str) {
        let payload = match decode_frame::<BrokerToClient>(frame) {
            Ok(BrokerToClient::ReceiveMessage { text }) => text,
            Err(err) => {
                warn!(error = %err, "dropping undecodable frame");
                return;
            }
        };

        let content = match self.codec.decode(&payload) {
            Ok(content) => content,
            Err(err) => {
                warn!(error = %err, "dropping message the codec rejected");
                return;
            }
        };

        let message = self.transcript.append(content).clone();
        debug!(received = self.transcript.len(), "message received");
        // Nobody listening is fine; the transcript still records the message.
        let _ = self.events.send(ClientEvent::Message(message));
    }

    async fn close(&mut self, link: Link) {
        if let Link::Open(mut session) = link {
            let limit = self.heartbeat.write_timeout;
            match timeout(limit, session.socket.close(None)).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => debug!(?err, "failed to close connection cleanly"),
                Err(_) => debug!(?limit, "close handshake timed out, dropping connection"),
            }
        }
        self.state.closed_by_client();
        self.publish_status();
    }

    fn publish_status(&self) {
        let status = self.state.status().clone();
        self.status.send_replace(status.clone());
        let _ = self.events.send(ClientEvent::Status(status));
    }
}

async fn connect(url: String, limit: Duration) -> Result<Socket, ConnectionError> {
    match timeout(limit, connect_async(url.as_str())).await {
        Ok(Ok((socket, _response))) => Ok(socket),
        Ok(Err(err)) => Err(ConnectionError::Handshake(err)),
        Err(_) => Err(ConnectionError::Timeout(limit)),
    }
}
