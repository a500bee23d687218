//! WebSocket [`Stream`] over tokio-tungstenite.
//!
//! A background task owns the socket. It reconnects with backoff, reports
//! `Reset` / `Message` / `Disconnect` on an mpsc channel and writes frames
//! queued by the connection.
//!
//! Every `Reset` starts a new socket generation. The connection calls
//! [`Stream::begin_session`] when it handles that `Reset`, so frames carry
//! the generation the connection believed was current. Frames from an older
//! generation are dropped; the connection resends what matters on reset.

use super::RetryPolicy;
use crate::config::ConnectionOptions;
use crate::error::{DdpError, Result};
use crate::stream::{
    ConnectionStatus, DisconnectOptions, ReconnectOptions, StatusKind, Stream, StreamEvent,
};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;

type Socket =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
enum Command {
    Send { generation: u64, frame: String },
    Reconnect { force: bool },
    Disconnect(DisconnectOptions),
    Lost(String),
}

/// Why a connected socket stopped.
enum SocketEnd {
    /// Remote close or error; retry with backoff.
    Dropped,
    /// Forced reconnect or lost connection; retry immediately.
    Restart,
    Disconnected(DisconnectOptions),
    /// Every handle is gone.
    Shutdown,
}

/// Handle held by the connection.
#[derive(Debug)]
pub struct WebSocketStream {
    commands: mpsc::UnboundedSender<Command>,
    status: Arc<Mutex<ConnectionStatus>>,
    generation: u64,
}

impl WebSocketStream {
    /// Start the socket task. The receiver yields the stream's events and
    /// must be drained by whoever drives the connection.
    pub fn spawn(
        url: &str,
        options: &ConnectionOptions,
    ) -> (Self, mpsc::UnboundedReceiver<StreamEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let status = Arc::new(Mutex::new(ConnectionStatus::connecting()));

        let task = SocketTask {
            url: to_websocket_url(url),
            retry: options.retry,
            policy: RetryPolicy::default(),
            connect_timeout: options.connect_timeout(),
            commands: command_rx,
            events: event_tx,
            status: status.clone(),
            generation: 0,
            retry_count: 0,
        };
        tokio::spawn(task.run());

        (
            Self {
                commands: command_tx,
                status,
                generation: 0,
            },
            event_rx,
        )
    }

    fn command(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("websocket task has stopped; command dropped");
        }
    }
}

impl Stream for WebSocketStream {
    fn send(&mut self, frame: String) {
        self.command(Command::Send {
            generation: self.generation,
            frame,
        });
    }

    fn reconnect(&mut self, options: ReconnectOptions) {
        self.command(Command::Reconnect {
            force: options.force,
        });
    }

    fn disconnect(&mut self, options: DisconnectOptions) {
        self.command(Command::Disconnect(options));
    }

    fn status(&self) -> ConnectionStatus {
        self.status.lock().clone()
    }

    fn begin_session(&mut self) {
        self.generation += 1;
    }

    fn lost_connection(&mut self, reason: &str) {
        self.command(Command::Lost(reason.to_string()));
    }
}

/// `http(s)://` and bare host URLs become `ws(s)://`; the DDP endpoint path
/// is `/websocket`.
pub fn to_websocket_url(url: &str) -> String {
    let url = url.trim_end_matches('/');
    let with_scheme = if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if url.starts_with("ws://") || url.starts_with("wss://") {
        url.to_string()
    } else {
        format!("ws://{url}")
    };
    if with_scheme.ends_with("/websocket") {
        with_scheme
    } else {
        format!("{with_scheme}/websocket")
    }
}

// ── Socket task ─────────────────────────────────────────────────

struct SocketTask {
    url: String,
    retry: bool,
    policy: RetryPolicy,
    connect_timeout: Duration,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<StreamEvent>,
    status: Arc<Mutex<ConnectionStatus>>,
    generation: u64,
    retry_count: u32,
}

impl SocketTask {
    async fn run(mut self) {
        loop {
            self.set_status(StatusKind::Connecting, None, None);
            let end = match self.open().await {
                Ok(socket) => {
                    self.retry_count = 0;
                    self.generation += 1;
                    self.set_status(StatusKind::Connected, None, None);
                    tracing::info!(url = %self.url, generation = self.generation, "websocket connected");
                    if self.events.send(StreamEvent::Reset).is_err() {
                        return;
                    }
                    let end = self.pump(socket).await;
                    let _ = self.events.send(StreamEvent::Disconnect);
                    end
                }
                Err(e) => {
                    tracing::warn!(url = %self.url, error = %e, "websocket connect failed");
                    SocketEnd::Dropped
                }
            };

            let keep_going = match end {
                SocketEnd::Restart => true,
                SocketEnd::Dropped if self.retry => self.wait_to_retry().await,
                SocketEnd::Dropped => self.wait_offline(None).await,
                SocketEnd::Disconnected(options) if options.permanent => {
                    self.set_status(StatusKind::Failed, None, options.error.clone());
                    tracing::info!(reason = ?options.error, "websocket closed permanently");
                    false
                }
                SocketEnd::Disconnected(options) => self.wait_offline(options.error).await,
                SocketEnd::Shutdown => false,
            };
            if !keep_going {
                return;
            }
        }
    }

    async fn open(&self) -> Result<Socket> {
        match tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(self.url.as_str()),
        )
        .await
        {
            Ok(Ok((socket, _response))) => Ok(socket),
            Ok(Err(e)) => Err(DdpError::Transport(e.to_string())),
            Err(_) => Err(DdpError::Transport(format!(
                "timed out after {}ms",
                self.connect_timeout.as_millis()
            ))),
        }
    }

    /// Shuttle frames until the socket ends.
    async fn pump(&mut self, socket: Socket) -> SocketEnd {
        let (mut sink, mut source) = socket.split();
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = sink.send(WsMessage::Close(None)).await;
                        return SocketEnd::Shutdown;
                    };
                    match command {
                        Command::Send { generation, frame } => {
                            if generation != self.generation {
                                tracing::debug!(generation, current = self.generation, "dropping frame from an old session");
                            } else if let Err(e) = sink.send(WsMessage::Text(frame.into())).await {
                                tracing::warn!(error = %e, "websocket send failed");
                                return SocketEnd::Dropped;
                            }
                        }
                        Command::Reconnect { force: false } => {}
                        Command::Reconnect { force: true } => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return SocketEnd::Restart;
                        }
                        Command::Disconnect(options) => {
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return SocketEnd::Disconnected(options);
                        }
                        Command::Lost(reason) => {
                            tracing::warn!(reason = %reason, "websocket considered lost");
                            let _ = sink.send(WsMessage::Close(None)).await;
                            return SocketEnd::Restart;
                        }
                    }
                }
                inbound = source.next() => match inbound {
                    Some(Ok(WsMessage::Text(text))) => {
                        if self.events.send(StreamEvent::Message(text.as_str().to_owned())).is_err() {
                            return SocketEnd::Shutdown;
                        }
                    }
                    Some(Ok(WsMessage::Close(frame))) => {
                        tracing::info!(close_frame = ?frame, "websocket closed by server");
                        return SocketEnd::Dropped;
                    }
                    Some(Ok(
                        WsMessage::Ping(_)
                        | WsMessage::Pong(_)
                        | WsMessage::Frame(_)
                        | WsMessage::Binary(_),
                    )) => {
                        // DDP is text only; ping/pong handled by tungstenite
                    }
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "websocket error");
                        return SocketEnd::Dropped;
                    }
                    None => return SocketEnd::Dropped,
                },
            }
        }
    }

    /// Sleep out the backoff delay. A reconnect request cuts it short.
    async fn wait_to_retry(&mut self) -> bool {
        let delay = self.policy.delay(self.retry_count);
        self.retry_count += 1;
        let retry_time = chrono::Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
        self.set_status(StatusKind::Waiting, Some(retry_time), None);
        tracing::debug!(delay_ms = delay.as_millis() as u64, attempt = self.retry_count, "reconnecting later");

        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    None => return false,
                    Some(Command::Reconnect { .. }) => return true,
                    Some(Command::Disconnect(options)) if options.permanent => {
                        self.set_status(StatusKind::Failed, None, options.error);
                        return false;
                    }
                    Some(Command::Disconnect(options)) => return self.wait_offline(options.error).await,
                    // Nothing is connected; the engine resends on reset.
                    Some(Command::Send { .. } | Command::Lost(_)) => {}
                },
            }
        }
    }

    /// Stay offline until asked to reconnect.
    async fn wait_offline(&mut self, reason: Option<String>) -> bool {
        self.set_status(StatusKind::Offline, None, reason);
        loop {
            match self.commands.recv().await {
                None => return false,
                Some(Command::Reconnect { .. }) => {
                    self.retry_count = 0;
                    return true;
                }
                Some(Command::Disconnect(options)) if options.permanent => {
                    self.set_status(StatusKind::Failed, None, options.error);
                    return false;
                }
                Some(_) => {}
            }
        }
    }

    fn set_status(
        &self,
        kind: StatusKind,
        retry_time: Option<chrono::DateTime<chrono::Utc>>,
        reason: Option<String>,
    ) {
        let mut status = self.status.lock();
        *status = ConnectionStatus {
            status: kind,
            connected: kind == StatusKind::Connected,
            retry_count: self.retry_count,
            retry_time,
            reason,
        };
    }
}
