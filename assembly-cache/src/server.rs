//! WebSocket autoupdate server.
//!
//! ```text
//! Client A ──┐                          ┌── ChannelTransport (A) ◄──┐
//!            ├── connect{token,change} ─┤                           ├── AutoupdateDispatcher
//! Client B ──┘                          └── ChannelTransport (B) ◄──┘          ▲
//!                                                                              │
//!                                                         ElementCache::change_elements
//! ```
//!
//! Every connection starts with a `connect` frame whose token is resolved
//! to a user by the configured [`Authenticate`]. The server answers with
//! everything the client missed since its change id (or the full dataset)
//! and then forwards each dispatched batch until either side goes away.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::auth::Authenticate;
use crate::autoupdate::{AutoupdateMessage, ChannelTransport};
use crate::cache::{CacheError, ElementCache};
use crate::protocol::{decode_client, encode_server, ClientMessage, ProtocolError, ServerMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Outbound queue per session; a session that falls this far behind is dropped
    pub session_queue_capacity: usize,
    /// Heartbeat interval in seconds
    pub heartbeat_interval_secs: u64,
    /// Time a client has to send its connect frame
    pub connect_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            session_queue_capacity: 256,
            heartbeat_interval_secs: 30,
            connect_timeout_secs: 10,
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            session_queue_capacity: 16,
            heartbeat_interval_secs: 1,
            connect_timeout_secs: 2,
        }
    }
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub active_sessions: usize,
}

#[derive(Debug, Default)]
struct Counters {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    rejected_connections: AtomicU64,
    total_messages: AtomicU64,
}

/// The autoupdate server.
pub struct AutoupdateServer {
    config: ServerConfig,
    cache: Arc<ElementCache>,
    auth: Arc<dyn Authenticate>,
    counters: Arc<Counters>,
}

impl AutoupdateServer {
    pub fn new(config: ServerConfig, cache: Arc<ElementCache>, auth: Arc<dyn Authenticate>) -> Self {
        Self {
            config,
            cache,
            auth,
            counters: Arc::new(Counters::default()),
        }
    }

    /// Bind to the configured address and serve until `shutdown` flips to true.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Autoupdate server listening on {}", listener.local_addr()?);
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` flips to true.
    pub async fn serve(
        &self,
        listener: TcpListener,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    log::debug!("New TCP connection from {addr}");

                    let cache = self.cache.clone();
                    let auth = self.auth.clone();
                    let config = self.config.clone();
                    let counters = self.counters.clone();
                    let shutdown = shutdown.clone();
                    tokio::spawn(async move {
                        if let Err(e) = Self::handle_connection(
                            stream, addr, cache, auth, config, counters, shutdown,
                        )
                        .await
                        {
                            log::warn!("Connection error from {addr}: {e}");
                        }
                    });
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        log::info!("Autoupdate server stopped accepting connections");
        Ok(())
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        cache: Arc<ElementCache>,
        auth: Arc<dyn Authenticate>,
        config: ServerConfig,
        counters: Arc<Counters>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        counters.total_connections.fetch_add(1, Ordering::Relaxed);

        let timeout = Duration::from_secs(config.connect_timeout_secs);
        let (token, change_id) =
            match tokio::time::timeout(timeout, Self::await_connect(&mut ws_receiver)).await {
                Ok(Ok(Some(connect))) => connect,
                Ok(Ok(None)) => return Ok(()),
                Ok(Err(e)) => {
                    counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    send_frame(&mut ws_sender, &ServerMessage::error(e.to_string())).await?;
                    return Err(e.into());
                }
                Err(_) => {
                    counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
                    send_frame(&mut ws_sender, &ServerMessage::error("connect timed out")).await?;
                    return Ok(());
                }
            };

        let user_id = match auth.authenticate(token.as_deref()) {
            Ok(user_id) => user_id,
            Err(e) => {
                counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
                log::warn!("Rejected connection from {addr}: {e}");
                send_frame(&mut ws_sender, &ServerMessage::error(e.to_string())).await?;
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
        };

        if !cache.restrictions().can_see_anything(user_id) {
            counters.rejected_connections.fetch_add(1, Ordering::Relaxed);
            send_frame(&mut ws_sender, &ServerMessage::error("anonymous access is disabled")).await?;
            ws_sender.send(Message::Close(None)).await?;
            return Ok(());
        }

        let (transport, outbound) = ChannelTransport::new(config.session_queue_capacity);
        let (session_id, initial) = match cache
            .connect_session(user_id, change_id, Arc::new(transport))
            .await
        {
            Ok(connected) => connected,
            Err(e) => {
                send_frame(&mut ws_sender, &ServerMessage::error(e.to_string())).await?;
                return Err(e.into());
            }
        };
        counters.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "Session {session_id} for user {user_id} from {addr} (change id {change_id} → {})",
            initial.to_change_id
        );

        let result = Self::run_session(
            &mut ws_sender,
            &mut ws_receiver,
            initial,
            outbound,
            &config,
            &counters,
            shutdown,
        )
        .await;

        cache.autoupdate().disconnect(&session_id);
        counters.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Session {session_id} closed");
        result
    }

    /// Read frames until a valid connect frame. `None` when the peer left.
    async fn await_connect<R>(receiver: &mut R) -> Result<Option<(Option<String>, u64)>, ProtocolError>
    where
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        while let Some(frame) = receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    return match decode_client(text.as_str())? {
                        ClientMessage::Connect { token, change_id } => Ok(Some((token, change_id))),
                        ClientMessage::Ping => Err(ProtocolError::NotConnected),
                    };
                }
                Ok(Message::Binary(_)) => return Err(ProtocolError::Unsupported),
                Ok(Message::Close(_)) | Err(_) => return Ok(None),
                Ok(_) => {}
            }
        }
        Ok(None)
    }

    async fn run_session<S, R>(
        ws_sender: &mut S,
        ws_receiver: &mut R,
        initial: AutoupdateMessage,
        mut outbound: mpsc::Receiver<Arc<AutoupdateMessage>>,
        config: &ServerConfig,
        counters: &Counters,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), ServerError>
    where
        S: Sink<Message, Error = tungstenite::Error> + Unpin,
        R: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
    {
        send_frame(ws_sender, &ServerMessage::Autoupdate(Arc::new(initial))).await?;
        counters.total_messages.fetch_add(1, Ordering::Relaxed);

        let period = Duration::from_secs(config.heartbeat_interval_secs.max(1));
        let mut heartbeat = tokio::time::interval_at(tokio::time::Instant::now() + period, period);

        loop {
            if *shutdown.borrow() {
                ws_sender.send(Message::Close(None)).await?;
                return Ok(());
            }
            tokio::select! {
                message = outbound.recv() => match message {
                    Some(message) => {
                        send_frame(ws_sender, &ServerMessage::Autoupdate(message)).await?;
                        counters.total_messages.fetch_add(1, Ordering::Relaxed);
                    }
                    None => {
                        // Dropped by the dispatcher: too slow, rebuild or shutdown.
                        ws_sender.send(Message::Close(None)).await?;
                        return Ok(());
                    }
                },

                frame = ws_receiver.next() => match frame {
                    Some(Ok(Message::Text(text))) => match decode_client(text.as_str()) {
                        Ok(ClientMessage::Ping) => send_frame(ws_sender, &ServerMessage::Pong).await?,
                        Ok(ClientMessage::Connect { .. }) => {
                            send_frame(ws_sender, &ServerMessage::error("already connected")).await?
                        }
                        Err(e) => send_frame(ws_sender, &ServerMessage::error(e.to_string())).await?,
                    },
                    Some(Ok(Message::Ping(data))) => ws_sender.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Err(e)) => return Err(e.into()),
                    Some(Ok(_)) => {}
                },

                _ = heartbeat.tick() => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }

                changed = shutdown.changed() => {
                    if changed.is_err() {
                        ws_sender.send(Message::Close(None)).await?;
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.counters.total_connections.load(Ordering::Relaxed),
            active_connections: self.counters.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.counters.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.counters.total_messages.load(Ordering::Relaxed),
            active_sessions: self.cache.autoupdate().session_count(),
        }
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn cache(&self) -> &Arc<ElementCache> {
        &self.cache
    }
}

async fn send_frame<S>(sender: &mut S, message: &ServerMessage) -> Result<(), ServerError>
where
    S: Sink<Message, Error = tungstenite::Error> + Unpin,
{
    let text = encode_server(message)?;
    sender.send(Message::Text(text.into())).await?;
    Ok(())
}
