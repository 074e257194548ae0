//! WebSocket autoupdate client.
//!
//! Remembers the last change id it received, so a reconnect only transfers
//! what changed in between instead of the full dataset.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::autoupdate::AutoupdateMessage;
use crate::protocol::{decode_server, encode_client, ClientMessage, ProtocolError, ServerMessage};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events emitted by the client.
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Autoupdate(Arc<AutoupdateMessage>),
    Pong,
    /// Error frame sent by the server
    ServerError(String),
    Disconnected,
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tungstenite::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("not connected")]
    NotConnected,
}

pub struct AutoupdateClient {
    server_url: String,
    /// Presented in the connect frame; none connects anonymously.
    token: Option<String>,
    state: Arc<RwLock<ConnectionState>>,
    /// `to_change_id` of the last applied autoupdate
    last_change_id: Arc<AtomicU64>,
    outgoing_tx: Option<mpsc::Sender<ClientMessage>>,
    event_tx: mpsc::Sender<ClientEvent>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
}

impl AutoupdateClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            token: None,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            last_change_id: Arc::new(AtomicU64::new(0)),
            outgoing_tx: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    pub fn last_change_id(&self) -> u64 {
        self.last_change_id.load(Ordering::Acquire)
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Connect and request everything after the last seen change id.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        *self.state.write().await = ConnectionState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok(connected) => connected,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let connect = ClientMessage::Connect {
            token: self.token.clone(),
            change_id: self.last_change_id(),
        };
        ws_writer.send(Message::Text(encode_client(&connect)?.into())).await?;

        let (out_tx, mut out_rx) = mpsc::channel::<ClientMessage>(64);
        self.outgoing_tx = Some(out_tx);

        // Writer task: forward outgoing frames, close when the client lets go.
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let Ok(text) = encode_client(&message) else { continue };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });

        *self.state.write().await = ConnectionState::Connected;

        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let last_change_id = self.last_change_id.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_reader.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let event = match decode_server(text.as_str()) {
                    Ok(ServerMessage::Autoupdate(message)) => {
                        last_change_id.store(message.to_change_id, Ordering::Release);
                        ClientEvent::Autoupdate(message)
                    }
                    Ok(ServerMessage::Pong) => ClientEvent::Pong,
                    Ok(ServerMessage::Error { message }) => ClientEvent::ServerError(message),
                    Err(e) => {
                        log::warn!("Dropping undecodable server frame: {e}");
                        continue;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    break;
                }
            }

            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(ClientEvent::Disconnected).await;
        });

        log::debug!("Connected to {}", self.server_url);
        Ok(())
    }

    pub async fn send_ping(&self) -> Result<(), ClientError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ClientError::NotConnected)?;
        tx.send(ClientMessage::Ping)
            .await
            .map_err(|_| ClientError::NotConnected)
    }

    /// Close the connection. The last change id is kept for the next `connect`.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }
}
