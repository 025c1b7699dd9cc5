//! WebSocket sync client.
//!
//! Owns a [`ClientSession`] and two background tasks:
//! - writer: forwards encoded frames from a channel to the socket;
//! - reader: applies incoming server cycles one at a time under the
//!   session lock, so UI code using [`SyncClient::with_session`] never
//!   observes a half-applied message.
//!
//! A message the client cannot apply is reported as a
//! [`SyncEvent::ProtocolFault`] and answered with a `Hello` for the same
//! session, which makes the server resend full state.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;
use trellis_core::ConnectorRegistry;
use uuid::Uuid;

use crate::client_session::{ApplyReport, ClientSession};
use crate::error::ProtocolError;
use crate::protocol::{MessageType, SyncMessage};

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// e.g. `ws://127.0.0.1:9191`
    pub server_url: String,
    pub outgoing_capacity: usize,
    pub event_capacity: usize,
}

impl ClientConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            outgoing_capacity: 256,
            event_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    /// Socket open, waiting for the initial full state
    Connecting,
    Connected,
}

/// Events emitted by the sync client.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Initial state applied
    Connected { session_id: Uuid, resumed: bool },
    /// A server cycle was applied
    CycleApplied(ApplyReport),
    /// The server rejected one of our messages, or we rejected one of its
    ProtocolFault(String),
    Disconnected,
}

pub struct SyncClient {
    config: ClientConfig,
    session: Arc<Mutex<ClientSession>>,
    session_id: Arc<RwLock<Option<Uuid>>>,
    state: Arc<RwLock<ConnectionState>>,
    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<Vec<u8>>>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
    event_tx: mpsc::Sender<SyncEvent>,
}

impl SyncClient {
    pub fn new(config: ClientConfig, registry: ConnectorRegistry) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            config,
            session: Arc::new(Mutex::new(ClientSession::new(registry))),
            session_id: Arc::new(RwLock::new(None)),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Open the socket and say hello, resuming the previous session if there
    /// was one. Completes before the initial state arrives; wait for
    /// [`SyncEvent::Connected`].
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.config.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                log::warn!("Failed to connect to {}: {e}", self.config.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to WebSocket
        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(self.config.outgoing_capacity);
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            let _ = ws_writer.close().await;
        });

        let hello = SyncMessage::hello(*self.session_id.read().await).encode()?;
        out_tx
            .send(hello)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        let resync_tx = out_tx.downgrade();
        self.outgoing_tx = Some(out_tx);

        // Reader task: apply incoming cycles one at a time
        let session = Arc::clone(&self.session);
        let session_id = Arc::clone(&self.session_id);
        let state = Arc::clone(&self.state);
        let event_tx = self.event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let bytes: Vec<u8> = match msg {
                    Ok(Message::Binary(data)) => data.into(),
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                let frame = match SyncMessage::decode(&bytes) {
                    Ok(frame) => frame,
                    Err(e) => {
                        log::warn!("Dropping undecodable frame: {e}");
                        continue;
                    }
                };

                match frame.msg_type {
                    MessageType::ServerCycle => {
                        let resumed = {
                            let mut known = session_id.write().await;
                            match *known {
                                Some(id) if id == frame.session_id => true,
                                _ => {
                                    *known = Some(frame.session_id);
                                    session.lock().await.reset();
                                    false
                                }
                            }
                        };

                        let applied = match frame.server_message() {
                            Ok(message) => session.lock().await.apply(&message),
                            Err(e) => Err(e),
                        };
                        match applied {
                            Ok(report) => {
                                let first = {
                                    let mut s = state.write().await;
                                    let first = *s != ConnectionState::Connected;
                                    *s = ConnectionState::Connected;
                                    first
                                };
                                if first {
                                    let _ = event_tx
                                        .send(SyncEvent::Connected {
                                            session_id: frame.session_id,
                                            resumed,
                                        })
                                        .await;
                                }
                                let _ = event_tx.send(SyncEvent::CycleApplied(report)).await;
                            }
                            Err(e) if e.is_duplicate() => {
                                log::debug!("Ignoring {e}");
                            }
                            Err(e) => {
                                log::warn!("Rejected server cycle: {e}; requesting resync");
                                let _ = event_tx.send(SyncEvent::ProtocolFault(e.to_string())).await;
                                if let (Some(tx), Ok(hello)) = (
                                    resync_tx.upgrade(),
                                    SyncMessage::hello(Some(frame.session_id)).encode(),
                                ) {
                                    let _ = tx.send(hello).await;
                                }
                            }
                        }
                    }
                    MessageType::Fault => {
                        let reason = frame.fault_reason().unwrap_or_default();
                        log::warn!("Server fault: {reason}");
                        let _ = event_tx.send(SyncEvent::ProtocolFault(reason)).await;
                    }
                    MessageType::Pong => log::trace!("Pong from server"),
                    other => log::debug!("Unhandled message type: {other:?}"),
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Send every queued ServerRpc call as one client cycle. Returns the
    /// cycle number.
    pub async fn flush(&self) -> Result<u64, ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let id = (*self.session_id.read().await).ok_or(ProtocolError::ConnectionClosed)?;

        let (seq, encoded) = {
            let mut session = self.session.lock().await;
            let message = session.take_outgoing();
            (message.seq, SyncMessage::client_cycle(id, &message)?.encode()?)
        };
        tx.send(encoded)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)?;
        Ok(seq)
    }

    pub async fn ping(&self) -> Result<(), ProtocolError> {
        let tx = self.outgoing_tx.as_ref().ok_or(ProtocolError::ConnectionClosed)?;
        let id = self.session_id.read().await.unwrap_or_else(Uuid::nil);
        tx.send(SyncMessage::ping(id).encode()?)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Run `f` with exclusive access to the client session, between
    /// incoming messages.
    pub async fn with_session<R>(&self, f: impl FnOnce(&mut ClientSession) -> R) -> R {
        let mut session = self.session.lock().await;
        f(&mut *session)
    }

    pub async fn session_id(&self) -> Option<Uuid> {
        *self.session_id.read().await
    }

    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Close the writer side; the reader reports `Disconnected` once the
    /// server closes the socket.
    pub fn disconnect(&mut self) {
        self.outgoing_tx = None;
    }
}
