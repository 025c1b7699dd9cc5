//! WebSocket sync server.
//!
//! ```text
//! client                          server
//!   │ Hello(resume id?)  ───────►   SessionManager::get_or_create
//!   │ ◄─────── ServerCycle(resync)  full state of every component
//!   │ ClientCycle(seq n) ───────►   lock session, run one cycle
//!   │ ◄─────── ServerCycle(seq m)   diffs + ClientRpc calls
//!   │ ◄─────── ServerCycle          push tick: server-side changes
//!   │ Ping ─────────────►  ◄─ Pong
//! ```
//!
//! A protocol error on an incoming cycle is answered with a `Fault` frame
//! followed by a resync. Duplicates are dropped silently.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio_tungstenite::tungstenite::Message;
use trellis_core::BoxError;
use uuid::Uuid;

use crate::manager::{SessionManager, SharedSession, UiProvider};
use crate::protocol::{MessageType, SyncMessage};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    pub max_sessions: usize,
    /// How often server-side changes are pushed without a client request
    pub push_interval_ms: u64,
    /// Keep a session after its connection closes so the client can resume it
    pub retain_sessions: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9191".to_string(),
            max_sessions: 1024,
            push_interval_ms: 50,
            retain_sessions: true,
        }
    }
}

impl ServerConfig {
    /// Defaults overridden by `TRELLIS_BIND_ADDR` and `TRELLIS_MAX_SESSIONS`.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(addr) = std::env::var("TRELLIS_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(max) = std::env::var("TRELLIS_MAX_SESSIONS") {
            match max.parse() {
                Ok(max) => config.max_sessions = max,
                Err(e) => log::warn!("Ignoring TRELLIS_MAX_SESSIONS={max}: {e}"),
            }
        }
        config
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Server messages sent (responses and pushes)
    pub cycles: u64,
    pub protocol_faults: u64,
}

pub struct SyncServer {
    config: ServerConfig,
    manager: SessionManager,
    stats: Arc<RwLock<ServerStats>>,
}

impl SyncServer {
    pub fn new(config: ServerConfig, provider: impl UiProvider) -> Self {
        let manager = SessionManager::new(provider, config.max_sessions);
        Self {
            config,
            manager,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Accept WebSocket connections until the listener fails.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Sync server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let manager = self.manager.clone();
            let stats = self.stats.clone();
            let config = self.config.clone();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, manager, stats, config).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        manager: SessionManager,
        stats: Arc<RwLock<ServerStats>>,
        config: ServerConfig,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");
        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let mut session: Option<(Uuid, SharedSession)> = None;
        let mut push = tokio::time::interval(Duration::from_millis(config.push_interval_ms.max(1)));
        push.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let bytes: Vec<u8> = data.into();
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += bytes.len() as u64;
                                }
                                let frame = match SyncMessage::decode(&bytes) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Failed to decode message from {addr}: {e}");
                                        stats.write().await.protocol_faults += 1;
                                        continue;
                                    }
                                };

                                match frame.msg_type {
                                    MessageType::Hello => {
                                        let (id, shared, created) =
                                            manager.get_or_create(frame.resume_id()).await?;
                                        // Resuming keeps the client's cycle numbering
                                        let reply = {
                                            let mut locked = shared.lock().await;
                                            SyncMessage::server_cycle(id, &locked.initial_message())?
                                        };
                                        send_frame(&mut ws_sender, &reply).await?;
                                        stats.write().await.cycles += 1;
                                        log::info!(
                                            "Connection {addr} {} session {id}",
                                            if created { "opened" } else { "resumed" }
                                        );
                                        session = Some((id, shared));
                                    }

                                    MessageType::ClientCycle => {
                                        let Some((id, shared)) = &session else {
                                            send_frame(&mut ws_sender, &SyncMessage::fault(frame.session_id, "no session")).await?;
                                            continue;
                                        };
                                        let replies = {
                                            let mut locked = shared.lock().await;
                                            let outcome = frame
                                                .client_message()
                                                .and_then(|message| locked.run_cycle(&message));
                                            match outcome {
                                                Ok(outcome) => {
                                                    if !outcome.report.is_clean() {
                                                        log::debug!("Session {id} cycle report: {:?}", outcome.report);
                                                    }
                                                    vec![SyncMessage::server_cycle(*id, &outcome.response)?]
                                                }
                                                Err(e) if e.is_duplicate() => {
                                                    log::debug!("Session {id}: ignoring {e}");
                                                    Vec::new()
                                                }
                                                Err(e) => {
                                                    log::warn!("Session {id}: {e}");
                                                    stats.write().await.protocol_faults += 1;
                                                    locked.request_resync();
                                                    vec![
                                                        SyncMessage::fault(*id, &e.to_string()),
                                                        SyncMessage::server_cycle(*id, &locked.end_cycle())?,
                                                    ]
                                                }
                                            }
                                        };
                                        for reply in &replies {
                                            send_frame(&mut ws_sender, reply).await?;
                                            if reply.msg_type == MessageType::ServerCycle {
                                                stats.write().await.cycles += 1;
                                            }
                                        }
                                    }

                                    MessageType::Ping => {
                                        send_frame(&mut ws_sender, &SyncMessage::pong(frame.session_id)).await?;
                                    }

                                    other => {
                                        log::debug!("Unhandled message type from {addr}: {other:?}");
                                    }
                                }
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    _ = push.tick(), if session.is_some() => {
                        let Some((id, shared)) = &session else { continue };
                        let reply = {
                            let mut locked = shared.lock().await;
                            if !locked.has_pending_changes() {
                                continue;
                            }
                            SyncMessage::server_cycle(*id, &locked.end_cycle())?
                        };
                        send_frame(&mut ws_sender, &reply).await?;
                        stats.write().await.cycles += 1;
                    }
                }
            }
            Ok::<(), BoxError>(())
        }
        .await;

        stats.write().await.active_connections -= 1;
        if let Some((id, _)) = session {
            if !config.retain_sessions {
                manager.remove(&id).await;
            }
        }
        result
    }

    pub fn manager(&self) -> &SessionManager {
        &self.manager
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }
}

async fn send_frame<S>(sink: &mut S, frame: &SyncMessage) -> Result<(), BoxError>
where
    S: Sink<Message> + Unpin,
    S::Error: std::error::Error + Send + Sync + 'static,
{
    let encoded = frame.encode()?;
    sink.send(Message::Binary(encoded.into())).await?;
    Ok(())
}
