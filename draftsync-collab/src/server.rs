//! WebSocket front end for the collaboration gateway.
//!
//! Architecture:
//! ```text
//! Client A ──┐
//!             ├── CollabServer ── CollaborationGateway ──┬── SessionRegistry
//! Client B ──┘        │                                  └── RoomPresenceTracker
//!                     │
//!                     └── DocumentStore (external, save path only)
//! ```
//!
//! One task per connection. Incoming JSON text frames are decoded to
//! [`ClientMessage`] and handed to the gateway strictly in arrival order —
//! the read loop awaits each `handle_message` before taking the next frame.
//! Outbound [`ServerMessage`]s arrive on the connection's queue and are
//! written by the same task; when the gateway drops the queue (eviction),
//! the remaining messages flush and the transport is closed.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::gateway::CollaborationGateway;
use crate::protocol::{ClientMessage, ConnectionId, ServerMessage};
use crate::store::DocumentStore;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Cap on concurrent editors per document room
    pub max_editors_per_room: usize,
    /// Interval between server-initiated WebSocket pings
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            max_editors_per_room: 100,
            heartbeat_interval_secs: 30,
        }
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
}

/// The collaboration server.
pub struct CollabServer {
    config: ServerConfig,
    gateway: Arc<CollaborationGateway>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    /// Create a new server over the given document store.
    pub fn new(config: ServerConfig, store: Arc<dyn DocumentStore>) -> Self {
        let gateway = Arc::new(CollaborationGateway::with_room_capacity(
            store,
            config.max_editors_per_room,
        ));
        Self {
            config,
            gateway,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults(store: Arc<dyn DocumentStore>) -> Self {
        Self::new(ServerConfig::default(), store)
    }

    /// Start listening for WebSocket connections.
    ///
    /// This runs the server accept loop. Call from an async runtime.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Collab server listening on {}", self.config.bind_addr);

        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let gateway = self.gateway.clone();
            let stats = self.stats.clone();
            let heartbeat = Duration::from_secs(self.config.heartbeat_interval_secs.max(1));

            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, addr, gateway, stats, heartbeat).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    /// Get the protocol gateway.
    pub fn gateway(&self) -> &Arc<CollaborationGateway> {
        &self.gateway
    }
}

/// Handle a single WebSocket connection for its whole lifetime.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    gateway: Arc<CollaborationGateway>,
    stats: Arc<RwLock<ServerStats>>,
    heartbeat: Duration,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let ws_stream = tokio_tungstenite::accept_async(stream).await?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let connection_id: ConnectionId = Uuid::new_v4();
    let (tx, mut outgoing) = mpsc::unbounded_channel::<ServerMessage>();
    gateway.register(connection_id, tx).await;

    log::info!("WebSocket connection {connection_id} established from {addr}");
    {
        let mut s = stats.write().await;
        s.total_connections += 1;
        s.active_connections += 1;
    }

    let mut ping_timer = tokio::time::interval(heartbeat);
    ping_timer.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping_timer.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            // Incoming WebSocket frame
            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        {
                            let mut s = stats.write().await;
                            s.total_messages += 1;
                        }
                        match ClientMessage::decode(&text) {
                            // Awaiting here is what serializes this
                            // connection's messages.
                            Ok(client_msg) => gateway.handle_message(connection_id, client_msg).await,
                            Err(e) => {
                                // Malformed input never crashes the connection.
                                log::warn!("Undecodable frame from {addr}: {e}");
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if ws_sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        log::info!("Connection {connection_id} closed from {addr}");
                        break;
                    }
                    Some(Err(e)) => {
                        log::error!("WebSocket error from {addr}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            // Outbound message from the gateway
            out = outgoing.recv() => {
                match out {
                    Some(server_msg) => {
                        match server_msg.encode() {
                            Ok(text) => {
                                if ws_sender.send(Message::Text(text.into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => log::error!("Failed to encode outbound message: {e}"),
                        }
                    }
                    None => {
                        // The gateway dropped our queue (eviction). Queued
                        // messages have already flushed, so close now.
                        let _ = ws_sender.send(Message::Close(None)).await;
                        log::info!("Connection {connection_id} force-closed (superseded)");
                        break;
                    }
                }
            }

            // Server-initiated keepalive
            _ = ping_timer.tick() => {
                if ws_sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break;
                }
            }
        }
    }

    gateway.disconnect(connection_id).await;
    {
        let mut s = stats.write().await;
        s.active_connections -= 1;
    }

    Ok(())
}
