//! Protocol state machine bridging transport events to the session registry,
//! the presence tracker, and the Document store.
//!
//! Per-connection states:
//! ```text
//! Connected ──join-room──► InRoom(doc) ──leave-room──► Connected
//!     │                        │
//!     └──────disconnect────────┴──► Closed (terminal)
//! ```
//!
//! The gateway delivers messages through a per-connection outbound queue
//! (unbounded mpsc) drained by the transport's writer task. Dropping the
//! queue's sender closes the transport after queued messages have flushed,
//! which is how eviction guarantees the `duplicate-connection` notice is
//! delivered before the forced close.
//!
//! All in-memory state sits behind one coarse lock; the only suspending
//! operation, `DocumentStore::save`, is awaited outside of it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};

use crate::presence::RoomPresenceTracker;
use crate::protocol::{
    anonymous_user_id, ClientMessage, ConnectionId, DocumentId, Editor, ServerMessage, UserId,
};
use crate::session::{SessionRegistry, TransportState};
use crate::store::DocumentStore;

/// Notice text sent to a superseded connection before its transport closes.
const DUPLICATE_NOTICE: &str =
    "This post was opened in a newer session under your account; this session is being closed.";

/// Default cap on concurrent editors in one room.
const DEFAULT_ROOM_CAPACITY: usize = 100;

/// Per-connection protocol state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ConnState {
    /// Registered, not in any room.
    Connected,
    /// Joined a document room under a resolved identity.
    InRoom {
        document_id: DocumentId,
        user_id: UserId,
    },
}

struct Peer {
    tx: mpsc::UnboundedSender<ServerMessage>,
    state: ConnState,
}

#[derive(Default)]
struct GatewayState {
    sessions: SessionRegistry,
    presence: RoomPresenceTracker,
    peers: HashMap<ConnectionId, Peer>,
}

impl GatewayState {
    fn send_to(&self, connection_id: ConnectionId, msg: ServerMessage) {
        if let Some(peer) = self.peers.get(&connection_id) {
            // A full/closed queue means the writer task is gone; disconnect
            // cleanup will handle the rest.
            let _ = peer.tx.send(msg);
        }
    }

    /// Presence broadcast: the encoded editor set, to every listed member.
    fn broadcast_editors(&self, editors: &[Editor]) {
        let payload = ServerMessage::Editors(editors.iter().map(Editor::encode).collect());
        for editor in editors {
            self.send_to(editor.connection_id, payload.clone());
        }
    }
}

/// The protocol handler: connect/disconnect/join/leave/content-update/save.
pub struct CollaborationGateway {
    state: Mutex<GatewayState>,
    store: Arc<dyn DocumentStore>,
    max_editors_per_room: usize,
}

impl CollaborationGateway {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_room_capacity(store, DEFAULT_ROOM_CAPACITY)
    }

    /// Create with an explicit cap on concurrent editors per room.
    pub fn with_room_capacity(store: Arc<dyn DocumentStore>, max_editors_per_room: usize) -> Self {
        Self {
            state: Mutex::new(GatewayState::default()),
            store,
            max_editors_per_room,
        }
    }

    /// Transport connect: register the connection and its outbound queue.
    pub async fn register(
        &self,
        connection_id: ConnectionId,
        tx: mpsc::UnboundedSender<ServerMessage>,
    ) {
        let mut state = self.state.lock().await;
        state.sessions.register_connection(connection_id);
        state.peers.insert(
            connection_id,
            Peer {
                tx,
                state: ConnState::Connected,
            },
        );
        log::debug!("Connection {connection_id} registered");
    }

    /// Process one protocol message from a connection.
    ///
    /// Callers must await completion before feeding the next message from the
    /// same connection; that is what preserves per-connection ordering.
    pub async fn handle_message(&self, connection_id: ConnectionId, msg: ClientMessage) {
        match msg {
            ClientMessage::JoinRoom {
                document_id,
                user_id,
                display_name,
            } => {
                self.handle_join(connection_id, document_id, user_id, display_name)
                    .await;
            }
            ClientMessage::LeaveRoom {
                document_id,
                user_id,
            } => {
                self.handle_leave(connection_id, document_id, user_id).await;
            }
            ClientMessage::ContentUpdate {
                document_id,
                content,
                user_id,
            } => {
                self.handle_content_update(connection_id, document_id, content, user_id)
                    .await;
            }
            ClientMessage::SaveContent {
                document_id,
                content,
            } => {
                self.handle_save(connection_id, document_id, content).await;
            }
        }
    }

    async fn handle_join(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
        user_id: Option<UserId>,
        display_name: Option<String>,
    ) {
        let mut state = self.state.lock().await;
        if !state.peers.contains_key(&connection_id) {
            log::warn!("join-room from unregistered connection {connection_id}");
            return;
        }

        // Unauthenticated sessions get a pseudo-id unique to this connection.
        let user_id = user_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| anonymous_user_id(&connection_id));

        // Already in a room? Implicitly leave it first (re-join of the same
        // room under the same identity is idempotent and skips this).
        let previous = state.peers.get(&connection_id).map(|p| p.state.clone());
        if let Some(ConnState::InRoom {
            document_id: current_doc,
            user_id: current_user,
        }) = previous
        {
            if current_doc != document_id || current_user != user_id {
                if let Some(remaining) =
                    state.presence.leave(&current_doc, &current_user, connection_id)
                {
                    state.broadcast_editors(&remaining);
                }
                log::info!(
                    "Connection {connection_id} implicitly left {current_doc} to join {document_id}"
                );
            }
        }

        state.sessions.attribute_to_user(user_id.clone(), connection_id);

        // Single-session enforcement: evict every other connection of this
        // user that is a member of the target room. Notice first, then
        // presence removal, then transport close (sender drop) so the notice
        // can flush.
        let candidates = state.sessions.evict_other_connections(&user_id, connection_id);
        for evicted in candidates {
            // Only a connection holding an editor entry for this exact user
            // in this room is a duplicate; a connection that re-joined under
            // another identity keeps its stale attribution but is not one.
            if !state.presence.contains(&document_id, &user_id, evicted) {
                continue;
            }
            state.send_to(
                evicted,
                ServerMessage::DuplicateConnection {
                    message: DUPLICATE_NOTICE.to_string(),
                },
            );
            state.presence.leave(&document_id, &user_id, evicted);
            state
                .sessions
                .set_transport_state(&evicted, TransportState::Closing);
            if let Some(peer) = state.peers.remove(&evicted) {
                drop(peer.tx);
            }
            log::info!(
                "Evicted connection {evicted} of user {user_id} from {document_id} (superseded by {connection_id})"
            );
        }

        // Capacity check after eviction (an evicted duplicate frees its
        // slot). A re-join of an existing identity always passes.
        if !state.presence.contains(&document_id, &user_id, connection_id)
            && state.presence.editor_count(&document_id) >= self.max_editors_per_room
        {
            // The implicit leave above may already have run; the connection
            // is in no room now.
            if let Some(peer) = state.peers.get_mut(&connection_id) {
                peer.state = ConnState::Connected;
            }
            let editors = state.presence.editors(&document_id).unwrap_or_default();
            state.send_to(
                connection_id,
                ServerMessage::JoinRoomResponse {
                    success: false,
                    editors: editors.iter().map(Editor::encode).collect(),
                },
            );
            log::warn!(
                "Join of {user_id} ({connection_id}) to {document_id} rejected: room is full"
            );
            return;
        }

        let editors = state.presence.join(
            &document_id,
            user_id.clone(),
            connection_id,
            display_name,
        );
        if let Some(peer) = state.peers.get_mut(&connection_id) {
            peer.state = ConnState::InRoom {
                document_id: document_id.clone(),
                user_id: user_id.clone(),
            };
        }

        // Exactly one presence broadcast per successful join; it includes
        // the sender.
        state.broadcast_editors(&editors);
        state.send_to(
            connection_id,
            ServerMessage::JoinRoomResponse {
                success: true,
                editors: editors.iter().map(Editor::encode).collect(),
            },
        );
        log::info!("User {user_id} ({connection_id}) joined room {document_id}");
    }

    async fn handle_leave(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
        user_id: UserId,
    ) {
        let mut state = self.state.lock().await;
        let in_room = matches!(
            state.peers.get(&connection_id),
            Some(Peer { state: ConnState::InRoom { document_id: doc, .. }, .. }) if *doc == document_id
        );
        if !in_room {
            // Out-of-state message; dropped, never fatal.
            log::debug!("leave-room for {document_id} from connection {connection_id} not in that room");
            return;
        }

        if let Some(remaining) = state.presence.leave(&document_id, &user_id, connection_id) {
            state.broadcast_editors(&remaining);
        }
        if let Some(peer) = state.peers.get_mut(&connection_id) {
            peer.state = ConnState::Connected;
        }
        state.send_to(connection_id, ServerMessage::LeaveRoomResponse { success: true });
        log::info!("User {user_id} ({connection_id}) left room {document_id}");
    }

    async fn handle_content_update(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
        content: String,
        user_id: UserId,
    ) {
        let state = self.state.lock().await;
        // Guard against stale messages after a reconnect: the update must
        // target the room this connection is currently in.
        let in_room = matches!(
            state.peers.get(&connection_id),
            Some(Peer { state: ConnState::InRoom { document_id: doc, .. }, .. }) if *doc == document_id
        );
        if !in_room {
            log::debug!(
                "Ignoring content-update for {document_id} from connection {connection_id} (not in that room)"
            );
            return;
        }

        // Relay to every other room member — no persistence, no echo.
        if let Some(editors) = state.presence.editors(&document_id) {
            let relay = ServerMessage::ContentUpdated { content, user_id };
            for editor in &editors {
                if editor.connection_id != connection_id {
                    state.send_to(editor.connection_id, relay.clone());
                }
            }
        }
    }

    async fn handle_save(
        &self,
        connection_id: ConnectionId,
        document_id: DocumentId,
        content: String,
    ) {
        // The store call is the only suspending operation; it runs outside
        // the state lock.
        let result = self.store.save(&document_id, &content).await;

        let state = self.state.lock().await;
        match result {
            Ok(()) => {
                let timestamp = unix_millis();
                if let Some(editors) = state.presence.editors(&document_id) {
                    let saved = ServerMessage::ContentSaved {
                        document_id: document_id.clone(),
                        timestamp,
                    };
                    for editor in &editors {
                        state.send_to(editor.connection_id, saved.clone());
                    }
                }
                state.send_to(
                    connection_id,
                    ServerMessage::SaveContentResponse {
                        success: true,
                        error: None,
                    },
                );
                log::info!("Saved {document_id} ({} bytes) via {connection_id}", content.len());
            }
            Err(e) => {
                // Persistence failures surface only to the requester.
                state.send_to(
                    connection_id,
                    ServerMessage::SaveContentResponse {
                        success: false,
                        error: Some(e.to_string()),
                    },
                );
                log::warn!("Save of {document_id} via {connection_id} failed: {e}");
            }
        }
    }

    /// Transport disconnect: implicit leave from every room, then the
    /// connection record is destroyed. Terminal.
    pub async fn disconnect(&self, connection_id: ConnectionId) {
        let mut state = self.state.lock().await;
        state.peers.remove(&connection_id);
        for (document_id, editors) in state.presence.leave_all_rooms(connection_id) {
            if let Some(editors) = editors {
                state.broadcast_editors(&editors);
            } else {
                log::debug!("Room {document_id} removed (empty)");
            }
        }
        state
            .sessions
            .set_transport_state(&connection_id, TransportState::Closed);
        state.sessions.remove_connection(&connection_id);
        log::info!("Connection {connection_id} disconnected");
    }

    /// Number of registered connections.
    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.sessions.connection_count()
    }

    /// Number of live rooms.
    pub async fn room_count(&self) -> usize {
        self.state.lock().await.presence.room_count()
    }

    /// Current editor list for a room, if it exists.
    pub async fn room_editors(&self, document_id: &str) -> Option<Vec<Editor>> {
        self.state.lock().await.presence.editors(document_id)
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
