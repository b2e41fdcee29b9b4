//! Client-side half of the collaboration protocol.
//!
//! Provides:
//! - Connection lifecycle (connect, disconnect, explicit re-connect)
//! - Debounced outbound edits (500 ms quiet period, trailing value only)
//! - Save with a 5 second timeout and a direct-store fallback when offline
//! - Takeover handling when the session is superseded elsewhere
//!
//! Room membership never survives a transport reconnect: the controller
//! resets to `Disconnected` on transport loss and re-joins the stored target
//! document only when `connect()` is invoked again.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::debounce::Debouncer;
use crate::protocol::{
    ClientMessage, DocumentId, Editor, ProtocolError, ServerMessage, UserId,
};
use crate::store::DocumentStore;

/// Quiet period before an in-progress edit is sent to the room.
pub const DEBOUNCE_QUIET_PERIOD: Duration = Duration::from_millis(500);

/// How long a save waits for its response before failing.
pub const SAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    InRoom,
}

/// Events emitted by the sync controller for the embedding application.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// Transport established
    Connected,
    /// Transport lost; room membership is gone with it
    Disconnected,
    /// Join confirmed with the room's current editor set
    JoinedRoom { editors: Vec<Editor> },
    /// Presence update for the current room
    EditorsChanged(Vec<Editor>),
    /// Another member's in-progress edit (already applied locally)
    RemoteContent { content: String, user_id: UserId },
    /// The document was persisted by some room member
    ContentSaved {
        document_id: DocumentId,
        timestamp: u64,
    },
    /// A save initiated here failed; retry is up to the user
    SaveFailed { error: Option<String> },
    /// This session was superseded by a newer one; editing has stopped
    SessionTakenOver { message: String },
}

/// The client sync controller.
///
/// Manages a WebSocket connection to the collaboration server and the local
/// working copy of the document being edited.
pub struct ClientSyncController {
    user_id: UserId,
    display_name: Option<String>,
    server_url: String,

    /// Document to join on connect.
    target_document: Arc<RwLock<Option<DocumentId>>>,

    /// Fallback save path when the transport is down.
    store: Arc<dyn DocumentStore>,

    state: Arc<RwLock<ConnectionState>>,

    /// Local working copy; updated immediately on every local edit and
    /// overwritten unconditionally by remote content (last message wins).
    content: Arc<RwLock<String>>,

    /// Set on takeover; blocks all further outbound edits.
    halted: Arc<AtomicBool>,

    /// Bumped on every successful `connect()`. Reader tasks from older
    /// transports compare against it and must not touch shared state once
    /// a newer connection exists.
    generation: Arc<AtomicU64>,

    /// Single outstanding save slot (one in-flight save per connection).
    pending_save: Arc<Mutex<Option<oneshot::Sender<bool>>>>,

    outgoing_tx: Option<mpsc::UnboundedSender<ClientMessage>>,
    debouncer: Option<Debouncer<(DocumentId, String)>>,

    event_tx: mpsc::Sender<SyncEvent>,
    event_rx: Option<mpsc::Receiver<SyncEvent>>,
}

impl ClientSyncController {
    pub fn new(
        user_id: impl Into<UserId>,
        display_name: Option<String>,
        server_url: impl Into<String>,
        store: Arc<dyn DocumentStore>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            user_id: user_id.into(),
            display_name,
            server_url: server_url.into(),
            target_document: Arc::new(RwLock::new(None)),
            store,
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            content: Arc::new(RwLock::new(String::new())),
            halted: Arc::new(AtomicBool::new(false)),
            generation: Arc::new(AtomicU64::new(0)),
            pending_save: Arc::new(Mutex::new(None)),
            outgoing_tx: None,
            debouncer: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<SyncEvent>> {
        self.event_rx.take()
    }

    /// Set the document to edit. Joined on the next `connect()`.
    pub async fn set_target_document(&self, document_id: impl Into<DocumentId>) {
        *self.target_document.write().await = Some(document_id.into());
    }

    /// Open the transport and, if a target document is set, join its room.
    ///
    /// Spawns background tasks for reading and writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;
        self.halted.store(false, Ordering::SeqCst);

        let ws_stream = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok((stream, _)) => stream,
            Err(e) => {
                log::warn!("Connect to {} failed: {e}", self.server_url);
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };

        // This transport supersedes any earlier one; its reader task owns
        // the shared state only while the generation still matches.
        let my_gen = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing queue to the WebSocket.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ClientMessage>();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let Ok(text) = msg.encode() else { continue };
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });
        self.outgoing_tx = Some(out_tx.clone());

        // Debounced edit emission: only the final value of a burst is sent.
        let edit_tx = out_tx.clone();
        let edit_user = self.user_id.clone();
        let edit_halted = self.halted.clone();
        self.debouncer = Some(Debouncer::new(
            DEBOUNCE_QUIET_PERIOD,
            move |(document_id, content): (DocumentId, String)| {
                if edit_halted.load(Ordering::SeqCst) {
                    return;
                }
                let _ = edit_tx.send(ClientMessage::ContentUpdate {
                    document_id,
                    content,
                    user_id: edit_user.clone(),
                });
            },
        ));

        *self.state.write().await = ConnectionState::Connected;
        let _ = self.event_tx.send(SyncEvent::Connected).await;

        // Join the stored target document, if any.
        if let Some(document_id) = self.target_document.read().await.clone() {
            let _ = out_tx.send(ClientMessage::JoinRoom {
                document_id,
                user_id: Some(self.user_id.clone()),
                display_name: self.display_name.clone(),
            });
        }

        // Reader task: translate server messages into state + events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        let content = self.content.clone();
        let halted = self.halted.clone();
        let pending_save = self.pending_save.clone();
        let generation = self.generation.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let text = match msg {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => continue,
                };
                let server_msg = match ServerMessage::decode(&text) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("Undecodable server frame: {e}");
                        continue;
                    }
                };

                match server_msg {
                    ServerMessage::JoinRoomResponse { success, editors } => {
                        if success {
                            *state.write().await = ConnectionState::InRoom;
                            let _ = event_tx
                                .send(SyncEvent::JoinedRoom {
                                    editors: parse_editors(&editors),
                                })
                                .await;
                        }
                    }
                    ServerMessage::LeaveRoomResponse { success } => {
                        if success {
                            *state.write().await = ConnectionState::Connected;
                        }
                    }
                    ServerMessage::Editors(encoded) => {
                        let _ = event_tx
                            .send(SyncEvent::EditorsChanged(parse_editors(&encoded)))
                            .await;
                    }
                    ServerMessage::ContentUpdated {
                        content: remote,
                        user_id,
                    } => {
                        // Last message wins; no merge, no conflict detection.
                        *content.write().await = remote.clone();
                        let _ = event_tx
                            .send(SyncEvent::RemoteContent {
                                content: remote,
                                user_id,
                            })
                            .await;
                    }
                    ServerMessage::ContentSaved {
                        document_id,
                        timestamp,
                    } => {
                        let _ = event_tx
                            .send(SyncEvent::ContentSaved {
                                document_id,
                                timestamp,
                            })
                            .await;
                    }
                    ServerMessage::SaveContentResponse { success, error } => {
                        if let Some(responder) = pending_save.lock().await.take() {
                            let _ = responder.send(success);
                        }
                        if !success {
                            let _ = event_tx.send(SyncEvent::SaveFailed { error }).await;
                        }
                    }
                    ServerMessage::DuplicateConnection { message } => {
                        // A takeover notice for a superseded transport is
                        // moot once this client has already reconnected.
                        if generation.load(Ordering::SeqCst) != my_gen {
                            continue;
                        }
                        halted.store(true, Ordering::SeqCst);
                        let _ = event_tx
                            .send(SyncEvent::SessionTakenOver { message })
                            .await;
                    }
                }
            }

            // A stale reader outliving its transport must not clobber the
            // state of a newer connection.
            if generation.load(Ordering::SeqCst) != my_gen {
                return;
            }

            // Transport lost: room membership does not survive. A pending
            // save resolves to false so its caller never hangs.
            *state.write().await = ConnectionState::Disconnected;
            if let Some(responder) = pending_save.lock().await.take() {
                let _ = responder.send(false);
            }
            let _ = event_tx.send(SyncEvent::Disconnected).await;
        });

        Ok(())
    }

    /// Record a local edit.
    ///
    /// The local working copy reflects the edit immediately; the outbound
    /// `content-update` is debounced so only the final value of a burst is
    /// sent to the room.
    pub async fn update_content(&self, text: impl Into<String>) {
        let text = text.into();
        *self.content.write().await = text.clone();

        if self.halted.load(Ordering::SeqCst) {
            return;
        }
        let Some(document_id) = self.target_document.read().await.clone() else {
            return;
        };
        if let Some(debouncer) = &self.debouncer {
            debouncer.submit((document_id, text));
        }
    }

    /// Persist the current content.
    ///
    /// Connected: emits `save-content` and resolves from the matching
    /// response, or `false` after [`SAVE_TIMEOUT`]. Only one save may be in
    /// flight at a time; a second concurrent call returns `false`.
    /// Disconnected: falls back to a direct document-store update and never
    /// emits a socket message.
    pub async fn save(&self) -> bool {
        let Some(document_id) = self.target_document.read().await.clone() else {
            return false;
        };
        let content = self.content.read().await.clone();

        let connected = matches!(
            *self.state.read().await,
            ConnectionState::Connected | ConnectionState::InRoom
        );
        if !connected {
            return self.store.save(&document_id, &content).await.is_ok();
        }

        let receiver = {
            let mut slot = self.pending_save.lock().await;
            if slot.is_some() {
                log::warn!("save() called with a save already in flight");
                return false;
            }
            let (responder, receiver) = oneshot::channel();
            *slot = Some(responder);
            receiver
        };

        let sent = self
            .outgoing_tx
            .as_ref()
            .map(|tx| {
                tx.send(ClientMessage::SaveContent {
                    document_id,
                    content,
                })
                .is_ok()
            })
            .unwrap_or(false);
        if !sent {
            self.pending_save.lock().await.take();
            return false;
        }

        match tokio::time::timeout(SAVE_TIMEOUT, receiver).await {
            Ok(Ok(success)) => success,
            // Responder dropped without an answer (disconnect cleanup).
            Ok(Err(_)) => false,
            // Timeout is terminal for this attempt; clear the slot so a
            // retry can proceed.
            Err(_) => {
                self.pending_save.lock().await.take();
                let _ = self
                    .event_tx
                    .send(SyncEvent::SaveFailed { error: None })
                    .await;
                false
            }
        }
    }

    /// Leave the current room explicitly.
    pub async fn leave_room(&self) {
        let Some(document_id) = self.target_document.read().await.clone() else {
            return;
        };
        if let Some(tx) = &self.outgoing_tx {
            let _ = tx.send(ClientMessage::LeaveRoom {
                document_id,
                user_id: self.user_id.clone(),
            });
        }
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Current local working copy of the document.
    pub async fn local_content(&self) -> String {
        self.content.read().await.clone()
    }

    /// Whether editing has been halted by a session takeover.
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

fn parse_editors(encoded: &[String]) -> Vec<Editor> {
    encoded
        .iter()
        .filter_map(|s| match Editor::parse(s) {
            Ok(editor) => Some(editor),
            Err(e) => {
                log::warn!("Skipping malformed editor entry: {e}");
                None
            }
        })
        .collect()
}
