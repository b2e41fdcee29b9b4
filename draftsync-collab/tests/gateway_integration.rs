//! Integration tests for the server-side protocol over real WebSockets.
//!
//! These tests start a real server and drive it with raw WebSocket clients
//! speaking the JSON wire protocol, verifying room membership, content relay,
//! save coordination, and single-session enforcement end to end.

use std::sync::Arc;

use draftsync_collab::protocol::{ClientMessage, ServerMessage};
use draftsync_collab::server::{CollabServer, ServerConfig};
use draftsync_collab::store::{DocumentStore, MemoryStore};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::time::{timeout, Duration};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// Find a free port for testing.
async fn free_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Start a server on a free port, return the port and its store.
async fn start_test_server() -> (u16, Arc<MemoryStore>) {
    let port = free_port().await;
    let store = Arc::new(MemoryStore::new());
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_editors_per_room: 100,
        heartbeat_interval_secs: 30,
    };
    let server = CollabServer::new(config, store.clone());
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    // Give server time to bind
    tokio::time::sleep(Duration::from_millis(50)).await;
    (port, store)
}

/// A raw protocol client: one WebSocket connection speaking JSON events.
struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    async fn connect(port: u16) -> Self {
        let url = format!("ws://127.0.0.1:{port}");
        let (ws, _) = tokio_tungstenite::connect_async(&url)
            .await
            .expect("connect to test server");
        Self { ws }
    }

    async fn send(&mut self, msg: ClientMessage) {
        let text = msg.encode().unwrap();
        self.ws.send(Message::Text(text.into())).await.unwrap();
    }

    /// Receive the next protocol message, skipping transport frames.
    async fn recv(&mut self) -> ServerMessage {
        self.recv_within(Duration::from_secs(2))
            .await
            .expect("server message within timeout")
    }

    async fn recv_within(&mut self, dur: Duration) -> Option<ServerMessage> {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let frame = timeout(remaining, self.ws.next()).await.ok()??;
            match frame {
                Ok(Message::Text(text)) => {
                    return Some(ServerMessage::decode(&text).expect("decodable frame"));
                }
                Ok(Message::Close(_)) | Err(_) => return None,
                _ => continue,
            }
        }
    }

    /// True once the server closes this connection.
    async fn closed_within(&mut self, dur: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + dur;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match timeout(remaining, self.ws.next()).await {
                Ok(None) | Ok(Some(Ok(Message::Close(_)))) | Ok(Some(Err(_))) => return true,
                Ok(Some(Ok(_))) => continue,
                Err(_) => return false,
            }
        }
    }

    async fn join(&mut self, document_id: &str, user_id: &str) {
        self.send(ClientMessage::JoinRoom {
            document_id: document_id.into(),
            user_id: Some(user_id.into()),
            display_name: None,
        })
        .await;
    }
}

#[tokio::test]
async fn test_join_room_response_lists_joiner() {
    let (port, _store) = start_test_server().await;
    let mut alice = TestClient::connect(port).await;
    alice.join("doc-1", "alice").await;

    // The presence broadcast precedes the direct response.
    match alice.recv().await {
        ServerMessage::Editors(list) => {
            assert_eq!(list.len(), 1);
            assert!(list[0].starts_with("alice:"));
        }
        other => panic!("Expected editors broadcast, got {other:?}"),
    }
    match alice.recv().await {
        ServerMessage::JoinRoomResponse { success, editors } => {
            assert!(success);
            assert_eq!(editors.len(), 1);
        }
        other => panic!("Expected join-room-response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_second_joiner_updates_first() {
    let (port, _store) = start_test_server().await;

    let mut alice = TestClient::connect(port).await;
    alice.join("doc-1", "alice").await;
    let _ = alice.recv().await; // editors
    let _ = alice.recv().await; // join response

    let mut bob = TestClient::connect(port).await;
    bob.join("doc-1", "bob").await;
    match bob.recv().await {
        ServerMessage::Editors(list) => assert_eq!(list.len(), 2),
        other => panic!("Expected editors broadcast, got {other:?}"),
    }

    // Alice sees the grown editor set.
    match alice.recv().await {
        ServerMessage::Editors(list) => {
            assert_eq!(list.len(), 2);
            assert!(list.iter().any(|e| e.starts_with("alice:")));
            assert!(list.iter().any(|e| e.starts_with("bob:")));
        }
        other => panic!("Expected editors broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn test_content_update_relays_without_echo() {
    let (port, _store) = start_test_server().await;

    let mut alice = TestClient::connect(port).await;
    alice.join("doc-1", "alice").await;
    let _ = alice.recv().await;
    let _ = alice.recv().await;

    let mut bob = TestClient::connect(port).await;
    bob.join("doc-1", "bob").await;
    let _ = bob.recv().await;
    let _ = bob.recv().await;
    let _ = alice.recv().await; // editors after bob joined

    alice
        .send(ClientMessage::ContentUpdate {
            document_id: "doc-1".into(),
            content: "hello from alice".into(),
            user_id: "alice".into(),
        })
        .await;

    match bob.recv().await {
        ServerMessage::ContentUpdated { content, user_id } => {
            assert_eq!(content, "hello from alice");
            assert_eq!(user_id, "alice");
        }
        other => panic!("Expected content-updated, got {other:?}"),
    }

    // No echo back to the author.
    assert!(alice.recv_within(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn test_cross_room_isolation() {
    let (port, _store) = start_test_server().await;

    let mut alice = TestClient::connect(port).await;
    alice.join("doc-1", "alice").await;
    let _ = alice.recv().await;
    let _ = alice.recv().await;

    let mut carol = TestClient::connect(port).await;
    carol.join("doc-2", "carol").await;
    let _ = carol.recv().await;
    let _ = carol.recv().await;

    alice
        .send(ClientMessage::ContentUpdate {
            document_id: "doc-1".into(),
            content: "only for doc-1".into(),
            user_id: "alice".into(),
        })
        .await;

    assert!(
        carol.recv_within(Duration::from_millis(200)).await.is_none(),
        "doc-2 member must not see doc-1 traffic"
    );
}

#[tokio::test]
async fn test_save_persists_and_broadcasts() {
    let (port, store) = start_test_server().await;

    let mut alice = TestClient::connect(port).await;
    alice.join("doc-1", "alice").await;
    let _ = alice.recv().await;
    let _ = alice.recv().await;

    let mut bob = TestClient::connect(port).await;
    bob.join("doc-1", "bob").await;
    let _ = bob.recv().await;
    let _ = bob.recv().await;
    let _ = alice.recv().await;

    alice
        .send(ClientMessage::SaveContent {
            document_id: "doc-1".into(),
            content: "final draft".into(),
        })
        .await;

    // Requester gets the broadcast and the direct response, in that order.
    match alice.recv().await {
        ServerMessage::ContentSaved {
            document_id,
            timestamp,
        } => {
            assert_eq!(document_id, "doc-1");
            assert!(timestamp > 0);
        }
        other => panic!("Expected content-saved, got {other:?}"),
    }
    match alice.recv().await {
        ServerMessage::SaveContentResponse { success, error } => {
            assert!(success);
            assert!(error.is_none());
        }
        other => panic!("Expected save-content-response, got {other:?}"),
    }

    // Every other room member gets the broadcast too.
    match bob.recv().await {
        ServerMessage::ContentSaved { document_id, .. } => assert_eq!(document_id, "doc-1"),
        other => panic!("Expected content-saved, got {other:?}"),
    }

    assert_eq!(store.load("doc-1").await.unwrap(), "final draft");
}

#[tokio::test]
async fn test_leave_room_notifies_remaining() {
    let (port, _store) = start_test_server().await;

    let mut alice = TestClient::connect(port).await;
    alice.join("doc-1", "alice").await;
    let _ = alice.recv().await;
    let _ = alice.recv().await;

    let mut bob = TestClient::connect(port).await;
    bob.join("doc-1", "bob").await;
    let _ = bob.recv().await;
    let _ = bob.recv().await;
    let _ = alice.recv().await;

    bob.send(ClientMessage::LeaveRoom {
        document_id: "doc-1".into(),
        user_id: "bob".into(),
    })
    .await;

    match bob.recv().await {
        ServerMessage::LeaveRoomResponse { success } => assert!(success),
        other => panic!("Expected leave-room-response, got {other:?}"),
    }

    match alice.recv().await {
        ServerMessage::Editors(list) => {
            assert_eq!(list.len(), 1);
            assert!(list[0].starts_with("alice:"));
        }
        other => panic!("Expected editors broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn test_disconnect_notifies_remaining() {
    let (port, _store) = start_test_server().await;

    let mut alice = TestClient::connect(port).await;
    alice.join("doc-1", "alice").await;
    let _ = alice.recv().await;
    let _ = alice.recv().await;

    let mut bob = TestClient::connect(port).await;
    bob.join("doc-1", "bob").await;
    let _ = bob.recv().await;
    let _ = bob.recv().await;
    let _ = alice.recv().await;

    drop(bob);

    match alice.recv().await {
        ServerMessage::Editors(list) => {
            assert_eq!(list.len(), 1);
            assert!(list[0].starts_with("alice:"));
        }
        other => panic!("Expected editors broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn test_duplicate_connection_evicts_older_session() {
    let (port, _store) = start_test_server().await;

    let mut first = TestClient::connect(port).await;
    first.join("doc-1", "alice").await;
    let _ = first.recv().await;
    let _ = first.recv().await;

    let mut second = TestClient::connect(port).await;
    second.join("doc-1", "alice").await;

    // The superseded session gets the notice before its transport closes.
    match first.recv().await {
        ServerMessage::DuplicateConnection { message } => {
            assert!(!message.is_empty());
        }
        other => panic!("Expected duplicate-connection, got {other:?}"),
    }
    assert!(
        first.closed_within(Duration::from_secs(2)).await,
        "evicted transport should close"
    );

    // The newer session joins normally and is the room's only member.
    match second.recv().await {
        ServerMessage::Editors(list) => assert_eq!(list.len(), 1),
        other => panic!("Expected editors broadcast, got {other:?}"),
    }
    match second.recv().await {
        ServerMessage::JoinRoomResponse { success, .. } => assert!(success),
        other => panic!("Expected join-room-response, got {other:?}"),
    }
}

#[tokio::test]
async fn test_same_user_different_rooms_coexist() {
    let (port, _store) = start_test_server().await;

    let mut first = TestClient::connect(port).await;
    first.join("doc-1", "alice").await;
    let _ = first.recv().await;
    let _ = first.recv().await;

    // Same user, different document: no eviction.
    let mut second = TestClient::connect(port).await;
    second.join("doc-2", "alice").await;
    match second.recv().await {
        ServerMessage::Editors(list) => assert_eq!(list.len(), 1),
        other => panic!("Expected editors broadcast, got {other:?}"),
    }

    assert!(
        first.recv_within(Duration::from_millis(200)).await.is_none(),
        "no eviction across rooms"
    );
}

#[tokio::test]
async fn test_anonymous_join_gets_pseudo_identity() {
    let (port, _store) = start_test_server().await;

    let mut guest = TestClient::connect(port).await;
    guest
        .send(ClientMessage::JoinRoom {
            document_id: "doc-1".into(),
            user_id: None,
            display_name: None,
        })
        .await;

    match guest.recv().await {
        ServerMessage::Editors(list) => {
            assert_eq!(list.len(), 1);
            assert!(list[0].starts_with("anonymous-"));
        }
        other => panic!("Expected editors broadcast, got {other:?}"),
    }
}

#[tokio::test]
async fn test_save_failure_reported_to_requester_only() {
    // Store that refuses every write.
    struct RefusingStore;

    #[async_trait::async_trait]
    impl DocumentStore for RefusingStore {
        async fn load(&self, document_id: &str) -> Result<String, draftsync_collab::StoreError> {
            Err(draftsync_collab::StoreError::NotFound(document_id.to_string()))
        }
        async fn save(
            &self,
            _document_id: &str,
            _content: &str,
        ) -> Result<(), draftsync_collab::StoreError> {
            Err(draftsync_collab::StoreError::Unavailable("read-only".into()))
        }
    }

    let port = free_port().await;
    let config = ServerConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        max_editors_per_room: 100,
        heartbeat_interval_secs: 30,
    };
    let server = CollabServer::new(config, Arc::new(RefusingStore));
    tokio::spawn(async move {
        server.run().await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut alice = TestClient::connect(port).await;
    alice.join("doc-1", "alice").await;
    let _ = alice.recv().await;
    let _ = alice.recv().await;

    let mut bob = TestClient::connect(port).await;
    bob.join("doc-1", "bob").await;
    let _ = bob.recv().await;
    let _ = bob.recv().await;
    let _ = alice.recv().await;

    alice
        .send(ClientMessage::SaveContent {
            document_id: "doc-1".into(),
            content: "doomed".into(),
        })
        .await;

    match alice.recv().await {
        ServerMessage::SaveContentResponse { success, error } => {
            assert!(!success);
            assert!(error.is_some());
        }
        other => panic!("Expected save-content-response, got {other:?}"),
    }

    // No content-saved broadcast on failure.
    assert!(bob.recv_within(Duration::from_millis(200)).await.is_none());
}
