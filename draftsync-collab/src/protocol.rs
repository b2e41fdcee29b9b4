//! JSON wire protocol for collaborative post editing.
//!
//! Wire format (serde_json-encoded, one logical message per text frame):
//! ```text
//! {"event": "join-room", "data": {"documentId": "...", "userId": "...", ...}}
//! ```
//!
//! Editor identities on the wire are composite-encoded as
//! `userId:connectionId[:displayName]` — parsers split on `:` with at most
//! three parts and treat a missing third segment as "no display name".

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Identifier of a document (post) being edited.
pub type DocumentId = String;

/// Stable identifier of a logical user.
pub type UserId = String;

/// Opaque transport-session identifier, unique per connection.
pub type ConnectionId = Uuid;

/// Pseudo-id prefix for unauthenticated sessions.
pub const ANONYMOUS_PREFIX: &str = "anonymous-";

/// Generate the pseudo-id for an unauthenticated connection.
///
/// Anonymous ids are unique per connection by construction, so they are
/// exempt from duplicate-connection eviction.
pub fn anonymous_user_id(connection_id: &ConnectionId) -> UserId {
    format!("{ANONYMOUS_PREFIX}{connection_id}")
}

/// Whether a user id is an anonymous pseudo-id.
pub fn is_anonymous(user_id: &str) -> bool {
    user_id.starts_with(ANONYMOUS_PREFIX)
}

/// A participant entry in a room, keyed by `(user_id, connection_id)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Editor {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
    pub display_name: Option<String>,
}

impl Editor {
    pub fn new(
        user_id: impl Into<UserId>,
        connection_id: ConnectionId,
        display_name: Option<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            connection_id,
            display_name,
        }
    }

    /// Composite wire encoding: `userId:connectionId[:displayName]`.
    ///
    /// User ids must not contain `:`; display names may (the third segment
    /// is the unsplit remainder on the parse side).
    pub fn encode(&self) -> String {
        match &self.display_name {
            Some(name) => format!("{}:{}:{}", self.user_id, self.connection_id, name),
            None => format!("{}:{}", self.user_id, self.connection_id),
        }
    }

    /// Parse the composite wire encoding.
    pub fn parse(encoded: &str) -> Result<Self, ProtocolError> {
        let mut parts = encoded.splitn(3, ':');
        let user_id = parts
            .next()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ProtocolError::MalformedEditorId(encoded.to_string()))?;
        let connection_id = parts
            .next()
            .and_then(|s| Uuid::parse_str(s).ok())
            .ok_or_else(|| ProtocolError::MalformedEditorId(encoded.to_string()))?;
        let display_name = parts.next().map(str::to_string);
        Ok(Self {
            user_id: user_id.to_string(),
            connection_id,
            display_name,
        })
    }
}

/// Messages sent client → server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientMessage {
    /// Join a document room. A missing `user_id` means the session is
    /// unauthenticated and gets an `anonymous-<connectionId>` pseudo-id.
    JoinRoom {
        document_id: DocumentId,
        user_id: Option<UserId>,
        display_name: Option<String>,
    },
    /// Leave the current room explicitly.
    LeaveRoom {
        document_id: DocumentId,
        user_id: UserId,
    },
    /// In-progress edit, relayed to other room members without persistence.
    ContentUpdate {
        document_id: DocumentId,
        content: String,
        user_id: UserId,
    },
    /// Persist the document via the Document store.
    SaveContent {
        document_id: DocumentId,
        content: String,
    },
}

/// Messages sent server → client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerMessage {
    JoinRoomResponse {
        success: bool,
        editors: Vec<String>,
    },
    LeaveRoomResponse {
        success: bool,
    },
    SaveContentResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Presence update: the room's full editor set, composite-encoded.
    Editors(Vec<String>),
    /// Relayed edit from another room member.
    ContentUpdated {
        content: String,
        user_id: UserId,
    },
    /// Broadcast after a successful save.
    ContentSaved {
        document_id: DocumentId,
        timestamp: u64,
    },
    /// This session was superseded by a newer connection of the same user.
    /// The client must stop editing; the server closes the transport after
    /// the notice has been queued.
    DuplicateConnection {
        message: String,
    },
}

impl ClientMessage {
    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

impl ServerMessage {
    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Deserialization(e.to_string()))
    }
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
    MalformedEditorId(String),
    ConnectionClosed,
    Timeout,
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
            Self::MalformedEditorId(s) => write!(f, "Malformed editor id: {s}"),
            Self::ConnectionClosed => write!(f, "Connection closed"),
            Self::Timeout => write!(f, "Connection timeout"),
        }
    }
}

impl std::error::Error for ProtocolError {}
