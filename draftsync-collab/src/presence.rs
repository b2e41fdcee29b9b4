//! Per-document editor sets and presence snapshots.
//!
//! Each room holds its editors in an associative map keyed by
//! `(user_id, connection_id)`, so lookup and removal are O(1) rather than a
//! scan over all editors. A reverse index from connection id to the rooms it
//! occupies keeps disconnect cleanup proportional to the rooms that
//! connection is actually in, not to the total editor population.
//!
//! Rooms are created lazily on first join and garbage-collected as soon as
//! their editor set becomes empty.

use std::collections::{HashMap, HashSet};

use crate::protocol::{ConnectionId, DocumentId, Editor, UserId};

/// Composite room key for an editor entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EditorKey {
    pub user_id: UserId,
    pub connection_id: ConnectionId,
}

#[derive(Debug, Default)]
struct Room {
    editors: HashMap<EditorKey, Editor>,
}

impl Room {
    /// Snapshot for broadcast, in a stable order so presence payloads are
    /// deterministic across identical states.
    fn snapshot(&self) -> Vec<Editor> {
        let mut editors: Vec<Editor> = self.editors.values().cloned().collect();
        editors.sort_by(|a, b| {
            (a.user_id.as_str(), a.connection_id).cmp(&(b.user_id.as_str(), b.connection_id))
        });
        editors
    }
}

/// Maintains the editor set per room and computes presence snapshots.
#[derive(Debug, Default)]
pub struct RoomPresenceTracker {
    rooms: HashMap<DocumentId, Room>,
    /// Reverse index: connection id → rooms it currently occupies.
    memberships: HashMap<ConnectionId, HashSet<DocumentId>>,
}

impl RoomPresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or overwrite) the editor keyed by `(user_id, connection_id)`,
    /// lazily creating the room. Returns the full current editor list for
    /// broadcast. On a duplicate key the last write wins for `display_name`.
    pub fn join(
        &mut self,
        document_id: &str,
        user_id: impl Into<UserId>,
        connection_id: ConnectionId,
        display_name: Option<String>,
    ) -> Vec<Editor> {
        let user_id = user_id.into();
        let room = self.rooms.entry(document_id.to_string()).or_default();
        room.editors.insert(
            EditorKey {
                user_id: user_id.clone(),
                connection_id,
            },
            Editor::new(user_id, connection_id, display_name),
        );
        self.memberships
            .entry(connection_id)
            .or_default()
            .insert(document_id.to_string());
        room.snapshot()
    }

    /// Remove the matching editor. Returns `None` when the room became empty
    /// and was deleted (no broadcast needed — no listeners remain), otherwise
    /// the remaining editor list. Removing from an unknown room or with an
    /// unknown key is a no-op returning `None`.
    pub fn leave(
        &mut self,
        document_id: &str,
        user_id: &str,
        connection_id: ConnectionId,
    ) -> Option<Vec<Editor>> {
        let room = self.rooms.get_mut(document_id)?;
        let key = EditorKey {
            user_id: user_id.to_string(),
            connection_id,
        };
        if room.editors.remove(&key).is_none() {
            return None;
        }

        // Capture everything needed from the room before touching any other
        // part of self.
        let still_present = room
            .editors
            .keys()
            .any(|k| k.connection_id == connection_id);
        let remaining = if room.editors.is_empty() {
            None
        } else {
            Some(room.snapshot())
        };

        // Drop the reverse-index entry unless the connection still has
        // another editor identity in this room.
        if !still_present {
            self.forget_membership(&connection_id, document_id);
        }
        if remaining.is_none() {
            self.rooms.remove(document_id);
        }
        remaining
    }

    /// Remove the connection from every room it occupies. Used on disconnect.
    /// Returns one entry per affected room with the broadcast payload, or
    /// `None` where the room emptied out.
    pub fn leave_all_rooms(
        &mut self,
        connection_id: ConnectionId,
    ) -> Vec<(DocumentId, Option<Vec<Editor>>)> {
        let docs = match self.memberships.remove(&connection_id) {
            Some(docs) => docs,
            None => return Vec::new(),
        };

        let mut affected = Vec::with_capacity(docs.len());
        for doc in docs {
            let Some(room) = self.rooms.get_mut(&doc) else {
                continue;
            };
            room.editors.retain(|k, _| k.connection_id != connection_id);
            if room.editors.is_empty() {
                self.rooms.remove(&doc);
                affected.push((doc, None));
            } else {
                let snapshot = self.rooms[&doc].snapshot();
                affected.push((doc, Some(snapshot)));
            }
        }
        affected
    }

    /// Whether the connection holds any editor entry in the room.
    pub fn is_member(&self, document_id: &str, connection_id: ConnectionId) -> bool {
        self.memberships
            .get(&connection_id)
            .is_some_and(|docs| docs.contains(document_id))
    }

    /// Whether the room holds an editor entry for exactly this
    /// `(user_id, connection_id)` identity. Stricter than [`is_member`],
    /// which matches any identity of the connection.
    ///
    /// [`is_member`]: Self::is_member
    pub fn contains(&self, document_id: &str, user_id: &str, connection_id: ConnectionId) -> bool {
        self.rooms.get(document_id).is_some_and(|room| {
            room.editors.contains_key(&EditorKey {
                user_id: user_id.to_string(),
                connection_id,
            })
        })
    }

    /// Current editor list for a room, if it exists.
    pub fn editors(&self, document_id: &str) -> Option<Vec<Editor>> {
        self.rooms.get(document_id).map(Room::snapshot)
    }

    pub fn editor_count(&self, document_id: &str) -> usize {
        self.rooms
            .get(document_id)
            .map_or(0, |room| room.editors.len())
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    fn forget_membership(&mut self, connection_id: &ConnectionId, document_id: &str) {
        if let Some(docs) = self.memberships.get_mut(connection_id) {
            docs.remove(document_id);
            if docs.is_empty() {
                self.memberships.remove(connection_id);
            }
        }
    }
}
