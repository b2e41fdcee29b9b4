//! Per-user connection bookkeeping, independent of room membership.
//!
//! The registry owns `Connection` records for their whole lifetime: created
//! on transport connect, destroyed on transport disconnect. It also maps each
//! logical user to the set of connections currently attributed to them, which
//! is what duplicate-connection eviction is computed from.
//!
//! The registry never performs messaging or transport side effects itself —
//! the gateway sends the `duplicate-connection` notice, removes evicted
//! connections from their room, and closes the transport after the notice
//! has been queued.

use std::collections::{HashMap, HashSet};

use crate::protocol::{is_anonymous, ConnectionId, UserId};

/// Transport lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Open,
    Closing,
    Closed,
}

/// A live transport session tracked by the registry.
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: ConnectionId,
    pub transport_state: TransportState,
}

/// Tracks which connections belong to which logical user.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    connections: HashMap<ConnectionId, Connection>,
    users: HashMap<UserId, HashSet<ConnectionId>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a Connection record in `Open` state.
    pub fn register_connection(&mut self, connection_id: ConnectionId) {
        self.connections.insert(
            connection_id,
            Connection {
                id: connection_id,
                transport_state: TransportState::Open,
            },
        );
    }

    /// Add `connection_id` to `user_id`'s connection set. Idempotent.
    pub fn attribute_to_user(&mut self, user_id: impl Into<UserId>, connection_id: ConnectionId) {
        self.users
            .entry(user_id.into())
            .or_default()
            .insert(connection_id);
    }

    /// Compute the eviction candidates for a fresh join: every connection of
    /// `user_id` other than `keep`. Anonymous pseudo-ids are never evicted
    /// since each anonymous session is already distinct.
    ///
    /// The caller filters candidates by room membership and performs the
    /// notice/removal/close sequence.
    pub fn evict_other_connections(
        &self,
        user_id: &str,
        keep: ConnectionId,
    ) -> Vec<ConnectionId> {
        if is_anonymous(user_id) {
            return Vec::new();
        }
        self.users
            .get(user_id)
            .map(|conns| conns.iter().copied().filter(|c| *c != keep).collect())
            .unwrap_or_default()
    }

    /// Mark a connection's transport state (e.g. `Closing` once an eviction
    /// notice has been queued).
    pub fn set_transport_state(&mut self, connection_id: &ConnectionId, state: TransportState) {
        if let Some(conn) = self.connections.get_mut(connection_id) {
            conn.transport_state = state;
        }
    }

    /// Delete the Connection and unattribute it from every user; user entries
    /// whose set becomes empty are removed. Called on disconnect.
    pub fn remove_connection(&mut self, connection_id: &ConnectionId) -> Option<Connection> {
        let removed = self.connections.remove(connection_id);
        if removed.is_some() {
            self.users.retain(|_, conns| {
                conns.remove(connection_id);
                !conns.is_empty()
            });
        }
        removed
    }

    pub fn connection(&self, connection_id: &ConnectionId) -> Option<&Connection> {
        self.connections.get(connection_id)
    }

    pub fn is_registered(&self, connection_id: &ConnectionId) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn connections_for_user(&self, user_id: &str) -> Vec<ConnectionId> {
        self.users
            .get(user_id)
            .map(|conns| conns.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn user_count(&self) -> usize {
        self.users.len()
    }
}
