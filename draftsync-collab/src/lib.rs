//! # draftsync-collab — Real-time collaborative editing for drafts
//!
//! Provides WebSocket-based multi-editor document rooms with live content
//! relay, presence tracking, and coordinated persistence.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐    WebSocket     ┌──────────────────────┐
//! │ ClientSyncController │ ◄──────────────► │     CollabServer     │
//! │ (per editor session) │   JSON events    │   (accept + frames)  │
//! └──────────┬───────────┘                  └──────────┬───────────┘
//!            │                                         │
//!            ▼                                         ▼
//! ┌──────────────────────┐                  ┌──────────────────────┐
//! │ Debouncer (500 ms)   │                  │ CollaborationGateway │
//! │ trailing-edge edits  │                  │ (protocol semantics) │
//! └──────────────────────┘                  └──────────┬───────────┘
//!                                                      │
//!                                      ┌───────────────┼───────────────┐
//!                                      ▼               ▼               ▼
//!                              ┌──────────────┐ ┌──────────────┐ ┌───────────┐
//!                              │SessionRegistry│ │RoomPresence  │ │ Document  │
//!                              │(conns, users)│ │Tracker (rooms)│ │ Store     │
//!                              └──────────────┘ └──────────────┘ └───────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — JSON wire protocol (tagged client/server events)
//! - [`session`] — Connection and user bookkeeping, duplicate eviction
//! - [`presence`] — Per-document editor sets with reverse membership index
//! - [`gateway`] — Protocol handler tying sessions, presence, and storage
//! - [`server`] — WebSocket front end (accept loop, frame pump, heartbeat)
//! - [`client`] — Client controller with debounced edits and save timeout
//! - [`debounce`] — Trailing-edge debounce primitive
//! - [`store`] — Document persistence trait and in-memory implementation

pub mod protocol;
pub mod session;
pub mod presence;
pub mod gateway;
pub mod server;
pub mod client;
pub mod debounce;
pub mod store;

// Re-exports for convenience
pub use protocol::{
    ClientMessage, ConnectionId, DocumentId, Editor, ProtocolError, ServerMessage,
    UserId,
};
pub use session::{Connection, SessionRegistry, TransportState};
pub use presence::RoomPresenceTracker;
pub use gateway::CollaborationGateway;
pub use server::{CollabServer, ServerConfig, ServerStats};
pub use client::{
    ClientSyncController, ConnectionState, SyncEvent, DEBOUNCE_QUIET_PERIOD,
    SAVE_TIMEOUT,
};
pub use debounce::Debouncer;
pub use store::{DocumentStore, MemoryStore, StoreError};
