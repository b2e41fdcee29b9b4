//! Document store seam.
//!
//! Persistence is owned by an external collaborator; the collaboration layer
//! only ever calls `load` and `save`. The in-memory implementation backs
//! tests, demos, and the client's direct-save fallback path.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::protocol::DocumentId;

/// Errors surfaced by a document store.
#[derive(Debug, Clone)]
pub enum StoreError {
    NotFound(DocumentId),
    Unavailable(String),
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "Document not found: {id}"),
            Self::Unavailable(e) => write!(f, "Store unavailable: {e}"),
        }
    }
}

impl std::error::Error for StoreError {}

/// The external document store, seen through the collaboration layer's eyes.
///
/// Content is mutated only via explicit `save` calls, never via
/// content-update broadcasts.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, document_id: &str) -> Result<String, StoreError>;
    async fn save(&self, document_id: &str, content: &str) -> Result<(), StoreError>;
}

/// In-memory store for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct MemoryStore {
    documents: RwLock<HashMap<DocumentId, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a document, bypassing the save path.
    pub async fn insert(&self, document_id: impl Into<DocumentId>, content: impl Into<String>) {
        self.documents
            .write()
            .await
            .insert(document_id.into(), content.into());
    }

    pub async fn len(&self) -> usize {
        self.documents.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.documents.read().await.is_empty()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn load(&self, document_id: &str) -> Result<String, StoreError> {
        self.documents
            .read()
            .await
            .get(document_id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(document_id.to_string()))
    }

    async fn save(&self, document_id: &str, content: &str) -> Result<(), StoreError> {
        self.documents
            .write()
            .await
            .insert(document_id.to_string(), content.to_string());
        Ok(())
    }
}
