//! Snapshot consumer for the document store.
//!
//! Clients periodically publish the full document state as a
//! `yjs_snapshot` event. The document service persists it:
//!
//! ```text
//! <ns>.documents.*.snapshots ──► SnapshotConsumer
//!                                  ├─ document_id       ─► Uuid
//!                                  ├─ content | payload ─► base64 decode
//!                                  └─ DocumentStore::update_content
//! ```
//!
//! Publishers other than the hub put the state in `content`; the hub
//! relays client snapshots with the state in `payload`. `content` wins
//! when both are set. A snapshot with neither is rejected rather than
//! written as an empty document.
//!
//! Nothing is retried. A document that no longer exists is not an error.

use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use bytes::Bytes;
use serde::Deserialize;
use uuid::Uuid;

use crate::bridge::MessageHandler;
use crate::protocol::Event;

/// Errors a document store may report.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("document {0} not found")]
    NotFound(Uuid),
    #[error("store backend error: {0}")]
    Backend(String),
}

/// Persistence side of the document service.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Replace the stored content of `document_id`.
    async fn update_content(&self, document_id: Uuid, content: Vec<u8>) -> Result<(), StoreError>;
}

/// Why a snapshot was not stored.
#[derive(Debug, thiserror::Error)]
pub enum SnapshotError {
    #[error("malformed snapshot message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("invalid document id {id:?}: {source}")]
    InvalidDocumentId {
        id: String,
        #[source]
        source: uuid::Error,
    },
    #[error("snapshot for document {0} carries no content")]
    EmptyContent(Uuid),
    #[error("invalid snapshot content: {0}")]
    InvalidContent(#[from] base64::DecodeError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Snapshot message as read from the broker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SnapshotMessage {
    #[serde(default)]
    pub document_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub payload: String,
}

impl SnapshotMessage {
    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Base64 document state: `content` if set, `payload` otherwise.
    pub fn encoded_content(&self) -> &str {
        if self.content.is_empty() {
            &self.payload
        } else {
            &self.content
        }
    }
}

impl From<&Event> for SnapshotMessage {
    fn from(event: &Event) -> Self {
        Self {
            document_id: event.document_id.clone(),
            content: String::new(),
            payload: event.payload.clone(),
        }
    }
}

pub struct SnapshotConsumer {
    store: Arc<dyn DocumentStore>,
}

impl SnapshotConsumer {
    pub fn new(store: Arc<dyn DocumentStore>) -> Self {
        Self { store }
    }

    /// Validate a snapshot and write it to the store.
    pub async fn apply(&self, message: &SnapshotMessage) -> Result<Uuid, SnapshotError> {
        let document_id = Uuid::parse_str(message.document_id.trim()).map_err(|source| {
            SnapshotError::InvalidDocumentId {
                id: message.document_id.clone(),
                source,
            }
        })?;
        let encoded = message.encoded_content();
        if encoded.is_empty() {
            return Err(SnapshotError::EmptyContent(document_id));
        }
        let content = STANDARD.decode(encoded.as_bytes())?;
        self.store.update_content(document_id, content).await?;
        Ok(document_id)
    }

    /// Decode a raw broker payload and apply it.
    pub async fn apply_raw(&self, payload: &[u8]) -> Result<Uuid, SnapshotError> {
        let message = SnapshotMessage::decode(payload)?;
        self.apply(&message).await
    }
}

#[async_trait]
impl MessageHandler for SnapshotConsumer {
    async fn handle_message(&self, payload: Bytes) {
        match self.apply_raw(&payload).await {
            Ok(id) => log::debug!("stored snapshot for document {id}"),
            Err(SnapshotError::Store(StoreError::NotFound(id))) => {
                log::info!("snapshot for unknown document {id} ignored");
            }
            Err(SnapshotError::Store(e)) => log::error!("storing snapshot failed: {e}"),
            Err(e) => log::warn!("snapshot dropped: {e}"),
        }
    }
}
