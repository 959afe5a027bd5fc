//! JSON wire protocol shared by clients, hub instances and the broker.
//!
//! Every frame, in every direction, has the same shape:
//! ```text
//! {
//!   "type":        "yjs_update" | "yjs_snapshot" | "presence" | "user_name",
//!   "document_id": "<opaque>",
//!   "client_id":   "<origin connection>",
//!   "payload":     "<opaque, usually base64>"
//! }
//! ```
//!
//! The hub never looks inside `payload`. Missing fields decode to empty
//! values and unknown fields are ignored; identity fields are overwritten
//! from the connection anyway.

use serde::{Deserialize, Serialize};

use crate::presence;

/// Wire name of an edit update.
pub const TYPE_UPDATE: &str = "yjs_update";
/// Wire name of a full document snapshot.
pub const TYPE_SNAPSHOT: &str = "yjs_snapshot";
/// Wire name of a presence (awareness) update.
pub const TYPE_PRESENCE: &str = "presence";
/// Wire name of a display-name announcement.
pub const TYPE_USER_NAME: &str = "user_name";

/// Message types carried in the `type` field.
///
/// Anything the hub does not know is kept verbatim in `Unknown` so the
/// router can log it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// Incremental edit (`yjs_update`)
    EditUpdate,
    /// Full document state for persistence (`yjs_snapshot`)
    Snapshot,
    /// Cursor/awareness state (`presence`)
    Presence,
    /// Display name of a participant (`user_name`)
    NameAnnouncement,
    /// Unrecognized type string
    Unknown(String),
}

impl MessageType {
    /// The string used on the wire.
    pub fn as_str(&self) -> &str {
        match self {
            Self::EditUpdate => TYPE_UPDATE,
            Self::Snapshot => TYPE_SNAPSHOT,
            Self::Presence => TYPE_PRESENCE,
            Self::NameAnnouncement => TYPE_USER_NAME,
            Self::Unknown(other) => other,
        }
    }
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Unknown(String::new())
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            TYPE_UPDATE => Self::EditUpdate,
            TYPE_SNAPSHOT => Self::Snapshot,
            TYPE_PRESENCE => Self::Presence,
            TYPE_USER_NAME => Self::NameAnnouncement,
            _ => Self::Unknown(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Unknown(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One unit of exchange between clients and hubs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Event {
    #[serde(rename = "type", default)]
    pub kind: MessageType,
    #[serde(default)]
    pub document_id: String,
    /// Producer of the event; preserved across broker hops.
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub payload: String,
}

impl Event {
    pub fn new(
        kind: MessageType,
        document_id: impl Into<String>,
        client_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            document_id: document_id.into(),
            client_id: client_id.into(),
            payload: payload.into(),
        }
    }

    /// Create an edit update.
    pub fn edit_update(
        document_id: impl Into<String>,
        client_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(MessageType::EditUpdate, document_id, client_id, payload)
    }

    /// Create a snapshot event.
    pub fn snapshot(
        document_id: impl Into<String>,
        client_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(MessageType::Snapshot, document_id, client_id, payload)
    }

    /// Create a presence update.
    pub fn presence(
        document_id: impl Into<String>,
        client_id: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self::new(MessageType::Presence, document_id, client_id, payload)
    }

    /// Announce the display name of `client_id` within a document.
    pub fn user_name(document_id: impl Into<String>, client_id: impl Into<String>) -> Self {
        let client_id = client_id.into();
        let name = presence::display_name(&client_id);
        Self::new(MessageType::NameAnnouncement, document_id, client_id, name)
    }

    /// Overwrite the identity fields with the connection's own identity.
    pub fn stamped(mut self, document_id: &str, client_id: &str) -> Self {
        document_id.clone_into(&mut self.document_id);
        client_id.clone_into(&mut self.client_id);
        self
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Serialization)
    }

    /// Deserialize from the JSON wire format.
    pub fn decode(bytes: &[u8]) -> Result<Self, ProtocolError> {
        serde_json::from_slice(bytes).map_err(ProtocolError::Deserialization)
    }
}

/// Protocol errors.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("serialization error: {0}")]
    Serialization(#[source] serde_json::Error),
    #[error("deserialization error: {0}")]
    Deserialization(#[source] serde_json::Error),
}
