//! Message routing for inbound client frames.
//!
//! | type           | local broadcast        | broker subject class |
//! |----------------|------------------------|----------------------|
//! | `yjs_update`   | yes, origin excluded   | `updates`            |
//! | `presence`     | yes, origin excluded   | `presence`           |
//! | `yjs_snapshot` | no                     | `snapshots`          |
//! | `user_name`    | no, hub-generated only | none                 |
//! | anything else  | no                     | none                 |
//!
//! Each event is serialized once; the same bytes go to every local
//! queue and to the broker.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;

use crate::bridge::BrokerBridge;
use crate::connection::Connection;
use crate::protocol::{Event, MessageType};
use crate::registry::ConnectionRegistry;
use crate::subject::EventClass;

/// What happens to one message type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub local_broadcast: bool,
    pub publish: Option<EventClass>,
}

impl Route {
    pub const DROP: Route = Route {
        local_broadcast: false,
        publish: None,
    };

    pub fn for_type(kind: &MessageType) -> Self {
        match kind {
            MessageType::EditUpdate => Route {
                local_broadcast: true,
                publish: Some(EventClass::Updates),
            },
            MessageType::Presence => Route {
                local_broadcast: true,
                publish: Some(EventClass::Presence),
            },
            MessageType::Snapshot => Route {
                local_broadcast: false,
                publish: Some(EventClass::Snapshots),
            },
            MessageType::NameAnnouncement | MessageType::Unknown(_) => Route::DROP,
        }
    }
}

pub struct MessageRouter {
    registry: Arc<ConnectionRegistry>,
    bridge: Option<Arc<BrokerBridge>>,
    frames: AtomicU64,
    decode_failures: AtomicU64,
}

impl MessageRouter {
    /// Router for a hub that shares events through `bridge`.
    pub fn new(registry: Arc<ConnectionRegistry>, bridge: Arc<BrokerBridge>) -> Self {
        Self::build(registry, Some(bridge))
    }

    /// Router for a hub without a broker.
    pub fn local(registry: Arc<ConnectionRegistry>) -> Self {
        Self::build(registry, None)
    }

    fn build(registry: Arc<ConnectionRegistry>, bridge: Option<Arc<BrokerBridge>>) -> Self {
        Self {
            registry,
            bridge,
            frames: AtomicU64::new(0),
            decode_failures: AtomicU64::new(0),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bridge(&self) -> Option<&Arc<BrokerBridge>> {
        self.bridge.as_ref()
    }

    /// Decode a client frame, stamp it with the sender's identity and route it.
    ///
    /// Malformed frames are logged and skipped; the connection stays up.
    pub async fn handle_frame(&self, conn: &Connection, frame: &[u8]) {
        self.frames.fetch_add(1, Ordering::Relaxed);
        let event = match Event::decode(frame) {
            Ok(event) => event.stamped(conn.document_id(), conn.client_id()),
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "dropping malformed frame from client {} on document {}: {e}",
                    conn.client_id(),
                    conn.document_id()
                );
                return;
            }
        };
        self.dispatch(event).await;
    }

    /// Route an already stamped event.
    pub async fn dispatch(&self, event: Event) {
        let route = Route::for_type(&event.kind);
        if route == Route::DROP {
            match &event.kind {
                MessageType::NameAnnouncement => log::debug!(
                    "ignoring client-sent user_name from {} on document {}",
                    event.client_id,
                    event.document_id
                ),
                other => log::debug!(
                    "ignoring unknown message type {other:?} from {} on document {}",
                    event.client_id,
                    event.document_id
                ),
            }
            return;
        }

        let encoded = match event.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("cannot encode {} event: {e}", event.kind);
                return;
            }
        };

        if route.local_broadcast {
            self.registry
                .broadcast(&event.document_id, Arc::from(encoded.as_str()), Some(&event.client_id))
                .await;
        }

        if let (Some(class), Some(bridge)) = (route.publish, &self.bridge) {
            bridge
                .publish_encoded(&event.document_id, class, Bytes::from(encoded))
                .await;
        }
    }

    /// Register `conn` and exchange display names with the room.
    ///
    /// The joiner receives its own name first, then one announcement per
    /// client already present. Everyone else receives the joiner's name.
    pub async fn join(&self, conn: Arc<Connection>) -> Vec<String> {
        let document_id = conn.document_id().to_owned();
        let client_id = conn.client_id().to_owned();

        let own_name = encode_name(&document_id, &client_id);
        if let Some(own_name) = &own_name {
            conn.try_send(own_name.clone());
        }

        let peers = self
            .registry
            .register_with(conn, |conn, peers| {
                for peer in peers {
                    if let Some(name) = encode_name(&document_id, peer) {
                        conn.try_send(name);
                    }
                }
            })
            .await;

        if let Some(own_name) = own_name {
            self.registry
                .broadcast(&document_id, own_name, Some(&client_id))
                .await;
        }

        log::info!(
            "client {client_id} joined document {document_id} ({} peers)",
            peers.len()
        );
        peers
    }

    pub fn frames_received(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn decode_failures(&self) -> u64 {
        self.decode_failures.load(Ordering::Relaxed)
    }
}

fn encode_name(document_id: &str, client_id: &str) -> Option<Arc<str>> {
    match Event::user_name(document_id, client_id).encode() {
        Ok(encoded) => Some(Arc::from(encoded)),
        Err(e) => {
            log::warn!("cannot encode user_name for {client_id}: {e}");
            None
        }
    }
}
