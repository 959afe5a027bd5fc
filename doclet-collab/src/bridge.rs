//! Bridge between the local registry and the shared broker.
//!
//! ```text
//!   hub 1                         broker                        hub 2
//!   router ── publish ──► <ns>.documents.<doc>.<class> ──► subscription task
//!                                                              │ decode
//!                                                              ▼
//!                                                         EventHandler
//!                                                              │ RegistryRelay
//!                                                              ▼
//!                                                    registry.broadcast(doc,
//!                                                      exclude = origin)
//! ```
//!
//! Publishing never fails from the caller's point of view: the broker is
//! best effort, so errors are logged and counted. Subscription tasks are
//! owned by the bridge and stopped by [`BrokerBridge::shutdown`].
//! Snapshot subscriptions skip the event decode and hand raw payloads
//! to a [`MessageHandler`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::broker::{Broker, BrokerError};
use crate::protocol::Event;
use crate::registry::ConnectionRegistry;
use crate::snapshot::{DocumentStore, SnapshotConsumer};
use crate::subject::{self, EventClass};

/// Receives events decoded from a broker subscription.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: Event);
}

/// Receives raw payloads from a broker subscription.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle_message(&self, payload: Bytes);
}

/// Decodes payloads into events for an [`EventHandler`].
struct EventDecoder {
    pattern: String,
    handler: Arc<dyn EventHandler>,
    decode_failures: Arc<AtomicU64>,
}

#[async_trait]
impl MessageHandler for EventDecoder {
    async fn handle_message(&self, payload: Bytes) {
        match Event::decode(&payload) {
            Ok(event) => self.handler.handle(event).await,
            Err(e) => {
                self.decode_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("undecodable message on {}: {e}", self.pattern);
            }
        }
    }
}

/// Re-broadcasts broker events to local connections, skipping the origin.
pub struct RegistryRelay {
    registry: Arc<ConnectionRegistry>,
    relayed: Arc<AtomicU64>,
}

#[async_trait]
impl EventHandler for RegistryRelay {
    async fn handle(&self, event: Event) {
        let encoded = match event.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                log::warn!("cannot re-encode relayed event: {e}");
                return;
            }
        };
        self.relayed.fetch_add(1, Ordering::Relaxed);
        let outcome = self
            .registry
            .broadcast(&event.document_id, Arc::from(encoded), Some(&event.client_id))
            .await;
        log::trace!(
            "relayed {} for document {} to {} local clients",
            event.kind,
            event.document_id,
            outcome.delivered
        );
    }
}

/// Snapshot of bridge counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub published: u64,
    pub publish_failures: u64,
    pub relayed: u64,
    pub decode_failures: u64,
}

#[derive(Debug, Default)]
struct AtomicBridgeStats {
    published: AtomicU64,
    publish_failures: AtomicU64,
    relayed: Arc<AtomicU64>,
    decode_failures: Arc<AtomicU64>,
}

pub struct BrokerBridge {
    broker: Arc<dyn Broker>,
    namespace: String,
    registry: Arc<ConnectionRegistry>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: AtomicBridgeStats,
}

impl BrokerBridge {
    pub fn new(
        broker: Arc<dyn Broker>,
        namespace: impl Into<String>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            broker,
            namespace: namespace.into(),
            registry,
            tasks: Mutex::new(Vec::new()),
            stats: AtomicBridgeStats::default(),
        }
    }

    /// Publish `event` on the subject of `document_id` and `class`.
    pub async fn publish(&self, document_id: &str, class: EventClass, event: &Event) {
        let encoded = match event.encode() {
            Ok(encoded) => encoded,
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("cannot encode event for publish: {e}");
                return;
            }
        };
        self.publish_encoded(document_id, class, Bytes::from(encoded)).await;
    }

    /// Publish an already serialized event.
    pub async fn publish_encoded(&self, document_id: &str, class: EventClass, payload: Bytes) {
        let subject = subject::for_document(&self.namespace, document_id, class);
        match self.broker.publish(subject, payload).await {
            Ok(()) => {
                self.stats.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.stats.publish_failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("broker publish for document {document_id} failed: {e}");
            }
        }
    }

    /// Subscribe to `pattern` and feed every decoded event to `handler`.
    pub async fn subscribe(
        &self,
        pattern: String,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), BrokerError> {
        let decoder = Arc::new(EventDecoder {
            pattern: pattern.clone(),
            handler,
            decode_failures: self.stats.decode_failures.clone(),
        });
        self.subscribe_raw(pattern, decoder).await
    }

    /// Subscribe to `pattern` and feed every payload to `handler` as is.
    pub async fn subscribe_raw(
        &self,
        pattern: String,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BrokerError> {
        let mut messages = self.broker.subscribe(pattern.clone()).await?;

        let task = tokio::spawn(async move {
            log::debug!("subscription {pattern} started");
            while let Some(payload) = messages.next().await {
                handler.handle_message(payload).await;
            }
            log::debug!("subscription {pattern} ended");
        });

        self.tasks.lock().await.push(task);
        Ok(())
    }

    /// Relay `updates` and `presence` from every document into the registry.
    pub async fn start(&self) -> Result<(), BrokerError> {
        for class in [EventClass::Updates, EventClass::Presence] {
            let relay = Arc::new(RegistryRelay {
                registry: self.registry.clone(),
                relayed: self.stats.relayed.clone(),
            });
            self.subscribe(subject::wildcard(&self.namespace, class), relay)
                .await?;
        }
        log::info!("broker bridge relaying {}.documents.*", self.namespace);
        Ok(())
    }

    /// Hand every document snapshot to `store`.
    pub async fn start_snapshot_consumer(
        &self,
        store: Arc<dyn DocumentStore>,
    ) -> Result<(), BrokerError> {
        let consumer = Arc::new(SnapshotConsumer::new(store));
        self.subscribe_raw(subject::wildcard(&self.namespace, EventClass::Snapshots), consumer)
            .await
    }

    /// Stop every subscription and flush pending publishes.
    pub async fn shutdown(&self) {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }
        if let Err(e) = self.broker.flush().await {
            log::warn!("broker flush on shutdown failed: {e}");
        }
    }

    pub async fn subscription_count(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            published: self.stats.published.load(Ordering::Relaxed),
            publish_failures: self.stats.publish_failures.load(Ordering::Relaxed),
            relayed: self.stats.relayed.load(Ordering::Relaxed),
            decode_failures: self.stats.decode_failures.load(Ordering::Relaxed),
        }
    }
}
