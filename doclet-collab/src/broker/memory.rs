//! In-process broker.
//!
//! Every publish goes into one `tokio::sync::broadcast` channel; each
//! subscription filters the shared feed by its pattern. Several hubs
//! sharing one `MemoryBroker` behave like hubs sharing a NATS server.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream;
use tokio::sync::broadcast;

use super::{Broker, BrokerError, MessageStream};
use crate::subject;

const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug)]
pub struct MemoryBroker {
    sender: broadcast::Sender<(String, Bytes)>,
    available: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// `capacity` messages may be buffered per subscriber before it lags.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the broker going away (`false`) or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<(), BrokerError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::Unavailable)
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), BrokerError> {
        self.ensure_available()?;
        // No subscribers is not an error, same as NATS.
        let _ = self.sender.send((subject, payload));
        Ok(())
    }

    async fn subscribe(&self, pattern: String) -> Result<MessageStream, BrokerError> {
        self.ensure_available()?;
        let receiver = self.sender.subscribe();

        let messages = stream::unfold((receiver, pattern), |(mut receiver, pattern)| async move {
            loop {
                match receiver.recv().await {
                    Ok((subject, payload)) => {
                        if subject::matches(&pattern, &subject) {
                            return Some((payload, (receiver, pattern)));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        log::warn!("subscription {pattern} lagged, {skipped} messages skipped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(messages))
    }
}
