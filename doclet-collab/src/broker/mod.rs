//! Publish/subscribe broker abstraction.
//!
//! The hub only needs two things from a broker: fire-and-forget publish
//! to a subject, and a stream of payloads for a subject pattern.
//!
//! ```text
//!            ┌──────────────┐
//!  publish ─►│    Broker    │─► subscribe(pattern) ─► MessageStream
//!            └──────┬───────┘
//!          ┌────────┴────────┐
//!     MemoryBroker       NatsBroker
//!     (in-process)       (async-nats)
//! ```

pub mod memory;
pub mod nats;

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;

pub use memory::MemoryBroker;
pub use nats::NatsBroker;

/// Payloads delivered for one subscription.
pub type MessageStream = Pin<Box<dyn Stream<Item = Bytes> + Send>>;

#[async_trait]
pub trait Broker: Send + Sync {
    /// Publish `payload` on `subject`. No delivery guarantee.
    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), BrokerError>;

    /// Subscribe to a subject pattern (`*` and `>` wildcards).
    ///
    /// Dropping the returned stream ends the subscription.
    async fn subscribe(&self, pattern: String) -> Result<MessageStream, BrokerError>;

    /// Flush buffered publishes.
    async fn flush(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}

/// Broker errors.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker unavailable")]
    Unavailable,
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },
    #[error("publish to {subject} failed: {reason}")]
    Publish { subject: String, reason: String },
    #[error("subscribe to {pattern} failed: {reason}")]
    Subscribe { pattern: String, reason: String },
    #[error("flush failed: {0}")]
    Flush(String),
}
