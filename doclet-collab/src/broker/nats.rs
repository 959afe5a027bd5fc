//! NATS broker backed by `async-nats`.

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;

use super::{Broker, BrokerError, MessageStream};

/// A connected NATS client.
#[derive(Debug, Clone)]
pub struct NatsBroker {
    client: async_nats::Client,
}

impl NatsBroker {
    /// Connect to the NATS server at `url`.
    pub async fn connect(url: &str) -> Result<Self, BrokerError> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| BrokerError::Connect {
                url: url.to_string(),
                reason: e.to_string(),
            })?;
        log::info!("connected to NATS at {url}");
        Ok(Self { client })
    }
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(&self, subject: String, payload: Bytes) -> Result<(), BrokerError> {
        self.client
            .publish(subject.clone(), payload)
            .await
            .map_err(|e| BrokerError::Publish {
                subject,
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, pattern: String) -> Result<MessageStream, BrokerError> {
        let subscriber = self
            .client
            .subscribe(pattern.clone())
            .await
            .map_err(|e| BrokerError::Subscribe {
                pattern,
                reason: e.to_string(),
            })?;
        Ok(Box::pin(subscriber.map(|message| message.payload)))
    }

    async fn flush(&self) -> Result<(), BrokerError> {
        self.client
            .flush()
            .await
            .map_err(|e| BrokerError::Flush(e.to_string()))
    }
}
