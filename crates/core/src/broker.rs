use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::broadcast;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker connection not established within {0:?}")]
    ConnectTimeout(std::time::Duration),
    #[error("subscription to {topics:?} not acknowledged within {timeout:?}")]
    SubscribeTimeout {
        topics: Vec<String>,
        timeout: std::time::Duration,
    },
    #[error("broker client error: {0}")]
    Client(String),
}

/// Publish/subscribe operations the orchestrator relies on.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Receiver for every publish delivered on active subscriptions.
    fn inbound(&self) -> broadcast::Receiver<InboundMessage>;

    /// Subscribes to all `topics` and returns once the broker acknowledged them.
    async fn subscribe(&self, topics: &[String]) -> Result<(), BrokerError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BrokerError>;

    async fn disconnect(&self) -> Result<(), BrokerError>;
}
