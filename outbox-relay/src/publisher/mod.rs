//! Broker publishers used by the relay

mod amqp;
#[cfg(feature = "kafka")]
mod kafka;
mod recording;

pub use amqp::AmqpPublisher;
#[cfg(feature = "kafka")]
pub use kafka::KafkaPublisher;
pub use recording::{PublishedMessage, RecordingPublisher};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("broker connection is not open")]
    NotConnected,

    #[error("broker rejected message: {0}")]
    Rejected(String),

    #[error("broker transport error: {0}")]
    Transport(String),

    #[error("message serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait MessagePublisher: Send + Sync {
    /// Publish and wait for the broker's acknowledgement
    async fn publish(&self, routing_key: &str, body: &[u8], persistent: bool) -> Result<(), PublishError>;

    fn is_connected(&self) -> bool;

    async fn close(&self) -> Result<(), PublishError>;
}
