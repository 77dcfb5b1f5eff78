use anyhow::Result;
use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use std::time::Duration;
use tracing::{debug, error, info};

use super::{MessagePublisher, PublishError};
use crate::config::KafkaConfig;

/// Publishes every outbox event to one topic, keyed by routing key
pub struct KafkaPublisher {
    producer: FutureProducer,
    topic: String,
    timeout: Duration,
}

impl KafkaPublisher {
    pub async fn new(config: &KafkaConfig) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", &config.brokers)
            .set("message.timeout.ms", config.message_timeout_ms.to_string())
            .set("acks", "all")
            .set("enable.idempotence", "true")
            .create()?;

        info!(topic = %config.topic, "Kafka producer created");

        Ok(Self {
            producer,
            topic: config.topic.clone(),
            timeout: Duration::from_millis(config.message_timeout_ms),
        })
    }
}

#[async_trait]
impl MessagePublisher for KafkaPublisher {
    // Kafka writes are durable once acked by all replicas; `persistent` has no extra meaning here.
    async fn publish(&self, routing_key: &str, body: &[u8], _persistent: bool) -> Result<(), PublishError> {
        debug!("Publishing to {} with key {}", self.topic, routing_key);

        self.producer
            .send(
                FutureRecord::to(&self.topic).key(routing_key).payload(body),
                Timeout::After(self.timeout),
            )
            .await
            .map_err(|(e, _)| {
                error!("Failed to publish to {}: {}", self.topic, e);
                PublishError::Transport(e.to_string())
            })?;

        Ok(())
    }

    // librdkafka reconnects on its own
    fn is_connected(&self) -> bool {
        true
    }

    async fn close(&self) -> Result<(), PublishError> {
        let producer = self.producer.clone();
        let timeout = self.timeout;
        tokio::task::spawn_blocking(move || producer.flush(Timeout::After(timeout)))
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        info!("Kafka producer flushed");
        Ok(())
    }
}
