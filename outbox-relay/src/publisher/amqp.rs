use anyhow::{Context, Result};
use async_trait::async_trait;
use lapin::options::{BasicPublishOptions, ConfirmSelectOptions, ExchangeDeclareOptions};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, ExchangeKind};
use tracing::{debug, info};

use super::{MessagePublisher, PublishError};
use crate::config::AmqpConfig;

const PERSISTENT_DELIVERY: u8 = 2;

/// Publishes to a durable topic exchange with publisher confirms
pub struct AmqpPublisher {
    connection: Connection,
    channel: Channel,
    exchange: String,
}

impl AmqpPublisher {
    pub async fn connect(config: &AmqpConfig) -> Result<Self> {
        let connection = Connection::connect(&config.url, ConnectionProperties::default())
            .await
            .context("Failed to connect to AMQP broker")?;

        let channel = connection
            .create_channel()
            .await
            .context("Failed to open AMQP channel")?;

        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .context("Failed to enable publisher confirms")?;

        channel
            .exchange_declare(
                &config.exchange,
                ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .with_context(|| format!("Failed to declare exchange {}", config.exchange))?;

        info!(exchange = %config.exchange, "Connected to AMQP broker");

        Ok(Self {
            connection,
            channel,
            exchange: config.exchange.clone(),
        })
    }
}

#[async_trait]
impl MessagePublisher for AmqpPublisher {
    async fn publish(&self, routing_key: &str, body: &[u8], persistent: bool) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }

        let mut properties = BasicProperties::default().with_content_type("application/json".into());
        if persistent {
            properties = properties.with_delivery_mode(PERSISTENT_DELIVERY);
        }

        let confirm = self
            .channel
            .basic_publish(
                &self.exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                properties,
            )
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        let confirmation = confirm
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        if confirmation.is_nack() {
            return Err(PublishError::Rejected(format!(
                "nack for routing key {}",
                routing_key
            )));
        }

        debug!(routing_key = %routing_key, bytes = body.len(), "Published to exchange");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Ok(());
        }
        self.channel
            .close(200, "relay shutdown")
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;
        self.connection
            .close(200, "relay shutdown")
            .await
            .map_err(|e| PublishError::Transport(e.to_string()))?;

        info!("AMQP connection closed");
        Ok(())
    }
}
