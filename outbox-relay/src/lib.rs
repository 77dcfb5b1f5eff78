//! Transactional outbox relay
//!
//! Producers append rows to `outbox_events` inside their own transactions.
//! The relay polls due rows, publishes them to the broker and records the
//! outcome, retrying failures with exponential backoff until the row's retry
//! budget is spent.

mod config;
pub mod publisher;
mod relay;
mod store;

pub use config::{AmqpConfig, BrokerConfig, BrokerKind, KafkaConfig, RelayConfig};
pub use publisher::{MessagePublisher, PublishError};
pub use relay::{backoff_delay, BatchReport, OutboxRelay, RelayHealth, RelayMessage};
pub use store::{DeliveryUpdate, InMemoryOutboxStore, OutboxStats, OutboxStore, PgOutboxStore};
