use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::RwLock;

use super::{MessagePublisher, PublishError};

#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub persistent: bool,
}

impl PublishedMessage {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null)
    }
}

/// In-memory publisher with scripted failures (for testing and dry runs)
pub struct RecordingPublisher {
    messages: RwLock<Vec<PublishedMessage>>,
    failing_keys: RwLock<HashSet<String>>,
    fail_all: AtomicBool,
    connected: AtomicBool,
    closed: AtomicBool,
}

impl Default for RecordingPublisher {
    fn default() -> Self {
        Self {
            messages: RwLock::new(Vec::new()),
            failing_keys: RwLock::new(HashSet::new()),
            fail_all: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            closed: AtomicBool::new(false),
        }
    }
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self) -> Vec<PublishedMessage> {
        self.messages.read().await.clone()
    }

    /// Reject every message published with this routing key
    pub async fn fail_routing_key(&self, routing_key: &str) {
        self.failing_keys.write().await.insert(routing_key.to_string());
    }

    pub fn set_failing(&self, failing: bool) {
        self.fail_all.store(failing, Ordering::SeqCst);
    }

    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MessagePublisher for RecordingPublisher {
    async fn publish(&self, routing_key: &str, body: &[u8], persistent: bool) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::NotConnected);
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(PublishError::Transport("scripted failure".to_string()));
        }
        if self.failing_keys.read().await.contains(routing_key) {
            return Err(PublishError::Rejected(format!("routing key {} refused", routing_key)));
        }

        self.messages.write().await.push(PublishedMessage {
            routing_key: routing_key.to_string(),
            body: body.to_vec(),
            persistent,
        });
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && !self.closed.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
