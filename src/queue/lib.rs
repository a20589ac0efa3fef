pub mod kafka;
pub mod memory;

pub use kafka::KafkaQueue;
pub use memory::MemoryQueue;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::errors::Result;
use crate::errors::error::QueueError;


#[derive(Debug, Clone)]
/// Action to take on a message: Acknowledge or Negative Acknowledge (Fail)
pub enum AckAction {
    /// Message processed successfully
    Ack,
    /// Message processing failed
    Nack(String, Arc<Vec<u8>>, Arc<HashMap<String, String>>), // reason, payload, headers
}

pub const HEADER_ATTEMPT: &str = "x-attempt";
pub const HEADER_NACK_REASON: &str = "x-nack-reason";

/// Redelivery policy applied when a consumer rejects a message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NackPolicy {
    pub max_retries: u32,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NackDisposition {
    Retry { next_attempt: u32 },
    Dlq,
}

impl NackPolicy {
    pub fn from_config(backoff: &crate::common::model::config::BackoffConfig) -> Self {
        Self {
            max_retries: backoff.max_failures,
            backoff_ms: backoff.interval_ms,
        }
    }
}

pub(crate) fn parse_attempt(headers: &HashMap<String, String>) -> u32 {
    headers
        .get(HEADER_ATTEMPT)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(0)
}

pub fn decide_nack(policy: NackPolicy, attempt: u32) -> NackDisposition {
    if policy.max_retries > 0 && attempt < policy.max_retries {
        NackDisposition::Retry {
            next_attempt: attempt.saturating_add(1),
        }
    } else {
        NackDisposition::Dlq
    }
}

pub fn dlq_topic(topic: &str) -> String {
    format!("{}-dlq", topic)
}

/// Anything carrying a stable id for logging and tracing.
pub trait Identifiable {
    fn get_id(&self) -> String;
}

/// Represents a message received from the queue.
/// The consumer MUST call `ack()` once the message's effects are durable.
#[derive(Clone)]
pub struct Message {
    pub payload: Arc<Vec<u8>>,
    pub id: String,
    pub headers: Arc<HashMap<String, String>>,
    pub ack_tx: mpsc::Sender<(String, AckAction)>,
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("payload_len", &self.payload.len())
            .field("headers", &self.headers)
            .finish()
    }
}

impl Identifiable for Message {
    fn get_id(&self) -> String {
        self.id.clone()
    }
}

impl Message {
    pub fn attempt(&self) -> u32 {
        parse_attempt(&self.headers)
    }

    pub async fn ack(&self) -> Result<()> {
        self.ack_tx
            .send((self.id.clone(), AckAction::Ack))
            .await
            .map_err(|_| {
                QueueError::OperationFailed(Box::new(std::io::Error::other(
                    "Failed to send ACK signal",
                )))
                .into()
            })
    }

    pub async fn nack(&self, reason: impl Into<String>) -> Result<()> {
        self.ack_tx
            .send((
                self.id.clone(),
                AckAction::Nack(reason.into(), self.payload.clone(), self.headers.clone()),
            ))
            .await
            .map_err(|_| {
                QueueError::OperationFailed(Box::new(std::io::Error::other(
                    "Failed to send NACK signal",
                )))
                .into()
            })
    }
}

#[async_trait]
pub trait MqBackend: Send + Sync {
    /// Resolves once the broker has confirmed the write.
    async fn publish(&self, topic: &str, key: Option<&str>, payload: &[u8]) -> Result<()> {
        self.publish_with_headers(topic, key, payload, &HashMap::new())
            .await
    }

    async fn publish_with_headers(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<()>;

    async fn subscribe(&self, topic: &str, sender: mpsc::Sender<Message>) -> Result<()>;

    /// Send a message to the Dead Letter Queue (DLQ).
    async fn send_to_dlq(&self, topic: &str, payload: &[u8], reason: &str) -> Result<()> {
        let mut headers = HashMap::new();
        headers.insert(HEADER_NACK_REASON.to_string(), reason.to_string());
        self.publish_with_headers(&dlq_topic(topic), None, payload, &headers)
            .await
    }
}
