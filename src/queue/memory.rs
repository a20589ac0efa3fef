use async_trait::async_trait;
use dashmap::DashMap;
use log::{debug, warn};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

use super::{
    AckAction, HEADER_ATTEMPT, HEADER_NACK_REASON, Message, MqBackend, NackDisposition,
    NackPolicy, decide_nack, dlq_topic, parse_attempt,
};
use crate::errors::Result;
use crate::errors::error::QueueError;

type Delivery = (Arc<Vec<u8>>, Arc<HashMap<String, String>>);

#[derive(Clone)]
struct Subscription {
    sender: mpsc::Sender<Message>,
    ack_tx: mpsc::Sender<(String, AckAction)>,
}

struct Inner {
    nack_policy: NackPolicy,
    subscriptions: DashMap<String, Vec<Subscription>>,
    pending: DashMap<String, VecDeque<Delivery>>,
    published: Mutex<Vec<(String, Vec<u8>)>>,
    acked: Mutex<Vec<String>>,
    next_seq: AtomicU64,
    round_robin: AtomicUsize,
}

/// In-process broker for single-node runs and tests.
///
/// Publishes are delivered to subscribers of the topic in round-robin order, or buffered
/// until someone subscribes. Nacked messages are redelivered according to the
/// [`NackPolicy`] and end up on `{topic}-dlq` once the policy is exhausted.
#[derive(Clone)]
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    pub fn new(nack_policy: NackPolicy) -> Self {
        Self {
            inner: Arc::new(Inner {
                nack_policy,
                subscriptions: DashMap::new(),
                pending: DashMap::new(),
                published: Mutex::new(Vec::new()),
                acked: Mutex::new(Vec::new()),
                next_seq: AtomicU64::new(0),
                round_robin: AtomicUsize::new(0),
            }),
        }
    }

    /// Every payload published to `topic`, in order.
    pub async fn published(&self, topic: &str) -> Vec<Vec<u8>> {
        self.inner
            .published
            .lock()
            .await
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub async fn acked(&self) -> Vec<String> {
        self.inner.acked.lock().await.clone()
    }

    pub fn pending_len(&self, topic: &str) -> usize {
        self.inner.pending.get(topic).map(|q| q.len()).unwrap_or(0)
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new(NackPolicy::default())
    }
}

impl Inner {
    async fn deliver(self: &Arc<Self>, topic: &str, delivery: Delivery) -> Result<()> {
        let subscription = self.subscriptions.get(topic).and_then(|subs| {
            if subs.is_empty() {
                None
            } else {
                let idx = self.round_robin.fetch_add(1, Ordering::Relaxed) % subs.len();
                Some(subs[idx].clone())
            }
        });

        let Some(subscription) = subscription else {
            self.pending
                .entry(topic.to_string())
                .or_default()
                .push_back(delivery);
            return Ok(());
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let message = Message {
            payload: delivery.0,
            id: format!("{}:0:{}", topic, seq),
            headers: delivery.1,
            ack_tx: subscription.ack_tx.clone(),
        };
        subscription.sender.send(message).await.map_err(|_| {
            QueueError::OperationFailed(Box::new(std::io::Error::other(format!(
                "subscriber for {} is gone",
                topic
            ))))
        })?;
        Ok(())
    }
}

async fn process_acks(
    inner: Weak<Inner>,
    topic: String,
    mut ack_rx: mpsc::Receiver<(String, AckAction)>,
) {
    while let Some((id, action)) = ack_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        match action {
            AckAction::Ack => {
                debug!("memory queue ack {}", id);
                inner.acked.lock().await.push(id);
            }
            AckAction::Nack(reason, payload, headers) => {
                let attempt = parse_attempt(&headers);
                match decide_nack(inner.nack_policy, attempt) {
                    NackDisposition::Retry { next_attempt } => {
                        if inner.nack_policy.backoff_ms > 0 {
                            tokio::time::sleep(Duration::from_millis(inner.nack_policy.backoff_ms))
                                .await;
                        }
                        let mut next_headers = (*headers).clone();
                        next_headers.insert(HEADER_ATTEMPT.to_string(), next_attempt.to_string());
                        next_headers.insert(HEADER_NACK_REASON.to_string(), reason);
                        if let Err(e) = inner.deliver(&topic, (payload, Arc::new(next_headers))).await {
                            warn!("Failed to redeliver {} on {}: {}", id, topic, e);
                        }
                    }
                    NackDisposition::Dlq => {
                        warn!("Message {} exhausted redeliveries on {}: {}", id, topic, reason);
                        let mut dlq_headers = (*headers).clone();
                        dlq_headers.insert(HEADER_NACK_REASON.to_string(), reason);
                        let dlq = dlq_topic(&topic);
                        inner
                            .published
                            .lock()
                            .await
                            .push((dlq.clone(), payload.to_vec()));
                        if let Err(e) = inner.deliver(&dlq, (payload, Arc::new(dlq_headers))).await {
                            warn!("Failed to dead-letter {}: {}", id, e);
                        }
                    }
                }
            }
        }
    }
}

#[async_trait]
impl MqBackend for MemoryQueue {
    async fn publish_with_headers(
        &self,
        topic: &str,
        _key: Option<&str>,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        self.inner
            .published
            .lock()
            .await
            .push((topic.to_string(), payload.to_vec()));
        self.inner
            .deliver(topic, (Arc::new(payload.to_vec()), Arc::new(headers.clone())))
            .await
    }

    async fn subscribe(&self, topic: &str, sender: mpsc::Sender<Message>) -> Result<()> {
        let (ack_tx, ack_rx) = mpsc::channel::<(String, AckAction)>(1000);
        tokio::spawn(process_acks(
            Arc::downgrade(&self.inner),
            topic.to_string(),
            ack_rx,
        ));

        self.inner
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .push(Subscription { sender, ack_tx });

        // The subscriber usually starts reading only after this returns, so a backlog
        // larger than its channel is flushed in the background.
        if let Some((_, backlog)) = self.inner.pending.remove(topic) {
            let inner = self.inner.clone();
            let topic = topic.to_string();
            tokio::spawn(async move {
                for delivery in backlog {
                    if let Err(e) = inner.deliver(&topic, delivery).await {
                        warn!("Failed to flush backlog on {}: {}", topic, e);
                        break;
                    }
                }
            });
        }
        Ok(())
    }
}
