use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::{error, info, warn};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use super::consumer::POISON_REASON;
use crate::common::model::DoneEvent;
use crate::errors::Result;
use crate::queue::{Message, MqBackend};

/// Latest terminal status per request, fed from the done topic.
#[derive(Default)]
pub struct DoneTracker {
    statuses: DashMap<String, DoneEvent>,
}

impl DoneTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every done event is terminal, so the first one recorded for a request wins.
    /// Returns false when the request already has a status.
    pub fn record(&self, event: DoneEvent) -> bool {
        match self.statuses.entry(event.request_id.clone()) {
            Entry::Occupied(current) => {
                warn!(
                    "Ignoring {:?} for request {}: already {:?}",
                    event.status,
                    event.request_id,
                    current.get().status
                );
                false
            }
            Entry::Vacant(slot) => {
                slot.insert(event);
                true
            }
        }
    }

    pub fn status(&self, request_id: &str) -> Option<DoneEvent> {
        self.statuses.get(request_id).map(|e| e.value().clone())
    }

    pub fn len(&self) -> usize {
        self.statuses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statuses.is_empty()
    }

    /// Consume `topic` until shutdown.
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<dyn MqBackend>,
        topic: String,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<()> {
        let (tx, mut rx) = mpsc::channel::<Message>(64);
        queue.subscribe(&topic, tx).await?;
        loop {
            let msg = tokio::select! {
                _ = shutdown_rx.recv() => break,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };
            let settled = match DoneEvent::from_bytes(&msg.payload) {
                Ok(event) => {
                    info!("Request {} finished: {:?}", event.request_id, event.status);
                    self.record(event);
                    msg.ack().await
                }
                Err(e) => {
                    warn!("Undecodable done event {}: {}", msg.id, e);
                    msg.nack(POISON_REASON).await
                }
            };
            if let Err(e) = settled {
                error!("Failed to settle done event {}: {}", msg.id, e);
            }
        }
        info!("Done tracker on {} stopped", topic);
        Ok(())
    }
}
