use log::{debug, error, warn};
use metrics::counter;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use super::runner::ProcessorRunner;
use super::stage::StageProcessor;
use crate::common::model::ChainRequest;
use crate::errors::Result;
use crate::queue::{Message, MqBackend};

pub(crate) const POISON_REASON: &str = "deserialization failed";

/// Binds a stage processor to its inbound topic.
pub struct StageConsumer {
    processor: Arc<StageProcessor>,
    queue: Arc<dyn MqBackend>,
    concurrency: usize,
}

impl StageConsumer {
    pub fn new(processor: Arc<StageProcessor>, queue: Arc<dyn MqBackend>, concurrency: usize) -> Self {
        Self {
            processor,
            queue,
            concurrency,
        }
    }

    /// Consume until `shutdown_rx` fires or the subscription closes.
    pub async fn run(self, shutdown_rx: broadcast::Receiver<()>) -> Result<()> {
        let topic = self.processor.inbound_topic();
        let (tx, rx) = mpsc::channel(self.concurrency.max(1) * 2);
        self.queue.subscribe(&topic, tx).await?;

        let name = format!("stage-{}", self.processor.stage().slug());
        let runner = ProcessorRunner::new(&name, shutdown_rx, self.concurrency);
        let processor = self.processor;
        runner
            .run(rx, move |msg: Message| {
                let processor = processor.clone();
                async move { handle_message(&processor, msg).await }
            })
            .await;
        Ok(())
    }
}

/// Decode, process, then settle the message according to the outcome.
pub async fn handle_message(processor: &StageProcessor, msg: Message) {
    let request = match ChainRequest::from_bytes(&msg.payload) {
        Ok(request) => request,
        Err(e) => {
            warn!("Dropping undecodable message {}: {}", msg.id, e);
            counter!("stage_poison_total").increment(1);
            if let Err(e) = msg.nack(POISON_REASON).await {
                error!("Failed to nack message {}: {}", msg.id, e);
            }
            return;
        }
    };

    let settled = match processor.handle(&request).await {
        Ok(outcome) if outcome.should_ack() => msg.ack().await,
        Ok(_) => {
            debug!("Message {} left unacknowledged", msg.id);
            Ok(())
        }
        Err(e) => {
            error!(
                "Stage {} failed on request {}: {}",
                processor.stage(),
                request.request_id,
                e
            );
            msg.nack(e.to_string()).await
        }
    };
    if let Err(e) = settled {
        error!("Failed to settle message {}: {}", msg.id, e);
    }
}
