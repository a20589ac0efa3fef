//! Stage processing: admission, idempotency, transform, routing, publish.

pub mod consumer;
pub mod done;
pub mod router;
pub mod runner;
pub mod stage;
pub mod submitter;

pub use consumer::StageConsumer;
pub use done::DoneTracker;
pub use router::{ChainRouter, Route};
pub use runner::ProcessorRunner;
pub use stage::{StageOutcome, StageProcessor};
pub use submitter::ChainSubmitter;

use log::{error, warn};
use metrics::counter;

use crate::common::model::config::PublishConfig;
use crate::errors::{QueueError, Result};
use crate::queue::MqBackend;

#[cfg(test)]
mod tests;

/// Publish and wait for broker confirmation, retrying with a fixed interval.
pub(crate) async fn publish_with_retry(
    queue: &dyn MqBackend,
    policy: &PublishConfig,
    topic: &str,
    key: &str,
    payload: &[u8],
) -> Result<()> {
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match queue.publish(topic, Some(key), payload).await {
            Ok(()) => return Ok(()),
            Err(e) if attempt < max_attempts => {
                warn!(
                    "Publish to {} failed (attempt {}/{}): {}",
                    topic, attempt, max_attempts, e
                );
                counter!("stage_publish_retry_total", "topic" => topic.to_string()).increment(1);
                attempt += 1;
                tokio::time::sleep(policy.interval()).await;
            }
            Err(e) => {
                error!("Giving up publishing to {}: {}", topic, e);
                return Err(QueueError::AttemptsExhausted(max_attempts).into());
            }
        }
    }
}
