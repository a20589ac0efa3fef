use log::info;
use std::sync::Arc;

use super::publish_with_retry;
use super::router::ChainRouter;
use crate::common::model::config::{Config, PublishConfig};
use crate::common::model::{ChainRequest, FilterType};
use crate::errors::{Result, StageError};
use crate::queue::MqBackend;

/// Entry point of a chain: publishes the first request to the head filter's stage.
pub struct ChainSubmitter {
    queue: Arc<dyn MqBackend>,
    router: ChainRouter,
    publish: PublishConfig,
}

impl ChainSubmitter {
    pub fn new(queue: Arc<dyn MqBackend>, config: &Config) -> Self {
        Self {
            queue,
            router: ChainRouter::new(&config.topics),
            publish: config.publish.clone(),
        }
    }

    pub async fn submit(
        &self,
        image_id: impl Into<String>,
        request_id: impl Into<String>,
        filters: Vec<FilterType>,
    ) -> Result<ChainRequest> {
        let request = ChainRequest::new(image_id, request_id, filters);
        let head = request.head().ok_or(StageError::EmptyChain)?;
        let topic = self.router.topic_for(head);

        publish_with_retry(
            self.queue.as_ref(),
            &self.publish,
            &topic,
            &request.request_id,
            &request.to_bytes()?,
        )
        .await?;
        info!(
            "Submitted request {} for image {} to {}",
            request.request_id, request.image_id, topic
        );
        Ok(request)
    }
}
