use log::{debug, info, warn};
use metrics::counter;
use std::sync::Arc;
use tracing::Instrument;
use uuid::Uuid;

use super::publish_with_retry;
use super::router::{ChainRouter, Route};
use crate::common::model::config::{Config, PublishConfig};
use crate::common::model::{ChainRequest, DoneEvent, FilterType};
use crate::errors::{Error, Result};
use crate::imaging::ImageFilter;
use crate::ledger::{Ledger, LedgerKey, LedgerTxn, ProcessedRecord};
use crate::queue::MqBackend;
use crate::storage::{ObjectStore, Tags};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageOutcome {
    /// Head of the chain names another stage. Not acknowledged.
    Skipped,
    /// Already handled by this stage for this request.
    Duplicate,
    /// Shrunk chain published to the next stage.
    Forwarded { image_id: String, topic: String },
    /// Chain finished; done event published.
    Completed { image_id: String },
    /// Conversion failed and a FAIL done event was published.
    Failed { message: String },
}

impl StageOutcome {
    /// Whether the consumed message should be acknowledged.
    pub fn should_ack(&self) -> bool {
        !matches!(self, StageOutcome::Skipped)
    }

    pub fn label(&self) -> &'static str {
        match self {
            StageOutcome::Skipped => "skipped",
            StageOutcome::Duplicate => "duplicate",
            StageOutcome::Forwarded { .. } => "forwarded",
            StageOutcome::Completed { .. } => "completed",
            StageOutcome::Failed { .. } => "failed",
        }
    }
}

/// Output id for a stage's result: the same input always maps to the same id.
pub fn artifact_id(stage: FilterType, original: &str, request: &str) -> String {
    let name = format!("{}:{}:{}", stage.slug(), original, request);
    Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()).to_string()
}

/// Applies one filter to chain messages addressed to it.
pub struct StageProcessor {
    stage: FilterType,
    filter: Arc<dyn ImageFilter>,
    ledger: Arc<dyn Ledger>,
    store: Arc<dyn ObjectStore>,
    queue: Arc<dyn MqBackend>,
    router: ChainRouter,
    publish: PublishConfig,
    temp_tag: String,
    surface_failures: bool,
}

impl StageProcessor {
    pub fn new(
        filter: Arc<dyn ImageFilter>,
        ledger: Arc<dyn Ledger>,
        store: Arc<dyn ObjectStore>,
        queue: Arc<dyn MqBackend>,
        config: &Config,
    ) -> Self {
        Self {
            stage: filter.filter_type(),
            filter,
            ledger,
            store,
            queue,
            router: ChainRouter::new(&config.topics),
            publish: config.publish.clone(),
            temp_tag: config.storage.temp_tag.clone(),
            surface_failures: config.stage.surface_failures,
        }
    }

    pub fn stage(&self) -> FilterType {
        self.stage
    }

    pub fn router(&self) -> &ChainRouter {
        &self.router
    }

    /// Topic this stage consumes.
    pub fn inbound_topic(&self) -> String {
        self.router.topic_for(self.stage)
    }

    pub async fn handle(&self, request: &ChainRequest) -> Result<StageOutcome> {
        let span = tracing::info_span!(
            "stage",
            stage = %self.stage,
            request_id = %request.request_id,
            image_id = %request.image_id,
        );
        let result = self.process(request).instrument(span).await;
        let label = match &result {
            Ok(outcome) => outcome.label(),
            Err(_) => "error",
        };
        counter!("stage_messages_total", "stage" => self.stage.slug(), "outcome" => label)
            .increment(1);
        result
    }

    async fn process(&self, request: &ChainRequest) -> Result<StageOutcome> {
        if request.head() != Some(self.stage) {
            debug!(
                "Skipping request {} addressed to {:?}",
                request.request_id,
                request.head()
            );
            return Ok(StageOutcome::Skipped);
        }

        let key = LedgerKey::new(&request.image_id, &request.request_id, self.stage);
        if self.ledger.exists(&key).await? {
            info!(
                "Request {} already processed for image {}",
                request.request_id, request.image_id
            );
            return Ok(StageOutcome::Duplicate);
        }

        let source = self.store.get(&request.image_id).await?;
        let converted = match self.filter.convert(source).await {
            Ok(bytes) => bytes,
            Err(e) if self.surface_failures && e.is_conversion() => {
                return self.surface_failure(request, key, e).await;
            }
            Err(e) => return Err(e),
        };

        let image_id = artifact_id(self.stage, &request.image_id, &request.request_id);
        let next = request.advance(image_id.clone());
        let route = self.router.route(&next.filters);

        let mut txn = self.ledger.begin().await?;
        if let Err(e) = txn
            .insert(&ProcessedRecord::new(key, Some(image_id.clone())))
            .await
        {
            abort(txn).await;
            return if e.is_duplicate() {
                info!("Concurrent delivery already recorded request {}", request.request_id);
                Ok(StageOutcome::Duplicate)
            } else {
                Err(e)
            };
        }

        let tags = match route {
            Route::Forward { .. } => {
                let mut tags = Tags::new();
                tags.insert(self.temp_tag.clone(), String::new());
                Some(tags)
            }
            Route::Terminal { .. } => None,
        };
        if let Err(e) = self.store.put(&image_id, &converted, tags.as_ref()).await {
            abort(txn).await;
            return Err(e);
        }

        let payload = match &route {
            Route::Forward { .. } => next.to_bytes(),
            Route::Terminal { .. } => DoneEvent::done(&image_id, &request.request_id).to_bytes(),
        };
        let published = match payload {
            Ok(payload) => {
                publish_with_retry(
                    self.queue.as_ref(),
                    &self.publish,
                    route.topic(),
                    &request.request_id,
                    &payload,
                )
                .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            abort(txn).await;
            if let Err(del) = self.store.delete(&image_id).await {
                warn!("Failed to delete orphaned artifact {}: {}", image_id, del);
            }
            return Err(e);
        }

        txn.commit().await?;

        Ok(match route {
            Route::Forward { topic, next } => {
                info!("Forwarded {} to {} ({})", image_id, next, topic);
                StageOutcome::Forwarded { image_id, topic }
            }
            Route::Terminal { .. } => {
                info!("Request {} done with image {}", request.request_id, image_id);
                StageOutcome::Completed { image_id }
            }
        })
    }

    async fn surface_failure(
        &self,
        request: &ChainRequest,
        key: LedgerKey,
        error: Error,
    ) -> Result<StageOutcome> {
        let message = error.to_string();
        warn!("Surfacing failure for request {}: {}", request.request_id, message);

        let mut txn = self.ledger.begin().await?;
        if let Err(e) = txn.insert(&ProcessedRecord::new(key, None)).await {
            abort(txn).await;
            return if e.is_duplicate() {
                Ok(StageOutcome::Duplicate)
            } else {
                Err(e)
            };
        }

        let published = match DoneEvent::failed(&request.request_id, message.clone()).to_bytes() {
            Ok(payload) => {
                publish_with_retry(
                    self.queue.as_ref(),
                    &self.publish,
                    self.router.done_topic(),
                    &request.request_id,
                    &payload,
                )
                .await
            }
            Err(e) => Err(e),
        };
        if let Err(e) = published {
            abort(txn).await;
            return Err(e);
        }

        txn.commit().await?;
        Ok(StageOutcome::Failed { message })
    }
}

async fn abort(txn: Box<dyn LedgerTxn>) {
    if let Err(e) = txn.rollback().await {
        warn!("Ledger rollback failed: {}", e);
    }
}
