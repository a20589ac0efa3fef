use super::*;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, sleep, timeout};

use crate::common::model::{ChainRequest, Config, DoneEvent, FilterType, ImageStatus};
use crate::errors::{Error, QueueError};
use crate::imaging::tests::{png, solid};
use crate::imaging::{GrayFilter, ImageFilter, PixelPool, ThresholdFilter};
use crate::ledger::sea::tests::memory_ledger;
use crate::ledger::{Ledger, LedgerKey};
use crate::queue::{AckAction, MemoryQueue, Message, MqBackend};
use crate::storage::{MemoryObjectStore, ObjectStore};

use consumer::{POISON_REASON, handle_message};
use stage::artifact_id;

/// Records publishes; the first `failures` publishes fail.
#[derive(Default)]
struct MockBackend {
    published: StdMutex<Vec<(String, Vec<u8>)>>,
    attempts: AtomicU32,
    failures: AtomicU32,
}

impl MockBackend {
    fn failing(failures: u32) -> Self {
        let backend = Self::default();
        backend.failures.store(failures, Ordering::SeqCst);
        backend
    }

    fn published(&self) -> Vec<(String, Vec<u8>)> {
        self.published.lock().unwrap().clone()
    }

    fn on(&self, topic: &str) -> Vec<Vec<u8>> {
        self.published()
            .into_iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, p)| p)
            .collect()
    }
}

#[async_trait]
impl MqBackend for MockBackend {
    async fn publish_with_headers(
        &self,
        topic: &str,
        _key: Option<&str>,
        payload: &[u8],
        _headers: &HashMap<String, String>,
    ) -> crate::errors::Result<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let left = self.failures.load(Ordering::SeqCst);
        if left > 0 {
            self.failures.store(left - 1, Ordering::SeqCst);
            return Err(QueueError::PushFailed("broker unavailable".into()).into());
        }
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_vec()));
        Ok(())
    }

    async fn subscribe(&self, _topic: &str, _sender: mpsc::Sender<Message>) -> crate::errors::Result<()> {
        Ok(())
    }
}

/// Prefixes the payload with the stage name; optionally fails.
struct StubFilter {
    stage: FilterType,
    calls: AtomicUsize,
    fail: bool,
}

impl StubFilter {
    fn new(stage: FilterType) -> Self {
        Self {
            stage,
            calls: AtomicUsize::new(0),
            fail: false,
        }
    }

    fn failing(stage: FilterType) -> Self {
        Self {
            fail: true,
            ..Self::new(stage)
        }
    }
}

#[async_trait]
impl ImageFilter for StubFilter {
    fn filter_type(&self) -> FilterType {
        self.stage
    }

    async fn convert(&self, image: Vec<u8>) -> crate::errors::Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Error::conversion_failed(self.stage, "an error occurred"));
        }
        let mut out = format!("{}:", self.stage.slug()).into_bytes();
        out.extend(image);
        Ok(out)
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.publish.interval_ms = 0;
    config
}

struct Harness {
    processor: StageProcessor,
    filter: Arc<StubFilter>,
    ledger: Arc<dyn Ledger>,
    store: Arc<MemoryObjectStore>,
    queue: Arc<MockBackend>,
}

async fn harness(filter: StubFilter, queue: MockBackend, config: &Config) -> Harness {
    let filter = Arc::new(filter);
    let ledger: Arc<dyn Ledger> = Arc::new(memory_ledger().await);
    let store = Arc::new(MemoryObjectStore::new());
    let queue = Arc::new(queue);
    store.put("img-1", b"source", None).await.unwrap();
    let processor = StageProcessor::new(
        filter.clone(),
        ledger.clone(),
        store.clone(),
        queue.clone(),
        config,
    );
    Harness {
        processor,
        filter,
        ledger,
        store,
        queue,
    }
}

#[tokio::test]
async fn test_forward_shrinks_chain() {
    let h = harness(StubFilter::new(FilterType::Gray), MockBackend::default(), &test_config()).await;
    let request = ChainRequest::new(
        "img-1",
        "req-1",
        vec![FilterType::Gray, FilterType::Gauss, FilterType::Threshold],
    );

    let outcome = h.processor.handle(&request).await.unwrap();
    let expected_id = artifact_id(FilterType::Gray, "img-1", "req-1");
    assert_eq!(
        outcome,
        StageOutcome::Forwarded {
            image_id: expected_id.clone(),
            topic: "images.wip.gauss".into(),
        }
    );

    let sent = h.queue.on("images.wip.gauss");
    assert_eq!(sent.len(), 1);
    let next = ChainRequest::from_bytes(&sent[0]).unwrap();
    assert_eq!(next.image_id, expected_id);
    assert_ne!(next.image_id, request.image_id);
    assert_eq!(next.request_id, "req-1");
    assert_eq!(next.filters, vec![FilterType::Gauss, FilterType::Threshold]);

    assert_eq!(h.store.get(&expected_id).await.unwrap(), b"gray:source");
    assert!(h.store.tags(&expected_id).unwrap().contains_key("tmp"));

    let record = h
        .ledger
        .find(&LedgerKey::new("img-1", "req-1", FilterType::Gray))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.modified, Some(expected_id));
}

#[tokio::test]
async fn test_last_filter_emits_single_done_event() {
    let h = harness(
        StubFilter::new(FilterType::Threshold),
        MockBackend::default(),
        &test_config(),
    )
    .await;
    let request = ChainRequest::new("img-1", "req-1", vec![FilterType::Threshold]);

    let outcome = h.processor.handle(&request).await.unwrap();
    let StageOutcome::Completed { image_id } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };

    let published = h.queue.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].0, "images.done");
    let event = DoneEvent::from_bytes(&published[0].1).unwrap();
    assert_eq!(event.status, ImageStatus::Done);
    assert_eq!(event.image_id.as_deref(), Some(image_id.as_str()));
    assert_eq!(event.request_id, "req-1");

    assert!(h.store.tags(&image_id).unwrap().is_empty());
}

#[tokio::test]
async fn test_redelivery_is_acknowledged_without_recompute() {
    let h = harness(StubFilter::new(FilterType::Gray), MockBackend::default(), &test_config()).await;
    let request = ChainRequest::new("img-1", "req-1", vec![FilterType::Gray, FilterType::Gauss]);

    assert!(matches!(
        h.processor.handle(&request).await.unwrap(),
        StageOutcome::Forwarded { .. }
    ));
    assert_eq!(
        h.processor.handle(&request).await.unwrap(),
        StageOutcome::Duplicate
    );
    assert!(StageOutcome::Duplicate.should_ack());

    assert_eq!(h.filter.calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.queue.published().len(), 1);
}

#[tokio::test]
async fn test_same_image_new_request_is_processed_again() {
    let h = harness(StubFilter::new(FilterType::Gray), MockBackend::default(), &test_config()).await;
    for request_id in ["req-1", "req-2"] {
        let request = ChainRequest::new("img-1", request_id, vec![FilterType::Gray]);
        assert!(matches!(
            h.processor.handle(&request).await.unwrap(),
            StageOutcome::Completed { .. }
        ));
    }
    assert_eq!(h.filter.calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_mismatched_head_is_skipped_without_side_effects() {
    let h = harness(StubFilter::new(FilterType::Gray), MockBackend::default(), &test_config()).await;

    for filters in [vec![FilterType::Gauss, FilterType::Gray], vec![]] {
        let request = ChainRequest::new("img-1", "req-1", filters);
        let outcome = h.processor.handle(&request).await.unwrap();
        assert_eq!(outcome, StageOutcome::Skipped);
        assert!(!outcome.should_ack());
    }

    assert_eq!(h.filter.calls.load(Ordering::SeqCst), 0);
    assert!(h.queue.published().is_empty());
    assert_eq!(h.store.len(), 1);
    assert!(
        !h.ledger
            .exists(&LedgerKey::new("img-1", "req-1", FilterType::Gray))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_publish_failure_rolls_back_and_deletes_artifact() {
    let config = test_config();
    let h = harness(StubFilter::new(FilterType::Gray), MockBackend::failing(3), &config).await;
    let request = ChainRequest::new("img-1", "req-1", vec![FilterType::Gray, FilterType::Gauss]);

    let err = h.processor.handle(&request).await.unwrap_err();
    assert!(err.is_queue());
    assert!(err.to_string().contains("after maximum attempts (3)"));
    assert_eq!(h.queue.attempts.load(Ordering::SeqCst), config.publish.max_attempts);

    let key = LedgerKey::new("img-1", "req-1", FilterType::Gray);
    assert!(!h.ledger.exists(&key).await.unwrap());
    assert_eq!(h.store.keys(), vec!["img-1".to_string()]);

    // Redelivery after the broker recovers goes through and reuses the id.
    let outcome = h.processor.handle(&request).await.unwrap();
    assert_eq!(
        outcome,
        StageOutcome::Forwarded {
            image_id: artifact_id(FilterType::Gray, "img-1", "req-1"),
            topic: "images.wip.gauss".into(),
        }
    );
    assert!(h.ledger.exists(&key).await.unwrap());
}

#[tokio::test]
async fn test_transient_publish_failure_is_retried() {
    let h = harness(StubFilter::new(FilterType::Gray), MockBackend::failing(1), &test_config()).await;
    let request = ChainRequest::new("img-1", "req-1", vec![FilterType::Gray]);

    assert!(matches!(
        h.processor.handle(&request).await.unwrap(),
        StageOutcome::Completed { .. }
    ));
    assert_eq!(h.queue.attempts.load(Ordering::SeqCst), 2);
    assert_eq!(h.queue.published().len(), 1);
}

#[tokio::test]
async fn test_conversion_failure_leaves_no_trace() {
    let h = harness(
        StubFilter::failing(FilterType::Gauss),
        MockBackend::default(),
        &test_config(),
    )
    .await;
    let request = ChainRequest::new("img-1", "req-1", vec![FilterType::Gauss]);

    let err = h.processor.handle(&request).await.unwrap_err();
    assert!(err.is_conversion());
    assert!(h.queue.published().is_empty());
    assert_eq!(h.store.len(), 1);
    assert!(
        !h.ledger
            .exists(&LedgerKey::new("img-1", "req-1", FilterType::Gauss))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn test_surfaced_failure_publishes_fail_event_once() {
    let mut config = test_config();
    config.stage.surface_failures = true;
    let h = harness(StubFilter::failing(FilterType::Gauss), MockBackend::default(), &config).await;
    let request = ChainRequest::new("img-1", "req-1", vec![FilterType::Gauss, FilterType::Gray]);

    let outcome = h.processor.handle(&request).await.unwrap();
    let StageOutcome::Failed { message } = outcome else {
        panic!("unexpected outcome {outcome:?}");
    };
    assert!(message.contains("Unable to apply GAUSS filter: an error occurred"));

    let events = h.queue.on("images.done");
    assert_eq!(events.len(), 1);
    let event = DoneEvent::from_bytes(&events[0]).unwrap();
    assert_eq!(event.status, ImageStatus::Fail);
    assert!(event.image_id.is_none());
    assert_eq!(event.message.as_deref(), Some(message.as_str()));

    assert_eq!(
        h.processor.handle(&request).await.unwrap(),
        StageOutcome::Duplicate
    );
    assert_eq!(h.queue.published().len(), 1);
}

#[tokio::test]
async fn test_missing_source_is_a_storage_error() {
    let h = harness(StubFilter::new(FilterType::Gray), MockBackend::default(), &test_config()).await;
    let request = ChainRequest::new("missing", "req-1", vec![FilterType::Gray]);
    let err = h.processor.handle(&request).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(h.filter.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_shared_topic_mode_forwards_to_processing_topic() {
    let mut config = test_config();
    config.topics.per_filter = false;
    let h = harness(StubFilter::new(FilterType::Gray), MockBackend::default(), &config).await;
    assert_eq!(h.processor.inbound_topic(), "images.wip");

    let request = ChainRequest::new("img-1", "req-1", vec![FilterType::Gray, FilterType::Threshold]);
    h.processor.handle(&request).await.unwrap();
    assert_eq!(h.queue.on("images.wip").len(), 1);
}

fn message(payload: &[u8], ack_tx: mpsc::Sender<(String, AckAction)>) -> Message {
    Message {
        payload: Arc::new(payload.to_vec()),
        id: "images.wip.gray:0:1".into(),
        headers: Arc::new(HashMap::new()),
        ack_tx,
    }
}

#[tokio::test]
async fn test_message_settlement_follows_outcome() {
    let h = harness(StubFilter::new(FilterType::Gray), MockBackend::default(), &test_config()).await;
    let (ack_tx, mut ack_rx) = mpsc::channel(8);

    handle_message(&h.processor, message(b"not a chain request", ack_tx.clone())).await;
    match ack_rx.try_recv().unwrap().1 {
        AckAction::Nack(reason, ..) => assert_eq!(reason, POISON_REASON),
        AckAction::Ack => panic!("poison message acknowledged"),
    }

    let unknown_filter = br#"{"imageId":"img-1","requestId":"req-1","filters":["SEPIA"]}"#;
    handle_message(&h.processor, message(unknown_filter, ack_tx.clone())).await;
    assert!(matches!(ack_rx.try_recv().unwrap().1, AckAction::Nack(..)));

    let skipped = ChainRequest::new("img-1", "req-1", vec![FilterType::Gauss]);
    handle_message(&h.processor, message(&skipped.to_bytes().unwrap(), ack_tx.clone())).await;
    assert!(ack_rx.try_recv().is_err());

    let accepted = ChainRequest::new("img-1", "req-1", vec![FilterType::Gray]);
    handle_message(&h.processor, message(&accepted.to_bytes().unwrap(), ack_tx.clone())).await;
    assert!(matches!(ack_rx.try_recv().unwrap().1, AckAction::Ack));

    let missing = ChainRequest::new("nope", "req-2", vec![FilterType::Gray]);
    handle_message(&h.processor, message(&missing.to_bytes().unwrap(), ack_tx)).await;
    assert!(matches!(ack_rx.try_recv().unwrap().1, AckAction::Nack(..)));
}

#[tokio::test]
async fn test_submitter_publishes_to_head_topic() {
    let queue = Arc::new(MockBackend::default());
    let submitter = ChainSubmitter::new(queue.clone(), &test_config());

    let request = submitter
        .submit("img-1", "req-1", vec![FilterType::Threshold, FilterType::Gray])
        .await
        .unwrap();
    let sent = queue.on("images.wip.threshold");
    assert_eq!(sent.len(), 1);
    assert_eq!(ChainRequest::from_bytes(&sent[0]).unwrap(), request);

    let err = submitter.submit("img-1", "req-2", vec![]).await.unwrap_err();
    assert_eq!(err.kind(), crate::errors::ErrorKind::Stage);
}

#[tokio::test]
async fn test_submitter_gives_up_after_max_attempts() {
    let queue = Arc::new(MockBackend::failing(u32::MAX));
    let submitter = ChainSubmitter::new(queue.clone(), &test_config());
    let err = submitter
        .submit("img-1", "req-1", vec![FilterType::Gray])
        .await
        .unwrap_err();
    assert!(
        err.to_string()
            .contains("Failed to send request to Kafka after maximum attempts")
    );
    assert_eq!(queue.attempts.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_chain_runs_end_to_end_on_memory_queue() {
    let config = test_config();
    let queue = Arc::new(MemoryQueue::default());
    let ledger: Arc<dyn Ledger> = Arc::new(memory_ledger().await);
    let store = Arc::new(MemoryObjectStore::new());
    let pool = PixelPool::new(2, 64).unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);

    let filters: [Arc<dyn ImageFilter>; 2] = [
        Arc::new(GrayFilter::new(pool.clone())),
        Arc::new(ThresholdFilter::new(pool)),
    ];
    let mut handles = Vec::new();
    for filter in filters {
        let processor = Arc::new(StageProcessor::new(
            filter,
            ledger.clone(),
            store.clone(),
            queue.clone(),
            &config,
        ));
        let consumer = StageConsumer::new(processor, queue.clone(), 1);
        handles.push(tokio::spawn(consumer.run(shutdown_tx.subscribe())));
    }
    let tracker = Arc::new(DoneTracker::new());
    handles.push(tokio::spawn(tracker.clone().run(
        queue.clone(),
        config.topics.done.clone(),
        shutdown_tx.subscribe(),
    )));

    store
        .put("upload", &png(&solid(30, 20, [200, 40, 40, 255])), None)
        .await
        .unwrap();
    ChainSubmitter::new(queue.clone(), &config)
        .submit("upload", "req-e2e", vec![FilterType::Gray, FilterType::Threshold])
        .await
        .unwrap();

    let event = timeout(Duration::from_secs(5), async {
        loop {
            if let Some(event) = tracker.status("req-e2e") {
                return event;
            }
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(event.status, ImageStatus::Done);

    // luminance of (200, 40, 40) is 87, below the cutoff
    let output = store.get(event.image_id.as_deref().unwrap()).await.unwrap();
    let output = image::load_from_memory(&output).unwrap().to_rgba8();
    assert!(output.pixels().all(|p| p.0 == [0, 0, 0, 255]));

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}

#[tokio::test]
async fn test_backlog_submitted_before_stages_start_is_drained() {
    let config = test_config();
    let queue = Arc::new(MemoryQueue::default());
    let ledger: Arc<dyn Ledger> = Arc::new(memory_ledger().await);
    let store = Arc::new(MemoryObjectStore::new());
    let pool = PixelPool::new(2, 64).unwrap();
    let (shutdown_tx, _) = broadcast::channel(1);

    store
        .put("upload", &png(&solid(8, 8, [10, 250, 10, 255])), None)
        .await
        .unwrap();
    let submitter = ChainSubmitter::new(queue.clone(), &config);
    let requests: Vec<String> = (0..6).map(|i| format!("req-{i}")).collect();
    for request in &requests {
        submitter
            .submit("upload", request, vec![FilterType::Gray, FilterType::Threshold])
            .await
            .unwrap();
    }

    let tracker = Arc::new(DoneTracker::new());
    let mut handles = vec![tokio::spawn(tracker.clone().run(
        queue.clone(),
        config.topics.done.clone(),
        shutdown_tx.subscribe(),
    ))];
    let filters: [Arc<dyn ImageFilter>; 2] = [
        Arc::new(GrayFilter::new(pool.clone())),
        Arc::new(ThresholdFilter::new(pool)),
    ];
    for filter in filters {
        let processor = Arc::new(StageProcessor::new(
            filter,
            ledger.clone(),
            store.clone(),
            queue.clone(),
            &config,
        ));
        let consumer = StageConsumer::new(processor, queue.clone(), 1);
        handles.push(tokio::spawn(consumer.run(shutdown_tx.subscribe())));
    }

    timeout(Duration::from_secs(10), async {
        while tracker.len() < requests.len() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    for request in &requests {
        assert_eq!(tracker.status(request).unwrap().status, ImageStatus::Done);
    }

    shutdown_tx.send(()).unwrap();
    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}
