use async_trait::async_trait;
use log::{debug, error, info, warn};
use metrics::counter;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message as KafkaMessageTrait, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use super::{
    AckAction, HEADER_ATTEMPT, HEADER_NACK_REASON, Message, MqBackend, NackDisposition,
    NackPolicy, decide_nack, dlq_topic, parse_attempt,
};
use crate::common::model::config::KafkaConfig;
use crate::errors::Result;
use crate::errors::error::QueueError;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct KafkaQueue {
    producer: FutureProducer,
    admin_client: Arc<AdminClient<DefaultClientContext>>,
    group_id: String,
    known_topics: Arc<RwLock<HashSet<String>>>,
    config: KafkaConfig,
    nack_policy: NackPolicy,
}

fn apply_security(config: &mut ClientConfig, kafka_config: &KafkaConfig) {
    let use_tls = kafka_config.tls.unwrap_or(false);

    if let (Some(user), Some(pass)) = (&kafka_config.username, &kafka_config.password) {
        if use_tls {
            config.set("security.protocol", "SASL_SSL");
        } else {
            config.set("security.protocol", "SASL_PLAINTEXT");
        }
        config
            .set("sasl.mechanism", "PLAIN")
            .set("sasl.username", user)
            .set("sasl.password", pass);
    } else if use_tls {
        config.set("security.protocol", "SSL");
    }
}

fn to_kafka_headers(headers: &HashMap<String, String>) -> OwnedHeaders {
    let mut kafka_headers = OwnedHeaders::new();
    for (k, v) in headers {
        kafka_headers = kafka_headers.insert(Header {
            key: k,
            value: Some(v.as_bytes()),
        });
    }
    kafka_headers
}

impl KafkaQueue {
    pub fn new(kafka_config: &KafkaConfig, group_id: &str, nack_policy: NackPolicy) -> Result<Self> {
        let mut config = ClientConfig::new();
        config
            .set("bootstrap.servers", kafka_config.brokers.as_str())
            .set("message.timeout.ms", "5000")
            .set("acks", "all")
            .set("enable.idempotence", "true");
        apply_security(&mut config, kafka_config);

        let producer: FutureProducer = config.create().map_err(|_| QueueError::ConnectionFailed)?;
        let admin_client: AdminClient<DefaultClientContext> =
            config.create().map_err(|_| QueueError::ConnectionFailed)?;

        Ok(Self {
            producer,
            admin_client: Arc::new(admin_client),
            group_id: kafka_config
                .group_id
                .clone()
                .unwrap_or_else(|| group_id.to_string()),
            known_topics: Arc::new(RwLock::new(HashSet::new())),
            config: kafka_config.clone(),
            nack_policy,
        })
    }

    fn is_known(&self, topic: &str) -> bool {
        self.known_topics
            .read()
            .map(|c| c.contains(topic))
            .unwrap_or(false)
    }

    async fn ensure_topic_exists(&self, topic_name: &str) -> Result<()> {
        if self.is_known(topic_name) {
            return Ok(());
        }

        let new_topic = NewTopic::new(
            topic_name,
            self.config.partitions,
            TopicReplication::Fixed(self.config.replication),
        );
        let opts = AdminOptions::new().operation_timeout(Some(Duration::from_secs(5)));

        match self.admin_client.create_topics(&[new_topic], &opts).await {
            Ok(results) => {
                for result in results {
                    match result {
                        Ok(_) => info!("Created Kafka topic: {}", topic_name),
                        Err((_, err)) => {
                            if err != RDKafkaErrorCode::TopicAlreadyExists {
                                warn!("Failed to create Kafka topic {}: {}", topic_name, err);
                            }
                        }
                    }
                }
            }
            Err(e) => {
                warn!("Admin client failed to create topic {}: {}", topic_name, e);
            }
        }

        let producer = self.producer.clone();
        let topic = topic_name.to_string();

        tokio::task::spawn_blocking(move || {
            let client = producer.client();
            let start = std::time::Instant::now();
            while start.elapsed() < Duration::from_secs(10) {
                if let Ok(meta) = client.fetch_metadata(Some(&topic), Duration::from_secs(1))
                    && meta
                        .topics()
                        .iter()
                        .any(|t| t.name() == topic && t.error().is_none())
                {
                    return Ok(());
                }
                std::thread::sleep(Duration::from_millis(100));
            }
            Err(QueueError::OperationFailed(Box::new(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                format!("Topic {} metadata not propagated", topic),
            ))))
        })
        .await
        .map_err(|e| QueueError::OperationFailed(Box::new(e)))??;

        if let Ok(mut cache) = self.known_topics.write() {
            cache.insert(topic_name.to_string());
        }

        Ok(())
    }
}

/// Offsets handed out but not yet settled, per partition.
#[derive(Default)]
struct InFlight {
    pending: HashMap<i32, BTreeSet<i64>>,
    max_settled: HashMap<i32, i64>,
}

impl InFlight {
    fn register(&mut self, partition: i32, offset: i64) {
        self.pending.entry(partition).or_default().insert(offset);
    }

    /// Marks an offset settled and returns the offset that is now safe to commit.
    fn settle(&mut self, partition: i32, offset: i64) -> Option<i64> {
        let set = self.pending.get_mut(&partition)?;
        set.remove(&offset);
        let current_max = self.max_settled.entry(partition).or_insert(-1);
        if offset > *current_max {
            *current_max = offset;
        }
        // commit offset N means everything below N is done
        match set.iter().next() {
            Some(&min_inflight) => Some(min_inflight),
            None => Some(*current_max + 1),
        }
    }
}

fn parse_message_id(id: &str) -> Option<(&str, i32, i64)> {
    let mut parts = id.rsplitn(3, ':');
    let offset = parts.next()?.parse().ok()?;
    let partition = parts.next()?.parse().ok()?;
    let topic = parts.next()?;
    Some((topic, partition, offset))
}

#[async_trait]
impl MqBackend for KafkaQueue {
    async fn publish_with_headers(
        &self,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<()> {
        if !self.is_known(topic)
            && let Err(e) = self.ensure_topic_exists(topic).await
        {
            warn!("Failed to ensure topic {} exists: {}", topic, e);
        }

        let record = FutureRecord::to(topic)
            .payload(payload)
            .key(key.unwrap_or(""))
            .headers(to_kafka_headers(headers));

        match self.producer.send(record, SEND_TIMEOUT).await {
            Ok(_) => Ok(()),
            Err((e, _)) => {
                if matches!(
                    &e,
                    rdkafka::error::KafkaError::MessageProduction(RDKafkaErrorCode::UnknownTopic)
                ) && let Ok(mut cache) = self.known_topics.write()
                {
                    cache.remove(topic);
                }
                error!("Kafka publish failed for topic {}: {:?}", topic, e);
                Err(QueueError::PushFailed(Box::new(e)).into())
            }
        }
    }

    async fn subscribe(&self, topic: &str, sender: mpsc::Sender<Message>) -> Result<()> {
        let topic = topic.to_string();

        if let Err(e) = self.ensure_topic_exists(&topic).await {
            warn!("Failed to ensure topic {} exists before subscribing: {}", topic, e);
        }

        let mut client_config = ClientConfig::new();
        client_config
            .set("group.id", &self.group_id)
            .set("bootstrap.servers", &self.config.brokers)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", self.config.session_timeout_ms.to_string())
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest");
        apply_security(&mut client_config, &self.config);

        let consumer: StreamConsumer = client_config
            .create()
            .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;
        consumer
            .subscribe(&[&topic])
            .map_err(|e| QueueError::OperationFailed(Box::new(e)))?;

        let consumer = Arc::new(consumer);
        let ack_consumer = consumer.clone();
        let retry_producer = self.producer.clone();
        let nack_policy = self.nack_policy;
        let (ack_tx, mut ack_rx) = mpsc::channel::<(String, AckAction)>(1000);

        let in_flight = Arc::new(Mutex::new(InFlight::default()));
        let tracker_consumer = in_flight.clone();

        // Ack processor: settles offsets, republishes nacked messages or dead-letters them.
        tokio::spawn(async move {
            while let Some((id, action)) = ack_rx.recv().await {
                let Some((topic_name, partition, offset)) = parse_message_id(&id) else {
                    warn!("Unparseable message id {}", id);
                    continue;
                };

                let should_commit = match action {
                    AckAction::Ack => true,
                    AckAction::Nack(reason, payload, headers) => {
                        let attempt = parse_attempt(&headers);
                        let disposition = decide_nack(nack_policy, attempt);
                        let action_label = match disposition {
                            NackDisposition::Retry { .. } => "retry",
                            NackDisposition::Dlq => "dlq",
                        };
                        counter!("stage_nack_total", "action" => action_label).increment(1);

                        let mut next_headers = (*headers).clone();
                        next_headers.insert(HEADER_NACK_REASON.to_string(), reason.clone());

                        let target = match disposition {
                            NackDisposition::Retry { next_attempt } => {
                                if nack_policy.backoff_ms > 0 {
                                    tokio::time::sleep(Duration::from_millis(nack_policy.backoff_ms))
                                        .await;
                                }
                                next_headers
                                    .insert(HEADER_ATTEMPT.to_string(), next_attempt.to_string());
                                topic_name.to_string()
                            }
                            NackDisposition::Dlq => {
                                warn!("Dead-lettering {} after {} attempts: {}", id, attempt, reason);
                                dlq_topic(topic_name)
                            }
                        };

                        let record = FutureRecord::to(&target)
                            .payload(payload.as_slice())
                            .key("")
                            .headers(to_kafka_headers(&next_headers));
                        match retry_producer.send(record, SEND_TIMEOUT).await {
                            Ok(_) => true,
                            Err((e, _)) => {
                                error!("Failed to republish {} to {}: {:?}", id, target, e);
                                false
                            }
                        }
                    }
                };

                if !should_commit {
                    continue;
                }

                let commit_offset = match tracker_consumer.lock() {
                    Ok(mut tracker) => tracker.settle(partition, offset),
                    Err(_) => None,
                };

                if let Some(off) = commit_offset {
                    let mut tpl = rdkafka::TopicPartitionList::new();
                    if tpl
                        .add_partition_offset(topic_name, partition, rdkafka::Offset::Offset(off))
                        .is_ok()
                        && let Err(e) = ack_consumer.commit(&tpl, CommitMode::Async)
                    {
                        debug!("Failed to commit kafka offset: {}", e);
                    }
                }
            }
        });

        tokio::spawn(async move {
            info!("Starting Kafka listener for topic: {}", topic);
            loop {
                match consumer.recv().await {
                    Ok(m) => {
                        let Some(payload) = m.payload() else {
                            continue;
                        };
                        let partition = m.partition();
                        let offset = m.offset();
                        let id = format!("{}:{}:{}", m.topic(), partition, offset);

                        if let Ok(mut tracker) = in_flight.lock() {
                            tracker.register(partition, offset);
                        }

                        let mut headers = HashMap::new();
                        if let Some(h) = m.headers() {
                            for i in 0..h.count() {
                                let header = h.get(i);
                                if let Some(v) = header.value {
                                    headers.insert(
                                        header.key.to_string(),
                                        String::from_utf8_lossy(v).to_string(),
                                    );
                                }
                            }
                        }

                        let msg = Message {
                            payload: Arc::new(payload.to_vec()),
                            id,
                            headers: Arc::new(headers),
                            ack_tx: ack_tx.clone(),
                        };

                        if sender.send(msg).await.is_err() {
                            warn!("Subscriber channel closed for topic {}", topic);
                            return;
                        }
                    }
                    Err(e) => {
                        error!("Kafka error: {}", e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(())
    }
}
