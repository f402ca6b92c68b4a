//! librdkafka-backed [`LogConnector`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Message};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::util::Timeout;
use rdkafka::{ClientContext, Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::warn;

use super::{
    ClientConfig, LogClient, LogConnector, LogSink, PartitionSeeker, RebalanceListener, SeekTo,
    codec_from_config,
};
use crate::codec::{Codec, CodecRegistry};
use crate::error::{Error, Result};
use crate::event::RawRecord;

/// Timeout of seeks issued from rebalance callbacks and of producer
/// initialization.
const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

/// Properties interpreted by this crate rather than librdkafka.
const LOCAL_KEYS: &[&str] = &[
    "max.poll.records",
    "key.deserializer",
    "value.deserializer",
    "key.serializer",
    "value.serializer",
];

fn native_config(config: &ClientConfig) -> rdkafka::ClientConfig {
    let mut native = rdkafka::ClientConfig::new();
    for (key, value) in config {
        if key.starts_with("conduit.") || LOCAL_KEYS.contains(&key.as_str()) {
            continue;
        }
        native.set(key, value);
    }
    native
}

fn partitions_of(list: &TopicPartitionList, topic: &str) -> Vec<i32> {
    list.elements()
        .iter()
        .filter(|e| e.topic() == topic)
        .map(|e| e.partition())
        .collect()
}

/// Opens librdkafka consumers and producers.
#[derive(Debug, Default, Clone, Copy)]
pub struct KafkaConnector;

struct RebalanceContext {
    topic: String,
    listener: Arc<dyn RebalanceListener>,
}

impl ClientContext for RebalanceContext {}

impl ConsumerContext for RebalanceContext {
    fn post_rebalance(&self, base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance<'_>) {
        match rebalance {
            Rebalance::Assign(list) => {
                let seeker = BaseSeeker {
                    consumer: base_consumer,
                    topic: &self.topic,
                };
                self.listener
                    .on_assigned(&partitions_of(list, &self.topic), &seeker);
            }
            Rebalance::Revoke(list) => {
                self.listener.on_revoked(&partitions_of(list, &self.topic));
            }
            Rebalance::Error(e) => {
                warn!(topic = %self.topic, error = %e, "rebalance failed");
            }
        }
    }
}

struct BaseSeeker<'a> {
    consumer: &'a BaseConsumer<RebalanceContext>,
    topic: &'a str,
}

impl PartitionSeeker for BaseSeeker<'_> {
    fn seek(&self, partition: i32, to: SeekTo) -> Result<()> {
        let offset = match to {
            SeekTo::Beginning => Offset::Beginning,
            SeekTo::End => Offset::End,
        };
        self.consumer
            .seek(self.topic, partition, offset, CLIENT_TIMEOUT)
            .map_err(Error::from)
    }
}

#[async_trait]
impl LogConnector for KafkaConnector {
    async fn connect_consumer(
        &self,
        config: &ClientConfig,
        codecs: Arc<CodecRegistry>,
        topic: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<Box<dyn LogClient>> {
        let codec = codec_from_config(config, &codecs)?;
        let context = RebalanceContext {
            topic: topic.to_string(),
            listener,
        };
        let consumer: StreamConsumer<RebalanceContext> =
            native_config(config).create_with_context(context)?;
        consumer.subscribe(&[topic])?;
        Ok(Box::new(KafkaClient {
            consumer,
            topic: topic.to_string(),
            codec,
            deferred: None,
        }))
    }

    async fn connect_producer(
        &self,
        config: &ClientConfig,
        codecs: Arc<CodecRegistry>,
        topic: &str,
    ) -> Result<Box<dyn LogSink>> {
        let codec = codec_from_config(config, &codecs)?;
        let producer: FutureProducer = native_config(config).create()?;
        if config.contains_key("transactional.id") {
            blocking(&producer, |p| p.init_transactions(CLIENT_TIMEOUT)).await?;
        }
        Ok(Box::new(KafkaSink {
            producer,
            topic: topic.to_string(),
            codec,
        }))
    }
}

struct KafkaClient {
    consumer: StreamConsumer<RebalanceContext>,
    topic: String,
    codec: Arc<Codec>,
    /// Error hit after part of a batch was read; reported by the next poll
    /// so the records already consumed reach the caller first.
    deferred: Option<Error>,
}

fn to_raw(message: &BorrowedMessage<'_>) -> RawRecord {
    RawRecord {
        partition: message.partition(),
        position: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        payload: message.payload().unwrap_or_default().to_vec(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
    }
}

#[async_trait]
impl LogClient for KafkaClient {
    fn codec(&self) -> Arc<Codec> {
        Arc::clone(&self.codec)
    }

    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<RawRecord>> {
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        let deadline = Instant::now() + timeout;
        let mut records = Vec::new();
        while records.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            // Wait for the first record, then only drain what is already buffered.
            let wait = if records.is_empty() {
                remaining
            } else {
                remaining.min(Duration::from_millis(1))
            };
            match tokio::time::timeout(wait, self.consumer.recv()).await {
                Ok(Ok(message)) => records.push(to_raw(&message)),
                Ok(Err(e)) if records.is_empty() => return Err(e.into()),
                Ok(Err(e)) => {
                    warn!(topic = %self.topic, received = records.len(), error = %e, "poll failed mid-batch");
                    self.deferred = Some(e.into());
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(records)
    }

    async fn commit(&mut self) -> Result<()> {
        match self.consumer.commit_consumer_state(CommitMode::Sync) {
            Ok(()) => Ok(()),
            Err(KafkaError::ConsumerCommit(RDKafkaErrorCode::NoOffset)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn lag(&self, partitions: &[i32]) -> HashMap<i32, u64> {
        let Ok(positions) = self.consumer.position() else {
            return HashMap::new();
        };
        partitions
            .iter()
            .filter_map(|&partition| {
                let Offset::Offset(position) =
                    positions.find_partition(&self.topic, partition)?.offset()
                else {
                    return None;
                };
                let (_, high) = self
                    .consumer
                    .get_watermark_offsets(&self.topic, partition)
                    .ok()?;
                Some((partition, (high - position).max(0) as u64))
            })
            .collect()
    }

    async fn close(&mut self) -> Result<()> {
        self.deferred = None;
        self.consumer.unsubscribe();
        Ok(())
    }
}

struct KafkaSink {
    producer: FutureProducer,
    topic: String,
    codec: Arc<Codec>,
}

/// Run a blocking producer call off the async runtime.
async fn blocking<F>(producer: &FutureProducer, call: F) -> Result<()>
where
    F: FnOnce(&FutureProducer) -> std::result::Result<(), KafkaError> + Send + 'static,
{
    let producer = producer.clone();
    tokio::task::spawn_blocking(move || call(&producer))
        .await
        .map_err(|e| Error::Backend(format!("producer task failed: {e}")))?
        .map_err(Error::from)
}

#[async_trait]
impl LogSink for KafkaSink {
    fn codec(&self) -> Arc<Codec> {
        Arc::clone(&self.codec)
    }

    async fn send(&mut self, key: Option<Vec<u8>>, payload: Vec<u8>) -> Result<()> {
        let mut record = FutureRecord::<[u8], [u8]>::to(&self.topic).payload(payload.as_slice());
        if let Some(key) = key.as_deref() {
            record = record.key(key);
        }
        self.producer
            .send(record, Timeout::Never)
            .await
            .map(|_| ())
            .map_err(|(e, _)| e.into())
    }

    async fn flush(&mut self, timeout: Duration) -> Result<()> {
        blocking(&self.producer, move |p| p.flush(timeout)).await
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        blocking(&self.producer, |p| p.begin_transaction()).await
    }

    async fn commit_transaction(&mut self, timeout: Duration) -> Result<()> {
        blocking(&self.producer, move |p| p.commit_transaction(timeout)).await
    }

    async fn abort_transaction(&mut self, timeout: Duration) -> Result<()> {
        blocking(&self.producer, move |p| p.abort_transaction(timeout)).await
    }

    async fn close(&mut self) -> Result<()> {
        blocking(&self.producer, |p| p.flush(CLIENT_TIMEOUT)).await
    }
}
