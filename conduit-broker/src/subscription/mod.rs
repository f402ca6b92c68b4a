//! Subscription adapter (Pulsar-like backends).
//!
//! Subscription backends hand out messages to the members of a shared
//! subscription and expect each message to be acknowledged by id. No
//! partition or offset model is exposed: consumers report no partitions and
//! zero lag.
//!
//! Without auto-commit, received message ids are queued and acknowledged
//! together on commit; rollback drops the queue so the backend redelivers
//! them. With auto-commit, every polled batch is acknowledged immediately.
//!
//! [`MemoryPubSub`] is a complete in-process backend; the `pulsar` feature
//! adds [`pulsar::PulsarConnector`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::broker::{Broker, BrokerType};
use crate::codec::Codec;
use crate::consumer::ConsumerBackend;
use crate::error::Result;
use crate::producer::ProducerBackend;
use crate::provider::Provider;
use crate::topic::{OffsetResetStrategy, Topic};

mod consumer;
pub mod memory;
mod producer;

#[cfg(feature = "pulsar")]
pub mod pulsar;

pub use consumer::SubscriptionConsumer;
pub use memory::MemoryPubSub;
pub use producer::SubscriptionProducer;

/// Backend identity of one message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageId {
    pub topic: String,
    pub ledger: u64,
    pub entry: u64,
    /// Partition of a partitioned topic, `-1` otherwise.
    pub partition: i32,
    pub batch_index: i32,
}

impl MessageId {
    /// Position of the message within its partition, ordered like the ids.
    pub fn position(&self) -> i64 {
        let position = (self.ledger << 32) | (self.entry & 0xffff_ffff);
        i64::try_from(position).unwrap_or(i64::MAX)
    }
}

/// A message handed out by a subscription.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub id: MessageId,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub publish_time: Option<DateTime<Utc>>,
}

/// Where a new subscription starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitialPosition {
    Earliest,
    Latest,
}

impl From<OffsetResetStrategy> for InitialPosition {
    fn from(strategy: OffsetResetStrategy) -> Self {
        match strategy {
            OffsetResetStrategy::Earliest => Self::Earliest,
            OffsetResetStrategy::Latest | OffsetResetStrategy::Current => Self::Latest,
        }
    }
}

/// Settings of one subscription member.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    pub topic: String,
    pub subscription: String,
    pub consumer_name: String,
    pub initial_position: InitialPosition,
    /// How long a member may wait for the backend, e.g. when connecting.
    pub timeout: Duration,
}

impl SubscriptionOptions {
    pub fn for_topic(topic: &Topic) -> Self {
        Self {
            topic: topic.name().to_string(),
            subscription: topic.subscription().to_string(),
            consumer_name: topic.client_id().to_string(),
            initial_position: topic.offset_reset_strategy().into(),
            timeout: topic.timeout(),
        }
    }
}

/// Opens subscriptions and publishers on one backend.
#[async_trait]
pub trait SubscriptionConnector: Send + Sync {
    async fn subscribe(
        &self,
        broker: &Broker,
        options: SubscriptionOptions,
    ) -> Result<Box<dyn SubscriptionClient>>;

    async fn publisher(
        &self,
        broker: &Broker,
        topic: &str,
        producer_name: &str,
    ) -> Result<Box<dyn SubscriptionSink>>;
}

/// One subscription member.
#[async_trait]
pub trait SubscriptionClient: Send {
    /// Wait up to `timeout` for the next message.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<ReceivedMessage>>;

    async fn acknowledge(&mut self, ids: &[MessageId]) -> Result<()>;

    /// Leave the subscription; unacknowledged messages become available to
    /// other members again.
    async fn close(&mut self) -> Result<()>;
}

/// One publisher.
#[async_trait]
pub trait SubscriptionSink: Send {
    async fn publish(&mut self, key: Option<Vec<u8>>, payload: Vec<u8>) -> Result<()>;

    /// Wait until published messages are persisted.
    async fn flush(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Provider for [`BrokerType::Pulsar`] brokers.
pub struct SubscriptionProvider {
    connector: Arc<dyn SubscriptionConnector>,
}

impl SubscriptionProvider {
    pub fn new(connector: Arc<dyn SubscriptionConnector>) -> Self {
        Self { connector }
    }
}

impl Provider for SubscriptionProvider {
    fn name(&self) -> &str {
        "subscription"
    }

    fn supports(&self, broker: &Broker) -> bool {
        broker.broker_type() == BrokerType::Pulsar
    }

    fn create_consumer(&self, topic: &Arc<Topic>) -> Result<Box<dyn ConsumerBackend>> {
        Ok(Box::new(SubscriptionConsumer::new(
            Arc::clone(topic),
            Arc::clone(&self.connector),
        )))
    }

    fn create_producer(&self, topic: &Arc<Topic>) -> Result<Box<dyn ProducerBackend>> {
        Ok(Box::new(SubscriptionProducer::new(
            Arc::clone(topic),
            Arc::clone(&self.connector),
        )))
    }
}

/// Codec shared by the consumer and producer of `topic`.
fn topic_codec(topic: &Topic) -> Result<Arc<Codec>> {
    Ok(Arc::new(Codec::for_topic(topic)?))
}
