//! Partitioned-log adapter (Kafka-like backends).
//!
//! The adapter translates a [`Topic`] into string properties for the backend
//! client and talks to the client through three seams:
//!
//! - [`LogConnector`] opens consumer and producer connections
//! - [`LogClient`] is one consumer connection (poll, commit, lag)
//! - [`LogSink`] is one producer connection (send, flush, transactions)
//!
//! Partition rebalances are reported through [`RebalanceListener`] on the
//! client's own thread; [`PartitionAssignment`] is the listener used by
//! [`LogConsumer`].
//!
//! # Codec injection
//!
//! Log clients build their (de)serializers from configuration alone. The
//! adapter registers the topic's codec in its [`CodecRegistry`] and puts the
//! returned token into the client configuration under
//! [`CODEC_TOKEN_KEY`]; the client resolves it with [`codec_from_config`].
//! The token is unregistered when the connection is released.
//!
//! [`MemoryLog`] is a complete in-process backend; the `kafka` feature adds
//! [`kafka::KafkaConnector`] on top of librdkafka.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::{Broker, BrokerType};
use crate::codec::{Codec, CodecRegistry, CodecToken};
use crate::consumer::ConsumerBackend;
use crate::error::{Error, Result};
use crate::event::RawRecord;
use crate::producer::ProducerBackend;
use crate::provider::Provider;
use crate::topic::{OffsetResetStrategy, Topic};

mod assignment;
mod consumer;
pub mod memory;
mod producer;

#[cfg(feature = "kafka")]
pub mod kafka;

pub use assignment::PartitionAssignment;
pub use consumer::LogConsumer;
pub use memory::MemoryLog;
pub use producer::LogProducer;

/// String properties handed to a log client.
pub type ClientConfig = BTreeMap<String, String>;

/// Property carrying the codec token.
pub const CODEC_TOKEN_KEY: &str = "conduit.codec.token";

/// (De)serializer name announcing that the codec comes from the token.
pub const CODEC_CLASS: &str = "conduit.codec";

/// Where to move a partition's read position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekTo {
    Beginning,
    End,
}

/// Moves read positions; handed to [`RebalanceListener::on_assigned`].
pub trait PartitionSeeker {
    fn seek(&self, partition: i32, to: SeekTo) -> Result<()>;
}

/// Receives partition rebalances. Called on the client's thread, possibly
/// while the owner is polling.
pub trait RebalanceListener: Send + Sync {
    fn on_assigned(&self, partitions: &[i32], seeker: &dyn PartitionSeeker);

    fn on_revoked(&self, partitions: &[i32]);

    /// Partitions taken away without an orderly revoke.
    fn on_lost(&self, partitions: &[i32]) {
        self.on_revoked(partitions);
    }
}

/// Opens connections to one log backend.
#[async_trait]
pub trait LogConnector: Send + Sync {
    async fn connect_consumer(
        &self,
        config: &ClientConfig,
        codecs: Arc<CodecRegistry>,
        topic: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<Box<dyn LogClient>>;

    async fn connect_producer(
        &self,
        config: &ClientConfig,
        codecs: Arc<CodecRegistry>,
        topic: &str,
    ) -> Result<Box<dyn LogSink>>;
}

/// One consumer connection.
#[async_trait]
pub trait LogClient: Send {
    /// Codec resolved from the client configuration.
    fn codec(&self) -> Arc<Codec>;

    /// Fetch up to `max` records from the assigned partitions.
    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<RawRecord>>;

    /// Synchronously commit the consumed positions.
    async fn commit(&mut self) -> Result<()>;

    /// Records between the read position and the end of each partition.
    fn lag(&self, partitions: &[i32]) -> HashMap<i32, u64>;

    async fn close(&mut self) -> Result<()>;
}

/// One producer connection.
#[async_trait]
pub trait LogSink: Send {
    fn codec(&self) -> Arc<Codec>;

    async fn send(&mut self, key: Option<Vec<u8>>, payload: Vec<u8>) -> Result<()>;

    async fn flush(&mut self, timeout: Duration) -> Result<()>;

    async fn begin_transaction(&mut self) -> Result<()>;

    async fn commit_transaction(&mut self, timeout: Duration) -> Result<()>;

    async fn abort_transaction(&mut self, timeout: Duration) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Resolve the codec announced in a client configuration.
pub fn codec_from_config(config: &ClientConfig, codecs: &CodecRegistry) -> Result<Arc<Codec>> {
    let raw = config
        .get(CODEC_TOKEN_KEY)
        .ok_or_else(|| Error::Config(format!("client configuration lacks '{CODEC_TOKEN_KEY}'")))?;
    let token = CodecToken::parse(raw)
        .ok_or_else(|| Error::Config(format!("invalid codec token '{raw}'")))?;
    codecs
        .resolve(token)
        .ok_or_else(|| Error::Config(format!("codec token {token} is not registered")))
}

/// Properties for a consumer of `topic`.
pub fn consumer_config(topic: &Topic, token: CodecToken) -> ClientConfig {
    let mut config = topic.broker().parameters().clone();
    config.insert("group.id".into(), topic.subscription().to_string());
    config.insert("client.id".into(), topic.client_id().to_string());
    config.insert(
        "max.poll.records".into(),
        topic.max_poll_records().to_string(),
    );
    config.insert(
        "enable.auto.commit".into(),
        topic.auto_commit().to_string(),
    );
    let reset = match topic.offset_reset_strategy() {
        OffsetResetStrategy::Earliest => "earliest",
        OffsetResetStrategy::Latest | OffsetResetStrategy::Current => "latest",
    };
    config.insert("auto.offset.reset".into(), reset.to_string());
    config.insert("key.deserializer".into(), CODEC_CLASS.to_string());
    config.insert("value.deserializer".into(), CODEC_CLASS.to_string());
    config.insert(CODEC_TOKEN_KEY.into(), token.to_string());
    config
}

/// Properties for a producer of `topic`. Without auto-commit the producer is
/// transactional, keyed by the client id.
pub fn producer_config(topic: &Topic, token: CodecToken) -> ClientConfig {
    let mut config = topic.broker().parameters().clone();
    config.insert("client.id".into(), topic.client_id().to_string());
    config.insert("compression.type".into(), "snappy".to_string());
    config.insert("key.serializer".into(), CODEC_CLASS.to_string());
    config.insert("value.serializer".into(), CODEC_CLASS.to_string());
    config.insert(CODEC_TOKEN_KEY.into(), token.to_string());
    if !topic.auto_commit() {
        config.insert("transactional.id".into(), topic.client_id().to_string());
        config.insert("enable.idempotence".into(), "true".to_string());
    }
    config
}

/// Provider for [`BrokerType::Kafka`] brokers.
pub struct LogProvider {
    connector: Arc<dyn LogConnector>,
    codecs: Arc<CodecRegistry>,
}

impl LogProvider {
    pub fn new(connector: Arc<dyn LogConnector>) -> Self {
        Self {
            connector,
            codecs: Arc::new(CodecRegistry::new()),
        }
    }

    /// Codecs of the live connections.
    pub fn codecs(&self) -> &Arc<CodecRegistry> {
        &self.codecs
    }
}

impl Provider for LogProvider {
    fn name(&self) -> &str {
        "log"
    }

    fn supports(&self, broker: &Broker) -> bool {
        broker.broker_type() == BrokerType::Kafka
    }

    fn create_consumer(&self, topic: &Arc<Topic>) -> Result<Box<dyn ConsumerBackend>> {
        Ok(Box::new(LogConsumer::new(
            Arc::clone(topic),
            Arc::clone(&self.connector),
            Arc::clone(&self.codecs),
        )))
    }

    fn create_producer(&self, topic: &Arc<Topic>) -> Result<Box<dyn ProducerBackend>> {
        Ok(Box::new(LogProducer::new(
            Arc::clone(topic),
            Arc::clone(&self.connector),
            Arc::clone(&self.codecs),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Format;

    fn topic() -> Topic {
        let broker = Arc::new(
            Broker::new(BrokerType::Kafka, "local")
                .with_parameter("bootstrap.servers", "localhost:9092"),
        );
        Topic::new(broker, "orders")
            .with_subscription("billing")
            .with_client_id("billing-1")
            .with_max_poll_records(20)
    }

    #[test]
    fn consumer_config_maps_topic_settings() {
        let codecs = CodecRegistry::new();
        let token = codecs.register(Codec::Json);
        let topic = topic().with_offset_reset_strategy(OffsetResetStrategy::Earliest);

        let config = consumer_config(&topic, token);

        assert_eq!(config["bootstrap.servers"], "localhost:9092");
        assert_eq!(config["group.id"], "billing");
        assert_eq!(config["client.id"], "billing-1");
        assert_eq!(config["max.poll.records"], "20");
        assert_eq!(config["enable.auto.commit"], "false");
        assert_eq!(config["auto.offset.reset"], "earliest");
        assert_eq!(config["value.deserializer"], CODEC_CLASS);
        assert_eq!(config[CODEC_TOKEN_KEY], token.to_string());
    }

    #[test]
    fn producer_config_is_transactional_without_auto_commit() {
        let codecs = CodecRegistry::new();
        let token = codecs.register(Codec::Json);

        let config = producer_config(&topic(), token);
        assert_eq!(config["compression.type"], "snappy");
        assert_eq!(config["transactional.id"], "billing-1");

        let config = producer_config(&topic().with_auto_commit(true), token);
        assert!(!config.contains_key("transactional.id"));
    }

    #[test]
    fn codec_is_resolved_through_token() {
        let codecs = CodecRegistry::new();
        let json = codecs.register(Codec::Json);
        let raw = codecs.register(Codec::Raw);

        let config = consumer_config(&topic(), raw);
        assert_eq!(codec_from_config(&config, &codecs).unwrap().format(), Format::Raw);

        let config = consumer_config(&topic(), json);
        assert_eq!(
            codec_from_config(&config, &codecs).unwrap().format(),
            Format::Json
        );

        codecs.unregister(json);
        assert!(matches!(
            codec_from_config(&config, &codecs),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn log_provider_supports_kafka_only() {
        let provider = LogProvider::new(Arc::new(MemoryLog::new()));
        assert!(provider.supports(&Broker::new(BrokerType::Kafka, "a")));
        assert!(!provider.supports(&Broker::new(BrokerType::Pulsar, "b")));
        assert!(!provider.supports(&Broker::new(BrokerType::RabbitMq, "c")));
    }
}
