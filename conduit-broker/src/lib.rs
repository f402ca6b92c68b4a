//! Uniform producer/consumer API over message brokers.
//!
//! Applications describe brokers and topics once and then consume or produce
//! typed events without caring whether the backend is a partitioned log
//! (Kafka-like) or a subscription system (Pulsar-like).
//!
//! # Key Types
//!
//! - [`BrokerService`] - Catalog of brokers and topics; creates consumers and
//!   producers through the first [`Provider`] that supports a broker
//! - [`Registry`] - Live consumers and producers, addressable by id
//! - [`BrokerConsumer`] - Polls, commits and rolls back decoded [`Event`]s
//! - [`BrokerProducer`] - Sends, commits and rolls back encoded events
//! - [`log::LogProvider`] - Partitioned-log adapter
//! - [`subscription::SubscriptionProvider`] - Subscription adapter
//!
//! Both adapters ship an in-process backend ([`log::MemoryLog`],
//! [`subscription::MemoryPubSub`]). The `kafka` and `pulsar` features add the
//! network clients.

pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod error;
pub mod event;
pub mod log;
pub mod producer;
pub mod provider;
pub mod service;
pub mod status;
pub mod subscription;
mod sync;
pub mod topic;

// Re-exports
pub use broker::{Broker, BrokerType};
pub use codec::{Codec, CodecRegistry, CodecToken};
pub use config::{BrokerConfig, BrokerEntry, ResolvedConfig, TopicEntry};
pub use consumer::{BrokerConsumer, ConsumerInfo, ConsumerSnapshot};
pub use error::{Error, Result};
pub use event::{Event, Partition, PartitionOffset};
pub use producer::{BrokerProducer, ProducerInfo, ProducerSnapshot};
pub use provider::{Provider, default_providers};
pub use service::{BrokerService, Registry};
pub use status::{ConsumerStatus, ProducerStatus};
pub use topic::{Format, OffsetResetStrategy, Topic, TopicHealth};
