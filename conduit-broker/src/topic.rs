//! Topic bindings.
//!
//! A [`Topic`] names a stream on a [`Broker`] together with how it is
//! consumed: subscription, client id, payload format, offset policy,
//! auto-commit and batch size. Topics are immutable; the `with_*` methods
//! return modified copies.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::{Broker, to_identifier};

/// Default subscription (consumer group) name.
pub const DEFAULT_SUBSCRIPTION: &str = "default";

/// Default maximum number of events returned by one poll.
pub const DEFAULT_MAX_POLL_RECORDS: usize = 500;

/// Default timeout for backend requests.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Encoding of event keys and values on the wire.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Strings or byte arrays passed through untouched.
    Raw,
    /// JSON documents.
    #[default]
    Json,
    /// Avro datums written with the topic's schema.
    Avro,
}

/// Where a consumer starts reading a partition it has never read before.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OffsetResetStrategy {
    /// Resume from the position committed for the subscription.
    #[default]
    Current,
    /// Start from the most recent events.
    Latest,
    /// Start from the oldest retained events.
    Earliest,
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Raw => write!(f, "raw"),
            Self::Json => write!(f, "json"),
            Self::Avro => write!(f, "avro"),
        }
    }
}

impl std::fmt::Display for OffsetResetStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Current => write!(f, "current"),
            Self::Latest => write!(f, "latest"),
            Self::Earliest => write!(f, "earliest"),
        }
    }
}

/// Health of a topic as seen by one of its consumers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TopicHealth {
    /// Events are consumed and published.
    Healthy,
    /// Healthy, but the consumer is behind.
    Late,
    /// The topic cannot be processed due to errors.
    Faulty,
}

/// A topic on a broker and the settings used to consume or produce it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    id: String,
    name: String,
    broker: Arc<Broker>,
    subscription: String,
    client_id: String,
    format: Format,
    offset_reset_strategy: OffsetResetStrategy,
    auto_commit: bool,
    max_poll_records: usize,
    timeout: Duration,
    avro_schema: Option<String>,
}

impl Topic {
    /// Create a topic with default settings.
    #[must_use]
    pub fn new(broker: Arc<Broker>, name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            id: to_identifier(&format!("{}_{}", broker.id(), name)),
            name,
            broker,
            subscription: DEFAULT_SUBSCRIPTION.to_string(),
            client_id: generate_client_id(),
            format: Format::default(),
            offset_reset_strategy: OffsetResetStrategy::default(),
            auto_commit: false,
            max_poll_records: DEFAULT_MAX_POLL_RECORDS,
            timeout: DEFAULT_TIMEOUT,
            avro_schema: None,
        }
    }

    #[must_use]
    pub fn with_subscription(mut self, subscription: impl Into<String>) -> Self {
        self.subscription = subscription.into();
        self
    }

    #[must_use]
    pub fn with_client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = client_id.into();
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    #[must_use]
    pub fn with_offset_reset_strategy(mut self, strategy: OffsetResetStrategy) -> Self {
        self.offset_reset_strategy = strategy;
        self
    }

    #[must_use]
    pub fn with_auto_commit(mut self, auto_commit: bool) -> Self {
        self.auto_commit = auto_commit;
        self
    }

    /// Set the batch size; values below one are raised to one.
    #[must_use]
    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records.max(1);
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Attach the Avro schema (JSON schema text) used by [`Format::Avro`].
    #[must_use]
    pub fn with_avro_schema(mut self, schema: impl Into<String>) -> Self {
        self.avro_schema = Some(schema.into());
        self
    }

    /// Identifier derived from the broker id and topic name.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn broker(&self) -> &Arc<Broker> {
        &self.broker
    }

    /// Subscription (consumer group) of consumers bound to this topic.
    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn format(&self) -> Format {
        self.format
    }

    pub fn offset_reset_strategy(&self) -> OffsetResetStrategy {
        self.offset_reset_strategy
    }

    pub fn auto_commit(&self) -> bool {
        self.auto_commit
    }

    pub fn max_poll_records(&self) -> usize {
        self.max_poll_records
    }

    /// Timeout for backend requests (connect, commit, flush).
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn avro_schema(&self) -> Option<&str> {
        self.avro_schema.as_deref()
    }

    /// Human-readable description used in log lines and error messages.
    pub fn describe(&self) -> String {
        format!("'{}' on broker '{}'", self.name, self.broker.name())
    }
}

impl std::fmt::Display for Topic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.describe())
    }
}

fn generate_client_id() -> String {
    let uuid = uuid::Uuid::new_v4().simple().to_string();
    format!("conduit-{}", &uuid[..12])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerType;

    fn broker() -> Arc<Broker> {
        Arc::new(Broker::new(BrokerType::Kafka, "local").with_name("Local Kafka"))
    }

    #[test]
    fn topic_defaults() {
        let topic = Topic::new(broker(), "orders");

        assert_eq!(topic.id(), "local_orders");
        assert_eq!(topic.subscription(), DEFAULT_SUBSCRIPTION);
        assert_eq!(topic.format(), Format::Json);
        assert_eq!(topic.offset_reset_strategy(), OffsetResetStrategy::Current);
        assert!(!topic.auto_commit());
        assert_eq!(topic.max_poll_records(), 500);
        assert_eq!(topic.timeout(), Duration::from_secs(30));
        assert!(topic.client_id().starts_with("conduit-"));
    }

    #[test]
    fn with_methods_return_modified_copies() {
        let base = Topic::new(broker(), "orders");
        let copy = base
            .clone()
            .with_subscription("billing")
            .with_client_id("billing-1")
            .with_format(Format::Raw)
            .with_offset_reset_strategy(OffsetResetStrategy::Earliest)
            .with_auto_commit(true)
            .with_max_poll_records(0);

        assert_eq!(base.subscription(), DEFAULT_SUBSCRIPTION);
        assert_eq!(copy.subscription(), "billing");
        assert_eq!(copy.client_id(), "billing-1");
        assert_eq!(copy.format(), Format::Raw);
        assert_eq!(copy.offset_reset_strategy(), OffsetResetStrategy::Earliest);
        assert!(copy.auto_commit());
        assert_eq!(copy.max_poll_records(), 1);
        assert_eq!(copy.id(), base.id());
    }

    #[test]
    fn describe_names_topic_and_broker() {
        let topic = Topic::new(broker(), "orders");
        assert_eq!(topic.describe(), "'orders' on broker 'Local Kafka'");
        assert_eq!(topic.to_string(), topic.describe());
    }

    #[test]
    fn client_ids_are_unique() {
        let a = Topic::new(broker(), "orders");
        let b = Topic::new(broker(), "orders");
        assert_ne!(a.client_id(), b.client_id());
    }
}
