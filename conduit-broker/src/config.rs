//! Broker and topic configuration.
//!
//! Configuration is a TOML document with `[[brokers]]` and `[[topics]]`
//! tables:
//!
//! ```toml
//! [[brokers]]
//! id = "local"
//! type = "kafka"
//! parameters = { "bootstrap.servers" = "localhost:9092" }
//!
//! [[topics]]
//! name = "orders"
//! broker = "local"
//! subscription = "billing"
//! offset_reset = "earliest"
//! timeout = "10s"
//! ```
//!
//! [`BrokerConfig::resolve`] validates it and yields the immutable
//! [`Broker`] and [`Topic`] values handed to
//! [`BrokerService`](crate::BrokerService).

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::broker::{Broker, BrokerType, to_identifier};
use crate::error::{Error, Result};
use crate::topic::{
    DEFAULT_MAX_POLL_RECORDS, DEFAULT_SUBSCRIPTION, DEFAULT_TIMEOUT, Format, OffsetResetStrategy,
    Topic,
};

/// Brokers and topics known to the application.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default)]
    pub brokers: Vec<BrokerEntry>,

    #[serde(default)]
    pub topics: Vec<TopicEntry>,
}

/// One `[[brokers]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerEntry {
    pub id: String,

    #[serde(rename = "type")]
    pub broker_type: BrokerType,

    /// Display name; defaults to the capitalized id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Passed to the backend client untouched.
    #[serde(default)]
    pub parameters: BTreeMap<String, String>,
}

/// One `[[topics]]` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TopicEntry {
    pub name: String,

    /// Id of the owning broker.
    pub broker: String,

    #[serde(default = "default_subscription")]
    pub subscription: String,

    /// Client id; generated when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,

    #[serde(default)]
    pub format: Format,

    #[serde(default)]
    pub offset_reset: OffsetResetStrategy,

    #[serde(default)]
    pub auto_commit: bool,

    #[serde(default = "default_max_poll_records")]
    pub max_poll_records: usize,

    /// Timeout for backend requests.
    #[serde(default = "default_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Avro schema (JSON text), required when `format = "avro"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avro_schema: Option<String>,
}

fn default_subscription() -> String {
    DEFAULT_SUBSCRIPTION.to_string()
}

fn default_max_poll_records() -> usize {
    DEFAULT_MAX_POLL_RECORDS
}

fn default_timeout() -> Duration {
    DEFAULT_TIMEOUT
}

impl TopicEntry {
    /// A topic entry with default settings.
    #[must_use]
    pub fn new(broker: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            broker: broker.into(),
            subscription: default_subscription(),
            client_id: None,
            format: Format::default(),
            offset_reset: OffsetResetStrategy::default(),
            auto_commit: false,
            max_poll_records: default_max_poll_records(),
            timeout: default_timeout(),
            avro_schema: None,
        }
    }
}

/// Validated brokers and topics.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub brokers: Vec<Arc<Broker>>,
    pub topics: Vec<Arc<Topic>>,
}

impl BrokerConfig {
    /// Default location: `<config dir>/conduit/brokers.toml`.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|d| d.join("conduit").join("brokers.toml"))
            .unwrap_or_else(|| PathBuf::from("brokers.toml"))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Load from [`default_path`](Self::default_path); a missing file yields
    /// an empty configuration.
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "no broker configuration found");
            return Ok(Self::default());
        }
        Self::load(&path)
    }

    /// Validate cross references and ranges and build the runtime values.
    pub fn resolve(&self) -> Result<ResolvedConfig> {
        let mut brokers: HashMap<String, Arc<Broker>> = HashMap::new();
        let mut resolved = ResolvedConfig::default();

        for entry in &self.brokers {
            if to_identifier(&entry.id).is_empty() {
                return Err(Error::Config("broker id must not be empty".to_string()));
            }
            let mut broker =
                Broker::new(entry.broker_type, &entry.id).with_parameters(entry.parameters.clone());
            if let Some(name) = &entry.name {
                broker = broker.with_name(name.clone());
            }
            let broker = Arc::new(broker);
            if brokers
                .insert(broker.id().to_string(), Arc::clone(&broker))
                .is_some()
            {
                return Err(Error::Config(format!(
                    "broker '{}' is declared more than once",
                    broker.id()
                )));
            }
            resolved.brokers.push(broker);
        }

        let mut topic_ids = HashSet::new();
        for entry in &self.topics {
            let broker = brokers.get(&to_identifier(&entry.broker)).ok_or_else(|| {
                Error::Config(format!(
                    "topic '{}' references unknown broker '{}'",
                    entry.name, entry.broker
                ))
            })?;
            let topic = Arc::new(entry.to_topic(Arc::clone(broker))?);
            if !topic_ids.insert(topic.id().to_string()) {
                return Err(Error::Config(format!(
                    "topic {} is declared more than once",
                    topic.describe()
                )));
            }
            resolved.topics.push(topic);
        }

        Ok(resolved)
    }
}

impl TopicEntry {
    fn to_topic(&self, broker: Arc<Broker>) -> Result<Topic> {
        if self.name.trim().is_empty() {
            return Err(Error::Config(format!(
                "topic on broker '{}' has an empty name",
                broker.id()
            )));
        }
        if self.max_poll_records == 0 {
            return Err(Error::Config(format!(
                "topic '{}': max_poll_records must be at least 1",
                self.name
            )));
        }
        if self.timeout.is_zero() {
            return Err(Error::Config(format!(
                "topic '{}': timeout must be positive",
                self.name
            )));
        }
        if self.format == Format::Avro && self.avro_schema.is_none() {
            return Err(Error::Config(format!(
                "topic '{}' uses the AVRO format but declares no schema",
                self.name
            )));
        }

        let mut topic = Topic::new(broker, self.name.clone())
            .with_subscription(self.subscription.clone())
            .with_format(self.format)
            .with_offset_reset_strategy(self.offset_reset)
            .with_auto_commit(self.auto_commit)
            .with_max_poll_records(self.max_poll_records)
            .with_timeout(self.timeout);
        if let Some(client_id) = &self.client_id {
            topic = topic.with_client_id(client_id.clone());
        }
        if let Some(schema) = &self.avro_schema {
            topic = topic.with_avro_schema(schema.clone());
        }
        Ok(topic)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    const SAMPLE: &str = r#"
        [[brokers]]
        id = "local-kafka"
        type = "kafka"
        parameters = { "bootstrap.servers" = "localhost:9092" }

        [[brokers]]
        id = "events"
        type = "pulsar"
        name = "Event Bus"

        [[topics]]
        name = "orders"
        broker = "local-kafka"
        subscription = "billing"
        offset_reset = "earliest"
        auto_commit = true
        max_poll_records = 50
        timeout = "10s"

        [[topics]]
        name = "audit"
        broker = "events"
        format = "raw"
    "#;

    #[test]
    fn parse_and_resolve_sample() {
        let config = BrokerConfig::from_toml_str(SAMPLE).unwrap();
        let resolved = config.resolve().unwrap();

        assert_eq!(resolved.brokers.len(), 2);
        let kafka = &resolved.brokers[0];
        assert_eq!(kafka.id(), "local_kafka");
        assert_eq!(kafka.name(), "Local Kafka");
        assert_eq!(kafka.parameter("bootstrap.servers"), Some("localhost:9092"));
        assert_eq!(resolved.brokers[1].name(), "Event Bus");

        let orders = &resolved.topics[0];
        assert_eq!(orders.id(), "local_kafka_orders");
        assert_eq!(orders.subscription(), "billing");
        assert_eq!(orders.offset_reset_strategy(), OffsetResetStrategy::Earliest);
        assert!(orders.auto_commit());
        assert_eq!(orders.max_poll_records(), 50);
        assert_eq!(orders.timeout(), Duration::from_secs(10));

        let audit = &resolved.topics[1];
        assert_eq!(audit.format(), Format::Raw);
        assert_eq!(audit.subscription(), DEFAULT_SUBSCRIPTION);
        assert_eq!(audit.max_poll_records(), DEFAULT_MAX_POLL_RECORDS);
        assert_eq!(audit.timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn unknown_broker_reference_is_rejected() {
        let config = BrokerConfig {
            brokers: Vec::new(),
            topics: vec![TopicEntry::new("missing", "orders")],
        };
        let err = config.resolve().unwrap_err();
        assert!(err.to_string().contains("unknown broker 'missing'"));
    }

    #[test]
    fn zero_poll_records_is_rejected() {
        let mut entry = TopicEntry::new("local", "orders");
        entry.max_poll_records = 0;
        let config = BrokerConfig {
            brokers: vec![BrokerEntry {
                id: "local".into(),
                broker_type: BrokerType::Kafka,
                name: None,
                parameters: BTreeMap::new(),
            }],
            topics: vec![entry],
        };
        assert!(matches!(config.resolve(), Err(Error::Config(_))));
    }

    #[test]
    fn avro_topic_requires_schema() {
        let text = r#"
            [[brokers]]
            id = "local"
            type = "kafka"

            [[topics]]
            name = "orders"
            broker = "local"
            format = "avro"
        "#;
        let err = BrokerConfig::from_toml_str(text)
            .unwrap()
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("AVRO"));
    }

    #[test]
    fn duplicate_brokers_are_rejected() {
        let text = r#"
            [[brokers]]
            id = "local"
            type = "kafka"

            [[brokers]]
            id = "Local"
            type = "pulsar"
        "#;
        let err = BrokerConfig::from_toml_str(text)
            .unwrap()
            .resolve()
            .unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn unknown_broker_type_fails_to_parse() {
        let text = r#"
            [[brokers]]
            id = "local"
            type = "nats"
        "#;
        assert!(matches!(
            BrokerConfig::from_toml_str(text),
            Err(Error::Toml(_))
        ));
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();

        let config = BrokerConfig::load(file.path()).unwrap();
        assert_eq!(config.brokers.len(), 2);
        assert_eq!(config.topics.len(), 2);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = BrokerConfig::load(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn default_path_ends_with_conduit_file() {
        let path = BrokerConfig::default_path();
        assert!(path.ends_with("conduit/brokers.toml") || path.ends_with("brokers.toml"));
    }
}
