//! Broker connection descriptions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Kind of message broker behind a [`Broker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerType {
    /// Apache Kafka, a partitioned and offset-addressed log.
    Kafka,
    /// Apache Pulsar, subscription-based pub/sub.
    Pulsar,
    /// RabbitMQ.
    #[serde(rename = "rabbitmq")]
    RabbitMq,
}

impl std::fmt::Display for BrokerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Kafka => write!(f, "kafka"),
            Self::Pulsar => write!(f, "pulsar"),
            Self::RabbitMq => write!(f, "rabbitmq"),
        }
    }
}

impl std::str::FromStr for BrokerType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kafka" => Ok(Self::Kafka),
            "pulsar" => Ok(Self::Pulsar),
            "rabbitmq" => Ok(Self::RabbitMq),
            other => Err(crate::Error::Config(format!("unknown broker type '{other}'"))),
        }
    }
}

/// A broker connection: identity, kind and the parameters handed to the
/// backend client untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    id: String,
    broker_type: BrokerType,
    name: String,
    parameters: BTreeMap<String, String>,
}

impl Broker {
    /// Create a broker; the id is normalized and also becomes the display name.
    #[must_use]
    pub fn new(broker_type: BrokerType, id: &str) -> Self {
        Self {
            id: to_identifier(id),
            broker_type,
            name: capitalize_words(id),
            parameters: BTreeMap::new(),
        }
    }

    /// Set the display name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Add one client parameter.
    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    /// Add many client parameters.
    #[must_use]
    pub fn with_parameters<I, K, V>(mut self, parameters: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.parameters
            .extend(parameters.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn broker_type(&self) -> BrokerType {
        self.broker_type
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parameters passed through to the backend client.
    pub fn parameters(&self) -> &BTreeMap<String, String> {
        &self.parameters
    }

    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }
}

impl std::fmt::Display for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.id, self.broker_type)
    }
}

/// Normalize a free-form name into an identifier: lower-case ASCII
/// alphanumerics, everything else folded into single underscores.
pub(crate) fn to_identifier(value: &str) -> String {
    let mut id = String::with_capacity(value.len());
    for c in value.trim().chars() {
        if c.is_ascii_alphanumeric() {
            id.push(c.to_ascii_lowercase());
        } else if !id.ends_with('_') {
            id.push('_');
        }
    }
    id.trim_matches('_').to_string()
}

fn capitalize_words(value: &str) -> String {
    value
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identifier_is_normalized() {
        assert_eq!(to_identifier("Local Kafka"), "local_kafka");
        assert_eq!(to_identifier("orders.v1--eu"), "orders_v1_eu");
        assert_eq!(to_identifier("  _x_ "), "x");
    }

    #[test]
    fn broker_defaults_name_from_id() {
        let broker = Broker::new(BrokerType::Kafka, "local-kafka");
        assert_eq!(broker.id(), "local_kafka");
        assert_eq!(broker.name(), "Local Kafka");
    }

    #[test]
    fn broker_parameters_pass_through() {
        let broker = Broker::new(BrokerType::Pulsar, "events")
            .with_name("Events")
            .with_parameter("service.url", "pulsar://localhost:6650")
            .with_parameters([("a", "1"), ("b", "2")]);

        assert_eq!(broker.name(), "Events");
        assert_eq!(
            broker.parameter("service.url"),
            Some("pulsar://localhost:6650")
        );
        assert_eq!(broker.parameters().len(), 3);
    }

    #[test]
    fn broker_type_parses_case_insensitively() {
        assert_eq!("KAFKA".parse::<BrokerType>().unwrap(), BrokerType::Kafka);
        assert_eq!(
            "RabbitMQ".parse::<BrokerType>().unwrap(),
            BrokerType::RabbitMq
        );
        assert!("nats".parse::<BrokerType>().is_err());
    }

    #[test]
    fn broker_type_serializes_lowercase() {
        let json = serde_json::to_string(&BrokerType::RabbitMq).unwrap();
        assert_eq!(json, "\"rabbitmq\"");
    }
}
