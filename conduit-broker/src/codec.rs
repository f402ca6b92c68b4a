//! Payload codecs for the closed set of topic formats.
//!
//! A [`Codec`] is chosen once per topic from its [`Format`]. Backend clients
//! that build their own (de)serializers find the codec for their topic in a
//! [`CodecRegistry`] owned by the adapter, keyed by a [`CodecToken`] that
//! travels through the client configuration.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::sync::lock;
use crate::topic::{Format, Topic};

/// Encodes and decodes keys and values of one topic.
#[derive(Debug, Clone)]
pub enum Codec {
    /// Strings and byte arrays pass through untouched.
    Raw,
    /// JSON documents.
    Json,
    /// Avro datums written with a fixed schema.
    Avro(Box<apache_avro::Schema>),
}

impl Codec {
    /// Select the codec for a topic's format.
    pub fn for_topic(topic: &Topic) -> Result<Self> {
        match topic.format() {
            Format::Raw => Ok(Self::Raw),
            Format::Json => Ok(Self::Json),
            Format::Avro => {
                let text = topic.avro_schema().ok_or_else(|| {
                    Error::Config(format!(
                        "topic {} uses the AVRO format but declares no schema",
                        topic.describe()
                    ))
                })?;
                let schema = apache_avro::Schema::parse_str(text).map_err(|e| {
                    Error::Config(format!(
                        "invalid AVRO schema for topic {}: {e}",
                        topic.describe()
                    ))
                })?;
                Ok(Self::Avro(Box::new(schema)))
            }
        }
    }

    pub fn format(&self) -> Format {
        match self {
            Self::Raw => Format::Raw,
            Self::Json => Format::Json,
            Self::Avro(_) => Format::Avro,
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Raw => encode_raw(serde_json::to_value(value)?),
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::Avro(schema) => {
                let value = apache_avro::to_value(value)?;
                Ok(apache_avro::to_avro_datum(schema, value)?)
            }
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Raw => decode_raw(bytes),
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Avro(schema) => {
                let mut reader = bytes;
                let value = apache_avro::from_avro_datum(schema, &mut reader, None)?;
                Ok(apache_avro::from_value(&value)?)
            }
        }
    }
}

fn encode_raw(value: Value) -> Result<Vec<u8>> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::String(s) => Ok(s.into_bytes()),
        Value::Array(items) => items
            .iter()
            .map(|item| item.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<u8>>>()
            .ok_or_else(|| Error::Codec("RAW payload arrays must contain bytes".to_string())),
        other => Err(Error::Codec(format!(
            "RAW payloads must be strings or byte arrays, got {other}"
        ))),
    }
}

fn decode_raw<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    if let Ok(text) = std::str::from_utf8(bytes)
        && let Ok(value) = serde_json::from_value(Value::String(text.to_string()))
    {
        return Ok(value);
    }
    let array = Value::Array(bytes.iter().map(|b| Value::from(*b)).collect());
    serde_json::from_value(array)
        .map_err(|e| Error::Codec(format!("RAW payload does not fit the target type: {e}")))
}

/// Handle to a codec registered in a [`CodecRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CodecToken(u64);

impl CodecToken {
    /// Parse a token previously rendered with `to_string`.
    pub fn parse(value: &str) -> Option<Self> {
        value.parse().ok().map(Self)
    }
}

impl std::fmt::Display for CodecToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Adapter-owned lookup from construction tokens to codecs.
#[derive(Debug, Default)]
pub struct CodecRegistry {
    next: AtomicU64,
    codecs: Mutex<HashMap<CodecToken, Arc<Codec>>>,
}

impl CodecRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, codec: Codec) -> CodecToken {
        let token = CodecToken(self.next.fetch_add(1, Ordering::Relaxed));
        lock(&self.codecs).insert(token, Arc::new(codec));
        token
    }

    pub fn resolve(&self, token: CodecToken) -> Option<Arc<Codec>> {
        lock(&self.codecs).get(&token).cloned()
    }

    pub fn unregister(&self, token: CodecToken) {
        lock(&self.codecs).remove(&token);
    }

    pub fn len(&self) -> usize {
        lock(&self.codecs).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerType};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Order {
        id: String,
        amount: i64,
    }

    const ORDER_SCHEMA: &str = r#"{
        "type": "record",
        "name": "Order",
        "fields": [
            {"name": "id", "type": "string"},
            {"name": "amount", "type": "long"}
        ]
    }"#;

    fn topic(format: Format) -> Topic {
        let broker = Arc::new(Broker::new(BrokerType::Kafka, "local"));
        Topic::new(broker, "orders").with_format(format)
    }

    #[test]
    fn json_codec_handles_structs() {
        let codec = Codec::for_topic(&topic(Format::Json)).unwrap();
        let order = Order {
            id: "o-1".into(),
            amount: 12,
        };
        let bytes = codec.encode(&order).unwrap();
        assert_eq!(bytes, br#"{"id":"o-1","amount":12}"#);
        let back: Order = codec.decode(&bytes).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn raw_codec_passes_strings_through() {
        let codec = Codec::Raw;
        assert_eq!(codec.encode("hello").unwrap(), b"hello");
        let text: String = codec.decode(b"hello").unwrap();
        assert_eq!(text, "hello");
    }

    #[test]
    fn raw_codec_passes_bytes_through() {
        let codec = Codec::Raw;
        let payload = vec![0u8, 159, 146, 150];
        assert_eq!(codec.encode(&payload).unwrap(), payload);
        let back: Vec<u8> = codec.decode(&payload).unwrap();
        assert_eq!(back, payload);
        // Valid UTF-8 still decodes into bytes when bytes are requested.
        let ascii: Vec<u8> = codec.decode(b"abc").unwrap();
        assert_eq!(ascii, b"abc");
    }

    #[test]
    fn raw_codec_rejects_structured_values() {
        let err = Codec::Raw
            .encode(&Order {
                id: "o-1".into(),
                amount: 1,
            })
            .unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn avro_codec_uses_topic_schema() {
        let codec = Codec::for_topic(&topic(Format::Avro).with_avro_schema(ORDER_SCHEMA)).unwrap();
        assert_eq!(codec.format(), Format::Avro);

        let order = Order {
            id: "o-2".into(),
            amount: 99,
        };
        let bytes = codec.encode(&order).unwrap();
        let back: Order = codec.decode(&bytes).unwrap();
        assert_eq!(back, order);
    }

    #[test]
    fn avro_requires_schema() {
        let err = Codec::for_topic(&topic(Format::Avro)).unwrap_err();
        assert!(err.to_string().contains("'orders'"));
    }

    #[test]
    fn registry_resolves_by_token() {
        let registry = CodecRegistry::new();
        let json = registry.register(Codec::Json);
        let raw = registry.register(Codec::Raw);

        assert_ne!(json, raw);
        assert_eq!(registry.resolve(json).unwrap().format(), Format::Json);
        assert_eq!(
            registry
                .resolve(CodecToken::parse(&raw.to_string()).unwrap())
                .unwrap()
                .format(),
            Format::Raw
        );

        registry.unregister(json);
        assert!(registry.resolve(json).is_none());
        assert_eq!(registry.len(), 1);
    }
}
