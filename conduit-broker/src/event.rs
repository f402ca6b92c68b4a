//! Delivered events and their positions.
//!
//! Identity is derived at construction: a [`Partition`] is identified by
//! `topic.id + "_" + partition`, an [`Event`] by its partition and offset.
//! Both adapters map their native positions onto these types, so partitions
//! can be used as map keys regardless of the backend.

use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::broker::to_identifier;
use crate::codec::Codec;
use crate::error::Result;
use crate::topic::Topic;

/// An ordered sub-stream of a topic.
#[derive(Debug, Clone)]
pub struct Partition {
    id: String,
    topic: Arc<Topic>,
    value: i32,
}

impl Partition {
    #[must_use]
    pub fn new(topic: Arc<Topic>, value: i32) -> Self {
        Self {
            id: to_identifier(&format!("{}_{}", topic.id(), value)),
            topic,
            value,
        }
    }

    /// Identity, stable for the lifetime of the process.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    /// The backend's partition number.
    pub fn value(&self) -> i32 {
        self.value
    }
}

impl PartialEq for Partition {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Partition {}

impl Hash for Partition {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl PartialOrd for Partition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Partition {
    fn cmp(&self, other: &Self) -> Ordering {
        self.id.cmp(&other.id)
    }
}

impl std::fmt::Display for Partition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.topic.name(), self.value)
    }
}

impl Serialize for Partition {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.id)
    }
}

/// The durable coordinate of one event.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    position: i64,
}

impl PartitionOffset {
    #[must_use]
    pub fn new(partition: Partition, position: i64) -> Self {
        Self {
            partition,
            position,
        }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn position(&self) -> i64 {
        self.position
    }
}

impl std::fmt::Display for PartitionOffset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.partition.id(), self.position)
    }
}

/// An undecoded record as handed over by a backend adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub partition: i32,
    pub position: i64,
    pub key: Option<Vec<u8>>,
    pub payload: Vec<u8>,
    pub timestamp: Option<DateTime<Utc>>,
}

/// One delivered message. Created only while translating a poll batch and
/// never mutated afterwards.
#[derive(Debug, Clone)]
pub struct Event<K, V> {
    id: String,
    key: Option<K>,
    value: V,
    offset: PartitionOffset,
    timestamp: DateTime<Utc>,
}

impl<K, V> Event<K, V> {
    #[must_use]
    pub fn new(
        offset: PartitionOffset,
        key: Option<K>,
        value: V,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: offset.to_string(),
            key,
            value,
            offset,
            timestamp,
        }
    }

    /// Identity derived from partition and offset.
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> Option<&K> {
        self.key.as_ref()
    }

    pub fn value(&self) -> &V {
        &self.value
    }

    /// Consume the event, keeping only its value.
    pub fn into_value(self) -> V {
        self.value
    }

    pub fn offset(&self) -> &PartitionOffset {
        &self.offset
    }

    pub fn partition(&self) -> &Partition {
        self.offset.partition()
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

impl<K, V> Event<K, V>
where
    K: serde::de::DeserializeOwned,
    V: serde::de::DeserializeOwned,
{
    /// Decode a raw record of `topic` with `codec`.
    pub fn decode(topic: &Arc<Topic>, codec: &Codec, record: RawRecord) -> Result<Self> {
        let key = record.key.as_deref().map(|k| codec.decode(k)).transpose()?;
        let value = codec.decode(&record.payload)?;
        let partition = Partition::new(Arc::clone(topic), record.partition);
        Ok(Self::new(
            PartitionOffset::new(partition, record.position),
            key,
            value,
            record.timestamp.unwrap_or_else(Utc::now),
        ))
    }
}
