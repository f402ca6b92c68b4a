//! Pulsar-backed [`SubscriptionConnector`].
//!
//! Clients are shared per broker id and service URL. The service URL comes
//! from the broker's `service.url` parameter; a broker whose URL changed gets
//! a fresh client.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use futures_util::StreamExt;
use pulsar::consumer::{ConsumerOptions, InitialPosition as PulsarPosition};
use pulsar::producer::{Message as OutgoingMessage, SendFuture};
use pulsar::proto::MessageIdData;
use pulsar::{Consumer, Producer, Pulsar, SubType, TokioExecutor};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{
    InitialPosition, MessageId, ReceivedMessage, SubscriptionClient, SubscriptionConnector,
    SubscriptionOptions, SubscriptionSink,
};
use crate::broker::Broker;
use crate::error::{Error, Result};

/// Broker parameter holding the service URL.
pub const SERVICE_URL: &str = "service.url";

const DEFAULT_SERVICE_URL: &str = "pulsar://localhost:6650";

/// Clients by broker id, each with the URL it was built for.
struct ClientCache<C> {
    entries: HashMap<String, (String, C)>,
}

impl<C> Default for ClientCache<C> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }
}

impl<C: Clone> ClientCache<C> {
    fn get(&self, broker: &str, url: &str) -> Option<C> {
        self.entries
            .get(broker)
            .filter(|(cached_url, _)| cached_url == url)
            .map(|(_, client)| client.clone())
    }

    /// Store `client`, replacing one built for another URL. Returns whether
    /// a stale client was dropped.
    fn insert(&mut self, broker: &str, url: &str, client: C) -> bool {
        self.entries
            .insert(broker.to_string(), (url.to_string(), client))
            .is_some_and(|(previous, _)| previous != url)
    }
}

/// Opens Pulsar consumers and producers.
#[derive(Default)]
pub struct PulsarConnector {
    clients: Mutex<ClientCache<Pulsar<TokioExecutor>>>,
}

impl PulsarConnector {
    async fn client(&self, broker: &Broker) -> Result<Pulsar<TokioExecutor>> {
        let url = broker.parameter(SERVICE_URL).unwrap_or(DEFAULT_SERVICE_URL);
        let mut clients = self.clients.lock().await;
        if let Some(client) = clients.get(broker.id(), url) {
            return Ok(client);
        }
        debug!(broker = %broker.id(), %url, "connecting to pulsar");
        let client = Pulsar::builder(url, TokioExecutor).build().await?;
        if clients.insert(broker.id(), url, client.clone()) {
            debug!(broker = %broker.id(), %url, "service url changed, replaced client");
        }
        Ok(client)
    }
}

#[async_trait]
impl SubscriptionConnector for PulsarConnector {
    async fn subscribe(
        &self,
        broker: &Broker,
        options: SubscriptionOptions,
    ) -> Result<Box<dyn SubscriptionClient>> {
        let client = self.client(broker).await?;
        let position = match options.initial_position {
            InitialPosition::Earliest => PulsarPosition::Earliest,
            InitialPosition::Latest => PulsarPosition::Latest,
        };
        let subscribe = client
            .consumer()
            .with_topic(&options.topic)
            .with_subscription(&options.subscription)
            .with_subscription_type(SubType::Shared)
            .with_consumer_name(&options.consumer_name)
            .with_options(ConsumerOptions::default().with_initial_position(position))
            .build::<Vec<u8>>();
        let consumer = tokio::time::timeout(options.timeout, subscribe)
            .await
            .map_err(|_| {
                Error::Backend(format!(
                    "timed out subscribing to '{}' after {:?}",
                    options.topic, options.timeout
                ))
            })??;
        Ok(Box::new(PulsarMember {
            consumer,
            unacknowledged: HashMap::new(),
        }))
    }

    async fn publisher(
        &self,
        broker: &Broker,
        topic: &str,
        producer_name: &str,
    ) -> Result<Box<dyn SubscriptionSink>> {
        let client = self.client(broker).await?;
        let producer = client
            .producer()
            .with_topic(topic)
            .with_name(producer_name)
            .build()
            .await?;
        Ok(Box::new(PulsarPublisher {
            producer,
            receipts: Vec::new(),
        }))
    }
}

struct PulsarMember {
    consumer: Consumer<Vec<u8>, TokioExecutor>,
    unacknowledged: HashMap<MessageId, (String, MessageIdData)>,
}

#[async_trait]
impl SubscriptionClient for PulsarMember {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<ReceivedMessage>> {
        let message = match tokio::time::timeout(timeout, self.consumer.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => return Err(Error::Backend("subscription stream ended".to_string())),
            Ok(Some(message)) => message?,
        };
        let native = message.message_id().clone();
        let id = MessageId {
            topic: message.topic.clone(),
            ledger: native.ledger_id,
            entry: native.entry_id,
            partition: native.partition.unwrap_or(-1),
            batch_index: native.batch_index.unwrap_or(-1),
        };
        let metadata = &message.payload.metadata;
        let received = ReceivedMessage {
            id: id.clone(),
            key: metadata.partition_key.clone().map(String::into_bytes),
            payload: message.payload.data.clone(),
            publish_time: i64::try_from(metadata.publish_time)
                .ok()
                .and_then(DateTime::from_timestamp_millis),
        };
        self.unacknowledged
            .insert(id, (message.topic.clone(), native));
        Ok(Some(received))
    }

    async fn acknowledge(&mut self, ids: &[MessageId]) -> Result<()> {
        for id in ids {
            let Some((topic, native)) = self.unacknowledged.remove(id) else {
                warn!(topic = %id.topic, entry = id.entry, "acknowledging unknown message");
                continue;
            };
            self.consumer
                .ack_with_id(&topic, native)
                .await
                .map_err(pulsar::Error::from)?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.unacknowledged.clear();
        self.consumer.close().await?;
        Ok(())
    }
}

struct PulsarPublisher {
    producer: Producer<TokioExecutor>,
    receipts: Vec<SendFuture>,
}

#[async_trait]
impl SubscriptionSink for PulsarPublisher {
    async fn publish(&mut self, key: Option<Vec<u8>>, payload: Vec<u8>) -> Result<()> {
        let message = OutgoingMessage {
            payload,
            partition_key: key.map(|k| String::from_utf8_lossy(&k).into_owned()),
            ..Default::default()
        };
        let receipt = self.producer.send_non_blocking(message).await?;
        self.receipts.push(receipt);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        for receipt in self.receipts.drain(..) {
            receipt.await?;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.flush().await?;
        self.producer.close().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_hits_only_for_the_same_url() {
        let mut cache = ClientCache::default();
        assert!(!cache.insert("events", "pulsar://a:6650", 1));
        assert_eq!(cache.get("events", "pulsar://a:6650"), Some(1));
        assert_eq!(cache.get("events", "pulsar://b:6650"), None);
        assert_eq!(cache.get("other", "pulsar://a:6650"), None);
    }

    #[test]
    fn changed_url_replaces_the_client() {
        let mut cache = ClientCache::default();
        cache.insert("events", "pulsar://a:6650", 1);
        assert!(cache.insert("events", "pulsar://b:6650", 2));
        assert_eq!(cache.get("events", "pulsar://b:6650"), Some(2));
        assert_eq!(cache.get("events", "pulsar://a:6650"), None);
        assert!(!cache.insert("events", "pulsar://b:6650", 3));
    }
}
