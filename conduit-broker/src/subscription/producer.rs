use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::{SubscriptionConnector, SubscriptionSink, topic_codec};
use crate::codec::Codec;
use crate::error::{Error, Result};
use crate::producer::ProducerBackend;
use crate::topic::Topic;

/// Producer backend over a [`SubscriptionSink`].
///
/// With auto-commit every send is published at once and commit waits for
/// persistence. Without it, sends are held back until commit publishes them
/// and rollback drops them.
pub struct SubscriptionProducer {
    topic: Arc<Topic>,
    connector: Arc<dyn SubscriptionConnector>,
    sink: Option<Box<dyn SubscriptionSink>>,
    codec: Option<Arc<Codec>>,
    buffered: Vec<(Option<Vec<u8>>, Vec<u8>)>,
}

impl SubscriptionProducer {
    pub fn new(topic: Arc<Topic>, connector: Arc<dyn SubscriptionConnector>) -> Self {
        Self {
            topic,
            connector,
            sink: None,
            codec: None,
            buffered: Vec::new(),
        }
    }

    fn sink(&mut self) -> Result<&mut Box<dyn SubscriptionSink>> {
        self.sink
            .as_mut()
            .ok_or_else(|| Error::Backend("subscription producer is not connected".to_string()))
    }
}

#[async_trait]
impl ProducerBackend for SubscriptionProducer {
    async fn initialize(&mut self) -> Result<()> {
        if self.sink.is_some() {
            return Ok(());
        }
        let codec = topic_codec(&self.topic)?;
        let sink = self
            .connector
            .publisher(self.topic.broker(), self.topic.name(), self.topic.client_id())
            .await?;
        self.sink = Some(sink);
        self.codec = Some(codec);
        Ok(())
    }

    fn codec(&self) -> Option<Arc<Codec>> {
        self.codec.clone()
    }

    async fn send(&mut self, key: Option<Vec<u8>>, payload: Vec<u8>) -> Result<()> {
        if self.topic.auto_commit() {
            return self.sink()?.publish(key, payload).await;
        }
        self.sink()?;
        self.buffered.push((key, payload));
        Ok(())
    }

    /// Publishes the buffer in order. On failure the unpublished remainder,
    /// starting with the failed event, stays buffered.
    async fn commit(&mut self) -> Result<()> {
        let Self {
            topic,
            sink: Some(sink),
            buffered,
            ..
        } = self
        else {
            return Err(Error::Backend(
                "subscription producer is not connected".to_string(),
            ));
        };
        let mut published = 0;
        while published < buffered.len() {
            let (key, payload) = buffered[published].clone();
            if let Err(e) = sink.publish(key, payload).await {
                buffered.drain(..published);
                debug!(topic = %topic.name(), published, remaining = buffered.len(), "publish failed during commit");
                return Err(e);
            }
            published += 1;
        }
        buffered.clear();
        sink.flush().await
    }

    async fn rollback(&mut self) -> Result<()> {
        if !self.buffered.is_empty() {
            debug!(topic = %self.topic.name(), dropped = self.buffered.len(), "buffered events dropped");
        }
        self.buffered.clear();
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.buffered.clear();
        self.codec = None;
        match self.sink.take() {
            Some(mut sink) => sink.close().await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, BrokerType};
    use crate::subscription::MemoryPubSub;

    fn topic(auto_commit: bool) -> Arc<Topic> {
        let broker = Arc::new(Broker::new(BrokerType::Pulsar, "events"));
        Arc::new(Topic::new(broker, "audit").with_auto_commit(auto_commit))
    }

    #[tokio::test]
    async fn buffered_sends_publish_on_commit() {
        let hub = MemoryPubSub::new();
        let mut producer = SubscriptionProducer::new(topic(false), Arc::new(hub.clone()));
        producer.initialize().await.unwrap();

        producer.send(None, b"1".to_vec()).await.unwrap();
        producer.send(None, b"2".to_vec()).await.unwrap();
        assert_eq!(hub.len("audit"), 0);

        producer.commit().await.unwrap();
        assert_eq!(hub.len("audit"), 2);

        producer.send(None, b"3".to_vec()).await.unwrap();
        producer.rollback().await.unwrap();
        producer.commit().await.unwrap();
        assert_eq!(hub.len("audit"), 2);
    }

    #[tokio::test]
    async fn failed_commit_keeps_unpublished_events() {
        let hub = MemoryPubSub::new();
        let mut producer = SubscriptionProducer::new(topic(false), Arc::new(hub.clone()));
        producer.initialize().await.unwrap();
        for value in ["1", "2", "3"] {
            producer.send(None, value.as_bytes().to_vec()).await.unwrap();
        }

        hub.fail_publish_after(1, "quota exceeded");
        assert!(producer.commit().await.is_err());
        assert_eq!(hub.len("audit"), 1);
        assert_eq!(producer.buffered.len(), 2);
        assert_eq!(producer.buffered[0].1, b"2");

        producer.commit().await.unwrap();
        assert_eq!(hub.len("audit"), 3);
        assert!(producer.buffered.is_empty());
    }

    #[tokio::test]
    async fn auto_commit_publishes_immediately() {
        let hub = MemoryPubSub::new();
        let mut producer = SubscriptionProducer::new(topic(true), Arc::new(hub.clone()));
        producer.initialize().await.unwrap();

        producer.send(Some(b"k".to_vec()), b"1".to_vec()).await.unwrap();
        assert_eq!(hub.len("audit"), 1);
    }
}
