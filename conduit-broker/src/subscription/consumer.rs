use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::debug;

use super::{
    MessageId, ReceivedMessage, SubscriptionClient, SubscriptionConnector, SubscriptionOptions,
    topic_codec,
};
use crate::codec::Codec;
use crate::consumer::{AssignmentView, ConsumerBackend, NoAssignment};
use crate::error::{Error, Result};
use crate::event::RawRecord;
use crate::topic::Topic;

/// Longest single wait on the backend while accumulating a batch.
const RECEIVE_SLICE: Duration = Duration::from_millis(500);

/// Consumer backend over a [`SubscriptionClient`].
pub struct SubscriptionConsumer {
    topic: Arc<Topic>,
    connector: Arc<dyn SubscriptionConnector>,
    client: Option<Box<dyn SubscriptionClient>>,
    codec: Option<Arc<Codec>>,
    /// Ids received since the last commit or rollback.
    pending: Vec<MessageId>,
    /// Receive error hit after part of a batch was collected; reported by
    /// the next fetch.
    deferred: Option<Error>,
}

impl SubscriptionConsumer {
    pub fn new(topic: Arc<Topic>, connector: Arc<dyn SubscriptionConnector>) -> Self {
        Self {
            topic,
            connector,
            client: None,
            codec: None,
            pending: Vec::new(),
            deferred: None,
        }
    }

    /// Messages awaiting acknowledgement.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    fn client(&mut self) -> Result<&mut Box<dyn SubscriptionClient>> {
        self.client
            .as_mut()
            .ok_or_else(|| Error::Backend("subscription consumer is not connected".to_string()))
    }
}

fn to_raw(message: ReceivedMessage) -> RawRecord {
    RawRecord {
        partition: message.id.partition.max(0),
        position: message.id.position(),
        key: message.key,
        payload: message.payload,
        timestamp: message.publish_time,
    }
}

#[async_trait]
impl ConsumerBackend for SubscriptionConsumer {
    async fn initialize(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let codec = topic_codec(&self.topic)?;
        let client = self
            .connector
            .subscribe(self.topic.broker(), SubscriptionOptions::for_topic(&self.topic))
            .await?;
        self.client = Some(client);
        self.codec = Some(codec);
        Ok(())
    }

    /// Accumulates messages until the batch is full or `timeout` elapses.
    async fn fetch(&mut self, timeout: Duration) -> Result<Vec<RawRecord>> {
        let max = self.topic.max_poll_records();
        let auto_commit = self.topic.auto_commit();
        let deadline = Instant::now() + timeout;
        if let Some(e) = self.deferred.take() {
            return Err(e);
        }
        let client = self.client()?;

        let mut ids = Vec::new();
        let mut records = Vec::new();
        let mut failure = None;
        while records.len() < max {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match client.receive(remaining.min(RECEIVE_SLICE)).await {
                Ok(Some(message)) => {
                    ids.push(message.id.clone());
                    records.push(to_raw(message));
                }
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        if let Some(e) = failure {
            if records.is_empty() {
                return Err(e);
            }
            debug!(topic = %self.topic.name(), received = records.len(), error = %e, "receive failed mid-batch");
            self.deferred = Some(e);
        }
        let client = self.client()?;

        if auto_commit {
            if !ids.is_empty() {
                client.acknowledge(&ids).await?;
            }
        } else {
            self.pending.extend(ids);
        }
        Ok(records)
    }

    fn codec(&self) -> Option<Arc<Codec>> {
        self.codec.clone()
    }

    async fn commit(&mut self) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let pending = std::mem::take(&mut self.pending);
        if let Err(e) = self.client()?.acknowledge(&pending).await {
            self.pending = pending;
            return Err(e);
        }
        debug!(topic = %self.topic.name(), acknowledged = pending.len(), "messages acknowledged");
        Ok(())
    }

    async fn discard(&mut self) -> Result<()> {
        if !self.pending.is_empty() {
            debug!(topic = %self.topic.name(), dropped = self.pending.len(), "unacknowledged messages dropped");
        }
        self.pending.clear();
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        self.pending.clear();
        self.deferred = None;
        self.codec = None;
        match self.client.take() {
            Some(mut client) => client.close().await,
            None => Ok(()),
        }
    }

    fn assignment(&self) -> Arc<dyn AssignmentView> {
        Arc::new(NoAssignment)
    }
}
