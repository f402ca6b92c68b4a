use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{LogClient, LogConnector, PartitionAssignment, RebalanceListener, consumer_config};
use crate::codec::{Codec, CodecRegistry, CodecToken};
use crate::consumer::{AssignmentView, ConsumerBackend};
use crate::error::{Error, Result};
use crate::event::RawRecord;
use crate::topic::Topic;

/// Consumer backend over a [`LogClient`].
///
/// With auto-commit the client advances committed positions itself and
/// [`commit`](ConsumerBackend::commit) does not reach the backend. Without
/// it, commit synchronously stores the positions consumed so far.
pub struct LogConsumer {
    topic: Arc<Topic>,
    connector: Arc<dyn LogConnector>,
    codecs: Arc<CodecRegistry>,
    assignment: Arc<PartitionAssignment>,
    client: Option<Box<dyn LogClient>>,
    token: Option<CodecToken>,
}

impl LogConsumer {
    pub fn new(
        topic: Arc<Topic>,
        connector: Arc<dyn LogConnector>,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            assignment: Arc::new(PartitionAssignment::new(Arc::clone(&topic))),
            topic,
            connector,
            codecs,
            client: None,
            token: None,
        }
    }

    fn client(&mut self) -> Result<&mut Box<dyn LogClient>> {
        self.client
            .as_mut()
            .ok_or_else(|| Error::Backend("log consumer is not connected".to_string()))
    }

    fn unregister_codec(&mut self) {
        if let Some(token) = self.token.take() {
            self.codecs.unregister(token);
        }
    }
}

#[async_trait]
impl ConsumerBackend for LogConsumer {
    async fn initialize(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let token = self.codecs.register(Codec::for_topic(&self.topic)?);
        self.token = Some(token);
        let config = consumer_config(&self.topic, token);
        let listener: Arc<dyn RebalanceListener> = self.assignment.clone();
        match self
            .connector
            .connect_consumer(&config, Arc::clone(&self.codecs), self.topic.name(), listener)
            .await
        {
            Ok(client) => {
                self.client = Some(client);
                Ok(())
            }
            Err(e) => {
                self.unregister_codec();
                Err(e)
            }
        }
    }

    async fn fetch(&mut self, timeout: Duration) -> Result<Vec<RawRecord>> {
        let max = self.topic.max_poll_records();
        let assignment = Arc::clone(&self.assignment);
        let client = self.client()?;
        let records = client.poll(max, timeout).await?;
        assignment.update_lag(client.lag(&assignment.assigned()));
        Ok(records)
    }

    fn codec(&self) -> Option<Arc<Codec>> {
        self.client.as_ref().map(|c| c.codec())
    }

    async fn commit(&mut self) -> Result<()> {
        if self.topic.auto_commit() {
            debug!(topic = %self.topic.name(), "auto-commit enabled, nothing to commit");
            return Ok(());
        }
        self.client()?.commit().await
    }

    async fn discard(&mut self) -> Result<()> {
        // Uncommitted positions live only in the connection, which the
        // caller closes next.
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        let result = match self.client.take() {
            Some(mut client) => client.close().await,
            None => Ok(()),
        };
        self.assignment.clear();
        self.unregister_codec();
        result
    }

    fn assignment(&self) -> Arc<dyn AssignmentView> {
        self.assignment.clone()
    }
}
