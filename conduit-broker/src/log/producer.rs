use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use super::{LogConnector, LogSink, producer_config};
use crate::codec::{Codec, CodecRegistry, CodecToken};
use crate::error::{Error, Result};
use crate::producer::ProducerBackend;
use crate::topic::Topic;

/// Producer backend over a [`LogSink`].
///
/// Without auto-commit a transaction is open at all times: it is begun on
/// connect and after every commit or rollback.
pub struct LogProducer {
    topic: Arc<Topic>,
    connector: Arc<dyn LogConnector>,
    codecs: Arc<CodecRegistry>,
    sink: Option<Box<dyn LogSink>>,
    token: Option<CodecToken>,
}

impl LogProducer {
    pub fn new(
        topic: Arc<Topic>,
        connector: Arc<dyn LogConnector>,
        codecs: Arc<CodecRegistry>,
    ) -> Self {
        Self {
            topic,
            connector,
            codecs,
            sink: None,
            token: None,
        }
    }

    fn transactional(&self) -> bool {
        !self.topic.auto_commit()
    }

    fn sink(&mut self) -> Result<&mut Box<dyn LogSink>> {
        self.sink
            .as_mut()
            .ok_or_else(|| Error::Backend("log producer is not connected".to_string()))
    }

    async fn connect(&mut self, token: CodecToken) -> Result<()> {
        let config = producer_config(&self.topic, token);
        let mut sink = self
            .connector
            .connect_producer(&config, Arc::clone(&self.codecs), self.topic.name())
            .await?;
        if self.transactional() {
            sink.begin_transaction().await?;
        }
        self.sink = Some(sink);
        Ok(())
    }
}

#[async_trait]
impl ProducerBackend for LogProducer {
    async fn initialize(&mut self) -> Result<()> {
        if self.sink.is_some() {
            return Ok(());
        }
        let token = self.codecs.register(Codec::for_topic(&self.topic)?);
        self.token = Some(token);
        if let Err(e) = self.connect(token).await {
            self.codecs.unregister(token);
            self.token = None;
            return Err(e);
        }
        Ok(())
    }

    fn codec(&self) -> Option<Arc<Codec>> {
        self.sink.as_ref().map(|s| s.codec())
    }

    async fn send(&mut self, key: Option<Vec<u8>>, payload: Vec<u8>) -> Result<()> {
        self.sink()?.send(key, payload).await
    }

    async fn commit(&mut self) -> Result<()> {
        let timeout = self.topic.timeout();
        let transactional = self.transactional();
        let sink = self.sink()?;
        if transactional {
            sink.commit_transaction(timeout).await?;
            sink.begin_transaction().await
        } else {
            sink.flush(timeout).await
        }
    }

    async fn rollback(&mut self) -> Result<()> {
        let timeout = self.topic.timeout();
        if !self.transactional() {
            debug!(topic = %self.topic.name(), "auto-commit enabled, sent events cannot be rolled back");
            return Ok(());
        }
        let sink = self.sink()?;
        sink.abort_transaction(timeout).await?;
        sink.begin_transaction().await
    }

    async fn release(&mut self) -> Result<()> {
        let timeout = self.topic.timeout();
        let transactional = self.transactional();
        let result = match self.sink.take() {
            Some(mut sink) => {
                if transactional && let Err(e) = sink.abort_transaction(timeout).await {
                    warn!(topic = %self.topic.name(), error = %e, "aborting open transaction failed");
                }
                sink.close().await
            }
            None => Ok(()),
        };
        if let Some(token) = self.token.take() {
            self.codecs.unregister(token);
        }
        result
    }
}
