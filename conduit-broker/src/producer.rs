//! Producer base shared by all backends.
//!
//! Mirrors [`crate::consumer`] with a single `Send` state in place of
//! `Poll`/`Consume`. What `commit` and `rollback` mean depends on the topic's
//! auto-commit flag: with auto-commit, `commit` flushes buffered sends; without
//! it, sends are grouped in a backend transaction that `commit` and `rollback`
//! complete or abort.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::codec::Codec;
use crate::error::{Error, Result, root_cause_description};
use crate::service::Registry;
use crate::status::{ProducerStatus, StatusCell};
use crate::topic::Topic;

/// Backend-specific half of a producer.
#[async_trait]
pub trait ProducerBackend: Send {
    async fn initialize(&mut self) -> Result<()>;

    /// Codec for outgoing records; `None` until initialized.
    fn codec(&self) -> Option<Arc<Codec>>;

    /// Hand one encoded record to the backend.
    async fn send(&mut self, key: Option<Vec<u8>>, payload: Vec<u8>) -> Result<()>;

    /// Flush buffered sends or commit the open transaction.
    async fn commit(&mut self) -> Result<()>;

    /// Abort the open transaction or drop buffered sends.
    async fn rollback(&mut self) -> Result<()>;

    async fn release(&mut self) -> Result<()>;
}

/// Introspection handle of a producer, shared with the registry.
#[derive(Debug)]
pub struct ProducerInfo {
    id: String,
    topic: Arc<Topic>,
    created_at: DateTime<Utc>,
    event_count: AtomicU64,
    commit_count: AtomicU64,
    rollback_count: AtomicU64,
    status: StatusCell<ProducerStatus>,
    closed: AtomicBool,
}

impl ProducerInfo {
    fn new(topic: Arc<Topic>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic,
            created_at: Utc::now(),
            event_count: AtomicU64::new(0),
            commit_count: AtomicU64::new(0),
            rollback_count: AtomicU64::new(0),
            status: StatusCell::new(ProducerStatus::Connect),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn topic(&self) -> &Arc<Topic> {
        &self.topic
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> ProducerStatus {
        self.status.get()
    }

    pub fn last_failure(&self) -> Option<String> {
        self.status.last_failure()
    }

    /// Events handed to the backend successfully.
    pub fn event_count(&self) -> u64 {
        self.event_count.load(Ordering::Relaxed)
    }

    pub fn commit_count(&self) -> u64 {
        self.commit_count.load(Ordering::Relaxed)
    }

    pub fn rollback_count(&self) -> u64 {
        self.rollback_count.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> ProducerSnapshot {
        ProducerSnapshot {
            id: self.id.clone(),
            topic: self.topic.id().to_string(),
            status: self.status(),
            last_failure: self.last_failure(),
            created_at: self.created_at,
            event_count: self.event_count(),
            commit_count: self.commit_count(),
            rollback_count: self.rollback_count(),
            closed: self.is_closed(),
        }
    }
}

/// Point-in-time copy of a producer's observable state.
#[derive(Debug, Clone, Serialize)]
pub struct ProducerSnapshot {
    pub id: String,
    pub topic: String,
    pub status: ProducerStatus,
    pub last_failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub event_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub closed: bool,
}

/// A producer of events with keys `K` and values `V`.
pub struct BrokerProducer<K, V> {
    info: Arc<ProducerInfo>,
    backend: Mutex<Box<dyn ProducerBackend>>,
    registry: Registry,
    _types: PhantomData<fn(K, V)>,
}

impl<K, V> std::fmt::Debug for BrokerProducer<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerProducer")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl<K, V> BrokerProducer<K, V> {
    /// Wrap a backend and register the producer.
    pub fn new(registry: Registry, topic: Arc<Topic>, backend: Box<dyn ProducerBackend>) -> Self {
        let info = Arc::new(ProducerInfo::new(topic));
        registry.register_producer(Arc::clone(&info));
        Self {
            info,
            backend: Mutex::new(backend),
            registry,
            _types: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        self.info.id()
    }

    pub fn topic(&self) -> &Arc<Topic> {
        self.info.topic()
    }

    pub fn info(&self) -> &Arc<ProducerInfo> {
        &self.info
    }

    pub fn status(&self) -> ProducerStatus {
        self.info.status()
    }

    pub fn last_failure(&self) -> Option<String> {
        self.info.last_failure()
    }

    pub fn event_count(&self) -> u64 {
        self.info.event_count()
    }

    pub fn commit_count(&self) -> u64 {
        self.info.commit_count()
    }

    pub fn rollback_count(&self) -> u64 {
        self.info.rollback_count()
    }

    pub fn is_closed(&self) -> bool {
        self.info.is_closed()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.info.created_at()
    }

    #[instrument(skip(self), fields(producer = %self.id(), topic = %self.topic().name()))]
    pub async fn initialize(&self) -> Result<()> {
        self.check_closed()?;
        let mut backend = self.backend.lock().await;
        self.run(
            ProducerStatus::Connect,
            "Failed to connect producer for",
            backend.initialize(),
        )
        .await?;
        info!("producer initialized");
        Ok(())
    }

    #[instrument(skip(self), fields(producer = %self.id(), topic = %self.topic().name()))]
    pub async fn commit(&self) -> Result<()> {
        self.check_closed()?;
        self.info.commit_count.fetch_add(1, Ordering::Relaxed);
        let mut backend = self.backend.lock().await;
        self.run(ProducerStatus::Commit, "Failed to commit events to", backend.commit())
            .await
    }

    #[instrument(skip(self), fields(producer = %self.id(), topic = %self.topic().name()))]
    pub async fn rollback(&self) -> Result<()> {
        self.check_closed()?;
        self.info.rollback_count.fetch_add(1, Ordering::Relaxed);
        let mut backend = self.backend.lock().await;
        self.run(
            ProducerStatus::Rollback,
            "Failed to roll back events of",
            backend.rollback(),
        )
        .await
    }

    /// Close the producer. Repeated calls are no-ops.
    pub async fn release(&self) {
        if self.info.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.release_producer(self.id());
        let mut backend = self.backend.lock().await;
        if let Err(e) = backend.release().await {
            warn!(producer = %self.id(), topic = %self.topic().name(), error = %e, "releasing producer failed");
        }
        info!(producer = %self.id(), topic = %self.topic().name(), "producer released");
    }

    pub async fn close(&self) {
        self.release().await;
    }

    fn check_closed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::message(format!(
                "Producer for {} is closed",
                self.topic().describe()
            )));
        }
        Ok(())
    }

    fn fail(&self, action: &str, error: Error) -> Error {
        let wrapped = Error::broker(format!("{action} {}", self.topic().describe()), error);
        let failure = root_cause_description(&wrapped);
        warn!(producer = %self.id(), topic = %self.topic().name(), failure = %failure, "{wrapped}");
        self.info.status.fail(failure);
        wrapped
    }

    async fn run<T, F>(&self, status: ProducerStatus, action: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.info.status.set(status);
        let started = Instant::now();
        match op.await {
            Ok(value) => {
                self.info.status.set(ProducerStatus::Idle);
                debug!(operation = %status, elapsed_ms = started.elapsed().as_millis() as u64, "completed");
                Ok(value)
            }
            Err(e) => Err(self.fail(action, e)),
        }
    }
}

impl<K, V> BrokerProducer<K, V>
where
    K: Serialize,
    V: Serialize,
{
    /// Send one event. May wait on backend-side buffering.
    #[instrument(skip_all, fields(producer = %self.id(), topic = %self.topic().name()))]
    pub async fn send(&self, key: Option<&K>, value: &V) -> Result<()> {
        self.check_closed()?;
        let mut backend = self.backend.lock().await;
        self.run(ProducerStatus::Send, "Failed to send event to", async {
            let codec = backend
                .codec()
                .ok_or_else(|| Error::Backend("producer is not initialized".to_string()))?;
            let key = key.map(|k| codec.encode(k)).transpose()?;
            let payload = codec.encode(value)?;
            backend.send(key, payload).await
        })
        .await?;
        self.info.event_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl<K, V> Drop for BrokerProducer<K, V> {
    fn drop(&mut self) {
        self.info.closed.store(true, Ordering::SeqCst);
        self.registry.release_producer(self.info.id());
    }
}
