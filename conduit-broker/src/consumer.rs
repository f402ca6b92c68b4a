//! Consumer base shared by all backends.
//!
//! [`BrokerConsumer`] owns the lifecycle, the [`ConsumerStatus`] state machine,
//! the counters and failure capture. Backend-specific work is delegated to a
//! [`ConsumerBackend`].
//!
//! # Lifecycle
//!
//! `initialize → {poll}* → commit | rollback → release`. One task drives the
//! poll loop; `release` may be called from any task and is idempotent.
//!
//! # Rollback
//!
//! Rollback discards uncommitted progress by closing the backend connection
//! and initializing it again from scratch. Everything not committed is
//! redelivered (at-least-once), but the partition assignment is lost and the
//! consumer waits for the broker to assign partitions again. This is
//! expensive; callers should roll back only when a batch cannot be
//! processed.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::codec::Codec;
use crate::error::{Error, Result, root_cause_description};
use crate::event::{Event, Partition, RawRecord};
use crate::service::Registry;
use crate::status::{ConsumerStatus, StatusCell};
use crate::topic::{Topic, TopicHealth};

/// Timeout used by [`BrokerConsumer::poll_default`].
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only view of a consumer's partition assignment.
///
/// Implementations are updated by the backend, possibly from its own
/// threads, and must be safe to read at any time.
pub trait AssignmentView: Send + Sync {
    /// Partitions currently assigned, in identity order.
    fn partitions(&self) -> Vec<Partition>;

    /// Best-effort count of events not yet delivered.
    fn lag(&self) -> u64;
}

/// Assignment of backends without a partition model.
#[derive(Debug, Default)]
pub struct NoAssignment;

impl AssignmentView for NoAssignment {
    fn partitions(&self) -> Vec<Partition> {
        Vec::new()
    }

    fn lag(&self) -> u64 {
        0
    }
}

/// Backend-specific half of a consumer.
#[async_trait]
pub trait ConsumerBackend: Send {
    /// Connect to the broker.
    ///
    /// Called again after [`release`](Self::release) by rollback recovery and
    /// must then re-establish the connection completely.
    async fn initialize(&mut self) -> Result<()>;

    /// Fetch at most the topic's `max_poll_records` records, waiting up to
    /// `timeout`.
    async fn fetch(&mut self, timeout: Duration) -> Result<Vec<RawRecord>>;

    /// Codec for the fetched records; `None` until initialized.
    fn codec(&self) -> Option<Arc<Codec>>;

    /// Acknowledge progress made since the last commit or rollback.
    async fn commit(&mut self) -> Result<()>;

    /// Forget progress that was not committed. Reconnecting is up to the caller.
    async fn discard(&mut self) -> Result<()>;

    /// Close the connection.
    async fn release(&mut self) -> Result<()>;

    /// Shared view of the partition assignment.
    fn assignment(&self) -> Arc<dyn AssignmentView>;
}

/// Introspection handle of a consumer, shared with the registry.
pub struct ConsumerInfo {
    id: String,
    topic: Arc<Topic>,
    created_at: DateTime<Utc>,
    poll_count: AtomicU64,
    event_count: AtomicU64,
    commit_count: AtomicU64,
    rollback_count: AtomicU64,
    status: StatusCell<ConsumerStatus>,
    closed: AtomicBool,
    assignment: Arc<dyn AssignmentView>,
}

impl ConsumerInfo {
    fn new(topic: Arc<Topic>, assignment: Arc<dyn AssignmentView>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            topic,
            created_at: Utc::now(),
            poll_count: AtomicU64::new(0),
            event_count: AtomicU64::new(0),
            commit_count: AtomicU64::new(0),
            rollback_count: AtomicU64::new(0),
            status: StatusCell::new(ConsumerStatus::Connect),
            closed: AtomicBool::new(false),
            assignment,
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

    pub fn status(&self) -> ConsumerStatus {
        self.status.get()
    }

    /// Root cause of the last failure while the consumer is failed.
    pub fn last_failure(&self) -> Option<String> {
        self.status.last_failure()
    }

    pub fn poll_count(&self) -> u64 {
        self.poll_count.load(Ordering::Relaxed)
    }

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

    pub fn partitions(&self) -> Vec<Partition> {
        self.assignment.partitions()
    }

    pub fn lag(&self) -> u64 {
        self.assignment.lag()
    }

    /// Health of the topic as seen by this consumer.
    pub fn health(&self) -> TopicHealth {
        if self.status() == ConsumerStatus::Failed {
            TopicHealth::Faulty
        } else if self.lag() > 0 {
            TopicHealth::Late
        } else {
            TopicHealth::Healthy
        }
    }

    pub fn snapshot(&self) -> ConsumerSnapshot {
        ConsumerSnapshot {
            id: self.id.clone(),
            topic: self.topic.id().to_string(),
            status: self.status(),
            last_failure: self.last_failure(),
            created_at: self.created_at,
            poll_count: self.poll_count(),
            event_count: self.event_count(),
            commit_count: self.commit_count(),
            rollback_count: self.rollback_count(),
            partitions: self
                .partitions()
                .iter()
                .map(|p| p.id().to_string())
                .collect(),
            lag: self.lag(),
            closed: self.is_closed(),
        }
    }
}

impl std::fmt::Debug for ConsumerInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerInfo")
            .field("id", &self.id)
            .field("topic", &self.topic.id())
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Point-in-time copy of a consumer's observable state.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumerSnapshot {
    pub id: String,
    pub topic: String,
    pub status: ConsumerStatus,
    pub last_failure: Option<String>,
    pub created_at: DateTime<Utc>,
    pub poll_count: u64,
    pub event_count: u64,
    pub commit_count: u64,
    pub rollback_count: u64,
    pub partitions: Vec<String>,
    pub lag: u64,
    pub closed: bool,
}

/// A consumer of events with keys `K` and values `V`.
pub struct BrokerConsumer<K, V> {
    info: Arc<ConsumerInfo>,
    backend: Mutex<Box<dyn ConsumerBackend>>,
    registry: Registry,
    _types: PhantomData<fn() -> (K, V)>,
}

impl<K, V> std::fmt::Debug for BrokerConsumer<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConsumer")
            .field("info", &self.info)
            .finish_non_exhaustive()
    }
}

impl<K, V> BrokerConsumer<K, V> {
    /// Wrap a backend and register the consumer.
    pub fn new(registry: Registry, topic: Arc<Topic>, backend: Box<dyn ConsumerBackend>) -> Self {
        let info = Arc::new(ConsumerInfo::new(topic, backend.assignment()));
        registry.register_consumer(Arc::clone(&info));
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

    /// Shared introspection handle.
    pub fn info(&self) -> &Arc<ConsumerInfo> {
        &self.info
    }

    pub fn status(&self) -> ConsumerStatus {
        self.info.status()
    }

    pub fn last_failure(&self) -> Option<String> {
        self.info.last_failure()
    }

    pub fn poll_count(&self) -> u64 {
        self.info.poll_count()
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

    /// Current partition assignment.
    pub fn partitions(&self) -> Vec<Partition> {
        self.info.partitions()
    }

    /// Best-effort backlog across the assigned partitions.
    pub fn lag(&self) -> u64 {
        self.info.lag()
    }

    /// Connect to the broker.
    #[instrument(skip(self), fields(consumer = %self.id(), topic = %self.topic().name()))]
    pub async fn initialize(&self) -> Result<()> {
        self.check_closed()?;
        let mut backend = self.backend.lock().await;
        self.run(
            ConsumerStatus::Connect,
            "Failed to connect consumer for",
            backend.initialize(),
        )
        .await?;
        info!("consumer initialized");
        Ok(())
    }

    /// Acknowledge the events returned since the last commit or rollback.
    ///
    /// With auto-commit the backend has already advanced; the call is still
    /// counted.
    #[instrument(skip(self), fields(consumer = %self.id(), topic = %self.topic().name()))]
    pub async fn commit(&self) -> Result<()> {
        self.check_closed()?;
        self.info.commit_count.fetch_add(1, Ordering::Relaxed);
        let mut backend = self.backend.lock().await;
        self.run(ConsumerStatus::Commit, "Failed to commit", backend.commit())
            .await
    }

    /// Discard uncommitted progress by closing and reinitializing the
    /// consumer. See the module documentation for the cost of doing so.
    #[instrument(skip(self), fields(consumer = %self.id(), topic = %self.topic().name()))]
    pub async fn rollback(&self) -> Result<()> {
        self.check_closed()?;
        self.info.rollback_count.fetch_add(1, Ordering::Relaxed);
        let mut backend = self.backend.lock().await;
        self.run(ConsumerStatus::Rollback, "Failed to roll back", async {
            backend.discard().await?;
            if let Err(e) = backend.release().await {
                warn!(error = %e, "closing consumer during rollback failed");
            }
            backend.initialize().await
        })
        .await?;
        info!("consumer rolled back and reconnected");
        Ok(())
    }

    /// Close the consumer. Repeated calls are no-ops.
    pub async fn release(&self) {
        if self.info.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.registry.release_consumer(self.id());
        let mut backend = self.backend.lock().await;
        if let Err(e) = backend.release().await {
            warn!(consumer = %self.id(), topic = %self.topic().name(), error = %e, "releasing consumer failed");
        }
        info!(consumer = %self.id(), topic = %self.topic().name(), "consumer released");
    }

    /// Alias of [`release`](Self::release).
    pub async fn close(&self) {
        self.release().await;
    }

    fn check_closed(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::message(format!(
                "Consumer for {} is closed",
                self.topic().describe()
            )));
        }
        Ok(())
    }

    /// Record a failure and wrap it with the topic.
    fn fail(&self, action: &str, error: Error) -> Error {
        let wrapped = Error::broker(format!("{action} {}", self.topic().describe()), error);
        let failure = root_cause_description(&wrapped);
        warn!(consumer = %self.id(), topic = %self.topic().name(), failure = %failure, "{wrapped}");
        self.info.status.fail(failure);
        wrapped
    }

    /// Run one status-bearing operation.
    async fn run<T, F>(&self, status: ConsumerStatus, action: &str, op: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        self.info.status.set(status);
        let started = Instant::now();
        match op.await {
            Ok(value) => {
                self.info.status.set(ConsumerStatus::Idle);
                debug!(operation = %status, elapsed_ms = started.elapsed().as_millis() as u64, "completed");
                Ok(value)
            }
            Err(e) => Err(self.fail(action, e)),
        }
    }
}

impl<K, V> BrokerConsumer<K, V>
where
    K: DeserializeOwned,
    V: DeserializeOwned,
{
    /// Poll for up to `max_poll_records` events, waiting up to `timeout`.
    #[instrument(skip(self), fields(consumer = %self.id(), topic = %self.topic().name()))]
    pub async fn poll(&self, timeout: Duration) -> Result<Vec<Event<K, V>>> {
        self.check_closed()?;
        self.info.poll_count.fetch_add(1, Ordering::Relaxed);
        let mut backend = self.backend.lock().await;
        let started = Instant::now();

        self.info.status.set(ConsumerStatus::Poll);
        let records = match backend.fetch(timeout).await {
            Ok(records) => records,
            Err(e) => return Err(self.fail("Failed to poll events from", e)),
        };

        self.info.status.set(ConsumerStatus::Consume);
        let events = match self.translate(backend.codec(), records) {
            Ok(events) => events,
            Err(e) => return Err(self.fail("Failed to decode events from", e)),
        };

        self.info
            .event_count
            .fetch_add(events.len() as u64, Ordering::Relaxed);
        self.info.status.set(ConsumerStatus::Idle);
        debug!(
            events = events.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "poll completed"
        );
        Ok(events)
    }

    /// Poll with [`DEFAULT_POLL_TIMEOUT`].
    pub async fn poll_default(&self) -> Result<Vec<Event<K, V>>> {
        self.poll(DEFAULT_POLL_TIMEOUT).await
    }

    fn translate(
        &self,
        codec: Option<Arc<Codec>>,
        records: Vec<RawRecord>,
    ) -> Result<Vec<Event<K, V>>> {
        let codec = codec.ok_or_else(|| Error::Backend("consumer is not initialized".to_string()))?;
        records
            .into_iter()
            .map(|record| Event::decode(self.topic(), &codec, record))
            .collect()
    }
}

impl<K, V> Drop for BrokerConsumer<K, V> {
    fn drop(&mut self) {
        self.info.closed.store(true, Ordering::SeqCst);
        self.registry.release_consumer(self.info.id());
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use super::*;
    use crate::broker::{Broker, BrokerType};

    /// Scripted backend: each fetch pops the next queued result.
    struct ScriptedBackend {
        fetches: VecDeque<Result<Vec<RawRecord>>>,
        initialized: Arc<AtomicU64>,
        released: Arc<AtomicU64>,
        connected: bool,
    }

    impl ScriptedBackend {
        fn new() -> Self {
            Self {
                fetches: VecDeque::new(),
                initialized: Arc::new(AtomicU64::new(0)),
                released: Arc::new(AtomicU64::new(0)),
                connected: false,
            }
        }

        fn queue(mut self, result: Result<Vec<RawRecord>>) -> Self {
            self.fetches.push_back(result);
            self
        }
    }

    #[async_trait]
    impl ConsumerBackend for ScriptedBackend {
        async fn initialize(&mut self) -> Result<()> {
            self.initialized.fetch_add(1, Ordering::SeqCst);
            self.connected = true;
            Ok(())
        }

        async fn fetch(&mut self, _timeout: Duration) -> Result<Vec<RawRecord>> {
            self.fetches.pop_front().unwrap_or_else(|| Ok(Vec::new()))
        }

        fn codec(&self) -> Option<Arc<Codec>> {
            self.connected.then(|| Arc::new(Codec::Json))
        }

        async fn commit(&mut self) -> Result<()> {
            Ok(())
        }

        async fn discard(&mut self) -> Result<()> {
            Ok(())
        }

        async fn release(&mut self) -> Result<()> {
            self.released.fetch_add(1, Ordering::SeqCst);
            self.connected = false;
            Ok(())
        }

        fn assignment(&self) -> Arc<dyn AssignmentView> {
            Arc::new(NoAssignment)
        }
    }

    fn topic() -> Arc<Topic> {
        let broker = Arc::new(Broker::new(BrokerType::Kafka, "local"));
        Arc::new(Topic::new(broker, "orders"))
    }

    fn record(position: i64, value: &str) -> RawRecord {
        RawRecord {
            partition: 0,
            position,
            key: None,
            payload: serde_json::to_vec(value).unwrap(),
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn new_consumer_starts_in_connect_and_registers() {
        let registry = Registry::default();
        let consumer: BrokerConsumer<String, String> =
            BrokerConsumer::new(registry.clone(), topic(), Box::new(ScriptedBackend::new()));

        assert_eq!(consumer.status(), ConsumerStatus::Connect);
        assert_eq!(registry.consumers().len(), 1);

        consumer.initialize().await.unwrap();
        assert_eq!(consumer.status(), ConsumerStatus::Idle);
    }

    #[tokio::test]
    async fn poll_counts_polls_and_events() {
        let backend = ScriptedBackend::new()
            .queue(Ok(vec![record(0, "a"), record(1, "b")]))
            .queue(Ok(Vec::new()));
        let consumer: BrokerConsumer<String, String> =
            BrokerConsumer::new(Registry::default(), topic(), Box::new(backend));
        consumer.initialize().await.unwrap();

        let events = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].value(), "b");

        let events = consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert!(events.is_empty());

        assert_eq!(consumer.poll_count(), 2);
        assert_eq!(consumer.event_count(), 2);
        assert_eq!(consumer.status(), ConsumerStatus::Idle);
    }

    #[tokio::test]
    async fn fetch_failure_marks_consumer_failed_until_next_success() {
        let backend = ScriptedBackend::new()
            .queue(Err(Error::Backend("broker went away".to_string())))
            .queue(Ok(vec![record(0, "a")]));
        let consumer: BrokerConsumer<String, String> =
            BrokerConsumer::new(Registry::default(), topic(), Box::new(backend));
        consumer.initialize().await.unwrap();

        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.to_string().contains("'orders'"));
        assert_eq!(consumer.status(), ConsumerStatus::Failed);
        assert!(
            consumer
                .last_failure()
                .unwrap()
                .contains("broker went away")
        );

        consumer.poll(Duration::from_millis(10)).await.unwrap();
        assert_eq!(consumer.status(), ConsumerStatus::Idle);
        assert!(consumer.last_failure().is_none());
    }

    #[tokio::test]
    async fn decode_failure_is_reported_as_consume_failure() {
        let bad = RawRecord {
            partition: 0,
            position: 0,
            key: None,
            payload: b"not json".to_vec(),
            timestamp: None,
        };
        let backend = ScriptedBackend::new().queue(Ok(vec![bad]));
        let consumer: BrokerConsumer<String, String> =
            BrokerConsumer::new(Registry::default(), topic(), Box::new(backend));
        consumer.initialize().await.unwrap();

        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.to_string().starts_with("Failed to decode events from"));
        assert_eq!(consumer.status(), ConsumerStatus::Failed);
        assert_eq!(consumer.event_count(), 0);
    }

    #[tokio::test]
    async fn rollback_reinitializes_backend() {
        let backend = ScriptedBackend::new();
        let initialized = Arc::clone(&backend.initialized);
        let released = Arc::clone(&backend.released);
        let consumer: BrokerConsumer<String, String> =
            BrokerConsumer::new(Registry::default(), topic(), Box::new(backend));
        consumer.initialize().await.unwrap();

        consumer.rollback().await.unwrap();

        assert_eq!(initialized.load(Ordering::SeqCst), 2);
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert_eq!(consumer.rollback_count(), 1);
        assert_eq!(consumer.status(), ConsumerStatus::Idle);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_blocks_further_use() {
        let registry = Registry::default();
        let backend = ScriptedBackend::new();
        let released = Arc::clone(&backend.released);
        let consumer: BrokerConsumer<String, String> =
            BrokerConsumer::new(registry.clone(), topic(), Box::new(backend));
        consumer.initialize().await.unwrap();

        consumer.release().await;
        consumer.close().await;

        assert!(consumer.is_closed());
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(registry.consumers().is_empty());

        let err = consumer.poll(Duration::from_millis(10)).await.unwrap_err();
        assert!(err.to_string().contains("is closed"));
        assert_eq!(consumer.poll_count(), 0);
    }

    #[tokio::test]
    async fn dropping_consumer_unregisters_it() {
        let registry = Registry::default();
        let consumer: BrokerConsumer<String, String> =
            BrokerConsumer::new(registry.clone(), topic(), Box::new(ScriptedBackend::new()));
        let info = Arc::clone(consumer.info());
        drop(consumer);

        assert!(registry.consumers().is_empty());
        assert!(info.is_closed());
    }

    #[tokio::test]
    async fn snapshot_reflects_counters() {
        let consumer: BrokerConsumer<String, String> = BrokerConsumer::new(
            Registry::default(),
            topic(),
            Box::new(ScriptedBackend::new().queue(Ok(vec![record(0, "a")]))),
        );
        consumer.initialize().await.unwrap();
        consumer.poll(Duration::from_millis(10)).await.unwrap();
        consumer.commit().await.unwrap();

        let snapshot = consumer.info().snapshot();
        assert_eq!(snapshot.topic, "local_orders");
        assert_eq!(snapshot.poll_count, 1);
        assert_eq!(snapshot.event_count, 1);
        assert_eq!(snapshot.commit_count, 1);
        assert_eq!(snapshot.status, ConsumerStatus::Idle);
        assert_eq!(consumer.info().health(), TopicHealth::Healthy);
    }
}
