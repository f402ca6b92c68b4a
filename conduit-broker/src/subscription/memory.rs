//! In-process subscription backend.
//!
//! [`MemoryPubSub`] keeps one append-only log per topic and any number of
//! shared subscriptions on it. Each subscription has a cursor, a queue of
//! messages awaiting redelivery and the unacknowledged messages of every
//! member. Messages a member never acknowledged are redelivered, oldest
//! first, once that member closes.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    InitialPosition, MessageId, ReceivedMessage, SubscriptionClient, SubscriptionConnector,
    SubscriptionOptions, SubscriptionSink,
};
use crate::broker::Broker;
use crate::error::{Error, Result};
use crate::sync::lock;

struct Stored {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    published: DateTime<Utc>,
}

#[derive(Default)]
struct Subscription {
    cursor: usize,
    redeliver: VecDeque<usize>,
    in_flight: HashMap<u64, BTreeSet<usize>>,
    acknowledged: usize,
}

impl Subscription {
    fn next(&mut self, end: usize) -> Option<usize> {
        if let Some(entry) = self.redeliver.pop_front() {
            return Some(entry);
        }
        (self.cursor < end).then(|| {
            self.cursor += 1;
            self.cursor - 1
        })
    }

    fn return_in_flight(&mut self, member: u64) {
        let Some(entries) = self.in_flight.remove(&member) else {
            return;
        };
        let mut queued: BTreeSet<usize> = self.redeliver.drain(..).collect();
        queued.extend(entries);
        self.redeliver = queued.into_iter().collect();
    }
}

#[derive(Default)]
struct TopicLog {
    entries: Vec<Stored>,
    subscriptions: HashMap<String, Subscription>,
}

#[derive(Default)]
struct HubState {
    topics: HashMap<String, TopicLog>,
    fail_next_receive: Option<String>,
    /// Publishes still allowed before the next one fails, and its message.
    fail_publish: Option<(usize, String)>,
    unavailable: bool,
}

impl HubState {
    fn subscription(&mut self, topic: &str, subscription: &str) -> Result<(&[Stored], &mut Subscription)> {
        let log = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| Error::Backend(format!("topic '{topic}' does not exist")))?;
        let TopicLog {
            entries,
            subscriptions,
        } = log;
        let sub = subscriptions.get_mut(subscription).ok_or_else(|| {
            Error::Backend(format!("subscription '{subscription}' on '{topic}' does not exist"))
        })?;
        Ok((entries.as_slice(), sub))
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(Error::Backend("broker is unavailable".to_string()));
        }
        Ok(())
    }

    fn check_publish(&mut self) -> Result<()> {
        let Some((remaining, _)) = self.fail_publish.as_mut() else {
            return Ok(());
        };
        if *remaining > 0 {
            *remaining -= 1;
            return Ok(());
        }
        let message = self.fail_publish.take().map(|(_, m)| m).unwrap_or_default();
        Err(Error::Backend(message))
    }
}

struct Hub {
    state: Mutex<HubState>,
    notify: Notify,
    next_member: AtomicU64,
}

/// In-process subscription backend. Clones share the same hub.
#[derive(Clone)]
pub struct MemoryPubSub {
    hub: Arc<Hub>,
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPubSub {
    #[must_use]
    pub fn new() -> Self {
        Self {
            hub: Arc::new(Hub {
                state: Mutex::new(HubState::default()),
                notify: Notify::new(),
                next_member: AtomicU64::new(0),
            }),
        }
    }

    /// Append a message to `topic`.
    pub fn publish(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> MessageId {
        let entry = {
            let mut state = lock(&self.hub.state);
            let log = state.topics.entry(topic.to_string()).or_default();
            log.entries.push(Stored {
                key: key.map(<[u8]>::to_vec),
                payload: payload.to_vec(),
                published: Utc::now(),
            });
            log.entries.len() - 1
        };
        self.hub.notify.notify_waiters();
        message_id(topic, entry)
    }

    /// Messages ever published to `topic`.
    pub fn len(&self, topic: &str) -> usize {
        lock(&self.hub.state)
            .topics
            .get(topic)
            .map_or(0, |log| log.entries.len())
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Messages the subscription has not handed out yet, including those
    /// queued for redelivery.
    pub fn backlog(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |end, sub| {
            end - sub.cursor + sub.redeliver.len()
        })
    }

    /// Messages handed out but not acknowledged.
    pub fn in_flight(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |_, sub| {
            sub.in_flight.values().map(BTreeSet::len).sum()
        })
    }

    pub fn acknowledged(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |_, sub| sub.acknowledged)
    }

    /// Members connected to the subscription.
    pub fn members(&self, topic: &str, subscription: &str) -> usize {
        self.with_subscription(topic, subscription, |_, sub| sub.in_flight.len())
    }

    /// Make the next receive of any member fail with `message`.
    pub fn fail_next_receive(&self, message: impl Into<String>) {
        lock(&self.hub.state).fail_next_receive = Some(message.into());
    }

    /// Let `count` more publishes through publishers succeed, then fail the
    /// next one with `message`.
    pub fn fail_publish_after(&self, count: usize, message: impl Into<String>) {
        lock(&self.hub.state).fail_publish = Some((count, message.into()));
    }

    /// Refuse new connections while `unavailable` is set.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.hub.state).unavailable = unavailable;
    }

    fn with_subscription<T: Default>(
        &self,
        topic: &str,
        subscription: &str,
        f: impl FnOnce(usize, &Subscription) -> T,
    ) -> T {
        let state = lock(&self.hub.state);
        state
            .topics
            .get(topic)
            .and_then(|log| {
                log.subscriptions
                    .get(subscription)
                    .map(|sub| f(log.entries.len(), sub))
            })
            .unwrap_or_default()
    }
}

fn message_id(topic: &str, entry: usize) -> MessageId {
    MessageId {
        topic: topic.to_string(),
        ledger: 0,
        entry: entry as u64,
        partition: -1,
        batch_index: -1,
    }
}

#[async_trait]
impl SubscriptionConnector for MemoryPubSub {
    async fn subscribe(
        &self,
        _broker: &Broker,
        options: SubscriptionOptions,
    ) -> Result<Box<dyn SubscriptionClient>> {
        let member = self.hub.next_member.fetch_add(1, Ordering::Relaxed);
        {
            let mut state = lock(&self.hub.state);
            state.check_available()?;
            let log = state.topics.entry(options.topic.clone()).or_default();
            let end = log.entries.len();
            let sub = log
                .subscriptions
                .entry(options.subscription.clone())
                .or_insert_with(|| Subscription {
                    cursor: match options.initial_position {
                        InitialPosition::Earliest => 0,
                        InitialPosition::Latest => end,
                    },
                    ..Subscription::default()
                });
            sub.in_flight.insert(member, BTreeSet::new());
        }
        Ok(Box::new(MemoryMember {
            pubsub: self.clone(),
            topic: options.topic,
            subscription: options.subscription,
            member,
            closed: false,
        }))
    }

    async fn publisher(
        &self,
        _broker: &Broker,
        topic: &str,
        _producer_name: &str,
    ) -> Result<Box<dyn SubscriptionSink>> {
        lock(&self.hub.state).check_available()?;
        Ok(Box::new(MemoryPublisher {
            pubsub: self.clone(),
            topic: topic.to_string(),
        }))
    }
}

struct MemoryMember {
    pubsub: MemoryPubSub,
    topic: String,
    subscription: String,
    member: u64,
    closed: bool,
}

impl MemoryMember {
    fn take(&self) -> Result<Option<ReceivedMessage>> {
        let mut state = lock(&self.pubsub.hub.state);
        if let Some(message) = state.fail_next_receive.take() {
            return Err(Error::Backend(message));
        }
        let (entries, sub) = state.subscription(&self.topic, &self.subscription)?;
        let Some(entry) = sub.next(entries.len()) else {
            return Ok(None);
        };
        sub.in_flight.entry(self.member).or_default().insert(entry);
        let stored = &entries[entry];
        Ok(Some(ReceivedMessage {
            id: message_id(&self.topic, entry),
            key: stored.key.clone(),
            payload: stored.payload.clone(),
            publish_time: Some(stored.published),
        }))
    }

    fn leave(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        {
            let mut state = lock(&self.pubsub.hub.state);
            if let Ok((_, sub)) = state.subscription(&self.topic, &self.subscription) {
                sub.return_in_flight(self.member);
            }
        }
        self.pubsub.hub.notify.notify_waiters();
    }
}

#[async_trait]
impl SubscriptionClient for MemoryMember {
    async fn receive(&mut self, timeout: Duration) -> Result<Option<ReceivedMessage>> {
        if self.closed {
            return Err(Error::Backend("consumer is closed".to_string()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.pubsub.hub.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(message) = self.take()? {
                return Ok(Some(message));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn acknowledge(&mut self, ids: &[MessageId]) -> Result<()> {
        let mut state = lock(&self.pubsub.hub.state);
        let (_, sub) = state.subscription(&self.topic, &self.subscription)?;
        let Some(in_flight) = sub.in_flight.get_mut(&self.member) else {
            return Err(Error::Backend("consumer left the subscription".to_string()));
        };
        let mut acknowledged = 0;
        for id in ids {
            if in_flight.remove(&(id.entry as usize)) {
                acknowledged += 1;
            }
        }
        sub.acknowledged += acknowledged;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.leave();
        Ok(())
    }
}

impl Drop for MemoryMember {
    fn drop(&mut self) {
        self.leave();
    }
}

struct MemoryPublisher {
    pubsub: MemoryPubSub,
    topic: String,
}

#[async_trait]
impl SubscriptionSink for MemoryPublisher {
    async fn publish(&mut self, key: Option<Vec<u8>>, payload: Vec<u8>) -> Result<()> {
        {
            let mut state = lock(&self.pubsub.hub.state);
            state.check_available()?;
            state.check_publish()?;
        }
        self.pubsub.publish(&self.topic, key.as_deref(), &payload);
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
