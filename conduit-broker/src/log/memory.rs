//! In-process partitioned log.
//!
//! [`MemoryLog`] behaves like a small Kafka cluster: topics are split into
//! partitions with partition-local offsets, consumers join groups and get
//! partitions assigned round-robin, committed offsets are stored per group,
//! and producers can write transactionally. Rebalances are eager: every
//! member has all its partitions revoked before the new assignment is handed
//! out, and listeners run outside the cluster lock.
//!
//! Test hooks ([`revoke_all`](MemoryLog::revoke_all),
//! [`rebalance`](MemoryLog::rebalance),
//! [`fail_next_poll`](MemoryLog::fail_next_poll),
//! [`set_unavailable`](MemoryLog::set_unavailable)) drive the situations a
//! real cluster produces on its own.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    ClientConfig, LogClient, LogConnector, LogSink, PartitionSeeker, RebalanceListener, SeekTo,
    codec_from_config,
};
use crate::codec::{Codec, CodecRegistry};
use crate::error::{Error, Result};
use crate::event::RawRecord;
use crate::sync::lock;

/// Partitions of topics created implicitly.
pub const DEFAULT_PARTITIONS: usize = 4;

#[derive(Debug, Clone)]
struct Stored {
    key: Option<Vec<u8>>,
    payload: Vec<u8>,
    timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct MemberState {
    assigned: BTreeSet<i32>,
    positions: HashMap<i32, i64>,
}

struct Member {
    id: u64,
    reset: SeekTo,
    state: Arc<Mutex<MemberState>>,
    listener: Arc<dyn RebalanceListener>,
}

#[derive(Default)]
struct Group {
    committed: HashMap<i32, i64>,
    members: Vec<Member>,
}

/// `(group id, topic)`
type GroupKey = (String, String);

struct ClusterState {
    default_partitions: usize,
    topics: HashMap<String, Vec<Vec<Stored>>>,
    groups: HashMap<GroupKey, Group>,
    seeks: Vec<SeekRecord>,
    fail_next_poll: Option<String>,
    unavailable: bool,
}

impl ClusterState {
    fn partitions(&mut self, topic: &str) -> &mut Vec<Vec<Stored>> {
        let count = self.default_partitions;
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); count])
    }

    fn end_offset(&self, topic: &str, partition: i32) -> i64 {
        self.topics
            .get(topic)
            .and_then(|partitions| partitions.get(partition as usize))
            .map_or(0, |records| records.len() as i64)
    }
}

struct Cluster {
    state: Mutex<ClusterState>,
    notify: Notify,
    next_member: AtomicU64,
}

/// A seek performed by a rebalance listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekRecord {
    pub group: String,
    pub topic: String,
    pub partition: i32,
    pub to: SeekTo,
}

/// Listener call collected under the cluster lock, made after releasing it.
enum Notice {
    Revoked(Arc<dyn RebalanceListener>, Vec<i32>),
    Assigned(Arc<dyn RebalanceListener>, Vec<i32>, MemberSeeker),
}

fn deliver(notices: Vec<Notice>) {
    for notice in notices {
        match notice {
            Notice::Revoked(listener, partitions) => listener.on_revoked(&partitions),
            Notice::Assigned(listener, partitions, seeker) => {
                listener.on_assigned(&partitions, &seeker);
            }
        }
    }
}

/// In-process partitioned log. Clones share the same cluster.
#[derive(Clone)]
pub struct MemoryLog {
    cluster: Arc<Cluster>,
}

impl Default for MemoryLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLog {
    #[must_use]
    pub fn new() -> Self {
        Self::with_partitions(DEFAULT_PARTITIONS)
    }

    /// A cluster whose implicitly created topics have `partitions` partitions.
    #[must_use]
    pub fn with_partitions(partitions: usize) -> Self {
        Self {
            cluster: Arc::new(Cluster {
                state: Mutex::new(ClusterState {
                    default_partitions: partitions.max(1),
                    topics: HashMap::new(),
                    groups: HashMap::new(),
                    seeks: Vec::new(),
                    fail_next_poll: None,
                    unavailable: false,
                }),
                notify: Notify::new(),
                next_member: AtomicU64::new(0),
            }),
        }
    }

    /// Create `topic` with an explicit partition count. Existing topics are
    /// left alone.
    pub fn create_topic(&self, topic: &str, partitions: usize) {
        lock(&self.cluster.state)
            .topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions.max(1)]);
    }

    pub fn partition_count(&self, topic: &str) -> usize {
        lock(&self.cluster.state).partitions(topic).len()
    }

    /// Append a record, choosing the partition by key hash (partition 0
    /// without a key). Returns the partition and offset.
    pub fn append(&self, topic: &str, key: Option<&[u8]>, payload: &[u8]) -> (i32, i64) {
        let partition = {
            let mut state = lock(&self.cluster.state);
            partition_for_key(key, state.partitions(topic).len())
        };
        let offset = self.append_to(topic, partition, key, payload);
        (partition, offset)
    }

    /// Append a record to one partition and return its offset.
    pub fn append_to(&self, topic: &str, partition: i32, key: Option<&[u8]>, payload: &[u8]) -> i64 {
        let offset = {
            let mut state = lock(&self.cluster.state);
            let partitions = state.partitions(topic);
            let index = (partition.max(0) as usize).min(partitions.len() - 1);
            let records = &mut partitions[index];
            records.push(Stored {
                key: key.map(<[u8]>::to_vec),
                payload: payload.to_vec(),
                timestamp: Utc::now(),
            });
            records.len() as i64 - 1
        };
        self.cluster.notify.notify_waiters();
        offset
    }

    /// Offset the next record of the partition will get.
    pub fn end_offset(&self, topic: &str, partition: i32) -> i64 {
        lock(&self.cluster.state).end_offset(topic, partition)
    }

    /// Total records across the partitions of `topic`.
    pub fn len(&self, topic: &str) -> usize {
        lock(&self.cluster.state)
            .topics
            .get(topic)
            .map_or(0, |partitions| partitions.iter().map(Vec::len).sum())
    }

    pub fn is_empty(&self, topic: &str) -> bool {
        self.len(topic) == 0
    }

    /// Committed offset of `group` for a partition.
    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        lock(&self.cluster.state)
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .and_then(|g| g.committed.get(&partition).copied())
    }

    /// Members of `group` on `topic`.
    pub fn members(&self, group: &str, topic: &str) -> usize {
        lock(&self.cluster.state)
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map_or(0, |g| g.members.len())
    }

    /// Seeks performed so far, oldest first.
    pub fn seeks(&self) -> Vec<SeekRecord> {
        lock(&self.cluster.state).seeks.clone()
    }

    /// Revoke every partition from every member of the group without
    /// reassigning them.
    pub fn revoke_all(&self, group: &str, topic: &str) {
        let notices = {
            let mut state = lock(&self.cluster.state);
            match state.groups.get_mut(&(group.to_string(), topic.to_string())) {
                Some(g) => revoke_members(g),
                None => Vec::new(),
            }
        };
        deliver(notices);
    }

    /// Run a full rebalance of the group.
    pub fn rebalance(&self, group: &str, topic: &str) {
        let key = (group.to_string(), topic.to_string());
        let notices = {
            let mut state = lock(&self.cluster.state);
            self.rebalance_locked(&mut state, &key)
        };
        deliver(notices);
    }

    /// Make the next poll of any consumer fail with `message`.
    pub fn fail_next_poll(&self, message: impl Into<String>) {
        lock(&self.cluster.state).fail_next_poll = Some(message.into());
    }

    /// Refuse new connections while `unavailable` is set.
    pub fn set_unavailable(&self, unavailable: bool) {
        lock(&self.cluster.state).unavailable = unavailable;
    }

    fn rebalance_locked(&self, state: &mut ClusterState, key: &GroupKey) -> Vec<Notice> {
        let count = state.partitions(&key.1).len();
        let ClusterState { groups, topics, .. } = state;
        let Some(group) = groups.get_mut(key) else {
            return Vec::new();
        };

        let mut notices = revoke_members(group);
        if group.members.is_empty() {
            return notices;
        }
        group.members.sort_by_key(|m| m.id);

        let members = group.members.len();
        let end = |partition: i32| {
            topics
                .get(&key.1)
                .and_then(|p| p.get(partition as usize))
                .map_or(0, |r| r.len() as i64)
        };
        for (index, member) in group.members.iter().enumerate() {
            let mut assigned = Vec::new();
            {
                let mut member_state = lock(&member.state);
                for partition in (0..count as i32).filter(|p| *p as usize % members == index) {
                    let position = match group.committed.get(&partition) {
                        Some(offset) => *offset,
                        None if member.reset == SeekTo::Beginning => 0,
                        None => end(partition),
                    };
                    member_state.assigned.insert(partition);
                    member_state.positions.insert(partition, position);
                    assigned.push(partition);
                }
            }
            if !assigned.is_empty() {
                notices.push(Notice::Assigned(
                    Arc::clone(&member.listener),
                    assigned,
                    MemberSeeker {
                        cluster: Arc::clone(&self.cluster),
                        member: Arc::clone(&member.state),
                        group: key.0.clone(),
                        topic: key.1.clone(),
                    },
                ));
            }
        }
        notices
    }
}

fn revoke_members(group: &mut Group) -> Vec<Notice> {
    let mut notices = Vec::new();
    for member in &group.members {
        let mut member_state = lock(&member.state);
        if member_state.assigned.is_empty() {
            continue;
        }
        let revoked: Vec<i32> = member_state.assigned.iter().copied().collect();
        member_state.assigned.clear();
        member_state.positions.clear();
        notices.push(Notice::Revoked(Arc::clone(&member.listener), revoked));
    }
    notices
}

fn partition_for_key(key: Option<&[u8]>, partitions: usize) -> i32 {
    match key {
        Some(k) => {
            let mut hasher = DefaultHasher::new();
            k.hash(&mut hasher);
            (hasher.finish() % partitions as u64) as i32
        }
        None => 0,
    }
}

struct MemberSeeker {
    cluster: Arc<Cluster>,
    member: Arc<Mutex<MemberState>>,
    group: String,
    topic: String,
}

impl PartitionSeeker for MemberSeeker {
    fn seek(&self, partition: i32, to: SeekTo) -> Result<()> {
        let mut state = lock(&self.cluster.state);
        let position = match to {
            SeekTo::Beginning => 0,
            SeekTo::End => state.end_offset(&self.topic, partition),
        };
        let mut member = lock(&self.member);
        if !member.assigned.contains(&partition) {
            return Err(Error::Backend(format!(
                "partition {partition} of '{}' is not assigned",
                self.topic
            )));
        }
        member.positions.insert(partition, position);
        state.seeks.push(SeekRecord {
            group: self.group.clone(),
            topic: self.topic.clone(),
            partition,
            to,
        });
        Ok(())
    }
}

fn required<'a>(config: &'a ClientConfig, key: &str) -> Result<&'a str> {
    config
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| Error::Config(format!("client configuration lacks '{key}'")))
}

#[async_trait]
impl LogConnector for MemoryLog {
    async fn connect_consumer(
        &self,
        config: &ClientConfig,
        codecs: Arc<CodecRegistry>,
        topic: &str,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<Box<dyn LogClient>> {
        let codec = codec_from_config(config, &codecs)?;
        let group = required(config, "group.id")?.to_string();
        let auto_commit = config
            .get("enable.auto.commit")
            .is_some_and(|v| v == "true");
        let reset = match config.get("auto.offset.reset").map(String::as_str) {
            Some("earliest") => SeekTo::Beginning,
            _ => SeekTo::End,
        };

        let id = self.cluster.next_member.fetch_add(1, Ordering::Relaxed);
        let member_state = Arc::new(Mutex::new(MemberState::default()));
        let key = (group.clone(), topic.to_string());
        let notices = {
            let mut state = lock(&self.cluster.state);
            if state.unavailable {
                return Err(Error::Backend("broker is unavailable".to_string()));
            }
            state.groups.entry(key.clone()).or_default().members.push(Member {
                id,
                reset,
                state: Arc::clone(&member_state),
                listener,
            });
            self.rebalance_locked(&mut state, &key)
        };
        deliver(notices);

        Ok(Box::new(MemoryLogClient {
            log: self.clone(),
            key,
            member: id,
            state: member_state,
            codec,
            auto_commit,
            closed: false,
        }))
    }

    async fn connect_producer(
        &self,
        config: &ClientConfig,
        codecs: Arc<CodecRegistry>,
        topic: &str,
    ) -> Result<Box<dyn LogSink>> {
        let codec = codec_from_config(config, &codecs)?;
        if lock(&self.cluster.state).unavailable {
            return Err(Error::Backend("broker is unavailable".to_string()));
        }
        Ok(Box::new(MemorySink {
            log: self.clone(),
            topic: topic.to_string(),
            codec,
            transactional: config.contains_key("transactional.id"),
            in_transaction: false,
            pending: Vec::new(),
        }))
    }
}

struct MemoryLogClient {
    log: MemoryLog,
    key: GroupKey,
    member: u64,
    state: Arc<Mutex<MemberState>>,
    codec: Arc<Codec>,
    auto_commit: bool,
    closed: bool,
}

impl MemoryLogClient {
    fn take(&self, max: usize) -> Result<Vec<RawRecord>> {
        let mut cluster = lock(&self.log.cluster.state);
        if let Some(message) = cluster.fail_next_poll.take() {
            return Err(Error::Backend(message));
        }

        let mut member = lock(&self.state);
        let mut records = Vec::new();
        let assigned: Vec<i32> = member.assigned.iter().copied().collect();
        for partition in assigned {
            if records.len() >= max {
                break;
            }
            let Some(log) = cluster
                .topics
                .get(&self.key.1)
                .and_then(|p| p.get(partition as usize))
            else {
                continue;
            };
            let start = member.positions.get(&partition).copied().unwrap_or(0).max(0) as usize;
            let end = log.len().min(start + (max - records.len()));
            for (offset, stored) in log.iter().enumerate().take(end).skip(start) {
                records.push(RawRecord {
                    partition,
                    position: offset as i64,
                    key: stored.key.clone(),
                    payload: stored.payload.clone(),
                    timestamp: Some(stored.timestamp),
                });
            }
            if end > start {
                member.positions.insert(partition, end as i64);
            }
        }

        if self.auto_commit
            && let Some(group) = cluster.groups.get_mut(&self.key)
        {
            group.committed.extend(member.positions.iter());
        }
        Ok(records)
    }

    fn leave(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let notices = {
            let mut state = lock(&self.log.cluster.state);
            let mut notices = Vec::new();
            if let Some(group) = state.groups.get_mut(&self.key)
                && let Some(index) = group.members.iter().position(|m| m.id == self.member)
            {
                let member = group.members.remove(index);
                let mut member_state = lock(&member.state);
                if !member_state.assigned.is_empty() {
                    let revoked = member_state.assigned.iter().copied().collect();
                    notices.push(Notice::Revoked(Arc::clone(&member.listener), revoked));
                }
                member_state.assigned.clear();
                member_state.positions.clear();
            }
            notices.extend(self.log.rebalance_locked(&mut state, &self.key));
            notices
        };
        deliver(notices);
    }
}

#[async_trait]
impl LogClient for MemoryLogClient {
    fn codec(&self) -> Arc<Codec> {
        Arc::clone(&self.codec)
    }

    async fn poll(&mut self, max: usize, timeout: Duration) -> Result<Vec<RawRecord>> {
        if self.closed {
            return Err(Error::Backend("consumer is closed".to_string()));
        }
        let deadline = Instant::now() + timeout;
        loop {
            let notified = self.log.cluster.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let records = self.take(max)?;
            if !records.is_empty() {
                return Ok(records);
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(records);
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let mut cluster = lock(&self.log.cluster.state);
        let member = lock(&self.state);
        let group = cluster
            .groups
            .get_mut(&self.key)
            .ok_or_else(|| Error::Backend("consumer left the group".to_string()))?;
        for partition in &member.assigned {
            if let Some(position) = member.positions.get(partition) {
                group.committed.insert(*partition, *position);
            }
        }
        Ok(())
    }

    fn lag(&self, partitions: &[i32]) -> HashMap<i32, u64> {
        let cluster = lock(&self.log.cluster.state);
        let member = lock(&self.state);
        partitions
            .iter()
            .filter_map(|p| {
                let position = member.positions.get(p)?;
                let end = cluster.end_offset(&self.key.1, *p);
                Some((*p, end.saturating_sub(*position).max(0) as u64))
            })
            .collect()
    }

    async fn close(&mut self) -> Result<()> {
        self.leave();
        Ok(())
    }
}

impl Drop for MemoryLogClient {
    fn drop(&mut self) {
        self.leave();
    }
}

struct MemorySink {
    log: MemoryLog,
    topic: String,
    codec: Arc<Codec>,
    transactional: bool,
    in_transaction: bool,
    pending: Vec<(Option<Vec<u8>>, Vec<u8>)>,
}

impl MemorySink {
    fn require_transactional(&self) -> Result<()> {
        if !self.transactional {
            return Err(Error::Backend(
                "producer has no transactional.id".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LogSink for MemorySink {
    fn codec(&self) -> Arc<Codec> {
        Arc::clone(&self.codec)
    }

    async fn send(&mut self, key: Option<Vec<u8>>, payload: Vec<u8>) -> Result<()> {
        if !self.transactional {
            self.log.append(&self.topic, key.as_deref(), &payload);
            return Ok(());
        }
        if !self.in_transaction {
            return Err(Error::Backend("no transaction in progress".to_string()));
        }
        self.pending.push((key, payload));
        Ok(())
    }

    async fn flush(&mut self, _timeout: Duration) -> Result<()> {
        Ok(())
    }

    async fn begin_transaction(&mut self) -> Result<()> {
        self.require_transactional()?;
        if self.in_transaction {
            return Err(Error::Backend("transaction already in progress".to_string()));
        }
        self.in_transaction = true;
        Ok(())
    }

    async fn commit_transaction(&mut self, _timeout: Duration) -> Result<()> {
        self.require_transactional()?;
        for (key, payload) in self.pending.drain(..) {
            self.log.append(&self.topic, key.as_deref(), &payload);
        }
        self.in_transaction = false;
        Ok(())
    }

    async fn abort_transaction(&mut self, _timeout: Duration) -> Result<()> {
        self.require_transactional()?;
        self.pending.clear();
        self.in_transaction = false;
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.pending.clear();
        self.in_transaction = false;
        Ok(())
    }
}
