//! In-process broker with topics, partitions and consumer groups.
//!
//! Used by the demo binary and by tests. Each subscription is one group
//! member; partitions of a topic are spread round-robin over the group's
//! members subscribed to it (in join order) and reassigned whenever a member
//! joins or leaves. The group's committed offsets are the durable read
//! position: a newly assigned partition, or a partition rewound with
//! `seek_to_committed`, resumes from there.

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::ack::{AcknowledgmentToken, CommitPosition, OffsetCommitter};
use crate::broker::{BrokerClient, DeliveryFuture, Subscription};
use crate::config::{BrokerConfig, OffsetReset};
use crate::error::BrokerError;
use crate::record::{Record, SendResult, TopicPartition};

/// Most recent effective commits kept for inspection
pub const COMMIT_LOG_CAPACITY: usize = 1024;

#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<Inner>,
}

struct Inner {
    config: BrokerConfig,
    state: Mutex<BrokerState>,
    notify: Notify,
}

#[derive(Default)]
struct BrokerState {
    topics: HashMap<String, TopicLog>,
    groups: HashMap<String, GroupState>,
    members: HashMap<Uuid, MemberState>,
    commit_log: VecDeque<CommitPosition>,
    ack_delay: Option<Duration>,
}

struct TopicLog {
    partitions: Vec<Vec<StoredRecord>>,
    next_partition: u32,
}

struct StoredRecord {
    key: Option<String>,
    value: String,
}

#[derive(Default)]
struct GroupState {
    /// Join order drives assignment
    members: Vec<Uuid>,
    /// Next offset to read per partition
    committed: HashMap<TopicPartition, u64>,
}

struct MemberState {
    group_id: String,
    topics: Vec<String>,
    assignment: Vec<TopicPartition>,
    positions: HashMap<TopicPartition, u64>,
    paused: bool,
    cursor: usize,
}

/// Partition for a keyed record
pub fn partition_for_key(key: &str, partitions: u32) -> u32 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() % partitions.max(1) as u64) as u32
}

fn validate_topic(topic: &str) -> Result<(), BrokerError> {
    if topic.trim().is_empty() || topic.chars().any(char::is_whitespace) {
        return Err(BrokerError::InvalidTopic(topic.to_string()));
    }
    Ok(())
}

impl TopicLog {
    fn new(partitions: u32) -> Self {
        Self {
            partitions: (0..partitions.max(1)).map(|_| Vec::new()).collect(),
            next_partition: 0,
        }
    }

    fn end_offset(&self, partition: u32) -> u64 {
        self.partitions
            .get(partition as usize)
            .map(|p| p.len() as u64)
            .unwrap_or(0)
    }
}

impl Inner {
    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl BrokerState {
    /// Create `topic` if missing; returns whether it was created
    fn ensure_topic(&mut self, topic: &str, partitions: u32) -> bool {
        if self.topics.contains_key(topic) {
            return false;
        }
        self.topics.insert(topic.to_string(), TopicLog::new(partitions));
        true
    }

    /// Groups with a member interested in `topic`
    fn groups_subscribed_to(&self, topic: &str) -> Vec<String> {
        let mut groups: Vec<String> = self
            .members
            .values()
            .filter(|m| m.topics.iter().any(|t| t == topic))
            .map(|m| m.group_id.clone())
            .collect();
        groups.sort();
        groups.dedup();
        groups
    }

    fn start_position(&self, group_id: &str, tp: &TopicPartition, reset: OffsetReset) -> u64 {
        if let Some(offset) = self.groups.get(group_id).and_then(|g| g.committed.get(tp)) {
            return *offset;
        }
        match reset {
            OffsetReset::Earliest => 0,
            OffsetReset::Latest => self
                .topics
                .get(&tp.topic)
                .map(|log| log.end_offset(tp.partition))
                .unwrap_or(0),
        }
    }

    /// Recompute the partition assignment of every member of `group_id`
    fn rebalance(&mut self, group_id: &str, reset: OffsetReset) {
        let member_ids = match self.groups.get(group_id) {
            Some(group) => group.members.clone(),
            None => return,
        };

        let mut topics: Vec<String> = member_ids
            .iter()
            .filter_map(|id| self.members.get(id))
            .flat_map(|m| m.topics.iter().cloned())
            .collect();
        topics.sort();
        topics.dedup();

        let mut plan: HashMap<Uuid, Vec<TopicPartition>> =
            member_ids.iter().map(|id| (*id, Vec::new())).collect();

        for topic in &topics {
            let partition_count = match self.topics.get(topic) {
                Some(log) => log.partitions.len() as u32,
                None => continue,
            };
            let consumers: Vec<Uuid> = member_ids
                .iter()
                .filter(|id| {
                    self.members
                        .get(id)
                        .map_or(false, |m| m.topics.iter().any(|t| t == topic))
                })
                .copied()
                .collect();
            if consumers.is_empty() {
                continue;
            }
            for partition in 0..partition_count {
                let owner = consumers[partition as usize % consumers.len()];
                if let Some(assigned) = plan.get_mut(&owner) {
                    assigned.push(TopicPartition::new(topic.clone(), partition));
                }
            }
        }

        for (id, assignment) in plan {
            let new_partitions: Vec<(TopicPartition, u64)> = match self.members.get(&id) {
                Some(member) => assignment
                    .iter()
                    .filter(|tp| !member.positions.contains_key(*tp))
                    .map(|tp| (tp.clone(), self.start_position(group_id, tp, reset)))
                    .collect(),
                None => continue,
            };

            if let Some(member) = self.members.get_mut(&id) {
                member.positions.retain(|tp, _| assignment.contains(tp));
                member.positions.extend(new_partitions);
                trace!("Member {} of '{}' assigned {:?}", id, group_id, assignment);
                member.assignment = assignment;
                member.cursor = 0;
            }
        }
    }
}

impl OffsetCommitter for Inner {
    fn commit(&self, position: &CommitPosition) -> Result<bool, BrokerError> {
        let mut state = self.state();
        let tp = position.topic_partition();
        let next = position.offset + 1;

        let group = state.groups.entry(position.group_id.clone()).or_default();
        let advanced = group.committed.get(&tp).map_or(true, |current| *current < next);
        if advanced {
            group.committed.insert(tp, next);
            if state.commit_log.len() == COMMIT_LOG_CAPACITY {
                state.commit_log.pop_front();
            }
            state.commit_log.push_back(position.clone());
            trace!(
                "Committed {}[{}]@{} for group '{}'",
                position.topic,
                position.partition,
                position.offset,
                position.group_id
            );
        }
        Ok(advanced)
    }
}

impl MemoryBroker {
    pub fn new(config: BrokerConfig) -> Self {
        info!(
            "🗄️ In-memory broker ready (default partitions: {})",
            config.default_partitions
        );
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(BrokerState::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Create a topic with an explicit partition count. Existing topics are
    /// left untouched.
    pub fn create_topic(&self, topic: &str, partitions: u32) -> Result<(), BrokerError> {
        validate_topic(topic)?;
        let reset = self.inner.config.auto_offset_reset;
        let mut state = self.inner.state();
        if state.ensure_topic(topic, partitions) {
            debug!("Created topic '{}' with {} partitions", topic, partitions.max(1));
            for group in state.groups_subscribed_to(topic) {
                state.rebalance(&group, reset);
            }
        }
        drop(state);
        self.inner.notify.notify_waiters();
        Ok(())
    }

    /// Delay send completions (records are still appended immediately)
    pub fn set_ack_delay(&self, delay: Option<Duration>) {
        self.inner.state().ack_delay = delay;
    }

    pub fn partitions(&self, topic: &str) -> Option<u32> {
        self.inner
            .state()
            .topics
            .get(topic)
            .map(|log| log.partitions.len() as u32)
    }

    pub fn end_offset(&self, topic: &str, partition: u32) -> Option<u64> {
        self.inner
            .state()
            .topics
            .get(topic)
            .map(|log| log.end_offset(partition))
    }

    /// Every record stored on `topic`, partition by partition
    pub fn records(&self, topic: &str) -> Vec<Record> {
        let state = self.inner.state();
        let Some(log) = state.topics.get(topic) else {
            return Vec::new();
        };
        log.partitions
            .iter()
            .enumerate()
            .flat_map(|(partition, records)| {
                records.iter().enumerate().map(move |(offset, stored)| {
                    Record::new(
                        topic,
                        stored.key.clone(),
                        stored.value.clone(),
                        partition as u32,
                        offset as u64,
                    )
                })
            })
            .collect()
    }

    /// Next offset the group will read on a partition, if it ever committed
    pub fn committed_offset(&self, group_id: &str, topic: &str, partition: u32) -> Option<u64> {
        self.inner
            .state()
            .groups
            .get(group_id)
            .and_then(|g| g.committed.get(&TopicPartition::new(topic, partition)).copied())
    }

    /// Commits that actually moved a group position, oldest first. Only the
    /// last [`COMMIT_LOG_CAPACITY`] are kept.
    pub fn commit_log(&self) -> Vec<CommitPosition> {
        self.inner.state().commit_log.iter().cloned().collect()
    }

    pub fn group_members(&self, group_id: &str) -> usize {
        self.inner
            .state()
            .groups
            .get(group_id)
            .map(|g| g.members.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerClient for MemoryBroker {
    fn send(&self, topic: &str, key: Option<String>, value: String) -> DeliveryFuture {
        if let Err(e) = validate_topic(topic) {
            return DeliveryFuture::ready(Err(e));
        }

        let size = value.len() + key.as_ref().map_or(0, |k| k.len());
        if size > self.inner.config.max_message_bytes {
            return DeliveryFuture::ready(Err(BrokerError::Rejected(format!(
                "record of {} bytes exceeds max_message_bytes {}",
                size, self.inner.config.max_message_bytes
            ))));
        }

        let reset = self.inner.config.auto_offset_reset;
        let (result, delay) = {
            let mut state = self.inner.state();
            if state.ensure_topic(topic, self.inner.config.default_partitions) {
                debug!("Auto-created topic '{}'", topic);
                for group in state.groups_subscribed_to(topic) {
                    state.rebalance(&group, reset);
                }
            }

            let delay = state.ack_delay;
            let Some(log) = state.topics.get_mut(topic) else {
                return DeliveryFuture::ready(Err(BrokerError::InvalidTopic(topic.to_string())));
            };
            let partition_count = log.partitions.len() as u32;
            let partition = match &key {
                Some(k) => partition_for_key(k, partition_count),
                None => {
                    let p = log.next_partition % partition_count;
                    log.next_partition = log.next_partition.wrapping_add(1);
                    p
                }
            };
            let records = &mut log.partitions[partition as usize];
            records.push(StoredRecord { key, value });
            let result = SendResult {
                topic: topic.to_string(),
                partition,
                offset: records.len() as u64 - 1,
            };
            (result, delay)
        };

        trace!("Stored {}[{}]@{}", result.topic, result.partition, result.offset);
        self.inner.notify.notify_waiters();

        match (delay, tokio::runtime::Handle::try_current()) {
            (Some(delay), Ok(handle)) => {
                let (tx, fut) = DeliveryFuture::channel();
                handle.spawn(async move {
                    tokio::time::sleep(delay).await;
                    tx.complete(Ok(result));
                });
                fut
            }
            _ => DeliveryFuture::ready(Ok(result)),
        }
    }

    async fn subscribe(&self, topics: &[String], group_id: &str) -> Result<Box<dyn Subscription>, BrokerError> {
        if topics.is_empty() {
            return Err(BrokerError::InvalidTopic(String::new()));
        }
        for topic in topics {
            validate_topic(topic)?;
        }

        let id = Uuid::new_v4();
        let reset = self.inner.config.auto_offset_reset;
        {
            let mut state = self.inner.state();
            for topic in topics {
                state.ensure_topic(topic, self.inner.config.default_partitions);
            }
            state.members.insert(
                id,
                MemberState {
                    group_id: group_id.to_string(),
                    topics: topics.to_vec(),
                    assignment: Vec::new(),
                    positions: HashMap::new(),
                    paused: false,
                    cursor: 0,
                },
            );
            state.groups.entry(group_id.to_string()).or_default().members.push(id);
            state.rebalance(group_id, reset);
        }
        self.inner.notify.notify_waiters();

        debug!("Member {} joined group '{}' for {:?}", id, group_id, topics);
        Ok(Box::new(MemorySubscription {
            id,
            group_id: group_id.to_string(),
            inner: self.inner.clone(),
            closed: false,
        }))
    }

    fn broker_type(&self) -> &'static str {
        "in-memory"
    }
}

pub struct MemorySubscription {
    id: Uuid,
    group_id: String,
    inner: Arc<Inner>,
    closed: bool,
}

impl MemorySubscription {
    fn with_member<T>(&self, f: impl FnOnce(&mut MemberState) -> T) -> Option<T> {
        let mut state = self.inner.state();
        state.members.get_mut(&self.id).map(f)
    }
}

#[async_trait]
impl Subscription for MemorySubscription {
    async fn next(&mut self) -> Option<(Record, AcknowledgmentToken)> {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before looking so a concurrent send is not missed
            notified.as_mut().enable();

            {
                let mut state = self.inner.state();
                let BrokerState { members, topics, .. } = &mut *state;
                let member = members.get_mut(&self.id)?;

                if !member.paused && !member.assignment.is_empty() {
                    let count = member.assignment.len();
                    for step in 0..count {
                        let index = (member.cursor + step) % count;
                        let tp = &member.assignment[index];
                        let position = member.positions.get(tp).copied().unwrap_or(0);
                        let stored = topics
                            .get(&tp.topic)
                            .and_then(|log| log.partitions.get(tp.partition as usize))
                            .and_then(|records| records.get(position as usize));

                        if let Some(stored) = stored {
                            let record = Record::new(
                                tp.topic.clone(),
                                stored.key.clone(),
                                stored.value.clone(),
                                tp.partition,
                                position,
                            );
                            member.positions.insert(tp.clone(), position + 1);
                            member.cursor = (index + 1) % count;

                            let token = AcknowledgmentToken::new(
                                CommitPosition {
                                    group_id: self.group_id.clone(),
                                    topic: record.topic().to_string(),
                                    partition: record.partition(),
                                    offset: record.offset(),
                                },
                                self.inner.clone(),
                            );
                            return Some((record, token));
                        }
                    }
                }
            }

            notified.await;
        }
    }

    fn pause(&mut self) {
        self.with_member(|m| m.paused = true);
    }

    fn resume(&mut self) {
        self.with_member(|m| m.paused = false);
        self.inner.notify.notify_waiters();
    }

    fn seek_to_committed(&mut self, partition: &TopicPartition) {
        let reset = self.inner.config.auto_offset_reset;
        {
            let mut state = self.inner.state();
            let start = state.start_position(&self.group_id, partition, reset);
            if let Some(member) = state.members.get_mut(&self.id) {
                if member.assignment.contains(partition) {
                    member.positions.insert(partition.clone(), start);
                }
            }
        }
        self.inner.notify.notify_waiters();
    }

    fn assignment(&self) -> Vec<TopicPartition> {
        self.with_member(|m| m.assignment.clone()).unwrap_or_default()
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let reset = self.inner.config.auto_offset_reset;
        {
            let mut state = self.inner.state();
            state.members.remove(&self.id);
            if let Some(group) = state.groups.get_mut(&self.group_id) {
                group.members.retain(|id| *id != self.id);
            }
            state.rebalance(&self.group_id, reset);
        }
        self.inner.notify.notify_waiters();
        debug!("Member {} left group '{}'", self.id, self.group_id);
    }

    fn group_id(&self) -> &str {
        &self.group_id
    }
}

impl Drop for MemorySubscription {
    fn drop(&mut self) {
        self.close();
    }
}
