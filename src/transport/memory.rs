//! In-memory stream transport.
//!
//! Models the consumer-group semantics of Redis Streams closely enough to run
//! the full consumer and maintenance stack in one process: per-group delivery
//! cursors, per-consumer pending lists, idle tracking, claims and trimming.
//! Idle times use `tokio::time::Instant` so tests can drive them with paused
//! time.

use std::collections::{BTreeMap, HashMap};
use std::pin::pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::debug;

use super::{
    ConsumerInfo, GroupCreation, GroupInfo, PendingEntry, ReadCursor, Result, StartPosition,
    StreamTransport, TransportError, TrimPolicy,
};
use crate::event::{EntryId, StreamEntry};
use crate::subject::Subject;

struct PendingRecord {
    consumer: String,
    delivered_at: Instant,
    deliveries: u64,
}

#[derive(Default)]
struct GroupState {
    last_delivered: EntryId,
    pending: BTreeMap<EntryId, PendingRecord>,
    /// Consumer name to the last time it read.
    consumers: HashMap<String, Instant>,
}

impl GroupState {
    fn starting_at(last_delivered: EntryId) -> Self {
        Self {
            last_delivered,
            ..Default::default()
        }
    }

    fn touch(&mut self, consumer: &str, now: Instant) {
        self.consumers.insert(consumer.to_string(), now);
    }
}

#[derive(Default)]
struct StreamState {
    entries: BTreeMap<EntryId, Vec<u8>>,
    last_id: EntryId,
    groups: HashMap<String, GroupState>,
}

impl StreamState {
    fn next_id(&self) -> EntryId {
        let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0);
        if millis > self.last_id.millis {
            EntryId::new(millis, 0)
        } else {
            self.last_id.successor()
        }
    }

    fn group_mut(&mut self, subject: Subject, group: &str) -> Result<&mut GroupState> {
        self.groups
            .get_mut(group)
            .ok_or_else(|| TransportError::GroupNotFound {
                subject,
                group: group.to_string(),
            })
    }

    fn group(&self, subject: Subject, group: &str) -> Result<&GroupState> {
        self.groups
            .get(group)
            .ok_or_else(|| TransportError::GroupNotFound {
                subject,
                group: group.to_string(),
            })
    }
}

/// In-process stream transport.
#[derive(Default)]
pub struct MemoryStreamTransport {
    streams: Mutex<HashMap<Subject, StreamState>>,
    appended: Notify,
    fail_reads: AtomicBool,
    fail_acks: AtomicBool,
    connection_lost: AtomicBool,
}

impl MemoryStreamTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every group read fail with a transient command error.
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Make every acknowledgement fail with a transient command error.
    pub fn set_fail_acks(&self, fail: bool) {
        self.fail_acks.store(fail, Ordering::SeqCst);
    }

    /// Simulate losing the connection: every operation fails fatally.
    pub fn set_connection_lost(&self, lost: bool) {
        self.connection_lost.store(lost, Ordering::SeqCst);
        self.appended.notify_waiters();
    }

    fn check_connection(&self) -> Result<()> {
        if self.connection_lost.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionLost(
                "in-memory transport disconnected".to_string(),
            ));
        }
        Ok(())
    }

    /// Try to deliver entries without blocking.
    async fn read_once(
        &self,
        subject: Subject,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
    ) -> Result<Vec<StreamEntry>> {
        let now = Instant::now();
        let mut streams = self.streams.lock().await;
        let stream = streams
            .get_mut(&subject)
            .ok_or_else(|| TransportError::GroupNotFound {
                subject,
                group: group.to_string(),
            })?;
        let StreamState {
            entries, groups, ..
        } = stream;
        let state = groups
            .get_mut(group)
            .ok_or_else(|| TransportError::GroupNotFound {
                subject,
                group: group.to_string(),
            })?;
        state.touch(consumer, now);

        let mut delivered = Vec::new();
        match cursor {
            ReadCursor::New => {
                let fresh: Vec<(EntryId, Vec<u8>)> = entries
                    .range(state.last_delivered.successor()..)
                    .take(count)
                    .map(|(id, payload)| (*id, payload.clone()))
                    .collect();
                for (id, payload) in fresh {
                    state.last_delivered = id;
                    state.pending.insert(
                        id,
                        PendingRecord {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            deliveries: 1,
                        },
                    );
                    delivered.push(StreamEntry {
                        id,
                        subject,
                        payload,
                    });
                }
            }
            ReadCursor::Pending { after } => {
                for (id, record) in state.pending.range_mut(after.successor()..) {
                    if delivered.len() >= count {
                        break;
                    }
                    if record.consumer != consumer {
                        continue;
                    }
                    record.delivered_at = now;
                    record.deliveries += 1;
                    delivered.push(StreamEntry {
                        id: *id,
                        subject,
                        payload: entries.get(id).cloned().unwrap_or_default(),
                    });
                }
            }
        }

        Ok(delivered)
    }
}

#[async_trait]
impl StreamTransport for MemoryStreamTransport {
    async fn ensure_stream(&self, subject: Subject, anchor_group: &str) -> Result<()> {
        self.check_connection()?;
        let mut streams = self.streams.lock().await;
        if !streams.contains_key(&subject) {
            let mut stream = StreamState::default();
            stream
                .groups
                .insert(anchor_group.to_string(), GroupState::default());
            streams.insert(subject, stream);
            debug!(subject = %subject, "Created stream");
        }
        Ok(())
    }

    async fn append(&self, subject: Subject, payload: &[u8]) -> Result<EntryId> {
        self.check_connection()?;
        let id = {
            let mut streams = self.streams.lock().await;
            let stream = streams.entry(subject).or_default();
            let id = stream.next_id();
            stream.entries.insert(id, payload.to_vec());
            stream.last_id = id;
            id
        };
        self.appended.notify_waiters();
        Ok(id)
    }

    async fn create_group(
        &self,
        subject: Subject,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation> {
        self.check_connection()?;
        let mut streams = self.streams.lock().await;
        let stream = streams.entry(subject).or_default();
        if stream.groups.contains_key(group) {
            return Ok(GroupCreation::AlreadyExists);
        }
        let cursor = match start {
            StartPosition::Tail => stream.last_id,
            StartPosition::Beginning => EntryId::MIN,
        };
        stream
            .groups
            .insert(group.to_string(), GroupState::starting_at(cursor));
        Ok(GroupCreation::Created)
    }

    async fn read_group(
        &self,
        subject: Subject,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>> {
        self.check_connection()?;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(TransportError::Command("injected read failure".to_string()));
        }

        let deadline = Instant::now() + block;
        loop {
            let mut notified = pin!(self.appended.notified());
            notified.as_mut().enable();

            let entries = self
                .read_once(subject, group, consumer, cursor, count)
                .await?;
            if !entries.is_empty() || block.is_zero() || cursor != ReadCursor::New {
                return Ok(entries);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
            self.check_connection()?;
        }
    }

    async fn ack(&self, subject: Subject, group: &str, id: EntryId) -> Result<bool> {
        self.check_connection()?;
        if self.fail_acks.load(Ordering::SeqCst) {
            return Err(TransportError::Command("injected ack failure".to_string()));
        }
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get_mut(&subject) else {
            return Ok(false);
        };
        let Some(state) = stream.groups.get_mut(group) else {
            return Ok(false);
        };
        Ok(state.pending.remove(&id).is_some())
    }

    async fn claim(
        &self,
        subject: Subject,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<EntryId>> {
        self.check_connection()?;
        let now = Instant::now();
        let mut streams = self.streams.lock().await;
        let stream = streams
            .get_mut(&subject)
            .ok_or_else(|| TransportError::GroupNotFound {
                subject,
                group: group.to_string(),
            })?;
        let state = stream.group_mut(subject, group)?;

        let mut claimed = Vec::new();
        for id in ids {
            let Some(record) = state.pending.get_mut(id) else {
                continue;
            };
            if now.saturating_duration_since(record.delivered_at) < min_idle {
                continue;
            }
            record.consumer = consumer.to_string();
            record.delivered_at = now;
            claimed.push(*id);
        }
        if !claimed.is_empty() && !state.consumers.contains_key(consumer) {
            state.touch(consumer, now);
        }
        Ok(claimed)
    }

    async fn trim(&self, subject: Subject, policy: TrimPolicy) -> Result<u64> {
        self.check_connection()?;
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get_mut(&subject) else {
            return Ok(0);
        };

        let mut removed = 0;
        while stream.entries.len() > policy.max_len {
            let Some((&oldest, _)) = stream.entries.first_key_value() else {
                break;
            };
            if policy.protect_from.is_some_and(|floor| oldest >= floor) {
                break;
            }
            stream.entries.remove(&oldest);
            removed += 1;
        }
        Ok(removed)
    }

    async fn list_pending(
        &self,
        subject: Subject,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        self.check_connection()?;
        let now = Instant::now();
        let streams = self.streams.lock().await;
        let stream = streams
            .get(&subject)
            .ok_or_else(|| TransportError::GroupNotFound {
                subject,
                group: group.to_string(),
            })?;
        let state = stream.group(subject, group)?;

        Ok(state
            .pending
            .iter()
            .take(count)
            .map(|(id, record)| PendingEntry {
                id: *id,
                consumer: record.consumer.clone(),
                idle: now.saturating_duration_since(record.delivered_at),
                deliveries: record.deliveries,
            })
            .collect())
    }

    async fn list_consumers(&self, subject: Subject, group: &str) -> Result<Vec<ConsumerInfo>> {
        self.check_connection()?;
        let now = Instant::now();
        let streams = self.streams.lock().await;
        let stream = streams
            .get(&subject)
            .ok_or_else(|| TransportError::GroupNotFound {
                subject,
                group: group.to_string(),
            })?;
        let state = stream.group(subject, group)?;

        let mut consumers: Vec<ConsumerInfo> = state
            .consumers
            .iter()
            .map(|(name, last_seen)| ConsumerInfo {
                name: name.clone(),
                pending: state
                    .pending
                    .values()
                    .filter(|record| &record.consumer == name)
                    .count() as u64,
                idle: now.saturating_duration_since(*last_seen),
            })
            .collect();
        consumers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(consumers)
    }

    async fn list_groups(&self, subject: Subject) -> Result<Vec<GroupInfo>> {
        self.check_connection()?;
        let streams = self.streams.lock().await;
        let Some(stream) = streams.get(&subject) else {
            return Ok(Vec::new());
        };

        let mut groups: Vec<GroupInfo> = stream
            .groups
            .iter()
            .map(|(name, state)| GroupInfo {
                name: name.clone(),
                last_delivered: state.last_delivered,
                pending: state.pending.len() as u64,
            })
            .collect();
        groups.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(groups)
    }

    async fn delete_consumer(
        &self,
        subject: Subject,
        group: &str,
        consumer: &str,
    ) -> Result<u64> {
        self.check_connection()?;
        let mut streams = self.streams.lock().await;
        let Some(stream) = streams.get_mut(&subject) else {
            return Ok(0);
        };
        let state = stream.group_mut(subject, group)?;

        state.consumers.remove(consumer);
        let before = state.pending.len();
        state.pending.retain(|_, record| record.consumer != consumer);
        Ok((before - state.pending.len()) as u64)
    }

    async fn stream_len(&self, subject: Subject) -> Result<u64> {
        self.check_connection()?;
        let streams = self.streams.lock().await;
        Ok(streams
            .get(&subject)
            .map(|stream| stream.entries.len() as u64)
            .unwrap_or(0))
    }
}
