//! Stream transport boundary.
//!
//! This module contains:
//! - `StreamTransport` trait: append-only subject streams with consumer groups
//! - Transport value types (pending entries, consumer info, trim policy)
//! - Implementations: in-memory (`MemoryStreamTransport`), Redis Streams
//!
//! The trait mirrors the XADD / XGROUP / XREADGROUP / XACK / XCLAIM / XTRIM /
//! XPENDING primitives. Everything above this layer is transport agnostic.

use std::time::Duration;

use async_trait::async_trait;

use crate::event::{EntryId, StreamEntry};
use crate::subject::Subject;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryStreamTransport;
#[cfg(feature = "redis")]
pub use self::redis::RedisStreamTransport;

/// Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Transport command failed: {0}")]
    Command(String),

    #[error("Consumer group '{group}' does not exist on '{subject}'")]
    GroupNotFound { subject: Subject, group: String },

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Malformed transport reply: {0}")]
    MalformedReply(String),
}

impl TransportError {
    /// Whether the error means the transport itself is gone.
    ///
    /// Everything else is transient and retried on the next poll.
    pub fn is_fatal(&self) -> bool {
        matches!(self, TransportError::ConnectionLost(_))
    }
}

/// Where a newly created consumer group starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartPosition {
    /// Only entries appended after the group was created (`$`).
    #[default]
    Tail,
    /// The whole retained history (`0`), for migration and backfill.
    Beginning,
}

/// Outcome of an idempotent group creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupCreation {
    Created,
    AlreadyExists,
}

/// What a group read returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadCursor {
    /// Entries never delivered to this group (`>`).
    New,
    /// This consumer's own pending entries with ids greater than `after`.
    Pending { after: EntryId },
}

impl ReadCursor {
    /// Start of a sweep over the consumer's pending list.
    pub fn pending_from_start() -> Self {
        ReadCursor::Pending {
            after: EntryId::MIN,
        }
    }
}

/// Delivered but unacknowledged entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: EntryId,
    /// Consumer currently owning the entry.
    pub consumer: String,
    /// Time since the entry was last delivered or claimed.
    pub idle: Duration,
    pub deliveries: u64,
}

/// Consumer registration inside a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: u64,
    /// Time since the consumer last read.
    pub idle: Duration,
}

/// Consumer group registered on a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    /// Last entry handed to any consumer of the group. Later entries have
    /// not been seen by the group yet.
    pub last_delivered: EntryId,
    pub pending: u64,
}

/// Trimming bound for one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrimPolicy {
    /// Approximate number of entries to retain.
    pub max_len: usize,
    /// Entries at or after this id are never removed.
    pub protect_from: Option<EntryId>,
}

impl TrimPolicy {
    pub fn max_len(max_len: usize) -> Self {
        Self {
            max_len,
            protect_from: None,
        }
    }

    pub fn protecting(mut self, id: Option<EntryId>) -> Self {
        self.protect_from = id;
        self
    }
}

/// Interface to a log-structured, consumer-group-capable stream store.
///
/// Implementations:
/// - `MemoryStreamTransport`: in-process model, for development and tests
/// - `RedisStreamTransport`: Redis Streams
#[async_trait]
pub trait StreamTransport: Send + Sync {
    /// Make sure the subject's stream exists.
    ///
    /// `anchor_group` is created at the tail when the stream is missing so that
    /// the stream can exist before anything is appended. No-op otherwise.
    async fn ensure_stream(&self, subject: Subject, anchor_group: &str) -> Result<()>;

    /// Append an encoded event, returning its assigned id.
    async fn append(&self, subject: Subject, payload: &[u8]) -> Result<EntryId>;

    /// Create a consumer group. Existing groups are left untouched.
    async fn create_group(
        &self,
        subject: Subject,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation>;

    /// Read up to `count` entries for `consumer`.
    ///
    /// For [`ReadCursor::New`] this waits up to `block` for new entries and
    /// adds whatever it returns to the consumer's pending list. A zero `block`
    /// returns immediately. Pending reads never block.
    async fn read_group(
        &self,
        subject: Subject,
        group: &str,
        consumer: &str,
        cursor: ReadCursor,
        count: usize,
        block: Duration,
    ) -> Result<Vec<StreamEntry>>;

    /// Acknowledge an entry. Returns whether it was still pending.
    async fn ack(&self, subject: Subject, group: &str, id: EntryId) -> Result<bool>;

    /// Transfer ownership of pending entries idle for at least `min_idle`.
    ///
    /// Returns the ids actually claimed.
    async fn claim(
        &self,
        subject: Subject,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<EntryId>>;

    /// Remove oldest entries per `policy`. Returns the number removed.
    async fn trim(&self, subject: Subject, policy: TrimPolicy) -> Result<u64>;

    /// Oldest `count` pending entries of the group, ordered by id.
    async fn list_pending(
        &self,
        subject: Subject,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>>;

    async fn list_consumers(&self, subject: Subject, group: &str) -> Result<Vec<ConsumerInfo>>;

    /// Every group on the subject's stream. Empty when the stream is missing.
    async fn list_groups(&self, subject: Subject) -> Result<Vec<GroupInfo>>;

    /// Remove a consumer registration. Returns the pending entries it dropped.
    async fn delete_consumer(&self, subject: Subject, group: &str, consumer: &str)
        -> Result<u64>;

    async fn stream_len(&self, subject: Subject) -> Result<u64>;
}
