//! Redis Streams transport.
//!
//! Each subject is one stream under `{prefix}:{subject}`. Every entry carries
//! a single `event` field holding the encoded envelope.
//!
//! Non-blocking commands share a `ConnectionManager`. Blocking `XREADGROUP`
//! calls get their own multiplexed connection per reader so a long block
//! never stalls acknowledgements or maintenance commands behind it.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::{
    StreamClaimOptions, StreamId, StreamInfoConsumersReply, StreamInfoGroupsReply,
    StreamPendingCountReply, StreamRangeReply, StreamReadOptions, StreamReadReply,
};
use redis::{AsyncCommands, Client, RedisError};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    ConsumerInfo, GroupCreation, GroupInfo, PendingEntry, ReadCursor, Result, StartPosition,
    StreamTransport, TransportError, TrimPolicy,
};
use crate::event::{EntryId, StreamEntry, EVENT_FIELD};
use crate::subject::Subject;

impl From<RedisError> for TransportError {
    fn from(e: RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            TransportError::ConnectionLost(e.to_string())
        } else {
            TransportError::Command(e.to_string())
        }
    }
}

fn group_error(subject: Subject, group: &str) -> impl FnOnce(RedisError) -> TransportError + '_ {
    move |e| {
        if e.code() == Some("NOGROUP") {
            TransportError::GroupNotFound {
                subject,
                group: group.to_string(),
            }
        } else {
            e.into()
        }
    }
}

fn parse_id(raw: &str) -> Result<EntryId> {
    raw.parse::<EntryId>()
        .map_err(|e| TransportError::MalformedReply(e.to_string()))
}

fn millis(duration: Duration) -> usize {
    usize::try_from(duration.as_millis()).unwrap_or(usize::MAX)
}

/// Redis Streams implementation of [`StreamTransport`].
pub struct RedisStreamTransport {
    client: Client,
    conn: ConnectionManager,
    key_prefix: String,
    readers: Mutex<HashMap<String, MultiplexedConnection>>,
}

impl RedisStreamTransport {
    /// Connect to Redis.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `key_prefix` - Prefix for all stream keys (default: "eventide")
    pub async fn new(url: &str, key_prefix: Option<&str>) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client.clone()).await?;

        info!(url = %url, "Connected to Redis for streams");

        Ok(Self {
            client,
            conn,
            key_prefix: key_prefix.unwrap_or("eventide").to_string(),
            readers: Mutex::new(HashMap::new()),
        })
    }

    fn stream_key(&self, subject: Subject) -> String {
        format!("{}:{}", self.key_prefix, subject)
    }

    async fn reader(&self, name: &str) -> Result<MultiplexedConnection> {
        let mut readers = self.readers.lock().await;
        if let Some(conn) = readers.get(name) {
            return Ok(conn.clone());
        }
        let conn = self.client.get_multiplexed_async_connection().await?;
        readers.insert(name.to_string(), conn.clone());
        Ok(conn)
    }

    async fn drop_reader(&self, name: &str) {
        self.readers.lock().await.remove(name);
    }

    fn to_entry(subject: Subject, raw: &StreamId) -> Result<StreamEntry> {
        Ok(StreamEntry {
            id: parse_id(&raw.id)?,
            subject,
            // Entries trimmed while pending come back without fields.
            payload: raw.get::<Vec<u8>>(EVENT_FIELD).unwrap_or_default(),
        })
    }

    /// Id of the oldest entry that `max_len` would retain.
    async fn retention_boundary(&self, key: &str, max_len: usize) -> Result<Option<EntryId>> {
        let mut conn = self.conn.clone();
        if max_len == 0 {
            let newest: StreamRangeReply = conn.xrevrange_count(key, "+", "-", 1).await?;
            return match newest.ids.first() {
                Some(entry) => Ok(Some(parse_id(&entry.id)?.successor())),
                None => Ok(None),
            };
        }
        let retained: StreamRangeReply = conn.xrevrange_count(key, "+", "-", max_len).await?;
        if retained.ids.len() < max_len {
            return Ok(None);
        }
        match retained.ids.last() {
            Some(entry) => Ok(Some(parse_id(&entry.id)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl StreamTransport for RedisStreamTransport {
    async fn ensure_stream(&self, subject: Subject, anchor_group: &str) -> Result<()> {
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();

        let exists: bool = conn.exists(&key).await?;
        if exists {
            return Ok(());
        }
        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(&key, anchor_group, "$")
            .await
        {
            Ok(()) => {
                debug!(subject = %subject, key = %key, "Created stream");
                Ok(())
            }
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn append(&self, subject: Subject, payload: &[u8]) -> Result<EntryId> {
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();

        let id: String = conn.xadd(&key, "*", &[(EVENT_FIELD, payload)]).await?;
        parse_id(&id)
    }

    async fn create_group(
        &self,
        subject: Subject,
        group: &str,
        start: StartPosition,
    ) -> Result<GroupCreation> {
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();
        let start_id = match start {
            StartPosition::Tail => "$",
            StartPosition::Beginning => "0",
        };

        match conn
            .xgroup_create_mkstream::<_, _, _, ()>(&key, group, start_id)
            .await
        {
            Ok(()) => Ok(GroupCreation::Created),
            Err(e) if e.code() == Some("BUSYGROUP") => Ok(GroupCreation::AlreadyExists),
            Err(e) => Err(e.into()),
        }
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
        let key = self.stream_key(subject);
        let mut options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count);

        let (start_id, reply) = match cursor {
            ReadCursor::New => {
                if !block.is_zero() {
                    options = options.block(millis(block));
                }
                let reader_name = format!("{}/{}/{}", key, group, consumer);
                let mut conn = self.reader(&reader_name).await?;
                let reply: std::result::Result<Option<StreamReadReply>, RedisError> =
                    conn.xread_options(&[&key], &[">"], &options).await;
                if let Err(e) = &reply {
                    if e.is_connection_dropped() || e.is_io_error() {
                        warn!(reader = %reader_name, error = %e, "Dropping broken reader connection");
                        self.drop_reader(&reader_name).await;
                    }
                }
                (">".to_string(), reply)
            }
            ReadCursor::Pending { after } => {
                // XREADGROUP with an explicit id returns entries strictly after it.
                let start_id = after.to_string();
                let mut conn = self.conn.clone();
                let reply: std::result::Result<Option<StreamReadReply>, RedisError> =
                    conn.xread_options(&[&key], &[&start_id], &options).await;
                (start_id, reply)
            }
        };

        let reply = reply.map_err(group_error(subject, group))?;
        let mut entries = Vec::new();
        for stream in reply.map(|r| r.keys).unwrap_or_default() {
            for raw in &stream.ids {
                entries.push(Self::to_entry(subject, raw)?);
            }
        }

        if !entries.is_empty() {
            debug!(
                subject = %subject,
                group = %group,
                consumer = %consumer,
                from = %start_id,
                count = entries.len(),
                "Read entries"
            );
        }
        Ok(entries)
    }

    async fn ack(&self, subject: Subject, group: &str, id: EntryId) -> Result<bool> {
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();

        let acked: u64 = conn
            .xack(&key, group, &[id.to_string()])
            .await
            .map_err(group_error(subject, group))?;
        Ok(acked > 0)
    }

    async fn claim(
        &self,
        subject: Subject,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[EntryId],
    ) -> Result<Vec<EntryId>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();
        let raw_ids: Vec<String> = ids.iter().map(EntryId::to_string).collect();

        let claimed: Vec<String> = conn
            .xclaim_options(
                &key,
                group,
                consumer,
                millis(min_idle),
                &raw_ids,
                StreamClaimOptions::default().with_justid(),
            )
            .await
            .map_err(group_error(subject, group))?;

        claimed.iter().map(|raw| parse_id(raw)).collect()
    }

    async fn trim(&self, subject: Subject, policy: TrimPolicy) -> Result<u64> {
        let key = self.stream_key(subject);

        let Some(boundary) = self.retention_boundary(&key, policy.max_len).await? else {
            return Ok(0);
        };
        let floor = match policy.protect_from {
            Some(protected) => boundary.min(protected),
            None => boundary,
        };

        let mut conn = self.conn.clone();
        let removed: u64 = redis::cmd("XTRIM")
            .arg(&key)
            .arg("MINID")
            .arg("~")
            .arg(floor.to_string())
            .query_async(&mut conn)
            .await?;

        debug!(subject = %subject, floor = %floor, removed = removed, "Trimmed stream");
        Ok(removed)
    }

    async fn list_pending(
        &self,
        subject: Subject,
        group: &str,
        count: usize,
    ) -> Result<Vec<PendingEntry>> {
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();

        let reply: StreamPendingCountReply = conn
            .xpending_count(&key, group, "-", "+", count)
            .await
            .map_err(group_error(subject, group))?;

        reply
            .ids
            .into_iter()
            .map(|pending| {
                Ok(PendingEntry {
                    id: parse_id(&pending.id)?,
                    consumer: pending.consumer,
                    idle: Duration::from_millis(pending.last_delivered_ms as u64),
                    deliveries: pending.times_delivered as u64,
                })
            })
            .collect()
    }

    async fn list_consumers(&self, subject: Subject, group: &str) -> Result<Vec<ConsumerInfo>> {
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();

        let reply: StreamInfoConsumersReply = conn
            .xinfo_consumers(&key, group)
            .await
            .map_err(group_error(subject, group))?;

        Ok(reply
            .consumers
            .into_iter()
            .map(|consumer| ConsumerInfo {
                name: consumer.name,
                pending: consumer.pending as u64,
                idle: Duration::from_millis(consumer.idle as u64),
            })
            .collect())
    }

    async fn list_groups(&self, subject: Subject) -> Result<Vec<GroupInfo>> {
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();

        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Ok(Vec::new());
        }
        let reply: StreamInfoGroupsReply = conn.xinfo_groups(&key).await?;

        reply
            .groups
            .into_iter()
            .map(|group| {
                Ok(GroupInfo {
                    last_delivered: parse_id(&group.last_delivered_id)?,
                    pending: group.pending as u64,
                    name: group.name,
                })
            })
            .collect()
    }

    async fn delete_consumer(
        &self,
        subject: Subject,
        group: &str,
        consumer: &str,
    ) -> Result<u64> {
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();

        let dropped: u64 = conn
            .xgroup_delconsumer(&key, group, consumer)
            .await
            .map_err(group_error(subject, group))?;

        self.drop_reader(&format!("{}/{}/{}", key, group, consumer))
            .await;
        Ok(dropped)
    }

    async fn stream_len(&self, subject: Subject) -> Result<u64> {
        let key = self.stream_key(subject);
        let mut conn = self.conn.clone();

        let len: u64 = conn.xlen(&key).await?;
        Ok(len)
    }
}
