//! Redis version store.
//!
//! Key format: `{prefix}:version:{scope}:{aggregate_id}`, value is the last
//! applied version as a decimal string.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Client, RedisError, Script};
use tracing::{debug, info};

use super::{check_monotonic, CasOutcome, EventStore, Result, StorageError};

/// Returns `{1, new}` on swap, `{0, current}` on conflict. An absent record
/// is passed and reported as the empty string.
const CAS_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if not current then current = '' end
if current ~= ARGV[1] then
  return {0, current}
end
redis.call('SET', KEYS[1], ARGV[2])
return {1, ARGV[2]}
"#;

impl From<RedisError> for StorageError {
    fn from(e: RedisError) -> Self {
        if e.is_connection_dropped() || e.is_connection_refusal() || e.is_io_error() {
            StorageError::ConnectionLost(e.to_string())
        } else {
            StorageError::Database(e.to_string())
        }
    }
}

/// Redis implementation of [`EventStore`].
pub struct RedisEventStore {
    conn: ConnectionManager,
    key_prefix: String,
    cas: Script,
}

impl RedisEventStore {
    /// Create a new Redis version store.
    ///
    /// # Arguments
    /// * `url` - Redis connection URL (e.g., redis://localhost:6379)
    /// * `key_prefix` - Prefix for all keys (default: "eventide")
    pub async fn new(url: &str, key_prefix: Option<&str>) -> Result<Self> {
        let client = Client::open(url)?;
        let conn = ConnectionManager::new(client).await?;

        info!(url = %url, "Connected to Redis for versions");

        Ok(Self {
            conn,
            key_prefix: key_prefix.unwrap_or("eventide").to_string(),
            cas: Script::new(CAS_SCRIPT),
        })
    }

    fn version_key(&self, scope: &str, aggregate_id: &str) -> String {
        format!("{}:version:{}:{}", self.key_prefix, scope, aggregate_id)
    }

    fn parse(&self, scope: &str, aggregate_id: &str, raw: &str) -> Result<Option<u64>> {
        if raw.is_empty() {
            return Ok(None);
        }
        raw.parse().map(Some).map_err(|_| StorageError::Corrupt {
            scope: scope.to_string(),
            aggregate_id: aggregate_id.to_string(),
            value: raw.to_string(),
        })
    }
}

#[async_trait]
impl EventStore for RedisEventStore {
    async fn get_version(&self, scope: &str, aggregate_id: &str) -> Result<Option<u64>> {
        let key = self.version_key(scope, aggregate_id);
        let mut conn = self.conn.clone();

        let value: Option<String> = conn.get(&key).await?;
        match value {
            Some(raw) => self.parse(scope, aggregate_id, &raw),
            None => Ok(None),
        }
    }

    async fn compare_and_set_version(
        &self,
        scope: &str,
        aggregate_id: &str,
        expected: Option<u64>,
        new: u64,
    ) -> Result<CasOutcome> {
        check_monotonic(aggregate_id, expected, new)?;
        let key = self.version_key(scope, aggregate_id);
        let mut conn = self.conn.clone();
        let expected_arg = expected.map(|v| v.to_string()).unwrap_or_default();

        let (swapped, current): (i64, String) = self
            .cas
            .key(&key)
            .arg(&expected_arg)
            .arg(new.to_string())
            .invoke_async(&mut conn)
            .await?;

        if swapped == 1 {
            debug!(
                scope = %scope,
                aggregate_id = %aggregate_id,
                version = new,
                "Stored version in Redis"
            );
            return Ok(CasOutcome::Swapped);
        }
        Ok(CasOutcome::Conflict {
            actual: self.parse(scope, aggregate_id, &current)?,
        })
    }
}
