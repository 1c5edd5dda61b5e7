//! Aggregate version records.
//!
//! This module contains:
//! - `EventStore` trait: last applied version per (service, aggregate)
//! - Implementations: in-memory (`MemoryEventStore`), Redis
//!
//! Versions only ever move forward. The compare-and-set is the single point
//! where concurrent deliveries of the same aggregate are serialized across
//! processes.

use async_trait::async_trait;

pub mod memory;
#[cfg(feature = "redis")]
pub mod redis;

pub use memory::MemoryEventStore;
#[cfg(feature = "redis")]
pub use self::redis::RedisEventStore;

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Corrupt version record for {scope}/{aggregate_id}: {value}")]
    Corrupt {
        scope: String,
        aggregate_id: String,
        value: String,
    },

    #[error("Version must increase: {current} -> {requested} for {aggregate_id}")]
    NonMonotonic {
        aggregate_id: String,
        current: u64,
        requested: u64,
    },
}

impl StorageError {
    /// Whether the store itself is unreachable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::ConnectionLost(_))
    }
}

/// Outcome of a version compare-and-set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CasOutcome {
    Swapped,
    /// Someone else moved the record first.
    Conflict { actual: Option<u64> },
}

/// Storage interface for last-applied aggregate versions.
///
/// `scope` is the consuming service. Each service owns its own records, so
/// two services applying the same event never contend.
///
/// Implementations:
/// - `MemoryEventStore`: development and tests
/// - `RedisEventStore`: one key per record, Lua compare-and-set
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Last applied version, or `None` if nothing was applied yet.
    async fn get_version(&self, scope: &str, aggregate_id: &str) -> Result<Option<u64>>;

    /// Atomically move the record from `expected` to `new`.
    ///
    /// Fails with [`StorageError::NonMonotonic`] when `new` does not exceed
    /// `expected`.
    async fn compare_and_set_version(
        &self,
        scope: &str,
        aggregate_id: &str,
        expected: Option<u64>,
        new: u64,
    ) -> Result<CasOutcome>;
}

pub(crate) fn check_monotonic(aggregate_id: &str, expected: Option<u64>, new: u64) -> Result<()> {
    let current = expected.unwrap_or(0);
    if new <= current {
        return Err(StorageError::NonMonotonic {
            aggregate_id: aggregate_id.to_string(),
            current,
            requested: new,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_monotonic() {
        assert!(check_monotonic("a", None, 1).is_ok());
        assert!(check_monotonic("a", Some(3), 5).is_ok());
        assert!(matches!(
            check_monotonic("a", Some(3), 3),
            Err(StorageError::NonMonotonic { current: 3, .. })
        ));
        assert!(check_monotonic("a", None, 0).is_err());
    }

    #[test]
    fn test_only_connection_loss_is_fatal() {
        assert!(StorageError::ConnectionLost("gone".into()).is_fatal());
        assert!(!StorageError::Database("busy".into()).is_fatal());
    }
}
