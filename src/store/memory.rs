//! In-memory version store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{check_monotonic, CasOutcome, EventStore, Result, StorageError};

/// Key type: (scope, aggregate id).
type VersionKey = (String, String);

/// Version store held in process memory.
#[derive(Default)]
pub struct MemoryEventStore {
    versions: RwLock<HashMap<VersionKey, u64>>,
    fail_on_write: AtomicBool,
    connection_lost: AtomicBool,
}

impl MemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make compare-and-set fail with a transient database error.
    pub fn set_fail_on_write(&self, fail: bool) {
        self.fail_on_write.store(fail, Ordering::SeqCst);
    }

    pub fn set_connection_lost(&self, lost: bool) {
        self.connection_lost.store(lost, Ordering::SeqCst);
    }

    /// Force a record, bypassing the compare-and-set. Used to simulate a
    /// concurrent writer.
    pub async fn force_version(&self, scope: &str, aggregate_id: &str, version: u64) {
        self.versions
            .write()
            .await
            .insert((scope.to_string(), aggregate_id.to_string()), version);
    }

    fn check_connection(&self) -> Result<()> {
        if self.connection_lost.load(Ordering::SeqCst) {
            return Err(StorageError::ConnectionLost(
                "in-memory store disconnected".to_string(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl EventStore for MemoryEventStore {
    async fn get_version(&self, scope: &str, aggregate_id: &str) -> Result<Option<u64>> {
        self.check_connection()?;
        let versions = self.versions.read().await;
        Ok(versions
            .get(&(scope.to_string(), aggregate_id.to_string()))
            .copied())
    }

    async fn compare_and_set_version(
        &self,
        scope: &str,
        aggregate_id: &str,
        expected: Option<u64>,
        new: u64,
    ) -> Result<CasOutcome> {
        self.check_connection()?;
        check_monotonic(aggregate_id, expected, new)?;
        if self.fail_on_write.load(Ordering::SeqCst) {
            return Err(StorageError::Database("injected write failure".to_string()));
        }

        let mut versions = self.versions.write().await;
        let key = (scope.to_string(), aggregate_id.to_string());
        let actual = versions.get(&key).copied();
        if actual != expected {
            return Ok(CasOutcome::Conflict { actual });
        }
        versions.insert(key, new);
        Ok(CasOutcome::Swapped)
    }
}
