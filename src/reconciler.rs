//! Version reconciliation.
//!
//! Gates every delivered event against the last applied version of its
//! aggregate. Stream order is not trusted: an event is applied only when it
//! is exactly the next version, stale versions are skipped, and events that
//! arrive ahead of a missing predecessor are deferred (left unacknowledged)
//! until the predecessor shows up.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::OwnedMutexGuard;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use crate::cold_storage::{BackfillRequest, BackfillSink, LoggingBackfillSink};
use crate::event::{EntryId, Event};
use crate::handler::{EventHandler, HandlerError};
use crate::store::{CasOutcome, EventStore, StorageError};
use crate::subject::Subject;

/// Compare-and-set attempts before a conflicting apply is deferred.
const CAS_ATTEMPTS: usize = 2;

/// Deferrals not retried for this many maximum ages are forgotten.
const FORGET_AFTER_MAX_AGES: u32 = 4;

/// Result type for reconciliation.
pub type Result<T> = std::result::Result<T, ReconcileError>;

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ReconcileError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ReconcileError::Storage(e) if e.is_fatal())
    }
}

/// Three-way apply decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Handler ran and the version record moved forward.
    Applied,
    /// Version already applied; acknowledge without side effects.
    Skipped { last_applied: u64 },
    /// A predecessor is missing; leave unacknowledged.
    Deferred {
        last_applied: Option<u64>,
        expected: u64,
    },
}

impl ApplyOutcome {
    /// Whether the entry may be acknowledged.
    pub fn is_settled(&self) -> bool {
        !matches!(self, ApplyOutcome::Deferred { .. })
    }
}

/// Decision for a version against the stored record, before any side effect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionCheck {
    Apply,
    Stale,
    Gap,
}

/// Classify `version` against the last applied version.
///
/// With `adopt_unknown`, the first version seen for an aggregate without a
/// record is applied whatever its number. Used when a service starts
/// consuming a subject whose earlier history it will never see.
pub fn classify(last_applied: Option<u64>, version: u64, adopt_unknown: bool) -> VersionCheck {
    let last = last_applied.unwrap_or(0);
    if version <= last {
        VersionCheck::Stale
    } else if version == last + 1 || (last_applied.is_none() && adopt_unknown) {
        VersionCheck::Apply
    } else {
        VersionCheck::Gap
    }
}

/// What to do with entries deferred past `max_deferred_age`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationPolicy {
    /// Log the stuck entry and keep waiting.
    #[default]
    LogOnly,
    /// Hand a backfill request to the configured sink.
    RequestBackfill,
}

fn default_max_deferred_age_secs() -> u64 {
    300
}

/// Reconciler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconcilerConfig {
    /// Seconds an entry may stay deferred before it is escalated.
    #[serde(default = "default_max_deferred_age_secs")]
    pub max_deferred_age_secs: u64,
    pub escalation: EscalationPolicy,
    pub adopt_unknown_aggregates: bool,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            max_deferred_age_secs: default_max_deferred_age_secs(),
            escalation: EscalationPolicy::default(),
            adopt_unknown_aggregates: false,
        }
    }
}

impl ReconcilerConfig {
    pub fn max_deferred_age(&self) -> Duration {
        Duration::from_secs(self.max_deferred_age_secs)
    }
}

struct DeferredState {
    first_deferred: Instant,
    last_deferred: Instant,
    escalated: bool,
}

/// First-deferral times of entries waiting on a predecessor.
///
/// Per process. An entry reclaimed by another instance starts aging again
/// there, and is forgotten here once this process stops retrying it.
#[derive(Default)]
pub struct DeferredTracker {
    entries: Mutex<HashMap<(Subject, EntryId), DeferredState>>,
}

impl DeferredTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note a deferral. Returns the entry's age the first time it reaches
    /// `max_age`, and `None` otherwise.
    ///
    /// Entries not deferred again within `FORGET_AFTER_MAX_AGES` times
    /// `max_age` were settled or reclaimed elsewhere and are dropped.
    pub fn record(&self, subject: Subject, id: EntryId, max_age: Duration) -> Option<Duration> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);

        let forget_after = max_age.saturating_mul(FORGET_AFTER_MAX_AGES);
        let before = entries.len();
        entries.retain(|_, state| now.saturating_duration_since(state.last_deferred) < forget_after);
        if entries.len() < before {
            debug!(
                forgotten = before - entries.len(),
                "Forgot deferrals no longer retried here"
            );
        }

        let state = entries.entry((subject, id)).or_insert(DeferredState {
            first_deferred: now,
            last_deferred: now,
            escalated: false,
        });
        state.last_deferred = now;
        let age = now.saturating_duration_since(state.first_deferred);
        if age >= max_age && !state.escalated {
            state.escalated = true;
            return Some(age);
        }
        None
    }

    pub fn clear(&self, subject: Subject, id: EntryId) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&(subject, id));
    }

    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// In-process per-aggregate mutual exclusion.
///
/// Entries are dropped once nobody holds or waits for them.
#[derive(Default)]
struct AggregateLocks {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct AggregateGuard<'a> {
    locks: &'a AggregateLocks,
    aggregate_id: String,
    guard: OwnedMutexGuard<()>,
}

impl AggregateLocks {
    async fn acquire(&self, aggregate_id: &str) -> AggregateGuard<'_> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(aggregate_id.to_string()).or_default().clone()
        };
        AggregateGuard {
            locks: self,
            aggregate_id: aggregate_id.to_string(),
            guard: lock.lock_owned().await,
        }
    }

    fn len(&self) -> usize {
        self.locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl Drop for AggregateGuard<'_> {
    fn drop(&mut self) {
        let mut locks = self
            .locks
            .locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        // The map and this guard are the only holders.
        if Arc::strong_count(OwnedMutexGuard::mutex(&self.guard)) == 2 {
            locks.remove(&self.aggregate_id);
        }
    }
}

/// Applies events of one consuming service in version order.
pub struct VersionReconciler {
    store: Arc<dyn EventStore>,
    scope: String,
    config: ReconcilerConfig,
    locks: AggregateLocks,
    deferred: DeferredTracker,
    backfill: Arc<dyn BackfillSink>,
}

impl VersionReconciler {
    /// Reconciler for the records of `scope` (the consuming service).
    pub fn new(
        store: Arc<dyn EventStore>,
        scope: impl Into<String>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            store,
            scope: scope.into(),
            config,
            locks: AggregateLocks::default(),
            deferred: DeferredTracker::new(),
            backfill: Arc::new(LoggingBackfillSink),
        }
    }

    pub fn with_backfill_sink(mut self, sink: Arc<dyn BackfillSink>) -> Self {
        self.backfill = sink;
        self
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn deferred(&self) -> &DeferredTracker {
        &self.deferred
    }

    /// Apply `event` through `handler` if it is the aggregate's next version.
    ///
    /// The handler runs before the version is persisted. A handler error
    /// leaves the record untouched.
    pub async fn apply(&self, event: &Event, handler: &dyn EventHandler) -> Result<ApplyOutcome> {
        let _guard = self.locks.acquire(&event.aggregate_id).await;
        let adopt = self.config.adopt_unknown_aggregates;

        let last = self
            .store
            .get_version(&self.scope, &event.aggregate_id)
            .await?;
        match classify(last, event.version, adopt) {
            VersionCheck::Stale => {
                return Ok(ApplyOutcome::Skipped {
                    last_applied: last.unwrap_or(0),
                })
            }
            VersionCheck::Gap => {
                return Ok(ApplyOutcome::Deferred {
                    last_applied: last,
                    expected: last.unwrap_or(0) + 1,
                })
            }
            VersionCheck::Apply => {}
        }

        handler.handle(event).await?;

        let mut expected = last;
        for _ in 0..CAS_ATTEMPTS {
            match self
                .store
                .compare_and_set_version(&self.scope, &event.aggregate_id, expected, event.version)
                .await?
            {
                CasOutcome::Swapped => {
                    debug!(
                        scope = %self.scope,
                        aggregate_id = %event.aggregate_id,
                        version = event.version,
                        "Applied event"
                    );
                    return Ok(ApplyOutcome::Applied);
                }
                CasOutcome::Conflict { actual } => {
                    warn!(
                        scope = %self.scope,
                        aggregate_id = %event.aggregate_id,
                        version = event.version,
                        expected = ?expected,
                        actual = ?actual,
                        "Version conflict"
                    );
                    match classify(actual, event.version, adopt) {
                        VersionCheck::Stale => {
                            return Ok(ApplyOutcome::Skipped {
                                last_applied: actual.unwrap_or(0),
                            })
                        }
                        VersionCheck::Gap => {
                            expected = actual;
                            break;
                        }
                        VersionCheck::Apply => expected = actual,
                    }
                }
            }
        }

        Ok(ApplyOutcome::Deferred {
            last_applied: expected,
            expected: expected.unwrap_or(0) + 1,
        })
    }

    /// [`apply`](Self::apply) for a stream entry, tracking how long it has
    /// been deferred and escalating it once it is too old.
    pub async fn apply_entry(
        &self,
        entry_id: EntryId,
        event: &Event,
        handler: &dyn EventHandler,
    ) -> Result<ApplyOutcome> {
        let outcome = self.apply(event, handler).await?;

        match outcome {
            ApplyOutcome::Deferred { last_applied, .. } => {
                let max_age = self.config.max_deferred_age();
                if let Some(age) = self.deferred.record(event.subject, entry_id, max_age) {
                    self.escalate(entry_id, event, last_applied, age).await;
                }
            }
            _ => self.deferred.clear(event.subject, entry_id),
        }
        Ok(outcome)
    }

    async fn escalate(
        &self,
        entry_id: EntryId,
        event: &Event,
        last_applied: Option<u64>,
        age: Duration,
    ) {
        let request = BackfillRequest {
            scope: self.scope.clone(),
            subject: event.subject,
            aggregate_id: event.aggregate_id.clone(),
            from_version: last_applied.unwrap_or(0) + 1,
            waiting_version: event.version,
            entry_id,
            deferred_for: age,
        };

        match self.config.escalation {
            EscalationPolicy::LogOnly => {
                warn!(
                    scope = %self.scope,
                    subject = %event.subject,
                    aggregate_id = %event.aggregate_id,
                    entry_id = %entry_id,
                    from_version = request.from_version,
                    waiting_version = request.waiting_version,
                    deferred_secs = age.as_secs(),
                    "Entry deferred past its maximum age"
                );
            }
            EscalationPolicy::RequestBackfill => {
                if let Err(e) = self.backfill.request_backfill(request).await {
                    error!(
                        scope = %self.scope,
                        subject = %event.subject,
                        aggregate_id = %event.aggregate_id,
                        entry_id = %entry_id,
                        error = %e,
                        "Failed to request backfill"
                    );
                }
            }
        }
    }
}
