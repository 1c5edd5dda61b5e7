//! Cold storage handoff.
//!
//! Archived events live outside the stream. The replay bridge pulls them
//! lazily, upgrades each to the current schema and pushes it through the same
//! version reconciliation as live entries, so replays and live traffic can
//! overlap safely.
//!
//! Backfill requests go the other way: when a deferred entry waits too long
//! for its predecessor, the reconciler asks a [`BackfillSink`] to fetch the
//! missing versions from cold storage.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::event::{EntryId, Event};
use crate::handler::EventHandler;
use crate::reconciler::{ApplyOutcome, ReconcileError, VersionReconciler};
use crate::subject::Subject;
use crate::upcast::{UpcastError, Upcaster};

/// Result type for cold storage operations.
pub type Result<T> = std::result::Result<T, ColdStorageError>;

#[derive(Debug, thiserror::Error)]
pub enum ColdStorageError {
    #[error("Cold storage unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to decode archived event: {0}")]
    Decode(String),

    #[error(transparent)]
    Upcast(#[from] UpcastError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error("Backfill receiver closed")]
    BackfillClosed,
}

/// Where a replay starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayMarker {
    Beginning,
    /// Events that occurred at or after this instant.
    Since(DateTime<Utc>),
}

impl ReplayMarker {
    fn admits(&self, occurred_at: DateTime<Utc>) -> bool {
        match self {
            ReplayMarker::Beginning => true,
            ReplayMarker::Since(since) => occurred_at >= *since,
        }
    }
}

/// Archived event, possibly written in an older schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyEvent {
    pub subject: Subject,
    pub aggregate_id: String,
    pub version: u64,
    pub schema_version: u32,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
}

impl From<LegacyEvent> for Event {
    fn from(legacy: LegacyEvent) -> Self {
        Event {
            subject: legacy.subject,
            aggregate_id: legacy.aggregate_id,
            version: legacy.version,
            schema_version: legacy.schema_version,
            payload: legacy.payload,
            occurred_at: legacy.occurred_at,
        }
    }
}

/// Archival event source.
pub trait ColdStorage: Send + Sync {
    /// Lazily yield archived events of `subject` from `marker` on, in
    /// archive order.
    fn fetch_events_since(
        &self,
        subject: Subject,
        marker: ReplayMarker,
    ) -> BoxStream<'_, Result<LegacyEvent>>;
}

/// Cold storage held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryColdStorage {
    events: Vec<LegacyEvent>,
}

impl MemoryColdStorage {
    pub fn new(events: impl IntoIterator<Item = LegacyEvent>) -> Self {
        Self {
            events: events.into_iter().collect(),
        }
    }

    pub fn push(&mut self, event: LegacyEvent) {
        self.events.push(event);
    }
}

impl ColdStorage for MemoryColdStorage {
    fn fetch_events_since(
        &self,
        subject: Subject,
        marker: ReplayMarker,
    ) -> BoxStream<'_, Result<LegacyEvent>> {
        stream::iter(
            self.events
                .iter()
                .filter(move |event| event.subject == subject && marker.admits(event.occurred_at))
                .cloned()
                .map(Ok),
        )
        .boxed()
    }
}

/// Counts from one replay run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub applied: u64,
    pub skipped: u64,
    /// Events still waiting on a predecessor when the replay ended.
    pub deferred: u64,
    /// Events whose handler still failed when the replay ended.
    pub failed: u64,
}

/// What one replay attempt left behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Settled,
    Deferred,
    Failed,
}

/// Feeds cold storage into a service's reconciler.
pub struct ReplayBridge {
    storage: Arc<dyn ColdStorage>,
    upcaster: Arc<Upcaster>,
    reconciler: Arc<VersionReconciler>,
}

impl ReplayBridge {
    pub fn new(
        storage: Arc<dyn ColdStorage>,
        upcaster: Arc<Upcaster>,
        reconciler: Arc<VersionReconciler>,
    ) -> Self {
        Self {
            storage,
            upcaster,
            reconciler,
        }
    }

    /// Replay `subject` from `marker` through `handler`.
    ///
    /// Archives are not guaranteed to be in version order. Deferred events
    /// are held back and retried after the stream is drained, until a full
    /// pass makes no progress. Handler failures are logged and retried the
    /// same way; storage errors end the replay.
    pub async fn replay(
        &self,
        subject: Subject,
        marker: ReplayMarker,
        handler: &dyn EventHandler,
    ) -> Result<ReplayReport> {
        let mut report = ReplayReport::default();
        let mut held = Vec::new();

        let mut events = self.storage.fetch_events_since(subject, marker);
        while let Some(legacy) = events.next().await {
            let event = self.upcaster.upcast(Event::from(legacy?))?;
            let attempt = self.attempt(&event, handler, &mut report).await?;
            if attempt != Attempt::Settled {
                held.push((event, attempt));
            }
        }

        loop {
            let before = held.len();
            let mut still_held = Vec::new();
            for (event, _) in held {
                let attempt = self.attempt(&event, handler, &mut report).await?;
                if attempt != Attempt::Settled {
                    still_held.push((event, attempt));
                }
            }
            held = still_held;
            if held.is_empty() || held.len() == before {
                break;
            }
        }
        for (_, attempt) in &held {
            match attempt {
                Attempt::Deferred => report.deferred += 1,
                Attempt::Failed => report.failed += 1,
                Attempt::Settled => {}
            }
        }

        if report.deferred > 0 || report.failed > 0 {
            warn!(
                subject = %subject,
                deferred = report.deferred,
                failed = report.failed,
                "Replay finished with events left unapplied"
            );
        }
        info!(
            subject = %subject,
            applied = report.applied,
            skipped = report.skipped,
            "Cold storage replay finished"
        );
        Ok(report)
    }

    async fn attempt(
        &self,
        event: &Event,
        handler: &dyn EventHandler,
        report: &mut ReplayReport,
    ) -> Result<Attempt> {
        match self.reconciler.apply(event, handler).await {
            Ok(ApplyOutcome::Applied) => {
                report.applied += 1;
                Ok(Attempt::Settled)
            }
            Ok(ApplyOutcome::Skipped { .. }) => {
                report.skipped += 1;
                Ok(Attempt::Settled)
            }
            Ok(ApplyOutcome::Deferred { .. }) => Ok(Attempt::Deferred),
            Err(ReconcileError::Handler(e)) => {
                warn!(
                    subject = %event.subject,
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    error = %e,
                    "Handler failed during replay"
                );
                Ok(Attempt::Failed)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Request to recover versions missing from the live stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillRequest {
    pub scope: String,
    pub subject: Subject,
    pub aggregate_id: String,
    /// First version the service has not seen.
    pub from_version: u64,
    /// Version of the entry that is waiting.
    pub waiting_version: u64,
    pub entry_id: EntryId,
    pub deferred_for: Duration,
}

/// Receives escalated backfill requests.
#[async_trait]
pub trait BackfillSink: Send + Sync {
    async fn request_backfill(&self, request: BackfillRequest) -> Result<()>;
}

/// Sink that only records the request in the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingBackfillSink;

#[async_trait]
impl BackfillSink for LoggingBackfillSink {
    async fn request_backfill(&self, request: BackfillRequest) -> Result<()> {
        warn!(
            scope = %request.scope,
            subject = %request.subject,
            aggregate_id = %request.aggregate_id,
            from_version = request.from_version,
            waiting_version = request.waiting_version,
            entry_id = %request.entry_id,
            deferred_secs = request.deferred_for.as_secs(),
            "Backfill required"
        );
        Ok(())
    }
}

/// Sink that forwards requests to a task owning the cold storage client.
#[derive(Debug, Clone)]
pub struct ChannelBackfillSink {
    sender: mpsc::Sender<BackfillRequest>,
}

impl ChannelBackfillSink {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<BackfillRequest>) {
        let (sender, receiver) = mpsc::channel(capacity);
        (Self { sender }, receiver)
    }
}

#[async_trait]
impl BackfillSink for ChannelBackfillSink {
    async fn request_backfill(&self, request: BackfillRequest) -> Result<()> {
        self.sender
            .send(request)
            .await
            .map_err(|_| ColdStorageError::BackfillClosed)
    }
}
