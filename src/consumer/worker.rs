//! Per-subject read, reconcile and acknowledge loop.

use std::sync::Arc;
use std::time::Duration;

use backon::BackoffBuilder;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::{ConsumerConfig, ConsumerStats, FatalSignal};
use crate::event::{EntryId, StreamEntry};
use crate::handler::EventHandler;
use crate::reconciler::{ApplyOutcome, ReconcileError, VersionReconciler};
use crate::subject::{Service, Subject};
use crate::transport::{ReadCursor, StreamTransport, TransportError};
use crate::upcast::Upcaster;
use crate::utils::retry::{consumer_backoff, MAX_CONSUMER_DELAY};

/// Why a read cycle failed.
enum CycleError {
    /// Transport or store connection is gone.
    Fatal(String),
    Transient(String),
}

impl From<TransportError> for CycleError {
    fn from(e: TransportError) -> Self {
        if e.is_fatal() {
            CycleError::Fatal(e.to_string())
        } else {
            CycleError::Transient(e.to_string())
        }
    }
}

/// What happened to one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryOutcome {
    Applied,
    Skipped,
    Deferred,
    /// Handler, upcast or transient store failure; left pending.
    Failed,
    /// Undecodable or misrouted; acknowledged without applying.
    Discarded,
}

/// Counts from one batch.
#[derive(Default)]
struct BatchSummary {
    last_id: Option<EntryId>,
    entries: usize,
    applied: bool,
    deferred: bool,
}

pub(super) struct SubjectWorker {
    pub(super) service: Service,
    pub(super) subject: Subject,
    pub(super) consumer: String,
    pub(super) transport: Arc<dyn StreamTransport>,
    pub(super) reconciler: Arc<VersionReconciler>,
    pub(super) upcaster: Arc<Upcaster>,
    pub(super) handler: Arc<dyn EventHandler>,
    pub(super) config: ConsumerConfig,
    pub(super) stats: Arc<ConsumerStats>,
    pub(super) fatal: Option<mpsc::UnboundedSender<FatalSignal>>,
    pub(super) shutdown: watch::Receiver<bool>,
}

impl SubjectWorker {
    fn group(&self) -> &'static str {
        self.service.name()
    }

    fn stopping(&self) -> bool {
        *self.shutdown.borrow()
    }

    pub(super) async fn run(mut self) {
        info!(
            service = %self.service,
            subject = %self.subject,
            consumer = %self.consumer,
            "Consumer started"
        );

        let backoff_builder = consumer_backoff();
        let mut backoff = backoff_builder.build();
        let mut connection_failures = 0u32;
        // Start with a sweep so entries left pending by a previous run of this
        // instance are retried first.
        let mut sweep_due = Instant::now();
        let mut has_deferred = false;

        while !self.stopping() {
            let result = if Instant::now() >= sweep_due {
                sweep_due = Instant::now() + self.config.pending_retry_interval();
                self.sweep_pending().await.map(|summary| {
                    has_deferred = summary.deferred;
                })
            } else {
                self.read_new().await.map(|summary| {
                    has_deferred |= summary.deferred;
                    // A newly applied predecessor may unblock deferred entries.
                    if summary.applied && has_deferred {
                        sweep_due = Instant::now();
                    }
                })
            };

            let delay = match result {
                Ok(()) => {
                    connection_failures = 0;
                    backoff = backoff_builder.build();
                    continue;
                }
                Err(CycleError::Transient(e)) => {
                    let delay = backoff.next().unwrap_or(MAX_CONSUMER_DELAY);
                    warn!(
                        subject = %self.subject,
                        group = %self.group(),
                        consumer = %self.consumer,
                        error = %e,
                        backoff_ms = %delay.as_millis(),
                        "Consumer cycle failed, retrying after backoff"
                    );
                    delay
                }
                Err(CycleError::Fatal(e)) => {
                    connection_failures += 1;
                    if connection_failures >= self.config.max_connection_failures {
                        self.report_fatal(e);
                        return;
                    }
                    let delay = backoff.next().unwrap_or(MAX_CONSUMER_DELAY);
                    error!(
                        subject = %self.subject,
                        group = %self.group(),
                        consumer = %self.consumer,
                        error = %e,
                        failures = connection_failures,
                        backoff_ms = %delay.as_millis(),
                        "Connection failure in consumer, retrying after backoff"
                    );
                    delay
                }
            };
            self.pause(delay).await;
        }

        if self.config.release_on_stop {
            self.release().await;
        }
        info!(
            service = %self.service,
            subject = %self.subject,
            consumer = %self.consumer,
            "Consumer stopped"
        );
    }

    /// Sleep unless shutdown arrives first.
    async fn pause(&mut self, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.changed() => {}
        }
    }

    async fn read_new(&self) -> Result<BatchSummary, CycleError> {
        let entries = self
            .transport
            .read_group(
                self.subject,
                self.group(),
                &self.consumer,
                ReadCursor::New,
                self.config.batch_size,
                self.config.block(),
            )
            .await?;
        self.process_batch(entries).await
    }

    /// Walk this consumer's own pending entries once, oldest first.
    async fn sweep_pending(&self) -> Result<BatchSummary, CycleError> {
        let mut total = BatchSummary::default();
        let mut after = EntryId::MIN;

        loop {
            let entries = self
                .transport
                .read_group(
                    self.subject,
                    self.group(),
                    &self.consumer,
                    ReadCursor::Pending { after },
                    self.config.batch_size,
                    Duration::ZERO,
                )
                .await?;
            if entries.is_empty() {
                break;
            }

            let summary = self.process_batch(entries).await?;
            total.entries += summary.entries;
            total.applied |= summary.applied;
            total.deferred |= summary.deferred;
            match summary.last_id {
                Some(last) => after = last,
                None => break,
            }
            if self.stopping() {
                break;
            }
        }

        if total.entries > 0 {
            debug!(
                subject = %self.subject,
                group = %self.group(),
                consumer = %self.consumer,
                entries = total.entries,
                "Swept pending entries"
            );
        }
        Ok(total)
    }

    async fn process_batch(&self, entries: Vec<StreamEntry>) -> Result<BatchSummary, CycleError> {
        let mut summary = BatchSummary::default();
        for entry in entries {
            let id = entry.id;
            let outcome = self.process_entry(entry).await?;
            summary.last_id = Some(id);
            summary.entries += 1;
            match outcome {
                EntryOutcome::Applied => {
                    summary.applied = true;
                    ConsumerStats::bump(&self.stats.applied);
                }
                EntryOutcome::Skipped => ConsumerStats::bump(&self.stats.skipped),
                EntryOutcome::Deferred => {
                    summary.deferred = true;
                    ConsumerStats::bump(&self.stats.deferred);
                }
                EntryOutcome::Failed => ConsumerStats::bump(&self.stats.failed),
                EntryOutcome::Discarded => ConsumerStats::bump(&self.stats.discarded),
            }
        }
        Ok(summary)
    }

    #[instrument(skip_all, fields(subject = %self.subject, group = %self.group(), entry_id = %entry.id))]
    async fn process_entry(&self, entry: StreamEntry) -> Result<EntryOutcome, CycleError> {
        let event = match entry.event() {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Discarding undecodable entry");
                self.ack(entry.id).await?;
                return Ok(EntryOutcome::Discarded);
            }
        };
        if event.subject != self.subject {
            error!(
                event_subject = %event.subject,
                aggregate_id = %event.aggregate_id,
                "Discarding entry published on the wrong stream"
            );
            self.ack(entry.id).await?;
            return Ok(EntryOutcome::Discarded);
        }

        let event = match self.upcaster.upcast(event) {
            Ok(event) => event,
            Err(e) => {
                error!(error = %e, "Cannot upcast entry, leaving it pending");
                return Ok(EntryOutcome::Failed);
            }
        };

        match self
            .reconciler
            .apply_entry(entry.id, &event, self.handler.as_ref())
            .await
        {
            Ok(ApplyOutcome::Applied) => {
                self.ack(entry.id).await?;
                Ok(EntryOutcome::Applied)
            }
            Ok(ApplyOutcome::Skipped { last_applied }) => {
                debug!(
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    last_applied = last_applied,
                    "Skipping stale event"
                );
                self.ack(entry.id).await?;
                Ok(EntryOutcome::Skipped)
            }
            Ok(ApplyOutcome::Deferred { last_applied, expected }) => {
                debug!(
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    last_applied = ?last_applied,
                    expected = expected,
                    "Deferring out-of-order event"
                );
                Ok(EntryOutcome::Deferred)
            }
            Err(e) if e.is_fatal() => Err(CycleError::Fatal(e.to_string())),
            Err(ReconcileError::Handler(e)) => {
                error!(
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    error = %e,
                    "Handler failed, leaving entry pending"
                );
                Ok(EntryOutcome::Failed)
            }
            Err(e) => {
                warn!(
                    aggregate_id = %event.aggregate_id,
                    version = event.version,
                    error = %e,
                    "Version store unavailable, leaving entry pending"
                );
                Ok(EntryOutcome::Failed)
            }
        }
    }

    async fn ack(&self, id: EntryId) -> Result<(), CycleError> {
        let acked = self.transport.ack(self.subject, self.group(), id).await?;
        if !acked {
            // Reclaimed by another consumer in the meantime; its copy will be
            // skipped as stale.
            debug!(entry_id = %id, "Entry was no longer pending");
        }
        Ok(())
    }

    /// Drop this consumer's registration if it owns no pending entries.
    async fn release(&self) {
        let consumers = match self
            .transport
            .list_consumers(self.subject, self.group())
            .await
        {
            Ok(consumers) => consumers,
            Err(e) => {
                warn!(subject = %self.subject, consumer = %self.consumer, error = %e, "Cannot inspect consumer on stop");
                return;
            }
        };
        let Some(own) = consumers.iter().find(|c| c.name == self.consumer) else {
            return;
        };
        if own.pending > 0 {
            info!(
                subject = %self.subject,
                consumer = %self.consumer,
                pending = own.pending,
                "Keeping consumer registration with pending entries"
            );
            return;
        }
        if let Err(e) = self
            .transport
            .delete_consumer(self.subject, self.group(), &self.consumer)
            .await
        {
            warn!(subject = %self.subject, consumer = %self.consumer, error = %e, "Failed to release consumer");
        }
    }

    fn report_fatal(&self, error: String) {
        error!(
            service = %self.service,
            subject = %self.subject,
            consumer = %self.consumer,
            error = %error,
            "Consumer giving up after repeated connection failures"
        );
        if let Some(fatal) = &self.fatal {
            let _ = fatal.send(FatalSignal {
                service: self.service,
                subject: self.subject,
                error,
            });
        }
    }
}
