//! Consumer group management.
//!
//! A `ConsumerGroupManager` owns one service's consumption: for every
//! subscribed subject it runs an independent worker that reads as this
//! instance's consumer inside the service's group, reconciles each event's
//! version and acknowledges settled entries.
//!
//! Delivery is at-least-once. Entries are acknowledged only after the version
//! record moved (or the event turned out stale); anything else stays pending
//! for the owner's periodic pending sweep or for leader reclamation.

mod worker;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::info;

use crate::cold_storage::{BackfillSink, LoggingBackfillSink};
use crate::handler::EventHandler;
use crate::identity::ConsumerIdentity;
use crate::reconciler::{ReconcilerConfig, VersionReconciler};
use crate::store::EventStore;
use crate::subject::{Service, Subject};
use crate::transport::StreamTransport;
use crate::upcast::Upcaster;

use worker::SubjectWorker;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Identity belongs to {actual}, not {expected}")]
    WrongService { expected: Service, actual: Service },

    #[error("{service} does not subscribe to {subject}")]
    NotSubscribed { service: Service, subject: Subject },

    #[error("Consumer group manager for {0} is stopped")]
    Stopped(Service),
}

fn default_batch_size() -> usize {
    10
}

fn default_block_ms() -> u64 {
    2000
}

fn default_pending_retry_interval_ms() -> u64 {
    5000
}

fn default_max_connection_failures() -> u32 {
    5
}

fn default_release_on_stop() -> bool {
    true
}

/// Consumer loop configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConsumerConfig {
    /// Entries per read.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// How long a read waits for new entries.
    #[serde(default = "default_block_ms")]
    pub block_ms: u64,
    /// Interval between sweeps of this consumer's own pending entries.
    #[serde(default = "default_pending_retry_interval_ms")]
    pub pending_retry_interval_ms: u64,
    /// Consecutive connection failures before the process is told to exit.
    #[serde(default = "default_max_connection_failures")]
    pub max_connection_failures: u32,
    /// Remove this consumer's registration on stop when it owns nothing.
    #[serde(default = "default_release_on_stop")]
    pub release_on_stop: bool,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            block_ms: default_block_ms(),
            pending_retry_interval_ms: default_pending_retry_interval_ms(),
            max_connection_failures: default_max_connection_failures(),
            release_on_stop: default_release_on_stop(),
        }
    }
}

impl ConsumerConfig {
    pub fn block(&self) -> Duration {
        Duration::from_millis(self.block_ms)
    }

    pub fn pending_retry_interval(&self) -> Duration {
        Duration::from_millis(self.pending_retry_interval_ms)
    }
}

/// A consumer loop gave up on its transport or store.
///
/// The process is expected to exit non-zero on receipt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FatalSignal {
    pub service: Service,
    pub subject: Subject,
    pub error: String,
}

/// Counters across all of a manager's workers.
#[derive(Debug, Default)]
pub struct ConsumerStats {
    applied: AtomicU64,
    skipped: AtomicU64,
    deferred: AtomicU64,
    failed: AtomicU64,
    discarded: AtomicU64,
}

/// Point-in-time copy of [`ConsumerStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub applied: u64,
    pub skipped: u64,
    pub deferred: u64,
    pub failed: u64,
    pub discarded: u64,
}

impl ConsumerStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            applied: self.applied.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Drives one service's consumption across its subscribed subjects.
pub struct ConsumerGroupManager {
    service: Service,
    transport: Arc<dyn StreamTransport>,
    store: Arc<dyn EventStore>,
    reconciler_config: ReconcilerConfig,
    backfill: Arc<dyn BackfillSink>,
    reconciler: Arc<VersionReconciler>,
    upcaster: Arc<Upcaster>,
    config: ConsumerConfig,
    fatal: Option<mpsc::UnboundedSender<FatalSignal>>,
    stats: Arc<ConsumerStats>,
    shutdown: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl ConsumerGroupManager {
    pub fn new(
        service: Service,
        transport: Arc<dyn StreamTransport>,
        store: Arc<dyn EventStore>,
    ) -> Self {
        let reconciler_config = ReconcilerConfig::default();
        let backfill: Arc<dyn BackfillSink> = Arc::new(LoggingBackfillSink);
        let reconciler = Arc::new(
            VersionReconciler::new(store.clone(), service.name(), reconciler_config.clone())
                .with_backfill_sink(backfill.clone()),
        );
        let (shutdown, _) = watch::channel(false);

        Self {
            service,
            transport,
            store,
            reconciler_config,
            backfill,
            reconciler,
            upcaster: Arc::new(Upcaster::standard()),
            config: ConsumerConfig::default(),
            fatal: None,
            stats: Arc::new(ConsumerStats::default()),
            shutdown,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_config(mut self, config: ConsumerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_reconciler_config(mut self, config: ReconcilerConfig) -> Self {
        self.reconciler_config = config;
        self.rebuild_reconciler();
        self
    }

    pub fn with_backfill_sink(mut self, sink: Arc<dyn BackfillSink>) -> Self {
        self.backfill = sink;
        self.rebuild_reconciler();
        self
    }

    pub fn with_upcaster(mut self, upcaster: Arc<Upcaster>) -> Self {
        self.upcaster = upcaster;
        self
    }

    /// Channel that receives a [`FatalSignal`] when a worker gives up.
    pub fn with_fatal_sender(mut self, sender: mpsc::UnboundedSender<FatalSignal>) -> Self {
        self.fatal = Some(sender);
        self
    }

    fn rebuild_reconciler(&mut self) {
        self.reconciler = Arc::new(
            VersionReconciler::new(
                self.store.clone(),
                self.service.name(),
                self.reconciler_config.clone(),
            )
            .with_backfill_sink(self.backfill.clone()),
        );
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn reconciler(&self) -> &Arc<VersionReconciler> {
        &self.reconciler
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Start consuming `subjects` as `identity`, one worker per subject.
    pub async fn subscribe(
        &self,
        subjects: &[Subject],
        identity: ConsumerIdentity,
        handler: Arc<dyn EventHandler>,
    ) -> Result<(), ConsumerError> {
        if identity.service != self.service {
            return Err(ConsumerError::WrongService {
                expected: self.service,
                actual: identity.service,
            });
        }
        if let Some(subject) = subjects
            .iter()
            .find(|subject| !self.service.subscriptions().contains(subject))
        {
            return Err(ConsumerError::NotSubscribed {
                service: self.service,
                subject: *subject,
            });
        }
        if *self.shutdown.borrow() {
            return Err(ConsumerError::Stopped(self.service));
        }

        let mut workers = self.workers.lock().await;
        for subject in subjects {
            let worker = SubjectWorker {
                service: self.service,
                subject: *subject,
                consumer: identity.consumer_name().to_string(),
                transport: self.transport.clone(),
                reconciler: self.reconciler.clone(),
                upcaster: self.upcaster.clone(),
                handler: handler.clone(),
                config: self.config.clone(),
                stats: self.stats.clone(),
                fatal: self.fatal.clone(),
                shutdown: self.shutdown.subscribe(),
            };
            workers.push(tokio::spawn(worker.run()));
        }

        info!(
            service = %self.service,
            consumer = %identity.consumer_name(),
            subjects = subjects.len(),
            "Subscribed"
        );
        Ok(())
    }

    /// Stop every worker and wait for in-flight batches to finish.
    pub async fn stop(&self) {
        self.shutdown.send_replace(true);
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for worker in workers {
            let _ = worker.await;
        }
        info!(service = %self.service, "Consumer group manager stopped");
    }
}
