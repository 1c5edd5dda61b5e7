//! Leader-only stream maintenance.
//!
//! Three periodic jobs per service, all driven from one task so they never
//! overlap on the same instance:
//!
//! - **Trim**: bound the streams the service produces into, never cutting past
//!   the oldest entry any consuming group has pending or has yet to receive.
//! - **Reclaim**: hand entries stuck in a consumer's pending list to a live
//!   consumer of the same group. Entries whose owner is gone move regardless
//!   of their own idle time.
//! - **Consumer GC**: drop registrations idle past the grace period once they
//!   own nothing.
//!
//! Leadership is decided by the caller; nothing here checks it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use crate::event::EntryId;
use crate::subject::{Service, Subject, SubjectRegistry};
use crate::transport::{ConsumerInfo, PendingEntry, Result, StreamTransport, TrimPolicy};

fn default_trim_interval_secs() -> u64 {
    60
}

fn default_max_stream_len() -> usize {
    1000
}

fn default_reclaim_interval_secs() -> u64 {
    30
}

fn default_reclaim_min_idle_ms() -> u64 {
    60_000
}

fn default_reclaim_batch_size() -> usize {
    100
}

fn default_consumer_gc_interval_secs() -> u64 {
    300
}

fn default_consumer_grace_secs() -> u64 {
    600
}

/// Maintenance schedule and thresholds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    #[serde(default = "default_trim_interval_secs")]
    pub trim_interval_secs: u64,
    /// Approximate upper bound on entries kept per stream.
    #[serde(default = "default_max_stream_len")]
    pub max_stream_len: usize,
    #[serde(default = "default_reclaim_interval_secs")]
    pub reclaim_interval_secs: u64,
    /// Idle time after which a live consumer's pending entry is reassigned.
    #[serde(default = "default_reclaim_min_idle_ms")]
    pub reclaim_min_idle_ms: u64,
    /// Pending entries inspected per group and cycle.
    #[serde(default = "default_reclaim_batch_size")]
    pub reclaim_batch_size: usize,
    #[serde(default = "default_consumer_gc_interval_secs")]
    pub consumer_gc_interval_secs: u64,
    /// A consumer idle this long is considered gone.
    #[serde(default = "default_consumer_grace_secs")]
    pub consumer_grace_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            trim_interval_secs: default_trim_interval_secs(),
            max_stream_len: default_max_stream_len(),
            reclaim_interval_secs: default_reclaim_interval_secs(),
            reclaim_min_idle_ms: default_reclaim_min_idle_ms(),
            reclaim_batch_size: default_reclaim_batch_size(),
            consumer_gc_interval_secs: default_consumer_gc_interval_secs(),
            consumer_grace_secs: default_consumer_grace_secs(),
        }
    }
}

impl MaintenanceConfig {
    pub fn trim_interval(&self) -> Duration {
        Duration::from_secs(self.trim_interval_secs)
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    pub fn reclaim_min_idle(&self) -> Duration {
        Duration::from_millis(self.reclaim_min_idle_ms)
    }

    pub fn consumer_gc_interval(&self) -> Duration {
        Duration::from_secs(self.consumer_gc_interval_secs)
    }

    pub fn consumer_grace(&self) -> Duration {
        Duration::from_secs(self.consumer_grace_secs)
    }
}

/// What one maintenance cycle did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub trimmed: u64,
    pub reclaimed: usize,
    pub consumers_removed: usize,
}

/// Maintenance jobs for one service.
pub struct StreamMaintenance {
    service: Service,
    transport: Arc<dyn StreamTransport>,
    registry: SubjectRegistry,
    config: MaintenanceConfig,
}

impl StreamMaintenance {
    pub fn new(
        service: Service,
        transport: Arc<dyn StreamTransport>,
        registry: SubjectRegistry,
        config: MaintenanceConfig,
    ) -> Self {
        Self {
            service,
            transport,
            registry,
            config,
        }
    }

    pub fn service(&self) -> Service {
        self.service
    }

    pub fn config(&self) -> &MaintenanceConfig {
        &self.config
    }

    /// Run all three jobs once, in reclaim, GC, trim order.
    pub async fn run_once(&self) -> Result<MaintenanceReport> {
        Ok(MaintenanceReport {
            reclaimed: self.reclaim_once().await?,
            consumers_removed: self.collect_consumers_once().await?,
            trimmed: self.trim_once().await?,
        })
    }

    /// Trim every stream this service produces into.
    #[instrument(skip_all, fields(service = %self.service))]
    pub async fn trim_once(&self) -> Result<u64> {
        let mut total = 0;
        for subject in self.registry.owned_by(self.service) {
            let floor = self.retention_floor(subject).await?;
            let protect_from = floor.as_ref().map(|(id, _)| *id);
            let policy = TrimPolicy::max_len(self.config.max_stream_len).protecting(protect_from);
            let removed = self.transport.trim(subject, policy).await?;
            if removed > 0 {
                info!(
                    subject = %subject,
                    removed = removed,
                    protect_from = ?protect_from.map(|id| id.to_string()),
                    "Trimmed stream"
                );
            }
            total += removed;

            if let Some((id, group)) = floor {
                let len = self.transport.stream_len(subject).await?;
                if len > self.config.max_stream_len as u64 {
                    warn!(
                        subject = %subject,
                        group = %group,
                        protect_from = %id,
                        len = len,
                        max_len = self.config.max_stream_len,
                        "Stream held above its bound by a group that has not caught up"
                    );
                }
            }
        }
        Ok(total)
    }

    /// Oldest entry some consuming group of `subject` still needs, with the
    /// group that needs it.
    ///
    /// A group needs its oldest pending entry and everything after its last
    /// delivered entry. Groups without a subscribing service are ignored.
    async fn retention_floor(&self, subject: Subject) -> Result<Option<(EntryId, String)>> {
        let consumers = self.registry.consumers_of(subject);
        let groups = self.transport.list_groups(subject).await?;

        let mut floor: Option<(EntryId, String)> = None;
        for group in groups
            .iter()
            .filter(|group| consumers.iter().any(|service| service.name() == group.name))
        {
            let mut needed = group.last_delivered.successor();
            if group.pending > 0 {
                let pending = self.transport.list_pending(subject, &group.name, 1).await?;
                if let Some(first) = pending.first() {
                    needed = needed.min(first.id);
                }
            }
            debug!(
                subject = %subject,
                group = %group.name,
                last_delivered = %group.last_delivered,
                needed_from = %needed,
                "Group retention floor"
            );
            if floor.as_ref().map_or(true, |(current, _)| needed < *current) {
                floor = Some((needed, group.name.clone()));
            }
        }
        Ok(floor)
    }

    /// Reassign stuck pending entries of this service's groups.
    #[instrument(skip_all, fields(service = %self.service))]
    pub async fn reclaim_once(&self) -> Result<usize> {
        let mut total = 0;
        for subject in self.registry.subscriptions_of(self.service) {
            total += self.reclaim_subject(subject).await?;
        }
        Ok(total)
    }

    async fn reclaim_subject(&self, subject: Subject) -> Result<usize> {
        let group = self.service.name();
        let pending = self
            .transport
            .list_pending(subject, group, self.config.reclaim_batch_size)
            .await?;
        if pending.is_empty() {
            return Ok(0);
        }
        let consumers = self.transport.list_consumers(subject, group).await?;
        let grace = self.config.consumer_grace();
        let min_idle = self.config.reclaim_min_idle();

        // Per target: entries of dead owners, then entries idle too long.
        let mut plan: BTreeMap<String, (Vec<EntryId>, Vec<EntryId>)> = BTreeMap::new();
        for entry in &pending {
            let owner_alive = consumers
                .iter()
                .any(|c| c.name == entry.consumer && c.idle < grace);
            if owner_alive && entry.idle < min_idle {
                continue;
            }
            let Some(target) = reclaim_target(&consumers, &entry.consumer, grace) else {
                debug!(
                    subject = %subject,
                    group = %group,
                    entry_id = %entry.id,
                    owner = %entry.consumer,
                    "No live consumer to take over pending entry"
                );
                continue;
            };
            let slot = plan.entry(target.name.clone()).or_default();
            if owner_alive {
                slot.1.push(entry.id);
            } else {
                slot.0.push(entry.id);
            }
        }

        let mut reclaimed = 0;
        for (target, (orphaned, stale)) in plan {
            for (ids, threshold) in [(orphaned, Duration::ZERO), (stale, min_idle)] {
                if ids.is_empty() {
                    continue;
                }
                let claimed = self
                    .transport
                    .claim(subject, group, &target, threshold, &ids)
                    .await?;
                if !claimed.is_empty() {
                    log_claimed(subject, group, &target, &pending, &claimed);
                }
                reclaimed += claimed.len();
            }
        }
        Ok(reclaimed)
    }

    /// Remove consumers gone past the grace period that own nothing.
    #[instrument(skip_all, fields(service = %self.service))]
    pub async fn collect_consumers_once(&self) -> Result<usize> {
        let group = self.service.name();
        let grace = self.config.consumer_grace();
        let mut removed = 0;

        for subject in self.registry.subscriptions_of(self.service) {
            let consumers = self.transport.list_consumers(subject, group).await?;
            for consumer in consumers.iter().filter(|c| c.idle >= grace) {
                if consumer.pending > 0 {
                    debug!(
                        subject = %subject,
                        group = %group,
                        consumer = %consumer.name,
                        pending = consumer.pending,
                        "Keeping idle consumer until its entries are reclaimed"
                    );
                    continue;
                }
                self.transport
                    .delete_consumer(subject, group, &consumer.name)
                    .await?;
                info!(
                    subject = %subject,
                    group = %group,
                    consumer = %consumer.name,
                    idle_secs = consumer.idle.as_secs(),
                    "Removed idle consumer"
                );
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Run the jobs on their intervals until stopped.
    pub fn spawn(self) -> MaintenanceHandle {
        let (cancel, mut cancel_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut trim = tokio::time::interval(self.config.trim_interval());
            let mut reclaim = tokio::time::interval(self.config.reclaim_interval());
            let mut gc = tokio::time::interval(self.config.consumer_gc_interval());
            for interval in [&mut trim, &mut reclaim, &mut gc] {
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            }
            info!(service = %self.service, "Maintenance jobs started");

            loop {
                tokio::select! {
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            break;
                        }
                    }
                    _ = reclaim.tick() => {
                        if let Err(e) = self.reclaim_once().await {
                            warn!(service = %self.service, error = %e, "Reclaim cycle failed");
                        }
                    }
                    _ = gc.tick() => {
                        if let Err(e) = self.collect_consumers_once().await {
                            warn!(service = %self.service, error = %e, "Consumer GC cycle failed");
                        }
                    }
                    _ = trim.tick() => {
                        if let Err(e) = self.trim_once().await {
                            warn!(service = %self.service, error = %e, "Trim cycle failed");
                        }
                    }
                }
            }
            info!(service = %self.service, "Maintenance jobs stopped");
        });

        MaintenanceHandle { cancel, task }
    }
}

/// Live consumer with the lowest idle time, other than `owner`.
fn reclaim_target<'a>(
    consumers: &'a [ConsumerInfo],
    owner: &str,
    grace: Duration,
) -> Option<&'a ConsumerInfo> {
    consumers
        .iter()
        .filter(|c| c.name != owner && c.idle < grace)
        .min_by_key(|c| c.idle)
}

fn log_claimed(
    subject: Subject,
    group: &str,
    target: &str,
    pending: &[PendingEntry],
    claimed: &[EntryId],
) {
    for entry in pending.iter().filter(|entry| claimed.contains(&entry.id)) {
        info!(
            subject = %subject,
            group = %group,
            entry_id = %entry.id,
            from = %entry.consumer,
            to = %target,
            idle_ms = entry.idle.as_millis() as u64,
            deliveries = entry.deliveries,
            "Reclaimed pending entry"
        );
    }
}

/// Handle to a running maintenance task.
pub struct MaintenanceHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl MaintenanceHandle {
    /// Signal the task to stop after its current job.
    pub fn stop(&self) {
        self.cancel.send_replace(true);
    }

    /// Stop and wait for the task to exit.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

/// Start `service`'s leader-only jobs.
pub fn run_maintenance_jobs(
    service: Service,
    transport: Arc<dyn StreamTransport>,
    registry: SubjectRegistry,
    config: MaintenanceConfig,
) -> MaintenanceHandle {
    StreamMaintenance::new(service, transport, registry, config).spawn()
}
