//! Stream and consumer group provisioning.
//!
//! Runs once per cluster boot on the leader (always in development) before
//! any consumer starts reading. Every step is idempotent: existing streams
//! are left alone and existing groups keep their delivery cursor.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{info, instrument};

use crate::subject::{Subject, SubjectRegistry};
use crate::transport::{GroupCreation, StartPosition, StreamTransport, TransportError};

/// Default label of the admin anchor group.
pub const DEFAULT_ADMIN_LABEL: &str = "event-admin";

#[derive(Debug, thiserror::Error)]
pub enum ProvisioningError {
    #[error("Failed to provision stream {subject}: {source}")]
    Stream {
        subject: Subject,
        #[source]
        source: TransportError,
    },

    #[error("Failed to provision consumer group {group} on {subject}: {source}")]
    Group {
        subject: Subject,
        group: String,
        #[source]
        source: TransportError,
    },
}

/// Provisioning configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Name of the anchor group used to create empty streams.
    pub label: String,
    /// Start newly created groups from the beginning of the stream instead of
    /// its tail. For migrations and backfills only.
    pub start_from_beginning: bool,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            label: DEFAULT_ADMIN_LABEL.to_string(),
            start_from_beginning: false,
        }
    }
}

impl AdminConfig {
    pub fn start_position(&self) -> StartPosition {
        if self.start_from_beginning {
            StartPosition::Beginning
        } else {
            StartPosition::Tail
        }
    }
}

/// What one provisioning run did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProvisioningReport {
    pub streams: usize,
    pub groups_created: usize,
    pub groups_existing: usize,
}

/// Idempotent one-time provisioning of streams and consumer groups.
pub struct EventAdmin {
    transport: Arc<dyn StreamTransport>,
    config: AdminConfig,
}

impl EventAdmin {
    pub fn new(transport: Arc<dyn StreamTransport>, config: AdminConfig) -> Self {
        Self { transport, config }
    }

    /// Ensure every subject's stream and every consuming service's group.
    #[instrument(skip_all, fields(label = %self.config.label))]
    pub async fn initialize(
        &self,
        registry: &SubjectRegistry,
    ) -> Result<ProvisioningReport, ProvisioningError> {
        let start = self.config.start_position();
        let mut report = ProvisioningReport::default();

        for subject in registry.subjects() {
            self.transport
                .ensure_stream(subject, &self.config.label)
                .await
                .map_err(|source| ProvisioningError::Stream { subject, source })?;
            report.streams += 1;

            for service in registry.consumers_of(subject) {
                let group = service.name();
                let created = self
                    .transport
                    .create_group(subject, group, start)
                    .await
                    .map_err(|source| ProvisioningError::Group {
                        subject,
                        group: group.to_string(),
                        source,
                    })?;
                match created {
                    GroupCreation::Created => {
                        info!(subject = %subject, group = %group, start = ?start, "Created consumer group");
                        report.groups_created += 1;
                    }
                    GroupCreation::AlreadyExists => report.groups_existing += 1,
                }
            }
        }

        info!(
            streams = report.streams,
            groups_created = report.groups_created,
            groups_existing = report.groups_existing,
            "Event admin initialized"
        );
        Ok(report)
    }
}

/// Provision `subjects` with default settings under `label`.
pub async fn init_event_admin(
    subjects: impl IntoIterator<Item = Subject>,
    transport: Arc<dyn StreamTransport>,
    label: &str,
) -> Result<ProvisioningReport, ProvisioningError> {
    let config = AdminConfig {
        label: label.to_string(),
        ..Default::default()
    };
    EventAdmin::new(transport, config)
        .initialize(&SubjectRegistry::with_subjects(subjects))
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subject::Service;
    use crate::transport::{MemoryStreamTransport, ReadCursor};
    use std::time::Duration;

    #[tokio::test]
    async fn test_initialize_creates_every_group() {
        let transport = Arc::new(MemoryStreamTransport::new());
        let registry = SubjectRegistry::standard();

        let report = EventAdmin::new(transport.clone(), AdminConfig::default())
            .initialize(&registry)
            .await
            .unwrap();

        assert_eq!(report.streams, Subject::ALL.len());
        assert_eq!(report.groups_created, registry.groups().len());
        for group in registry.groups() {
            transport
                .read_group(
                    group.subject,
                    group.name(),
                    "checker",
                    ReadCursor::New,
                    1,
                    Duration::ZERO,
                )
                .await
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_initialize_is_idempotent_and_keeps_cursors() {
        let transport = Arc::new(MemoryStreamTransport::new());
        let admin = EventAdmin::new(transport.clone(), AdminConfig::default());
        let registry = SubjectRegistry::with_subjects([Subject::BlogDeleted]);
        admin.initialize(&registry).await.unwrap();

        transport.append(Subject::BlogDeleted, b"{}").await.unwrap();

        let again = admin.initialize(&registry).await.unwrap();
        assert_eq!(again.groups_created, 0);
        assert_eq!(again.groups_existing, 2);

        // The entry appended between runs is still deliverable.
        let read = transport
            .read_group(
                Subject::BlogDeleted,
                Service::User.name(),
                "c1",
                ReadCursor::New,
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn test_new_groups_start_at_tail_by_default() {
        let transport = Arc::new(MemoryStreamTransport::new());
        transport.append(Subject::BlogCreated, b"{}").await.unwrap();

        init_event_admin([Subject::BlogCreated], transport.clone(), "event-admin")
            .await
            .unwrap();

        let read = transport
            .read_group(
                Subject::BlogCreated,
                Service::User.name(),
                "c1",
                ReadCursor::New,
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert!(read.is_empty());
    }

    #[tokio::test]
    async fn test_start_from_beginning_replays_history() {
        let transport = Arc::new(MemoryStreamTransport::new());
        transport.append(Subject::BlogCreated, b"{}").await.unwrap();
        let config = AdminConfig {
            start_from_beginning: true,
            ..Default::default()
        };

        EventAdmin::new(transport.clone(), config)
            .initialize(&SubjectRegistry::with_subjects([Subject::BlogCreated]))
            .await
            .unwrap();

        let read = transport
            .read_group(
                Subject::BlogCreated,
                Service::User.name(),
                "c1",
                ReadCursor::New,
                10,
                Duration::ZERO,
            )
            .await
            .unwrap();
        assert_eq!(read.len(), 1);
    }

    #[tokio::test]
    async fn test_transport_failure_is_provisioning_error() {
        let transport = Arc::new(MemoryStreamTransport::new());
        transport.set_connection_lost(true);

        let err = init_event_admin([Subject::UserCreated], transport, "event-admin")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisioningError::Stream {
                subject: Subject::UserCreated,
                ..
            }
        ));
    }
}
