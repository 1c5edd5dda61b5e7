//! Domain services consuming the event streams.
//!
//! Each service keeps a small in-memory read model fed by the subjects it
//! subscribes to. [`ServiceRuntime`] ties a service's handler to its consumer
//! group manager and, on the leader, to its maintenance jobs.

pub mod blog;
pub mod comment;
pub mod user;

use std::sync::Arc;

use serde::de::DeserializeOwned;
use tracing::info;

use crate::consumer::{ConsumerError, ConsumerGroupManager};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerError};
use crate::identity::{ConsumerIdentity, InstanceId};
use crate::maintenance::{run_maintenance_jobs, MaintenanceConfig, MaintenanceHandle};
use crate::subject::{Service, Subject, SubjectRegistry};
use crate::transport::StreamTransport;

pub use blog::BlogReadModel;
pub use comment::CommentReadModel;
pub use user::UserReadModel;

fn decode_payload<T: DeserializeOwned>(event: &Event) -> Result<T, HandlerError> {
    serde_json::from_value(event.payload.clone())
        .map_err(|e| HandlerError::invalid_payload(event.subject, e))
}

fn unhandled(service: Service, subject: Subject) -> HandlerError {
    HandlerError::Failed(format!("{service} has no handler for {subject}"))
}

/// Read models of every service.
#[derive(Clone, Default)]
pub struct ReadModels {
    pub blog: Arc<BlogReadModel>,
    pub comment: Arc<CommentReadModel>,
    pub user: Arc<UserReadModel>,
}

impl ReadModels {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handler_for(&self, service: Service) -> Arc<dyn EventHandler> {
        match service {
            Service::Blog => self.blog.clone(),
            Service::Comment => self.comment.clone(),
            Service::User => self.user.clone(),
        }
    }
}

/// One service's consumption, plus its maintenance jobs when leading.
pub struct ServiceRuntime {
    manager: ConsumerGroupManager,
    registry: SubjectRegistry,
    maintenance: Option<MaintenanceHandle>,
}

impl ServiceRuntime {
    pub fn new(manager: ConsumerGroupManager, registry: SubjectRegistry) -> Self {
        Self {
            manager,
            registry,
            maintenance: None,
        }
    }

    pub fn service(&self) -> Service {
        self.manager.service()
    }

    pub fn manager(&self) -> &ConsumerGroupManager {
        &self.manager
    }

    /// Subscribe `handler` to every subject the service consumes.
    ///
    /// Returns the subjects subscribed.
    pub async fn subscribe(
        &self,
        instance: &InstanceId,
        handler: Arc<dyn EventHandler>,
    ) -> Result<Vec<Subject>, ConsumerError> {
        let subjects = self.registry.subscriptions_of(self.service());
        let identity = ConsumerIdentity::new(self.service(), instance.clone());
        self.manager.subscribe(&subjects, identity, handler).await?;
        Ok(subjects)
    }

    /// Start the service's trim, reclaim and consumer GC jobs.
    pub fn run_maintenance_jobs(
        &mut self,
        transport: Arc<dyn StreamTransport>,
        config: MaintenanceConfig,
    ) {
        if self.maintenance.is_some() {
            return;
        }
        info!(service = %self.service(), "Starting maintenance jobs");
        self.maintenance = Some(run_maintenance_jobs(
            self.service(),
            transport,
            self.registry.clone(),
            config,
        ));
    }

    pub fn runs_maintenance(&self) -> bool {
        self.maintenance.is_some()
    }

    /// Stop maintenance, then drain consumers.
    pub async fn shutdown(self) {
        if let Some(maintenance) = self.maintenance {
            maintenance.shutdown().await;
        }
        self.manager.stop().await;
    }
}
