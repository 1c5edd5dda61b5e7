//! Shared utilities for integration tests.
//!
//! In-memory cluster helpers: provisioned transports, fast consumer settings,
//! recording handlers and polling.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;

use eventide::admin::init_event_admin;
use eventide::consumer::{ConsumerConfig, ConsumerGroupManager};
use eventide::event::Event;
use eventide::handler::{EventHandler, HandlerError};
use eventide::identity::{ConsumerIdentity, InstanceId};
use eventide::store::MemoryEventStore;
use eventide::subject::{Service, Subject};
use eventide::transport::{MemoryStreamTransport, StreamTransport};

/// Generous upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(60);

/// Short block and sweep intervals so paused-time tests converge quickly.
pub fn fast_consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        batch_size: 10,
        block_ms: 50,
        pending_retry_interval_ms: 200,
        max_connection_failures: 3,
        release_on_stop: true,
    }
}

/// Memory transport with every stream and group provisioned.
pub async fn provisioned_transport() -> Arc<MemoryStreamTransport> {
    let transport = Arc::new(MemoryStreamTransport::new());
    init_event_admin(Subject::ALL, transport.clone(), "event-admin")
        .await
        .expect("provisioning should succeed");
    transport
}

/// Consumer group manager for `service` with fast settings.
pub fn manager(
    service: Service,
    transport: &Arc<MemoryStreamTransport>,
    store: &Arc<MemoryEventStore>,
) -> ConsumerGroupManager {
    ConsumerGroupManager::new(service, transport.clone(), store.clone())
        .with_config(fast_consumer_config())
}

pub fn identity(service: Service, instance: &str) -> ConsumerIdentity {
    ConsumerIdentity::new(service, InstanceId::new(instance))
}

/// `User.nameUpdated` in the current schema.
pub fn name_update(aggregate_id: &str, version: u64) -> Event {
    Event::new(
        Subject::UserNameUpdated,
        aggregate_id,
        version,
        json!({"displayName": format!("name-v{version}")}),
    )
}

/// Append the encoded event directly, bypassing publisher checks.
pub async fn append_raw(transport: &dyn StreamTransport, event: &Event) {
    transport
        .append(event.subject, &event.encode().expect("event should encode"))
        .await
        .expect("append should succeed");
}

/// Handler recording every applied event.
#[derive(Default)]
pub struct RecordingHandler {
    events: RwLock<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    pub async fn versions(&self, aggregate_id: &str) -> Vec<u64> {
        self.events
            .read()
            .await
            .iter()
            .filter(|event| event.aggregate_id == aggregate_id)
            .map(|event| event.version)
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        self.events.write().await.push(event.clone());
        Ok(())
    }
}

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
