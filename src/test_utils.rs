//! Test utilities and fixture handlers.
//!
//! In-memory handlers and event builders shared by unit tests across modules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;

use crate::event::Event;
use crate::handler::{EventHandler, HandlerError};
use crate::subject::Subject;

/// Handler that records every event it is asked to apply.
#[derive(Default)]
pub struct RecordingHandler {
    events: RwLock<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    /// Versions applied for one aggregate, in application order.
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

/// Handler that always fails.
pub struct FailingHandler;

#[async_trait]
impl EventHandler for FailingHandler {
    async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
        Err(HandlerError::Failed("handler rejected event".to_string()))
    }
}

/// Handler that fails its first `failures` calls, then records.
pub struct FlakyHandler {
    remaining_failures: AtomicUsize,
    inner: RecordingHandler,
}

impl FlakyHandler {
    pub fn new(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            inner: RecordingHandler::new(),
        }
    }

    pub fn recorded(&self) -> &RecordingHandler {
        &self.inner
    }
}

#[async_trait]
impl EventHandler for FlakyHandler {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        let failed = self
            .remaining_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(HandlerError::Failed("transient handler failure".to_string()));
        }
        self.inner.handle(event).await
    }
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

/// Poll `check` until it holds or `timeout` elapses.
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
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
