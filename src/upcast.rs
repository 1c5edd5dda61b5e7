//! Payload schema upcasting.
//!
//! Old events stay on the stream and in cold storage in whatever schema they
//! were written with. Before reaching a handler, every event is walked one
//! schema step at a time up to its subject's current schema.

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use tracing::debug;

use crate::event::Event;
use crate::subject::Subject;

/// Result type for upcasting.
pub type Result<T> = std::result::Result<T, UpcastError>;

#[derive(Debug, thiserror::Error)]
pub enum UpcastError {
    #[error("No upcast step registered for {subject} v{from}")]
    MissingStep { subject: Subject, from: u32 },

    #[error("{subject} v{version} is newer than the supported v{current}")]
    FromFuture {
        subject: Subject,
        version: u32,
        current: u32,
    },

    #[error("Upcasting {subject} v{from} failed: {message}")]
    Failed {
        subject: Subject,
        from: u32,
        message: String,
    },
}

/// One schema step: payload at `from` to payload at `from + 1`.
pub type UpcastFn = Box<dyn Fn(Value) -> std::result::Result<Value, String> + Send + Sync>;

/// Registry of per-subject schema steps.
#[derive(Default)]
pub struct Upcaster {
    steps: HashMap<(Subject, u32), UpcastFn>,
}

impl fmt::Debug for Upcaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut steps: Vec<_> = self.steps.keys().collect();
        steps.sort();
        f.debug_struct("Upcaster").field("steps", &steps).finish()
    }
}

impl Upcaster {
    /// Registry without any steps. Only current-schema events pass.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every step needed by the current subject schemas.
    pub fn standard() -> Self {
        Self::new().with_step(Subject::UserNameUpdated, 1, user_name_updated_v1_to_v2)
    }

    /// Register the step from schema `from` to `from + 1`.
    pub fn with_step<F>(mut self, subject: Subject, from: u32, step: F) -> Self
    where
        F: Fn(Value) -> std::result::Result<Value, String> + Send + Sync + 'static,
    {
        self.steps.insert((subject, from), Box::new(step));
        self
    }

    /// Bring `event` to its subject's current schema.
    pub fn upcast(&self, mut event: Event) -> Result<Event> {
        let subject = event.subject;
        let current = subject.schema_version();
        if event.schema_version > current {
            return Err(UpcastError::FromFuture {
                subject,
                version: event.schema_version,
                current,
            });
        }

        while event.schema_version < current {
            let from = event.schema_version;
            let step = self
                .steps
                .get(&(subject, from))
                .ok_or(UpcastError::MissingStep { subject, from })?;
            event.payload = step(event.payload).map_err(|message| UpcastError::Failed {
                subject,
                from,
                message,
            })?;
            event.schema_version = from + 1;

            debug!(
                subject = %subject,
                aggregate_id = %event.aggregate_id,
                from = from,
                to = from + 1,
                "Upcast event payload"
            );
        }
        Ok(event)
    }
}

/// v1 carried `name`; v2 renamed it to `displayName`.
fn user_name_updated_v1_to_v2(mut payload: Value) -> std::result::Result<Value, String> {
    let object = payload
        .as_object_mut()
        .ok_or_else(|| "payload is not an object".to_string())?;
    let name = object
        .remove("name")
        .ok_or_else(|| "missing field `name`".to_string())?;
    object.insert("displayName".to_string(), name);
    Ok(payload)
}
