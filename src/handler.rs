//! Event handler boundary.

use async_trait::async_trait;

use crate::event::Event;
use crate::subject::Subject;

/// Errors returned by event handlers.
///
/// Any handler error leaves the entry unacknowledged; it is redelivered on
/// the owner's next pending sweep or reclaimed by the leader.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    #[error("Invalid {subject} payload: {message}")]
    InvalidPayload { subject: Subject, message: String },

    #[error("Handler failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl HandlerError {
    pub fn invalid_payload(subject: Subject, err: impl std::fmt::Display) -> Self {
        HandlerError::InvalidPayload {
            subject,
            message: err.to_string(),
        }
    }
}

/// Applies one event to a service's local state.
///
/// Called at most once per aggregate version on the happy path. Must not
/// persist the version itself; the reconciler does that after a successful
/// return.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}
