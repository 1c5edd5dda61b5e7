//! User service: owns user aggregates, tracks how many blogs each user has.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::blog::{BlogCreated, BlogDeleted};
use super::{decode_payload, unhandled};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerError};
use crate::subject::{Service, Subject};

/// `User.nameUpdated` payload, schema v2.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NameUpdated {
    pub display_name: String,
}

/// Per-author blog counts.
#[derive(Default)]
pub struct UserReadModel {
    blog_counts: RwLock<HashMap<String, u64>>,
}

impl UserReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn blog_count(&self, user_id: &str) -> u64 {
        self.blog_counts
            .read()
            .await
            .get(user_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventHandler for UserReadModel {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        match event.subject {
            Subject::BlogCreated => {
                let created: BlogCreated = decode_payload(event)?;
                *self
                    .blog_counts
                    .write()
                    .await
                    .entry(created.author_id)
                    .or_default() += 1;
            }
            Subject::BlogDeleted => {
                let deleted: BlogDeleted = decode_payload(event)?;
                if let Some(count) = self.blog_counts.write().await.get_mut(&deleted.author_id) {
                    *count = count.saturating_sub(1);
                }
            }
            other => return Err(unhandled(Service::User, other)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_counts_blogs_per_author() {
        let model = UserReadModel::new();
        for (blog, version) in [("b-1", 1), ("b-2", 1)] {
            let event = Event::new(
                Subject::BlogCreated,
                blog,
                version,
                json!({"authorId": "u-1", "title": "Hello"}),
            );
            model.handle(&event).await.unwrap();
        }
        let deleted = Event::new(Subject::BlogDeleted, "b-1", 2, json!({"authorId": "u-1"}));
        model.handle(&deleted).await.unwrap();

        assert_eq!(model.blog_count("u-1").await, 1);
        assert_eq!(model.blog_count("u-2").await, 0);
    }

    #[tokio::test]
    async fn test_rejects_foreign_subject() {
        let model = UserReadModel::new();
        let event = Event::new(Subject::CommentCreated, "c-1", 1, json!({"blogId": "b-1"}));
        assert!(matches!(
            model.handle(&event).await,
            Err(HandlerError::Failed(_))
        ));
    }
}
