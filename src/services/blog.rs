//! Blog service: keeps author display names and comment counts per blog.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::comment::{CommentCreated, CommentDeleted};
use super::user::NameUpdated;
use super::{decode_payload, unhandled};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerError};
use crate::subject::{Service, Subject};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlogCreated {
    pub author_id: String,
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlogDeleted {
    pub author_id: String,
}

#[derive(Default)]
pub struct BlogReadModel {
    author_names: RwLock<HashMap<String, String>>,
    comment_counts: RwLock<HashMap<String, u64>>,
}

impl BlogReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn author_name(&self, user_id: &str) -> Option<String> {
        self.author_names.read().await.get(user_id).cloned()
    }

    pub async fn comment_count(&self, blog_id: &str) -> u64 {
        self.comment_counts
            .read()
            .await
            .get(blog_id)
            .copied()
            .unwrap_or(0)
    }
}

#[async_trait]
impl EventHandler for BlogReadModel {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        match event.subject {
            Subject::UserNameUpdated => {
                let updated: NameUpdated = decode_payload(event)?;
                self.author_names
                    .write()
                    .await
                    .insert(event.aggregate_id.clone(), updated.display_name);
            }
            Subject::CommentCreated => {
                let created: CommentCreated = decode_payload(event)?;
                *self
                    .comment_counts
                    .write()
                    .await
                    .entry(created.blog_id)
                    .or_default() += 1;
            }
            Subject::CommentDeleted => {
                let deleted: CommentDeleted = decode_payload(event)?;
                if let Some(count) = self.comment_counts.write().await.get_mut(&deleted.blog_id) {
                    *count = count.saturating_sub(1);
                }
            }
            other => return Err(unhandled(Service::Blog, other)),
        }
        Ok(())
    }
}
