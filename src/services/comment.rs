//! Comment service: author names for comment listings, and which blogs are gone.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use super::blog::BlogDeleted;
use super::user::NameUpdated;
use super::{decode_payload, unhandled};
use crate::event::Event;
use crate::handler::{EventHandler, HandlerError};
use crate::subject::{Service, Subject};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentCreated {
    pub blog_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommentDeleted {
    pub blog_id: String,
}

#[derive(Default)]
pub struct CommentReadModel {
    author_names: RwLock<HashMap<String, String>>,
    deleted_blogs: RwLock<HashSet<String>>,
}

impl CommentReadModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn author_name(&self, user_id: &str) -> Option<String> {
        self.author_names.read().await.get(user_id).cloned()
    }

    /// Comments on a deleted blog are hidden.
    pub async fn is_blog_deleted(&self, blog_id: &str) -> bool {
        self.deleted_blogs.read().await.contains(blog_id)
    }
}

#[async_trait]
impl EventHandler for CommentReadModel {
    async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
        match event.subject {
            Subject::UserNameUpdated => {
                let updated: NameUpdated = decode_payload(event)?;
                self.author_names
                    .write()
                    .await
                    .insert(event.aggregate_id.clone(), updated.display_name);
            }
            Subject::BlogDeleted => {
                let _: BlogDeleted = decode_payload(event)?;
                self.deleted_blogs
                    .write()
                    .await
                    .insert(event.aggregate_id.clone());
            }
            other => return Err(unhandled(Service::Comment, other)),
        }
        Ok(())
    }
}
