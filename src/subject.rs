//! Subject registry.
//!
//! Subjects are a closed set known at compile time. Each subject names one
//! durable stream and carries the schema version its payload is currently
//! written in. Services are the consuming (and producing) domain modules;
//! the subscription table below decides which consumer groups exist.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Domain service that produces and consumes events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Service {
    Blog,
    Comment,
    User,
}

impl Service {
    pub const ALL: [Service; 3] = [Service::Blog, Service::Comment, Service::User];

    /// Consumer group name used by this service on every subject it reads.
    pub fn name(&self) -> &'static str {
        match self {
            Service::Blog => "Blog",
            Service::Comment => "Comment",
            Service::User => "User",
        }
    }

    /// Subjects this service consumes to maintain its read models.
    pub fn subscriptions(&self) -> &'static [Subject] {
        match self {
            Service::Blog => &[
                Subject::UserNameUpdated,
                Subject::CommentCreated,
                Subject::CommentDeleted,
            ],
            Service::Comment => &[Subject::UserNameUpdated, Subject::BlogDeleted],
            Service::User => &[Subject::BlogCreated, Subject::BlogDeleted],
        }
    }
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Service {
    type Err = UnknownService;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownService(s.to_string()))
    }
}

/// Event subject. One subject, one stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Subject {
    #[serde(rename = "User.created")]
    UserCreated,
    #[serde(rename = "User.nameUpdated")]
    UserNameUpdated,
    #[serde(rename = "Blog.created")]
    BlogCreated,
    #[serde(rename = "Blog.updated")]
    BlogUpdated,
    #[serde(rename = "Blog.deleted")]
    BlogDeleted,
    #[serde(rename = "Comment.created")]
    CommentCreated,
    #[serde(rename = "Comment.deleted")]
    CommentDeleted,
}

impl Subject {
    pub const ALL: [Subject; 7] = [
        Subject::UserCreated,
        Subject::UserNameUpdated,
        Subject::BlogCreated,
        Subject::BlogUpdated,
        Subject::BlogDeleted,
        Subject::CommentCreated,
        Subject::CommentDeleted,
    ];

    /// Wire name, which is also the stream key.
    pub fn as_str(&self) -> &'static str {
        match self {
            Subject::UserCreated => "User.created",
            Subject::UserNameUpdated => "User.nameUpdated",
            Subject::BlogCreated => "Blog.created",
            Subject::BlogUpdated => "Blog.updated",
            Subject::BlogDeleted => "Blog.deleted",
            Subject::CommentCreated => "Comment.created",
            Subject::CommentDeleted => "Comment.deleted",
        }
    }

    /// Schema version producers currently write for this subject.
    ///
    /// Older versions may still sit on the stream or arrive from cold
    /// storage; they are upgraded by the [`Upcaster`](crate::upcast::Upcaster)
    /// before reaching a handler.
    pub fn schema_version(&self) -> u32 {
        match self {
            // v1 carried a single `name` field
            Subject::UserNameUpdated => 2,
            _ => 1,
        }
    }

    /// Service that owns the aggregate and appends to this stream.
    pub fn producer(&self) -> Service {
        match self {
            Subject::UserCreated | Subject::UserNameUpdated => Service::User,
            Subject::BlogCreated | Subject::BlogUpdated | Subject::BlogDeleted => Service::Blog,
            Subject::CommentCreated | Subject::CommentDeleted => Service::Comment,
        }
    }
}

impl fmt::Display for Subject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Subject {
    type Err = UnknownSubject;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Subject::ALL
            .into_iter()
            .find(|subject| subject.as_str() == s)
            .ok_or_else(|| UnknownSubject(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown subject: {0}")]
pub struct UnknownSubject(pub String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown service: {0}")]
pub struct UnknownService(pub String);

/// One consumer group: a consuming service reading one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConsumerGroup {
    pub subject: Subject,
    pub service: Service,
}

impl ConsumerGroup {
    pub fn new(subject: Subject, service: Service) -> Self {
        Self { subject, service }
    }

    /// Group name on the stream.
    pub fn name(&self) -> &'static str {
        self.service.name()
    }
}

impl fmt::Display for ConsumerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.subject, self.service)
    }
}

/// Static view over subjects and the services consuming them.
///
/// Restricting the registry to a subset of subjects is how tests and
/// partial deployments provision fewer streams.
#[derive(Debug, Clone)]
pub struct SubjectRegistry {
    subjects: BTreeSet<Subject>,
}

impl Default for SubjectRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl SubjectRegistry {
    /// Registry of every known subject.
    pub fn standard() -> Self {
        Self {
            subjects: Subject::ALL.into_iter().collect(),
        }
    }

    /// Registry limited to the given subjects.
    pub fn with_subjects(subjects: impl IntoIterator<Item = Subject>) -> Self {
        Self {
            subjects: subjects.into_iter().collect(),
        }
    }

    pub fn subjects(&self) -> impl Iterator<Item = Subject> + '_ {
        self.subjects.iter().copied()
    }

    pub fn contains(&self, subject: Subject) -> bool {
        self.subjects.contains(&subject)
    }

    /// Services with a consumer group on `subject`.
    pub fn consumers_of(&self, subject: Subject) -> Vec<Service> {
        if !self.contains(subject) {
            return Vec::new();
        }
        Service::ALL
            .into_iter()
            .filter(|service| service.subscriptions().contains(&subject))
            .collect()
    }

    /// Subjects `service` consumes, limited to this registry.
    pub fn subscriptions_of(&self, service: Service) -> Vec<Subject> {
        service
            .subscriptions()
            .iter()
            .copied()
            .filter(|subject| self.contains(*subject))
            .collect()
    }

    /// Subjects whose stream `service` produces into.
    pub fn owned_by(&self, service: Service) -> Vec<Subject> {
        self.subjects()
            .filter(|subject| subject.producer() == service)
            .collect()
    }

    /// Every consumer group implied by the subscription table.
    pub fn groups(&self) -> Vec<ConsumerGroup> {
        self.subjects()
            .flat_map(|subject| {
                self.consumers_of(subject)
                    .into_iter()
                    .map(move |service| ConsumerGroup::new(subject, service))
            })
            .collect()
    }
}
