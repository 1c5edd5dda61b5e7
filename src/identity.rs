//! Instance identity and leader election.
//!
//! Every process in the cluster needs an identity that is unique across the
//! whole cluster: it names the process' consumers inside each consumer group.
//! The identity also decides, once at boot, whether the process is the leader
//! that provisions streams and runs maintenance.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::config::ConfigError;
use crate::subject::Service;

/// Instance id used when running a single development process.
pub const DEV_INSTANCE_ID: &str = "dev_consumer";

/// Environment variables consulted for the instance id, in order.
pub const INSTANCE_ID_VARS: [&str; 3] = ["EVENTIDE_INSTANCE_ID", "pm_id", "NODE_APP_INSTANCE"];

/// Execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    #[default]
    Development,
    Production,
}

/// Cluster-unique process identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct InstanceId(String);

impl InstanceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Resolve the instance id from configuration and the process environment.
    pub fn resolve(mode: RunMode, configured: Option<&str>) -> Result<Self, ConfigError> {
        Self::resolve_with(mode, configured, |var| std::env::var(var).ok())
    }

    /// Resolve with an explicit variable lookup.
    ///
    /// Order: configured value, then [`INSTANCE_ID_VARS`]. Production fails
    /// without an id; development falls back to [`DEV_INSTANCE_ID`].
    pub fn resolve_with<F>(mode: RunMode, configured: Option<&str>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let usable = |id: &str| {
            let id = id.trim();
            (!id.is_empty()).then(|| id.to_string())
        };
        let found = configured.and_then(usable).or_else(|| {
            INSTANCE_ID_VARS
                .iter()
                .find_map(|var| lookup(var).as_deref().and_then(usable))
        });

        match (found, mode) {
            (Some(id), _) => Ok(Self(id)),
            (None, RunMode::Development) => Ok(Self(DEV_INSTANCE_ID.to_string())),
            (None, RunMode::Production) => Err(ConfigError::MissingInstanceId),
        }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One consumer inside a service's consumer group.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerIdentity {
    pub service: Service,
    pub instance: InstanceId,
}

impl ConsumerIdentity {
    pub fn new(service: Service, instance: InstanceId) -> Self {
        Self { service, instance }
    }

    /// Consumer name registered on the stream.
    pub fn consumer_name(&self) -> &str {
        self.instance.as_str()
    }
}

impl fmt::Display for ConsumerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.service, self.instance)
    }
}

/// Cluster role, fixed for the lifetime of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leader,
    Follower,
}

/// Static leader election by reserved instance id.
#[derive(Debug, Clone)]
pub struct LeaderElector {
    mode: RunMode,
    leader_instance_id: String,
}

impl LeaderElector {
    pub fn new(mode: RunMode, leader_instance_id: impl Into<String>) -> Self {
        Self {
            mode,
            leader_instance_id: leader_instance_id.into(),
        }
    }

    /// The reserved id leads. In development the unmanaged fallback id
    /// leads as well, so a solo process still provisions its streams.
    pub fn is_leader(&self, instance: &InstanceId) -> bool {
        let id = instance.as_str();
        match self.mode {
            RunMode::Development => id == self.leader_instance_id || id == DEV_INSTANCE_ID,
            RunMode::Production => id == self.leader_instance_id,
        }
    }

    pub fn role(&self, instance: &InstanceId) -> Role {
        let role = if self.is_leader(instance) {
            Role::Leader
        } else {
            Role::Follower
        };
        info!(instance = %instance, role = ?role, mode = ?self.mode, "Elected cluster role");
        role
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn test_configured_id_wins() {
        let id = InstanceId::resolve_with(RunMode::Production, Some("7"), |_| Some("3".into()))
            .unwrap();
        assert_eq!(id.as_str(), "7");
    }

    #[test]
    fn test_env_lookup_order() {
        let id = InstanceId::resolve_with(RunMode::Production, None, |var| match var {
            "pm_id" => Some("2".into()),
            "NODE_APP_INSTANCE" => Some("9".into()),
            _ => None,
        })
        .unwrap();
        assert_eq!(id.as_str(), "2");
    }

    #[test]
    fn test_development_falls_back() {
        let id = InstanceId::resolve_with(RunMode::Development, None, no_env).unwrap();
        assert_eq!(id.as_str(), DEV_INSTANCE_ID);
    }

    #[test]
    fn test_production_requires_id() {
        let err = InstanceId::resolve_with(RunMode::Production, Some("  "), no_env).unwrap_err();
        assert!(matches!(err, ConfigError::MissingInstanceId));
    }

    #[test]
    fn test_production_leader_is_reserved_id() {
        let elector = LeaderElector::new(RunMode::Production, "0");
        assert!(elector.is_leader(&InstanceId::new("0")));
        assert!(!elector.is_leader(&InstanceId::new("1")));
        assert_eq!(elector.role(&InstanceId::new("1")), Role::Follower);
    }

    #[test]
    fn test_development_fallback_id_leads() {
        let elector = LeaderElector::new(RunMode::Development, "0");
        assert!(elector.is_leader(&InstanceId::new(DEV_INSTANCE_ID)));
    }

    #[test]
    fn test_development_cluster_has_one_leader() {
        let elector = LeaderElector::new(RunMode::Development, "0");
        assert!(elector.is_leader(&InstanceId::new("0")));
        assert!(!elector.is_leader(&InstanceId::new("1")));
        assert!(!elector.is_leader(&InstanceId::new("2")));
    }

    #[test]
    fn test_consumer_name_is_instance() {
        let identity = ConsumerIdentity::new(Service::Blog, InstanceId::new("3"));
        assert_eq!(identity.consumer_name(), "3");
        assert_eq!(identity.to_string(), "Blog:3");
    }
}
