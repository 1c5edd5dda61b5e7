//! Process wiring: backends, leader duties and per-service runtimes.

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::mpsc;
use tracing::info;

use crate::admin::{EventAdmin, ProvisioningReport};
use crate::config::Config;
use crate::consumer::{ConsumerGroupManager, FatalSignal};
use crate::identity::{InstanceId, Role};
use crate::services::{ReadModels, ServiceRuntime};
use crate::store::{EventStore, MemoryEventStore};
use crate::subject::{Service, SubjectRegistry};
use crate::transport::{MemoryStreamTransport, StreamTransport};
use crate::Result;

/// Stream transport and version store shared by every service.
#[derive(Clone)]
pub struct Backends {
    pub transport: Arc<dyn StreamTransport>,
    pub store: Arc<dyn EventStore>,
}

impl Backends {
    /// In-process backends for development and tests.
    pub fn memory() -> Self {
        Self {
            transport: Arc::new(MemoryStreamTransport::new()),
            store: Arc::new(MemoryEventStore::new()),
        }
    }

    /// Backends named by `config.redis`, retrying the initial connection.
    pub async fn connect(config: &Config) -> Result<Self> {
        if config.redis.is_memory() {
            info!("Using in-memory stream transport and version store");
            return Ok(Self::memory());
        }
        Self::connect_redis(config).await
    }

    #[cfg(feature = "redis")]
    async fn connect_redis(config: &Config) -> Result<Self> {
        use crate::config::ConfigError;
        use crate::store::RedisEventStore;
        use crate::transport::RedisStreamTransport;
        use crate::utils::bootstrap::connect_with_retry;

        let url = config
            .redis
            .url
            .as_deref()
            .ok_or(ConfigError::MissingParameter("redis.url"))?;
        let prefix = Some(config.redis.key_prefix.as_str());

        let transport = connect_with_retry("redis streams", url, || {
            RedisStreamTransport::new(url, prefix)
        })
        .await?;
        let store = connect_with_retry("redis versions", url, || {
            RedisEventStore::new(url, prefix)
        })
        .await?;

        Ok(Self {
            transport: Arc::new(transport),
            store: Arc::new(store),
        })
    }

    #[cfg(not(feature = "redis"))]
    async fn connect_redis(_config: &Config) -> Result<Self> {
        Err(crate::config::ConfigError::Invalid(
            "built without redis support; use redis.url = \"memory://\"".to_string(),
        )
        .into())
    }
}

/// A running process: every service consuming, leader duties when elected.
pub struct Node {
    instance: InstanceId,
    role: Role,
    provisioning: Option<ProvisioningReport>,
    read_models: ReadModels,
    runtimes: Vec<ServiceRuntime>,
    fatal: mpsc::UnboundedReceiver<FatalSignal>,
}

impl Node {
    /// Start with every known subject.
    pub async fn start(config: &Config, instance: InstanceId, backends: Backends) -> Result<Self> {
        Self::start_with_registry(config, instance, backends, SubjectRegistry::standard()).await
    }

    /// Provision (leader only), subscribe every service, then start
    /// maintenance (leader only).
    pub async fn start_with_registry(
        config: &Config,
        instance: InstanceId,
        backends: Backends,
        registry: SubjectRegistry,
    ) -> Result<Self> {
        let role = config.leader_elector().role(&instance);

        let provisioning = if role == Role::Leader {
            let report = EventAdmin::new(backends.transport.clone(), config.admin.clone())
                .initialize(&registry)
                .await?;
            Some(report)
        } else {
            None
        };

        let (fatal_tx, fatal) = mpsc::unbounded_channel();
        let read_models = ReadModels::new();
        let mut runtimes = Vec::with_capacity(Service::ALL.len());

        for service in Service::ALL {
            let manager = ConsumerGroupManager::new(
                service,
                backends.transport.clone(),
                backends.store.clone(),
            )
            .with_config(config.consumer.clone())
            .with_reconciler_config(config.reconciler.clone())
            .with_fatal_sender(fatal_tx.clone());

            let runtime = ServiceRuntime::new(manager, registry.clone());
            runtime
                .subscribe(&instance, read_models.handler_for(service))
                .await?;
            runtimes.push(runtime);
        }

        if role == Role::Leader {
            for runtime in &mut runtimes {
                runtime.run_maintenance_jobs(
                    backends.transport.clone(),
                    config.maintenance.clone(),
                );
            }
        }

        info!(instance = %instance, role = ?role, "Node started");
        Ok(Self {
            instance,
            role,
            provisioning,
            read_models,
            runtimes,
            fatal,
        })
    }

    pub fn instance(&self) -> &InstanceId {
        &self.instance
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_leader(&self) -> bool {
        self.role == Role::Leader
    }

    /// Provisioning outcome; `None` on followers.
    pub fn provisioning(&self) -> Option<&ProvisioningReport> {
        self.provisioning.as_ref()
    }

    /// Services whose maintenance jobs run in this process.
    pub fn maintenance_jobs(&self) -> Vec<Service> {
        self.runtimes
            .iter()
            .filter(|runtime| runtime.runs_maintenance())
            .map(|runtime| runtime.service())
            .collect()
    }

    pub fn read_models(&self) -> &ReadModels {
        &self.read_models
    }

    pub fn runtime(&self, service: Service) -> Option<&ServiceRuntime> {
        self.runtimes
            .iter()
            .find(|runtime| runtime.service() == service)
    }

    /// Wait for a consumer to give up on its connection.
    pub async fn fatal_signal(&mut self) -> Option<FatalSignal> {
        self.fatal.recv().await
    }

    /// Stop maintenance and drain every consumer.
    pub async fn shutdown(self) {
        join_all(self.runtimes.into_iter().map(ServiceRuntime::shutdown)).await;
        info!(instance = %self.instance, "Node stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::RunMode;

    #[tokio::test]
    async fn test_development_node_leads() {
        let config = Config::for_test();
        let node = Node::start(&config, InstanceId::new("dev_consumer"), Backends::memory())
            .await
            .unwrap();

        assert!(node.is_leader());
        assert_eq!(node.provisioning().unwrap().streams, 7);
        assert_eq!(node.maintenance_jobs(), Service::ALL.to_vec());
        node.shutdown().await;
    }

    #[tokio::test]
    async fn test_production_follower_skips_leader_duties() {
        let config = Config {
            mode: RunMode::Production,
            ..Config::for_test()
        };
        let backends = Backends::memory();
        let leader = Node::start(&config, InstanceId::new("0"), backends.clone())
            .await
            .unwrap();
        let follower = Node::start(&config, InstanceId::new("1"), backends)
            .await
            .unwrap();

        assert!(leader.is_leader());
        assert!(!follower.is_leader());
        assert!(follower.provisioning().is_none());
        assert!(follower.maintenance_jobs().is_empty());

        follower.shutdown().await;
        leader.shutdown().await;
    }

    #[tokio::test]
    async fn test_memory_url_connects_in_process() {
        let backends = Backends::connect(&Config::for_test()).await.unwrap();
        assert_eq!(
            backends
                .transport
                .stream_len(crate::subject::Subject::BlogCreated)
                .await
                .unwrap(),
            0
        );
    }
}
