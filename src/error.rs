//! Crate-level error.

use crate::admin::ProvisioningError;
use crate::cold_storage::ColdStorageError;
use crate::config::ConfigError;
use crate::consumer::ConsumerError;
use crate::handler::HandlerError;
use crate::reconciler::ReconcileError;
use crate::store::StorageError;
use crate::transport::TransportError;
use crate::upcast::UpcastError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Provisioning(#[from] ProvisioningError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    Reconcile(#[from] ReconcileError),

    #[error(transparent)]
    Upcast(#[from] UpcastError),

    #[error(transparent)]
    ColdStorage(#[from] ColdStorageError),
}

impl Error {
    /// Whether the process should stop rather than retry.
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Config(_) | Error::Provisioning(_) => true,
            Error::Transport(e) => e.is_fatal(),
            Error::Storage(e) => e.is_fatal(),
            Error::Reconcile(e) => e.is_fatal(),
            _ => false,
        }
    }
}
