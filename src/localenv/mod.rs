//! Host-local environment handles.
//!
//! A plan command runs against up to three local environments: the regular
//! one, the update-specific one and the join-specific one. Each wraps the
//! state store of its directory; the regular environment can additionally
//! open the etcd-backed cluster environment and the install wizard.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use slog::Logger;

use crate::error::{Error, Result};
use crate::ops::Operator;
use crate::storage::OperationsBackend;

/// The etcd-backed environment of a running cluster.
pub struct ClusterEnvironment {
    pub backend: Arc<dyn OperationsBackend>,
}

/// Opens the cluster environment, bounded by the connect timeout.
#[async_trait]
pub trait ClusterOpener: Send + Sync {
    async fn open(&self, connect_timeout: Duration) -> Result<ClusterEnvironment>;
}

/// The remote wizard environment available while an installer is running.
pub struct RemoteEnvironment {
    /// Absent when the wizard endpoint exists but exposes no operator
    pub operator: Option<Arc<dyn Operator>>,
}

/// Opens the remote wizard environment from installer-provided connection
/// state.
#[async_trait]
pub trait RemoteOpener: Send + Sync {
    async fn open(&self) -> Result<RemoteEnvironment>;
}

/// A host-local environment rooted at a state directory.
pub struct LocalEnvironment {
    backend: Arc<dyn OperationsBackend>,
    cluster: Option<Arc<dyn ClusterOpener>>,
    remote: Option<Arc<dyn RemoteOpener>>,
    wizard_backend: Option<Arc<dyn OperationsBackend>>,
    logger: Logger,
}

impl LocalEnvironment {
    pub fn new(backend: Arc<dyn OperationsBackend>, logger: Logger) -> Self {
        Self {
            backend,
            cluster: None,
            remote: None,
            wizard_backend: None,
            logger,
        }
    }

    /// Enables opening the etcd-backed cluster environment.
    pub fn with_cluster_opener(mut self, opener: Arc<dyn ClusterOpener>) -> Self {
        self.cluster = Some(opener);
        self
    }

    /// Enables opening the remote wizard environment.
    pub fn with_remote_opener(mut self, opener: Arc<dyn RemoteOpener>) -> Self {
        self.remote = Some(opener);
        self
    }

    /// Attaches the local wizard file store used when the remote wizard is
    /// unreachable.
    pub fn with_wizard_backend(mut self, backend: Arc<dyn OperationsBackend>) -> Self {
        self.wizard_backend = Some(backend);
        self
    }

    /// The state store of this environment's directory.
    pub fn backend(&self) -> Arc<dyn OperationsBackend> {
        self.backend.clone()
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    /// Opens the cluster environment. The command does not require a cluster
    /// to run; callers demote this failure to a debug log and continue with
    /// local state.
    pub async fn cluster_environment(&self, connect_timeout: Duration) -> Result<ClusterEnvironment> {
        match &self.cluster {
            Some(opener) => opener.open(connect_timeout).await,
            None => Err(Error::NotFound("no cluster environment configured".to_string())),
        }
    }

    /// Opens the remote wizard environment.
    pub async fn remote_environment(&self) -> Result<RemoteEnvironment> {
        match &self.remote {
            Some(opener) => opener.open().await,
            None => Err(Error::NotFound("no remote wizard environment configured".to_string())),
        }
    }

    /// The local wizard file store. Unlike the other stores this failure
    /// propagates: once the wizard has been selected as the source of truth
    /// there is nothing to fall back to.
    pub fn local_wizard_backend(&self) -> Result<Arc<dyn OperationsBackend>> {
        self.wizard_backend
            .clone()
            .ok_or_else(|| Error::NotFound("failed to read local wizard environment".to_string()))
    }
}
