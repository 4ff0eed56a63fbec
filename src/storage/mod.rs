//! Capability traits over the operation state stores.
//!
//! The stores themselves (the etcd-backed cluster store, the per-host update
//! and join stores, the wizard file store) live behind these seams; the core
//! only reads operations through them.

pub mod file;

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::Result;
use crate::ops::{Operation, Operator, SiteKey};

pub use file::FileBackend;

/// Read access to the operations recorded in a single state store.
#[async_trait]
pub trait OperationsBackend: Send + Sync {
    /// All operations known to this backend, in no particular order.
    async fn get_operations(&self) -> Result<Vec<Operation>>;

    /// The most recently created operation in this backend.
    async fn get_last_operation(&self) -> Result<Operation>;
}

/// Single-operation fetch seam used when merging stores.
#[async_trait]
pub trait OperationGetter: Send + Sync {
    async fn get_operation(&self) -> Result<Operation>;
}

/// Fetches the last operation from a state store.
pub struct BackendGetter {
    backend: Arc<dyn OperationsBackend>,
}

impl BackendGetter {
    pub fn new(backend: Arc<dyn OperationsBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl OperationGetter for BackendGetter {
    async fn get_operation(&self) -> Result<Operation> {
        self.backend.get_last_operation().await
    }
}

/// Fetches the last operation of a cluster from the wizard operator.
pub struct OperatorGetter {
    operator: Arc<dyn Operator>,
    site: SiteKey,
}

impl OperatorGetter {
    pub fn new(operator: Arc<dyn Operator>, site: SiteKey) -> Self {
        Self { operator, site }
    }
}

#[async_trait]
impl OperationGetter for OperatorGetter {
    async fn get_operation(&self) -> Result<Operation> {
        self.operator.get_last_operation(&self.site).await
    }
}
