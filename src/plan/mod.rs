//! Phase-level plan dispatch.
//!
//! Every long-running operation carries a tree-structured execution plan.
//! This module resolves the operation a command refers to and routes
//! execute, rollback, resume and complete actions to the plan driver for the
//! operation's type. The drivers themselves are opaque collaborators.

pub mod resolver;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::localenv::LocalEnvironment;
use crate::ops::{Operation, OperationType};

/// ID of the root phase of an execution plan.
pub const ROOT_PHASE: &str = "/";

/// Parameters for a single phase execution.
#[derive(Clone)]
pub struct PhaseParams {
    /// ID of the phase to execute; empty or "." refer to the root
    pub phase_id: String,
    /// Operation to work with. If unspecified, the most recent active
    /// operation is used.
    pub operation_id: Option<String>,
    /// Force phase execution out of order
    pub force: bool,
    /// Phase execution timeout
    pub timeout: Duration,
    /// Skip the verification of binary version compatibility
    pub skip_version_check: bool,
    /// Overrides the installer driver for installation-specific phases
    pub installer: Option<Arc<dyn InstallerDriver>>,
}

impl PhaseParams {
    pub fn new(phase_id: impl Into<String>) -> Self {
        Self {
            phase_id: phase_id.into(),
            operation_id: None,
            force: false,
            timeout: Duration::from_secs(3600),
            skip_version_check: false,
            installer: None,
        }
    }

    /// The phase ID with the root aliases collapsed.
    pub fn normalized_phase_id(&self) -> &str {
        match self.phase_id.as_str() {
            "" | "." => ROOT_PHASE,
            id => id,
        }
    }
}

/// Drives installation plans. Installs predate the cluster, so the installer
/// works against the wizard rather than the cluster store and additionally
/// knows how to resume an installation that left no resolvable operation
/// behind.
#[async_trait]
pub trait InstallerDriver: Send + Sync {
    async fn execute_phase(
        &self,
        env: &LocalEnvironment,
        params: &PhaseParams,
        op: &Operation,
    ) -> Result<()>;

    async fn rollback_phase(
        &self,
        env: &LocalEnvironment,
        params: &PhaseParams,
        op: &Operation,
    ) -> Result<()>;

    async fn complete(&self, env: &LocalEnvironment, op: &Operation) -> Result<()>;

    /// Resumes the installation when no operation could be resolved.
    async fn resume(&self, env: &LocalEnvironment) -> Result<()>;
}

/// Drives the plans of operations that run against a live cluster (expand,
/// update, runtime-environ, config). The side environment is the
/// operation-specific local store, when one exists.
#[async_trait]
pub trait PlanDriver: Send + Sync {
    async fn execute(
        &self,
        local_env: &LocalEnvironment,
        side_env: Option<&LocalEnvironment>,
        params: &PhaseParams,
        op: &Operation,
    ) -> Result<()>;

    async fn rollback(
        &self,
        local_env: &LocalEnvironment,
        side_env: Option<&LocalEnvironment>,
        params: &PhaseParams,
        op: &Operation,
    ) -> Result<()>;

    async fn complete(
        &self,
        local_env: &LocalEnvironment,
        side_env: Option<&LocalEnvironment>,
        op: &Operation,
    ) -> Result<()>;
}

/// Drives plans that support execution only.
#[async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(
        &self,
        local_env: &LocalEnvironment,
        params: &PhaseParams,
        op: &Operation,
    ) -> Result<()>;
}

/// Plan drivers keyed by operation type.
#[derive(Clone)]
pub struct Drivers {
    pub installer: Arc<dyn InstallerDriver>,
    pub join: Arc<dyn PlanDriver>,
    pub update: Arc<dyn PlanDriver>,
    pub environ: Arc<dyn PlanDriver>,
    pub config: Arc<dyn PlanDriver>,
    pub gc: Arc<dyn PhaseExecutor>,
}

impl Drivers {
    fn installer_for(&self, params: &PhaseParams) -> Arc<dyn InstallerDriver> {
        params.installer.clone().unwrap_or_else(|| self.installer.clone())
    }
}

/// Executes a phase of the operation resolved from params.
pub async fn execute_phase(
    drivers: &Drivers,
    local_env: &LocalEnvironment,
    update_env: Option<&LocalEnvironment>,
    join_env: Option<&LocalEnvironment>,
    params: PhaseParams,
) -> Result<()> {
    let op =
        resolver::get_active_operation(local_env, update_env, join_env, params.operation_id.as_deref())
            .await?;
    match op.op_type {
        OperationType::Install => {
            drivers.installer_for(&params).execute_phase(local_env, &params, &op).await
        }
        OperationType::Expand => drivers.join.execute(local_env, join_env, &params, &op).await,
        OperationType::Update => drivers.update.execute(local_env, update_env, &params, &op).await,
        OperationType::UpdateRuntimeEnviron => {
            drivers.environ.execute(local_env, update_env, &params, &op).await
        }
        OperationType::UpdateConfig => {
            drivers.config.execute(local_env, update_env, &params, &op).await
        }
        OperationType::GarbageCollect => drivers.gc.execute(local_env, &params, &op).await,
    }
}

/// Rolls back a phase of the operation resolved from params.
pub async fn rollback_phase(
    drivers: &Drivers,
    local_env: &LocalEnvironment,
    update_env: Option<&LocalEnvironment>,
    join_env: Option<&LocalEnvironment>,
    params: PhaseParams,
) -> Result<()> {
    let op =
        resolver::get_active_operation(local_env, update_env, join_env, params.operation_id.as_deref())
            .await?;
    match op.op_type {
        OperationType::Install => {
            drivers.installer_for(&params).rollback_phase(local_env, &params, &op).await
        }
        OperationType::Expand => drivers.join.rollback(local_env, join_env, &params, &op).await,
        OperationType::Update => drivers.update.rollback(local_env, update_env, &params, &op).await,
        OperationType::UpdateRuntimeEnviron => {
            drivers.environ.rollback(local_env, update_env, &params, &op).await
        }
        OperationType::UpdateConfig => {
            drivers.config.rollback(local_env, update_env, &params, &op).await
        }
        OperationType::GarbageCollect => Err(Error::BadParameter(format!(
            "operation type {} does not support plan rollback",
            op.op_type
        ))),
    }
}

/// Resumes the operation resolved from params by executing its plan from the
/// root. When no operation can be resolved at all, falls back to resuming
/// the installation through the installer driver.
pub async fn resume_operation(
    drivers: &Drivers,
    local_env: &LocalEnvironment,
    update_env: Option<&LocalEnvironment>,
    join_env: Option<&LocalEnvironment>,
    mut params: PhaseParams,
) -> Result<()> {
    params.phase_id = ROOT_PHASE.to_string();
    match execute_phase(drivers, local_env, update_env, join_env, params.clone()).await {
        Ok(()) => Ok(()),
        Err(err) if err.is_not_found() => {
            // No operation found. Attempt to resume the installation.
            drivers.installer_for(&params).resume(local_env).await
        }
        Err(err) => Err(err),
    }
}

/// Marks the plan of the operation resolved from operation_id completed.
pub async fn complete_plan(
    drivers: &Drivers,
    local_env: &LocalEnvironment,
    update_env: Option<&LocalEnvironment>,
    join_env: Option<&LocalEnvironment>,
    operation_id: Option<&str>,
) -> Result<()> {
    let op = resolver::get_active_operation(local_env, update_env, join_env, operation_id).await?;
    match op.op_type {
        OperationType::Install => drivers.installer.complete(local_env, &op).await,
        OperationType::Expand => drivers.join.complete(local_env, join_env, &op).await,
        OperationType::Update => drivers.update.complete(local_env, update_env, &op).await,
        OperationType::UpdateRuntimeEnviron => {
            drivers.environ.complete(local_env, update_env, &op).await
        }
        OperationType::UpdateConfig => drivers.config.complete(local_env, update_env, &op).await,
        OperationType::GarbageCollect => Err(Error::BadParameter(format!(
            "operation type {} does not support plan completion",
            op.op_type
        ))),
    }
}
